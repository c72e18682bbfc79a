//! Kernel Executive (ke)
//!
//! The executive ties the kernel together:
//!
//! - **Kernel context**: the big kernel lock around all kernel tables
//! - **Scheduler boundary**: thread spawn/wakeup/sleep over host threads
//! - **Wait support**: monitor condition variables addressed by channel

pub mod kernel;
pub mod sched;
pub mod wait;

pub use kernel::Sys;
pub use sched::{ThreadState, Tid};
