//! Networking (net)
//!
//! Local socket layer: a port table plus the listener/connector
//! rendezvous, with byte transfer carried by pipe pairs. No real
//! transport is involved.

pub mod socket;

pub use socket::{Port, ShutdownMode, NOPORT};
