//! Mentor OS Kernel
//!
//! A teaching kernel's process, thread and IPC core, running in user
//! space: kernel threads are carried by host threads and the whole kernel
//! lives inside an ordinary process, which keeps every lifecycle and
//! synchronization problem real while leaving the hardware out of it.
//!
//! # Architecture Overview
//!
//! The kernel is split into four subsystems:
//!
//! - **ke** - Kernel Executive: the big kernel lock, the scheduler
//!   boundary (spawn/wakeup/sleep), condition variables
//! - **ps** - Process Manager: process and thread control blocks,
//!   exec/exit/wait, join/detach
//! - **io** - I/O: lock-free ring buffer, reference-counted streams,
//!   pipes
//! - **net** - Sockets: port table and listener/connector rendezvous over
//!   pipe pairs
//!
//! # Boot
//!
//! [`boot`] brings a kernel up, runs an init task inside it, and tears
//! everything down once init has exited:
//!
//! ```
//! use kernel::{boot, Sys};
//!
//! fn init(sys: &Sys, _args: &[u8]) -> i32 {
//!     assert_eq!(sys.get_pid().0, 1);
//!     0
//! }
//!
//! assert_eq!(boot(init, &[]), 0);
//! ```
//!
//! Tasks are plain functions: they receive the system call surface
//! ([`Sys`]) and a byte buffer copied from their creator, and their return
//! value becomes their exit value.

pub mod config;
pub mod error;
pub mod io;
pub mod ke;
pub mod net;
pub mod ps;

use std::sync::{Arc, Once};

use ke::kernel::Kernel;
pub use error::{Error, Result};
pub use io::streams::Fid;
pub use ke::kernel::Sys;
pub use ke::sched::{ThreadState, Tid};
pub use net::socket::{Port, ShutdownMode, NOPORT};
pub use ps::process::{Pid, PID_INIT};

/// A task entry point: the body of a process's main thread or of a
/// created thread.
pub type Task = fn(&Sys, &[u8]) -> i32;

/// Keep the exit-token unwinds used by `Sys::exit`/`Sys::thread_exit` out
/// of stderr; every other panic goes to the previously installed hook.
fn install_exit_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ps::ExitToken>().is_none() {
                previous(info);
            }
        }));
    });
}

/// Boot a kernel, run `init` as the init process, and return init's exit
/// status once the kernel has shut down.
///
/// Boot creates the bootstrap pseudo process (pid 0, no thread) and then
/// the init process (pid 1) running `init` with a copy of `args`. It then
/// sleeps until init has exited - init reaps every remaining process
/// before it goes - joins all kernel threads and dismantles the kernel.
///
/// # Panics
/// If the process table does not hand out pids 0 and 1 for the first two
/// processes, which would mean the allocator itself is broken.
pub fn boot(init: Task, args: &[u8]) -> i32 {
    install_exit_hook();
    let kernel = Arc::new(Kernel::new());

    {
        let mut st = kernel.lock();
        match ps::process::exec_locked(&kernel, &mut st, None, None, &[]) {
            Ok(pid) if pid == ps::process::PID_BOOT => {}
            other => panic!("bootstrap process did not get pid 0: {other:?}"),
        }
        match ps::process::exec_locked(&kernel, &mut st, None, Some(init), args) {
            Ok(pid) if pid == PID_INIT => {}
            other => panic!("init process did not get pid 1: {other:?}"),
        }
    }
    log::debug!("[KE] kernel booted, init running");

    kernel.wait_shutdown();

    // Collect the host threads. New handles can still appear while the
    // last few threads run off their trampolines, so drain until empty.
    loop {
        let handles = {
            let mut st = kernel.lock();
            st.threads.take_handles()
        };
        if handles.is_empty() {
            break;
        }
        for handle in handles {
            let _ = handle.join();
        }
    }

    let status = {
        let st = kernel.lock();
        st.procs.get(PID_INIT).map(|p| p.exitval).unwrap_or(-1)
    };
    log::debug!("[KE] kernel shut down, init exited with {status}");
    status
}
