//! Process Manager (ps)
//!
//! Process and thread lifecycles:
//!
//! - **PCB layer**: process table, Exec/Exit/WaitChild, zombie reaping,
//!   orphan reparenting to init
//! - **PTCB layer**: per-thread records, CreateThread/Join/Detach/Exit
//!   with multi-waiter broadcast

pub mod process;
pub mod thread;

pub use process::Pid;

use std::panic::{self, AssertUnwindSafe};

use crate::ke::kernel::Sys;
use crate::Task;

/// Unwind payload used by the terminal exit calls.
///
/// `Sys::exit` and `Sys::thread_exit` never return; they unwind back to
/// the thread trampoline carrying one of these, and the trampoline
/// performs the matching bookkeeping. The panic hook installed at boot
/// keeps these payloads out of stderr.
pub(crate) enum ExitToken {
    /// The whole process exits with this status.
    Process(i32),
    /// Only the calling thread exits with this value.
    Thread(i32),
}

/// How a task left its trampoline.
pub(crate) enum TaskOutcome {
    /// The task function returned normally.
    Return(i32),
    /// The task called `exit`.
    ProcessExit(i32),
    /// The task called `thread_exit`.
    ThreadExit(i32),
}

/// Run a task to completion, translating unwinds into outcomes.
///
/// A stray panic (anything that is not an [`ExitToken`]) is logged and
/// treated as a normal return of -1 so one broken task cannot take the
/// kernel down with it.
pub(crate) fn run_task(sys: &Sys, task: Task, args: &[u8]) -> TaskOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| task(sys, args))) {
        Ok(value) => TaskOutcome::Return(value),
        Err(payload) => match payload.downcast::<ExitToken>() {
            Ok(token) => match *token {
                ExitToken::Process(status) => TaskOutcome::ProcessExit(status),
                ExitToken::Thread(value) => TaskOutcome::ThreadExit(value),
            },
            Err(_) => {
                log::error!(
                    "[PS] unhandled panic in task of process {}; treating as exit(-1)",
                    sys.pid.0
                );
                TaskOutcome::Return(-1)
            }
        },
    }
}
