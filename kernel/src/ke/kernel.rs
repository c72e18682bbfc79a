//! The kernel context object.
//!
//! All mutable kernel state - the process table, thread table, stream
//! table, pipe table, socket table and port table - lives in one
//! [`KernelState`] guarded by a single big kernel lock. Every system call
//! takes the lock on entry and releases it on every exit path; the only
//! suspension points are condition waits and the terminal exit sleep, both
//! of which release the lock atomically with the state change.
//!
//! The kernel is an owned object rather than global state: several kernel
//! instances can coexist in one host process without interfering, which is
//! also what lets each test boot its own.

use std::sync::Arc;

use crate::io::pipe::PipeTable;
use crate::io::streams::FcbTable;
use crate::ke::sched::{Parker, ThreadTable, Tid};
use crate::net::socket::{PortTable, SockTable};
use crate::ps::process::{Pid, ProcTable};

/// Guard for the big kernel lock.
pub(crate) type KGuard<'a> = spin::MutexGuard<'a, KernelState>;

/// Everything the kernel lock protects.
pub(crate) struct KernelState {
    /// Process table (PCBs).
    pub procs: ProcTable,
    /// Thread table (TCBs).
    pub threads: ThreadTable,
    /// Stream control blocks shared through descriptor tables.
    pub fcbs: FcbTable,
    /// Pipe control blocks.
    pub pipes: PipeTable,
    /// Socket control blocks.
    pub socks: SockTable,
    /// Port number to listener bindings.
    pub ports: PortTable,
}

/// The kernel context object.
pub struct Kernel {
    state: spin::Mutex<KernelState>,
    /// Parked on by the boot thread until init turns zombie.
    shutdown: Parker,
}

impl Kernel {
    pub(crate) fn new() -> Self {
        Self {
            state: spin::Mutex::new(KernelState {
                procs: ProcTable::new(),
                threads: ThreadTable::new(),
                fcbs: FcbTable::new(),
                pipes: PipeTable::new(),
                socks: SockTable::new(),
                ports: PortTable::new(),
            }),
            shutdown: Parker::new(),
        }
    }

    /// Take the big kernel lock.
    pub(crate) fn lock(&self) -> KGuard<'_> {
        self.state.lock()
    }

    /// Block the boot thread until the init process has exited.
    pub(crate) fn wait_shutdown(&self) {
        self.shutdown.park();
    }

    /// Signal the boot thread that the init process has exited.
    pub(crate) fn notify_shutdown(&self) {
        self.shutdown.unpark();
    }
}

/// The system call surface handed to every task.
///
/// A `Sys` identifies the calling thread and process; tasks receive one by
/// reference and perform every kernel operation through it. It is the
/// kernel-side equivalent of "the current thread".
pub struct Sys {
    pub(crate) kernel: Arc<Kernel>,
    pub(crate) tid: Tid,
    pub(crate) pid: Pid,
}
