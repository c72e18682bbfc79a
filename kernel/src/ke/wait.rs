//! Monitor-style condition variables.
//!
//! Every waitable kernel object carries a [`CondVar`]: a queue of thread
//! ids. All queues live inside `KernelState` and are only touched with the
//! kernel lock held, so the wait protocol is the classic monitor one:
//!
//! 1. enqueue the current thread on the object's queue (lock held)
//! 2. release the lock and suspend via the scheduler
//! 3. on wakeup, reacquire the lock and re-check the predicate
//!
//! Waits are addressed by a [`WaitChannel`] key rather than a reference,
//! because the object a sleeper waited on may be gone by the time it is
//! woken (its process exited, its pipe was released). A wait on a channel
//! that no longer resolves returns immediately; the caller's predicate
//! loop then observes the vanished object and fails cleanly.

use std::collections::VecDeque;

use crate::io::pipe::PipeId;
use crate::ke::kernel::{KGuard, Kernel, KernelState};
use crate::ke::sched::{self, ThreadState, Tid};
use crate::net::socket::SockId;
use crate::ps::process::Pid;

/// A queue of threads waiting for a condition to be signaled.
pub(crate) struct CondVar {
    waiters: VecDeque<Tid>,
}

impl CondVar {
    pub(crate) fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, tid: Tid) {
        self.waiters.push_back(tid);
    }

    pub(crate) fn pop(&mut self) -> Option<Tid> {
        self.waiters.pop_front()
    }

    /// Remove and return every queued waiter.
    pub(crate) fn take(&mut self) -> VecDeque<Tid> {
        core::mem::take(&mut self.waiters)
    }
}

/// Key naming a condition variable inside the kernel state.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WaitChannel {
    /// A process's child-exit condition.
    ChildExit(Pid),
    /// A thread's exit condition, addressed by owning process and tid.
    ThreadExit(Pid, Tid),
    /// A pipe's data-available condition.
    PipeReader(PipeId),
    /// A pipe's space-available condition.
    PipeWriter(PipeId),
    /// A socket's rendezvous condition (pending connections).
    Rendezvous(SockId),
}

fn resolve(st: &mut KernelState, ch: WaitChannel) -> Option<&mut CondVar> {
    match ch {
        WaitChannel::ChildExit(pid) => st.procs.get_mut(pid).map(|p| &mut p.child_exit),
        WaitChannel::ThreadExit(pid, tid) => st
            .procs
            .get_mut(pid)
            .and_then(|p| p.thread_mut(tid))
            .map(|t| &mut t.thread_exit),
        WaitChannel::PipeReader(id) => st.pipes.get_mut(id).map(|p| &mut p.reader_var),
        WaitChannel::PipeWriter(id) => st.pipes.get_mut(id).map(|p| &mut p.writer_var),
        WaitChannel::Rendezvous(id) => st.socks.get_mut(id).map(|s| &mut s.rendezvous),
    }
}

/// Block the current thread on `ch`, releasing the kernel lock while it
/// sleeps. Returns the reacquired lock guard.
pub(crate) fn cond_wait<'k>(
    kernel: &'k Kernel,
    mut st: KGuard<'k>,
    tid: Tid,
    ch: WaitChannel,
) -> KGuard<'k> {
    match resolve(&mut st, ch) {
        Some(cv) => cv.push(tid),
        // The object is gone; report as an immediate wakeup and let the
        // caller's predicate loop notice.
        None => return st,
    }
    match sched::sleep_releasing(kernel, st, tid, ThreadState::Blocked) {
        Some(guard) => guard,
        None => kernel.lock(),
    }
}

/// Wake one waiter on `ch`, if any.
pub(crate) fn cond_signal(st: &mut KernelState, ch: WaitChannel) {
    let woken = match resolve(st, ch) {
        Some(cv) => cv.pop(),
        None => None,
    };
    if let Some(tid) = woken {
        sched::wakeup(&mut st.threads, tid);
    }
}

/// Wake every waiter on `ch`.
pub(crate) fn cond_broadcast(st: &mut KernelState, ch: WaitChannel) {
    let woken = match resolve(st, ch) {
        Some(cv) => cv.take(),
        None => return,
    };
    sched::wake_list(&mut st.threads, woken);
}
