//! Kernel thread scheduling boundary.
//!
//! Kernel threads are carried by host threads, one per TCB. The scheduler
//! surface is the classic trio:
//!
//! - `spawn_thread` - create a new kernel thread for a process, parked
//! - `wakeup` - make a created/blocked thread runnable again
//! - `sleep_releasing` - publish a new thread state and release the big
//!   kernel lock while the thread suspends
//!
//! A thread suspends by parking on its own token (a mutex + condvar pair).
//! Wakeups grant the token, so a wakeup that lands between releasing the
//! kernel lock and actually parking is not lost; the park simply returns
//! immediately. Spurious token grants are harmless because every sleeper
//! re-checks its predicate under the kernel lock.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::ke::kernel::{KGuard, Kernel, Sys};
use crate::ps::process::Pid;

/// Thread identifier: an index into the kernel's thread table.
///
/// Slots are never recycled within a kernel's lifetime, so a `Tid` stays a
/// valid identifier after its thread exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid(pub usize);

/// Thread states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Thread exists but has not been woken for the first time
    Created = 0,
    /// Thread has been made runnable
    Ready = 1,
    /// Thread is executing its task
    Running = 2,
    /// Thread is suspended on a condition variable
    Blocked = 3,
    /// Thread has terminated
    Exited = 4,
}

/// What a freshly spawned thread should run once it is first woken.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ThreadEntry {
    /// Run the owning process's main task, then exit the process.
    MainTask,
    /// Pop a staged argument record and run its task, then exit the thread.
    StagedTask,
}

/// Per-thread parking spot. The token records a pending wakeup.
pub(crate) struct Parker {
    token: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            token: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Suspend until a token is granted, then consume it.
    pub(crate) fn park(&self) {
        let mut token = self.token.lock().unwrap();
        while !*token {
            token = self.cond.wait(token).unwrap();
        }
        *token = false;
    }

    /// Grant a token, releasing at most one park.
    pub(crate) fn unpark(&self) {
        *self.token.lock().unwrap() = true;
        self.cond.notify_one();
    }
}

/// Thread control block: the schedulable unit.
pub(crate) struct Tcb {
    /// Current thread state, readable under the kernel lock.
    pub state: ThreadState,
    /// Owning process.
    pub pid: Pid,
    /// Back-reference to the per-thread record in the owning process.
    pub ptcb: Option<u32>,
    /// Parking spot shared with the host thread.
    pub parker: Arc<Parker>,
    /// Host thread handle, collected at kernel teardown.
    pub join: Option<JoinHandle<()>>,
}

/// The kernel's thread table. Slots are append-only.
pub(crate) struct ThreadTable {
    slots: Vec<Tcb>,
}

impl ThreadTable {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn get(&self, tid: Tid) -> Option<&Tcb> {
        self.slots.get(tid.0)
    }

    pub(crate) fn get_mut(&mut self, tid: Tid) -> Option<&mut Tcb> {
        self.slots.get_mut(tid.0)
    }

    /// Take every live host-thread handle out of the table.
    pub(crate) fn take_handles(&mut self) -> Vec<JoinHandle<()>> {
        self.slots.iter_mut().filter_map(|t| t.join.take()).collect()
    }
}

/// Spawn a new kernel thread for `pid`.
///
/// The thread starts parked; it does not run until the first `wakeup`.
/// Must be called with the kernel lock held.
pub(crate) fn spawn_thread(
    kernel: &Arc<Kernel>,
    st: &mut crate::ke::kernel::KernelState,
    pid: Pid,
    entry: ThreadEntry,
) -> Tid {
    let tid = Tid(st.threads.slots.len());
    let parker = Arc::new(Parker::new());

    let thread_kernel = Arc::clone(kernel);
    let thread_parker = Arc::clone(&parker);
    let handle = std::thread::Builder::new()
        .name(format!("kthread-{}", tid.0))
        .spawn(move || {
            thread_parker.park();
            let sys = Sys {
                kernel: thread_kernel,
                tid,
                pid,
            };
            match entry {
                ThreadEntry::MainTask => crate::ps::process::start_main_thread(&sys),
                ThreadEntry::StagedTask => crate::ps::thread::start_any_thread(&sys),
            }
        })
        .expect("host refused to spawn a kernel thread");

    st.threads.slots.push(Tcb {
        state: ThreadState::Created,
        pid,
        ptcb: None,
        parker,
        join: Some(handle),
    });
    log::trace!("[KE] spawned thread {} for process {}", tid.0, pid.0);
    tid
}

/// Wake a thread, if it is sleeping.
///
/// Must be called with the kernel lock held. Returns false if the thread
/// has already exited.
pub(crate) fn wakeup(threads: &mut ThreadTable, tid: Tid) -> bool {
    match threads.get_mut(tid) {
        Some(tcb) if tcb.state != ThreadState::Exited => {
            tcb.state = ThreadState::Ready;
            tcb.parker.unpark();
            true
        }
        _ => false,
    }
}

/// Wake every thread on a waiter list.
pub(crate) fn wake_list(threads: &mut ThreadTable, list: std::collections::VecDeque<Tid>) {
    for tid in list {
        wakeup(threads, tid);
    }
}

/// Publish `state` for the current thread and release the kernel lock
/// while it suspends.
///
/// For a blocking state the thread parks and the reacquired lock guard is
/// returned once it is woken. For [`ThreadState::Exited`] the suspension
/// is terminal: the lock is released and `None` is returned, after which
/// the host thread is expected to unwind off its trampoline.
pub(crate) fn sleep_releasing<'k>(
    kernel: &'k Kernel,
    mut st: KGuard<'k>,
    tid: Tid,
    state: ThreadState,
) -> Option<KGuard<'k>> {
    let parker = match st.threads.get_mut(tid) {
        Some(tcb) => {
            tcb.state = state;
            log::trace!(
                "[KE] thread {} of process {} -> {:?}",
                tid.0,
                tcb.pid.0,
                state
            );
            Arc::clone(&tcb.parker)
        }
        None => return Some(st),
    };
    drop(st);

    if state == ThreadState::Exited {
        return None;
    }

    parker.park();

    let mut st = kernel.lock();
    if let Some(tcb) = st.threads.get_mut(tid) {
        tcb.state = ThreadState::Running;
    }
    Some(st)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parker_token_survives_early_unpark() {
        let parker = Arc::new(Parker::new());
        parker.unpark();
        // The token is already granted, so this must not block.
        parker.park();
    }

    #[test]
    fn parker_wakes_a_parked_thread() {
        let parker = Arc::new(Parker::new());
        let remote = Arc::clone(&parker);
        let waiter = std::thread::spawn(move || remote.park());
        std::thread::sleep(Duration::from_millis(10));
        parker.unpark();
        waiter.join().unwrap();
    }
}
