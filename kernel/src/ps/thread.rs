//! Thread lifecycle (PTCB layer).
//!
//! Every logical thread - the main thread included - is described by a
//! per-thread control block owned by its process. The PTCB carries the
//! join/detach state and the exit value; the schedulable unit underneath
//! it is a TCB in the kernel thread table.
//!
//! A PTCB outlives its thread: it is flagged exited (rather than removed)
//! when the thread terminates, so joining an already-exited thread still
//! yields its value. Process exit drains the whole table.

use std::collections::VecDeque;
use std::panic::panic_any;

use crate::error::{Error, Result};
use crate::ke::kernel::Sys;
use crate::ke::sched::{self, ThreadEntry, ThreadState, Tid};
use crate::ke::wait::{self, CondVar, WaitChannel};
use crate::ps::process::PState;
use crate::ps::{run_task, ExitToken, TaskOutcome};
use crate::Task;

/// Staged argument record: everything a freshly created thread needs to
/// start running. Queued on the owning PCB between `create_thread` and
/// the trampoline, and consumed exactly once by the thread it was staged
/// for.
pub(crate) struct ArgSt {
    /// Task to run.
    pub task: Task,
    /// Argument bytes, copied from the creator.
    pub args: Vec<u8>,
    /// The per-thread record that will receive the task's return value.
    pub ptcb: u32,
}

/// Per-thread control block.
pub(crate) struct Ptcb {
    /// Process-relative thread id; never reused while the process lives.
    pub ptid: u32,
    /// The underlying kernel thread. Stays valid as an identifier after
    /// the thread exits.
    pub tid: Tid,
    /// A detached thread cannot be joined.
    pub detached: bool,
    /// Set once the thread has terminated and `exitval` is readable.
    pub exited: bool,
    /// The thread's exit value.
    pub exitval: i32,
    /// Number of threads currently blocked in a join on this record.
    pub waiting_for_me: u32,
    /// Broadcast when the thread exits.
    pub thread_exit: CondVar,
}

impl Ptcb {
    pub(crate) fn new(ptid: u32, tid: Tid) -> Self {
        Self {
            ptid,
            tid,
            detached: false,
            exited: false,
            exitval: -1,
            waiting_for_me: 0,
            thread_exit: CondVar::new(),
        }
    }
}

/// Trampoline for threads created by `create_thread`.
///
/// Pops the argument record staged for this thread, runs its task, and
/// exits the thread with the task's return value.
pub(crate) fn start_any_thread(sys: &Sys) {
    let staged = {
        let mut st = sys.kernel.lock();
        if let Some(tcb) = st.threads.get_mut(sys.tid) {
            tcb.state = ThreadState::Running;
        }
        let ptid = st.threads.get(sys.tid).and_then(|t| t.ptcb);
        // The TCB->PTCB link and the PTCB's own record must agree.
        debug_assert_eq!(
            ptid,
            st.procs
                .get(sys.pid)
                .and_then(|p| p.thread(sys.tid))
                .map(|p| p.ptid)
        );
        match (ptid, st.procs.get_mut(sys.pid)) {
            (Some(ptid), Some(pcb)) => pcb
                .arg_queue
                .iter()
                .position(|a| a.ptcb == ptid)
                .and_then(|i| pcb.arg_queue.remove(i)),
            _ => None,
        }
    };

    let outcome = match staged {
        Some(argst) => run_task(sys, argst.task, &argst.args),
        None => {
            log::error!(
                "[PS] thread {} of process {} has no staged arguments",
                sys.tid.0,
                sys.pid.0
            );
            TaskOutcome::Return(-1)
        }
    };

    match outcome {
        TaskOutcome::Return(value) | TaskOutcome::ThreadExit(value) => {
            thread_exit_bookkeeping(sys, value)
        }
        TaskOutcome::ProcessExit(status) => {
            crate::ps::process::exit_bookkeeping(sys, status)
        }
    }
}

/// Terminate the calling thread: the body of `Sys::thread_exit`.
///
/// The exit value is stored in the PTCB before any waiter is woken, so
/// every concurrent joiner observes it; the terminal state change and the
/// release of the kernel lock happen atomically in `sleep_releasing`.
pub(crate) fn thread_exit_bookkeeping(sys: &Sys, value: i32) {
    let kernel = &sys.kernel;
    let mut st = kernel.lock();

    let waiters = match st.procs.get_mut(sys.pid).and_then(|p| p.thread_mut(sys.tid)) {
        Some(ptcb) => {
            ptcb.exitval = value;
            ptcb.exited = true;
            if ptcb.waiting_for_me > 0 {
                ptcb.thread_exit.take()
            } else {
                VecDeque::new()
            }
        }
        // The process already exited and drained its table.
        None => VecDeque::new(),
    };
    sched::wake_list(&mut st.threads, waiters);

    log::debug!(
        "[PS] thread {} of process {} exited with value {}",
        sys.tid.0,
        sys.pid.0,
        value
    );
    let _ = sched::sleep_releasing(kernel, st, sys.tid, ThreadState::Exited);
}

impl Sys {
    /// Create a new thread in the calling process.
    ///
    /// The thread executes `task` with a copy of `args`; if the task
    /// returns, its return value becomes the thread's exit value. The
    /// returned handle can be joined or detached.
    pub fn create_thread(&self, task: Task, args: &[u8]) -> Result<Tid> {
        let mut st = self.kernel.lock();
        match st.procs.get(self.pid) {
            Some(pcb) if pcb.pstate == PState::Alive => {}
            _ => return Err(Error::NoProcess),
        }

        let tid = sched::spawn_thread(&self.kernel, &mut st, self.pid, ThreadEntry::StagedTask);
        let ptid = match st.procs.get_mut(self.pid) {
            Some(pcb) => {
                let ptid = pcb.next_ptid;
                pcb.next_ptid += 1;
                pcb.threads.push(Ptcb::new(ptid, tid));
                pcb.arg_queue.push_back(ArgSt {
                    task,
                    args: args.to_vec(),
                    ptcb: ptid,
                });
                ptid
            }
            None => {
                // Cannot happen while we hold the lock; release the
                // spawned thread so it terminates instead of parking
                // forever.
                sched::wakeup(&mut st.threads, tid);
                return Err(Error::NoProcess);
            }
        };
        if let Some(tcb) = st.threads.get_mut(tid) {
            tcb.ptcb = Some(ptid);
        }
        sched::wakeup(&mut st.threads, tid);

        log::debug!(
            "[PS] created thread {} (ptid {}) in process {}",
            tid.0,
            ptid,
            self.pid.0
        );
        Ok(tid)
    }

    /// Return the calling thread's handle.
    pub fn thread_self(&self) -> Tid {
        self.tid
    }

    /// Wait for the given thread to exit and return its exit value.
    ///
    /// The tid must name an undetached thread of the calling process,
    /// other than the caller itself. Any number of threads may join the
    /// same target concurrently; all of them observe the same value.
    pub fn thread_join(&self, tid: Tid) -> Result<i32> {
        let kernel = &self.kernel;
        let mut st = kernel.lock();

        if tid == self.tid {
            return Err(Error::JoinSelf);
        }
        {
            let pcb = st.procs.get_mut(self.pid).ok_or(Error::NoProcess)?;
            let ptcb = pcb.thread_mut(tid).ok_or(Error::NoThread)?;
            if ptcb.detached {
                return Err(Error::Detached);
            }
            ptcb.waiting_for_me += 1;
        }

        loop {
            let exited = match st.procs.get(self.pid).and_then(|p| p.thread(tid)) {
                Some(ptcb) => ptcb.exited,
                // Drained by a process exit while we slept.
                None => return Err(Error::NoThread),
            };
            if exited {
                break;
            }
            st = wait::cond_wait(kernel, st, self.tid, WaitChannel::ThreadExit(self.pid, tid));
        }

        let pcb = st.procs.get_mut(self.pid).ok_or(Error::NoProcess)?;
        let ptcb = pcb.thread_mut(tid).ok_or(Error::NoThread)?;
        ptcb.waiting_for_me = ptcb.waiting_for_me.saturating_sub(1);
        Ok(ptcb.exitval)
    }

    /// Detach the given thread, making subsequent joins on it fail.
    ///
    /// A thread may detach itself. An exited thread cannot be detached.
    pub fn thread_detach(&self, tid: Tid) -> Result<()> {
        let mut st = self.kernel.lock();
        let pcb = st.procs.get_mut(self.pid).ok_or(Error::NoProcess)?;
        let ptcb = pcb.thread_mut(tid).ok_or(Error::NoThread)?;
        if ptcb.exited {
            return Err(Error::Exited);
        }
        ptcb.detached = true;
        Ok(())
    }

    /// Terminate the calling thread with the given exit value. Never
    /// returns.
    pub fn thread_exit(&self, value: i32) -> ! {
        panic_any(ExitToken::Thread(value))
    }

    /// Interrupt the given thread. Not implemented; always fails.
    pub fn thread_interrupt(&self, _tid: Tid) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Return the calling thread's interrupt flag. Not implemented;
    /// always false.
    pub fn thread_is_interrupted(&self) -> bool {
        false
    }

    /// Clear the calling thread's interrupt flag. Not implemented; does
    /// nothing.
    pub fn thread_clear_interrupt(&self) {}
}
