//! Process lifecycle (PCB layer).
//!
//! The process table and related system calls:
//!
//! - `exec` - create a process and its main thread
//! - `exit` - terminate the calling process
//! - `wait_child` - reap a specific child or any child
//! - `get_pid` / `get_ppid`
//!
//! A process is created ALIVE, turns ZOMBIE when it exits, and its slot is
//! only returned to the free list once its parent (or init, for orphans)
//! reaps it. Pid 0 is the bootstrap pseudo process (no thread, never
//! exits) and pid 1 is init, the universal reparenting target; both are
//! parentless.

use std::collections::VecDeque;
use std::panic::panic_any;
use std::sync::Arc;

use crate::config::{MAX_FILEID, MAX_PROC};
use crate::error::{Error, Result};
use crate::io::streams::{self, FcbId};
use crate::ke::kernel::{Kernel, KernelState, Sys};
use crate::ke::sched::{self, ThreadEntry, ThreadState, Tid};
use crate::ke::wait::{self, CondVar, WaitChannel};
use crate::ps::thread::Ptcb;
use crate::ps::{run_task, ExitToken, TaskOutcome};
use crate::Task;

/// Process identifier: an index into the process table. Slots are reused
/// after a zombie is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub usize);

/// The bootstrap pseudo process.
pub const PID_BOOT: Pid = Pid(0);

/// The init process, parent of last resort.
pub const PID_INIT: Pid = Pid(1);

/// Process states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PState {
    /// Slot is on the free list
    Free = 0,
    /// Process is live
    Alive = 1,
    /// Process has exited but has not been reaped
    Zombie = 2,
}

/// Process control block.
pub(crate) struct Pcb {
    /// Own pid (also the slot index).
    pub pid: Pid,
    /// Lifecycle state.
    pub pstate: PState,
    /// Parent process; None for pids 0 and 1.
    pub parent: Option<Pid>,
    /// Live and zombie children, in creation order.
    pub children: VecDeque<Pid>,
    /// Exited children awaiting reap, oldest first.
    pub exited: VecDeque<Pid>,
    /// File descriptor table.
    pub fidt: [Option<FcbId>; MAX_FILEID],
    /// The main thread, while the process is alive.
    pub main_thread: Option<Tid>,
    /// Per-thread records, including the main thread's.
    pub threads: Vec<Ptcb>,
    /// Next process-relative thread id; never reused while the process lives.
    pub next_ptid: u32,
    /// Entry point of the main thread.
    pub main_task: Option<Task>,
    /// Argument buffer, copied from the creator at exec time.
    pub args: Vec<u8>,
    /// Staged argument records for threads that have not started yet.
    pub arg_queue: VecDeque<crate::ps::thread::ArgSt>,
    /// Exit status, valid once ZOMBIE.
    pub exitval: i32,
    /// Signaled whenever one of this process's children turns zombie.
    pub child_exit: CondVar,
}

impl Pcb {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            pstate: PState::Free,
            parent: None,
            children: VecDeque::new(),
            exited: VecDeque::new(),
            fidt: [None; MAX_FILEID],
            main_thread: None,
            threads: Vec::new(),
            next_ptid: 0,
            main_task: None,
            args: Vec::new(),
            arg_queue: VecDeque::new(),
            exitval: 0,
            child_exit: CondVar::new(),
        }
    }

    fn reset(&mut self) {
        self.parent = None;
        self.children.clear();
        self.exited.clear();
        self.fidt = [None; MAX_FILEID];
        self.main_thread = None;
        self.threads.clear();
        self.next_ptid = 0;
        self.main_task = None;
        self.args.clear();
        self.arg_queue.clear();
        self.exitval = 0;
        self.child_exit = CondVar::new();
    }

    /// Find the per-thread record for `tid`.
    pub(crate) fn thread(&self, tid: Tid) -> Option<&Ptcb> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    /// Find the per-thread record for `tid`, mutably.
    pub(crate) fn thread_mut(&mut self, tid: Tid) -> Option<&mut Ptcb> {
        self.threads.iter_mut().find(|t| t.tid == tid)
    }
}

/// The bounded process table with its free list.
pub(crate) struct ProcTable {
    slots: Vec<Pcb>,
    free: Vec<Pid>,
    alive: usize,
}

impl ProcTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            alive: 0,
        }
    }

    /// Look up a non-FREE process.
    pub(crate) fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots.get(pid.0).filter(|p| p.pstate != PState::Free)
    }

    /// Look up a non-FREE process, mutably.
    pub(crate) fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slots
            .get_mut(pid.0)
            .filter(|p| p.pstate != PState::Free)
    }

    /// Number of live (ALIVE or ZOMBIE) processes.
    pub(crate) fn live_count(&self) -> usize {
        self.alive
    }

    /// Pull a PCB off the free list and mark it ALIVE.
    fn acquire(&mut self) -> Option<Pid> {
        let pid = match self.free.pop() {
            Some(pid) => pid,
            None => {
                if self.slots.len() >= MAX_PROC {
                    return None;
                }
                let pid = Pid(self.slots.len());
                self.slots.push(Pcb::new(pid));
                pid
            }
        };
        let pcb = &mut self.slots[pid.0];
        pcb.reset();
        pcb.pstate = PState::Alive;
        self.alive += 1;
        Some(pid)
    }

    /// Return a reaped PCB to the free list.
    fn release(&mut self, pid: Pid) {
        if let Some(pcb) = self.slots.get_mut(pid.0) {
            pcb.pstate = PState::Free;
            self.free.push(pid);
            self.alive -= 1;
        }
    }
}

// ============================================================================
// Process creation
// ============================================================================

/// Create a new process, optionally with a main thread.
///
/// Processes with pid <= 1 (bootstrap and init) are parentless; everyone
/// else links into the creator's child list and inherits its open file
/// descriptors with incremented refcounts. The argument buffer is copied
/// into storage owned by the new PCB. A `None` task creates an inert PCB
/// with no thread - that is how the bootstrap pseudo process comes to be.
///
/// Must be called with the kernel lock held.
pub(crate) fn exec_locked(
    kernel: &Arc<Kernel>,
    st: &mut KernelState,
    creator: Option<Pid>,
    task: Option<Task>,
    args: &[u8],
) -> Result<Pid> {
    let pid = st.procs.acquire().ok_or(Error::ProcessLimit)?;

    if pid.0 > 1 {
        if let Some(cpid) = creator {
            let inherited: Vec<(usize, FcbId)> = match st.procs.get_mut(cpid) {
                Some(creator_pcb) => {
                    creator_pcb.children.push_back(pid);
                    creator_pcb
                        .fidt
                        .iter()
                        .enumerate()
                        .filter_map(|(i, slot)| slot.map(|f| (i, f)))
                        .collect()
                }
                None => Vec::new(),
            };
            for &(_, fcb) in &inherited {
                streams::fcb_incref(st, fcb);
            }
            if let Some(pcb) = st.procs.get_mut(pid) {
                pcb.parent = Some(cpid);
                for (i, fcb) in inherited {
                    pcb.fidt[i] = Some(fcb);
                }
            }
        }
    }

    if let Some(pcb) = st.procs.get_mut(pid) {
        pcb.main_task = task;
        pcb.args = args.to_vec();
    }

    // Spawning and waking the main thread is the last step: once woken it
    // may run immediately, so the PCB must already be complete.
    if task.is_some() {
        let tid = sched::spawn_thread(kernel, st, pid, ThreadEntry::MainTask);
        let ptid = match st.procs.get_mut(pid) {
            Some(pcb) => {
                let ptid = pcb.next_ptid;
                pcb.next_ptid += 1;
                pcb.threads.push(Ptcb::new(ptid, tid));
                pcb.main_thread = Some(tid);
                ptid
            }
            None => 0,
        };
        if let Some(tcb) = st.threads.get_mut(tid) {
            tcb.ptcb = Some(ptid);
        }
        sched::wakeup(&mut st.threads, tid);
    }

    log::debug!(
        "[PS] created process {} (parent {:?})",
        pid.0,
        creator.filter(|_| pid.0 > 1).map(|p| p.0)
    );
    Ok(pid)
}

/// Trampoline for the main thread of a process.
///
/// Runs the PCB's staged main task and then exits the process with the
/// task's return value.
pub(crate) fn start_main_thread(sys: &Sys) {
    let staged = {
        let mut st = sys.kernel.lock();
        if let Some(tcb) = st.threads.get_mut(sys.tid) {
            tcb.state = ThreadState::Running;
        }
        debug_assert_eq!(
            st.procs.get(sys.pid).and_then(|p| p.main_thread),
            Some(sys.tid)
        );
        st.procs
            .get(sys.pid)
            .and_then(|p| p.main_task.map(|task| (task, p.args.clone())))
    };

    let outcome = match staged {
        Some((task, args)) => run_task(sys, task, &args),
        None => {
            log::error!("[PS] process {} has no main task", sys.pid.0);
            TaskOutcome::Return(-1)
        }
    };

    match outcome {
        TaskOutcome::Return(status) | TaskOutcome::ProcessExit(status) => {
            exit_bookkeeping(sys, status)
        }
        TaskOutcome::ThreadExit(value) => crate::ps::thread::thread_exit_bookkeeping(sys, value),
    }
}

// ============================================================================
// Process termination
// ============================================================================

/// Terminate the calling process: the body of `Sys::exit`.
///
/// Init first reaps every remaining descendant - it must not vanish while
/// it is still the reparenting target. The exiting process then releases
/// its descriptors, hands its children (and its unreaped zombies) to init,
/// queues itself on its parent's exited list, drains its thread table and
/// turns ZOMBIE before suspending for good.
pub(crate) fn exit_bookkeeping(sys: &Sys, status: i32) {
    if sys.pid == PID_INIT {
        while sys.wait_child(None).is_ok() {}
    }

    let kernel = &sys.kernel;
    let mut st = kernel.lock();
    let pid = sys.pid;

    // Release the descriptor table.
    let open: Vec<FcbId> = match st.procs.get_mut(pid) {
        Some(pcb) => pcb.fidt.iter_mut().filter_map(|slot| slot.take()).collect(),
        None => Vec::new(),
    };
    for fcb in open {
        streams::fcb_decref(&mut st, fcb);
    }

    let (children, exited, parent) = match st.procs.get_mut(pid) {
        Some(pcb) => (
            core::mem::take(&mut pcb.children),
            core::mem::take(&mut pcb.exited),
            pcb.parent,
        ),
        None => (VecDeque::new(), VecDeque::new(), None),
    };

    // Reparent children to init, preserving their order, and hand over any
    // zombies we never got around to reaping.
    for &child in &children {
        if let Some(cpcb) = st.procs.get_mut(child) {
            cpcb.parent = Some(PID_INIT);
        }
    }
    if pid != PID_INIT && (!children.is_empty() || !exited.is_empty()) {
        let had_zombies = !exited.is_empty();
        if let Some(init) = st.procs.get_mut(PID_INIT) {
            init.children.extend(children);
            init.exited.extend(exited);
        }
        if had_zombies {
            wait::cond_broadcast(&mut st, WaitChannel::ChildExit(PID_INIT));
        }
    }

    // Queue ourselves on the parent's exited list and wake it.
    if let Some(ppid) = parent {
        if let Some(parent_pcb) = st.procs.get_mut(ppid) {
            parent_pcb.exited.push_back(pid);
        }
        wait::cond_broadcast(&mut st, WaitChannel::ChildExit(ppid));
    }

    // Drain the thread table. Every queued joiner (and any sibling stuck
    // in wait_child) is woken first so nobody sleeps on a record that is
    // about to disappear; once woken they find the process ZOMBIE and
    // fail.
    let queues: Vec<VecDeque<Tid>> = match st.procs.get_mut(pid) {
        Some(pcb) => {
            let mut queues = vec![pcb.child_exit.take()];
            for ptcb in &mut pcb.threads {
                queues.push(ptcb.thread_exit.take());
            }
            pcb.threads.clear();
            pcb.arg_queue.clear();
            pcb.main_thread = None;
            pcb.main_task = None;
            pcb.args.clear();
            pcb.pstate = PState::Zombie;
            pcb.exitval = status;
            queues
        }
        None => Vec::new(),
    };
    for queue in queues {
        sched::wake_list(&mut st.threads, queue);
    }

    log::debug!(
        "[PS] process {} exited with status {} ({} live)",
        pid.0,
        status,
        st.procs.live_count()
    );

    if pid == PID_INIT {
        kernel.notify_shutdown();
    }

    let _ = sched::sleep_releasing(kernel, st, sys.tid, ThreadState::Exited);
}

// ============================================================================
// Reaping
// ============================================================================

/// Free a zombie child and return its exit status.
///
/// The zombie is unlinked from its parent's child and exited lists and its
/// slot goes back on the free list, making the pid eligible for reuse.
fn cleanup_zombie(st: &mut KernelState, cpid: Pid) -> i32 {
    let (status, parent) = match st.procs.get(cpid) {
        Some(z) => {
            debug_assert_eq!(z.pid, cpid);
            debug_assert_eq!(z.pstate, PState::Zombie);
            (z.exitval, z.parent)
        }
        None => return -1,
    };
    if let Some(ppid) = parent {
        if let Some(parent_pcb) = st.procs.get_mut(ppid) {
            if let Some(i) = parent_pcb.children.iter().position(|p| *p == cpid) {
                parent_pcb.children.remove(i);
            }
            if let Some(i) = parent_pcb.exited.iter().position(|p| *p == cpid) {
                parent_pcb.exited.remove(i);
            }
        }
    }
    st.procs.release(cpid);
    log::debug!("[PS] reaped process {} (status {})", cpid.0, status);
    status
}

fn wait_for_any_child(sys: &Sys) -> Result<(Pid, i32)> {
    let kernel = &sys.kernel;
    let mut st = kernel.lock();

    {
        let pcb = st.procs.get(sys.pid).ok_or(Error::NoProcess)?;
        if pcb.children.is_empty() {
            return Err(Error::NoChild);
        }
    }

    let cpid = loop {
        let pcb = st.procs.get_mut(sys.pid).ok_or(Error::NoProcess)?;
        if pcb.pstate != PState::Alive {
            return Err(Error::NoChild);
        }
        if let Some(cpid) = pcb.exited.pop_front() {
            break cpid;
        }
        st = wait::cond_wait(kernel, st, sys.tid, WaitChannel::ChildExit(sys.pid));
    };

    let status = cleanup_zombie(&mut st, cpid);
    Ok((cpid, status))
}

fn wait_for_specific_child(sys: &Sys, cpid: Pid) -> Result<i32> {
    let kernel = &sys.kernel;
    let mut st = kernel.lock();

    if cpid.0 >= MAX_PROC {
        return Err(Error::NoChild);
    }
    match st.procs.get(cpid) {
        Some(child) if child.parent == Some(sys.pid) => {}
        _ => return Err(Error::NoChild),
    }

    loop {
        {
            let me = st.procs.get(sys.pid).ok_or(Error::NoProcess)?;
            if me.pstate != PState::Alive {
                return Err(Error::NoChild);
            }
        }
        // Revalidate the child on every pass: a sibling's wait-any may
        // have reaped it while we slept.
        match st.procs.get(cpid) {
            None => return Err(Error::NoChild),
            Some(child) if child.parent != Some(sys.pid) => return Err(Error::NoChild),
            Some(child) if child.pstate == PState::Zombie => break,
            Some(_) => {}
        }
        st = wait::cond_wait(kernel, st, sys.tid, WaitChannel::ChildExit(sys.pid));
    }

    let status = cleanup_zombie(&mut st, cpid);
    Ok(status)
}

// ============================================================================
// System calls
// ============================================================================

impl Sys {
    /// Create a new process running `task` with a copy of `args`.
    ///
    /// The new process inherits the caller's open file descriptors and
    /// becomes the caller's child.
    ///
    /// # Returns
    /// The new pid, or [`Error::ProcessLimit`] if the table is full.
    pub fn exec(&self, task: Task, args: &[u8]) -> Result<Pid> {
        let mut st = self.kernel.lock();
        exec_locked(&self.kernel, &mut st, Some(self.pid), Some(task), args)
    }

    /// Terminate the calling process with the given status. Never returns.
    pub fn exit(&self, status: i32) -> ! {
        panic_any(ExitToken::Process(status))
    }

    /// Wait for a child to exit and reap it.
    ///
    /// With `Some(cpid)` the caller blocks until that specific child turns
    /// zombie; with `None` it blocks until any child can be reaped (oldest
    /// exit first) and fails immediately if it has no children at all.
    ///
    /// # Returns
    /// The reaped child's pid and exit status. Exactly one waiter can
    /// reap a given zombie; its pid is free for reuse afterwards.
    pub fn wait_child(&self, cpid: Option<Pid>) -> Result<(Pid, i32)> {
        match cpid {
            Some(cpid) => wait_for_specific_child(self, cpid).map(|status| (cpid, status)),
            None => wait_for_any_child(self),
        }
    }

    /// Return the calling process's pid.
    pub fn get_pid(&self) -> Pid {
        self.pid
    }

    /// Return the parent's pid, or None for parentless processes.
    pub fn get_ppid(&self) -> Option<Pid> {
        let st = self.kernel.lock();
        st.procs.get(self.pid).and_then(|p| p.parent)
    }
}
