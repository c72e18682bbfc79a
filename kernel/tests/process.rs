//! Process lifecycle integration tests.
//!
//! Every test boots a private kernel and drives it from its init task;
//! results come back through exit values and wait statuses.

use kernel::{boot, Error, Fid, Pid, Sys, PID_INIT};

fn exit_seven(_sys: &Sys, _args: &[u8]) -> i32 {
    7
}

fn init_wait_specific(sys: &Sys, _args: &[u8]) -> i32 {
    let pid = sys.exec(exit_seven, &[]).unwrap();
    let (reaped, status) = sys.wait_child(Some(pid)).unwrap();
    assert_eq!(reaped, pid);
    assert_eq!(status, 7);
    0
}

#[test]
fn waitchild_specific_returns_exit_code() {
    assert_eq!(boot(init_wait_specific, &[]), 0);
}

fn init_pid_reuse(sys: &Sys, _args: &[u8]) -> i32 {
    let first = sys.exec(exit_seven, &[]).unwrap();
    sys.wait_child(Some(first)).unwrap();
    // The reaped slot is first in line for reuse.
    let second = sys.exec(exit_seven, &[]).unwrap();
    assert_eq!(first, second);
    sys.wait_child(Some(second)).unwrap();
    0
}

#[test]
fn reaped_pid_is_reused() {
    assert_eq!(boot(init_pid_reuse, &[]), 0);
}

fn init_wait_no_children(sys: &Sys, _args: &[u8]) -> i32 {
    assert_eq!(sys.wait_child(None), Err(Error::NoChild));
    0
}

#[test]
fn wait_any_without_children_fails() {
    assert_eq!(boot(init_wait_no_children, &[]), 0);
}

fn init_wait_not_my_child(sys: &Sys, _args: &[u8]) -> i32 {
    // Pid 0 exists but is nobody's child; an unused pid does not exist.
    assert_eq!(sys.wait_child(Some(Pid(0))), Err(Error::NoChild));
    assert_eq!(sys.wait_child(Some(Pid(999))), Err(Error::NoChild));
    0
}

#[test]
fn wait_for_foreign_pid_fails() {
    assert_eq!(boot(init_wait_not_my_child, &[]), 0);
}

fn init_identity(sys: &Sys, _args: &[u8]) -> i32 {
    assert_eq!(sys.get_pid(), PID_INIT);
    assert_eq!(sys.get_ppid(), None);
    let pid = sys.exec(check_parent_is_init, &[]).unwrap();
    let (_, status) = sys.wait_child(Some(pid)).unwrap();
    status
}

fn check_parent_is_init(sys: &Sys, _args: &[u8]) -> i32 {
    if sys.get_ppid() == Some(PID_INIT) {
        0
    } else {
        1
    }
}

#[test]
fn pids_and_parents_are_reported() {
    assert_eq!(boot(init_identity, &[]), 0);
}

fn explicit_exit(sys: &Sys, _args: &[u8]) -> i32 {
    sys.exit(33);
}

fn init_explicit_exit(sys: &Sys, _args: &[u8]) -> i32 {
    let pid = sys.exec(explicit_exit, &[]).unwrap();
    let (_, status) = sys.wait_child(Some(pid)).unwrap();
    assert_eq!(status, 33);
    0
}

#[test]
fn exit_syscall_sets_the_status() {
    assert_eq!(boot(init_explicit_exit, &[]), 0);
}

fn init_args_are_copied(sys: &Sys, args: &[u8]) -> i32 {
    assert_eq!(args, b"hello init");
    let pid = sys.exec(check_child_args, b"hello child").unwrap();
    let (_, status) = sys.wait_child(Some(pid)).unwrap();
    status
}

fn check_child_args(_sys: &Sys, args: &[u8]) -> i32 {
    if args == b"hello child" {
        0
    } else {
        1
    }
}

#[test]
fn argument_buffers_reach_their_tasks() {
    assert_eq!(boot(init_args_are_copied, b"hello init"), 0);
}

// ---------------------------------------------------------------------------
// Orphan reparenting
// ---------------------------------------------------------------------------

// The middle process starts a grandchild that blocks on an inherited pipe,
// then exits. The grandchild becomes init's child; init releases it and
// reaps it.

fn grandchild(sys: &Sys, args: &[u8]) -> i32 {
    let r = Fid(args[0] as usize);
    let mut byte = [0u8; 1];
    // Blocks until init writes, which happens only after our original
    // parent has been reaped.
    if sys.read(r, &mut byte).unwrap() != 1 {
        return 90;
    }
    if sys.get_ppid() != Some(PID_INIT) {
        return 91;
    }
    42
}

fn middle(sys: &Sys, args: &[u8]) -> i32 {
    sys.exec(grandchild, args).unwrap();
    0
}

fn init_orphans(sys: &Sys, _args: &[u8]) -> i32 {
    let (r, w) = sys.pipe().unwrap();
    let args = [r.0 as u8];

    let mid = sys.exec(middle, &args).unwrap();
    let (_, status) = sys.wait_child(Some(mid)).unwrap();
    assert_eq!(status, 0);

    // The grandchild is ours now; let it run to completion.
    assert_eq!(sys.write(w, b"x").unwrap(), 1);
    let (_, status) = sys.wait_child(None).unwrap();
    assert_eq!(status, 42);

    sys.close(r).unwrap();
    sys.close(w).unwrap();
    0
}

#[test]
fn orphans_are_reparented_to_init() {
    assert_eq!(boot(init_orphans, &[]), 0);
}

// ---------------------------------------------------------------------------
// Init reaps stragglers on its way out
// ---------------------------------------------------------------------------

fn init_leaves_children_behind(sys: &Sys, _args: &[u8]) -> i32 {
    // Never reaped here; init's own exit path must collect them.
    sys.exec(exit_seven, &[]).unwrap();
    sys.exec(exit_seven, &[]).unwrap();
    0
}

#[test]
fn init_exit_reaps_remaining_children() {
    assert_eq!(boot(init_leaves_children_behind, &[]), 0);
}
