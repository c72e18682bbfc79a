//! Thread lifecycle integration tests: create/join/detach/exit.

use kernel::{boot, Error, Fid, Sys, Tid};

fn return_ten(_sys: &Sys, _args: &[u8]) -> i32 {
    10
}

fn return_twenty(_sys: &Sys, _args: &[u8]) -> i32 {
    20
}

fn init_join_value(sys: &Sys, _args: &[u8]) -> i32 {
    let t = sys.create_thread(return_ten, &[]).unwrap();
    assert_eq!(sys.thread_join(t).unwrap(), 10);
    0
}

#[test]
fn join_returns_the_exit_value() {
    assert_eq!(boot(init_join_value, &[]), 0);
}

fn init_two_threads(sys: &Sys, _args: &[u8]) -> i32 {
    let t1 = sys.create_thread(return_ten, &[]).unwrap();
    let t2 = sys.create_thread(return_twenty, &[]).unwrap();
    assert_eq!(sys.thread_join(t1).unwrap(), 10);
    assert_eq!(sys.thread_join(t2).unwrap(), 20);
    // Joining after the targets have exited is non-blocking and still
    // yields the stored values.
    assert_eq!(sys.thread_join(t1).unwrap(), 10);
    assert_eq!(sys.thread_join(t2).unwrap(), 20);
    0
}

#[test]
fn two_threads_two_values() {
    assert_eq!(boot(init_two_threads, &[]), 0);
}

fn init_join_errors(sys: &Sys, _args: &[u8]) -> i32 {
    assert_eq!(sys.thread_join(sys.thread_self()), Err(Error::JoinSelf));
    assert_eq!(sys.thread_join(Tid(4096)), Err(Error::NoThread));
    0
}

#[test]
fn join_self_and_join_unknown_fail() {
    assert_eq!(boot(init_join_errors, &[]), 0);
}

fn init_detach_after_exit(sys: &Sys, _args: &[u8]) -> i32 {
    let t = sys.create_thread(return_ten, &[]).unwrap();
    assert_eq!(sys.thread_join(t).unwrap(), 10);
    assert_eq!(sys.thread_detach(t), Err(Error::Exited));
    0
}

#[test]
fn an_exited_thread_cannot_be_detached() {
    assert_eq!(boot(init_detach_after_exit, &[]), 0);
}

fn blocked_reader(sys: &Sys, args: &[u8]) -> i32 {
    let r = Fid(args[0] as usize);
    let mut byte = [0u8; 1];
    let _ = sys.read(r, &mut byte);
    10
}

fn init_join_detached(sys: &Sys, _args: &[u8]) -> i32 {
    let (r, _w) = sys.pipe().unwrap();
    // The worker parks on the empty pipe, so it cannot exit before the
    // detach below.
    let t = sys.create_thread(blocked_reader, &[r.0 as u8]).unwrap();
    sys.thread_detach(t).unwrap();
    assert_eq!(sys.thread_join(t), Err(Error::Detached));
    0
}

#[test]
fn a_detached_thread_cannot_be_joined() {
    assert_eq!(boot(init_join_detached, &[]), 0);
}

fn exits_early(sys: &Sys, _args: &[u8]) -> i32 {
    sys.thread_exit(99);
}

fn init_thread_exit(sys: &Sys, _args: &[u8]) -> i32 {
    let t = sys.create_thread(exits_early, &[]).unwrap();
    assert_eq!(sys.thread_join(t).unwrap(), 99);
    0
}

#[test]
fn thread_exit_sets_the_value() {
    assert_eq!(boot(init_thread_exit, &[]), 0);
}

// ---------------------------------------------------------------------------
// Concurrent joiners
// ---------------------------------------------------------------------------

fn gated_worker(sys: &Sys, args: &[u8]) -> i32 {
    let r = Fid(args[0] as usize);
    let mut byte = [0u8; 1];
    let _ = sys.read(r, &mut byte);
    10
}

fn joiner(sys: &Sys, args: &[u8]) -> i32 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(args);
    let target = Tid(usize::from_ne_bytes(raw));
    sys.thread_join(target).unwrap()
}

fn init_concurrent_joiners(sys: &Sys, _args: &[u8]) -> i32 {
    let (r, w) = sys.pipe().unwrap();
    let target = sys.create_thread(gated_worker, &[r.0 as u8]).unwrap();

    let target_bytes = target.0.to_ne_bytes();
    let j1 = sys.create_thread(joiner, &target_bytes).unwrap();
    let j2 = sys.create_thread(joiner, &target_bytes).unwrap();

    // Release the target only after both joiners exist; they both must
    // observe its exit value.
    assert_eq!(sys.write(w, b"x").unwrap(), 1);
    assert_eq!(sys.thread_join(j1).unwrap(), 10);
    assert_eq!(sys.thread_join(j2).unwrap(), 10);
    0
}

#[test]
fn concurrent_joiners_all_observe_the_value() {
    assert_eq!(boot(init_concurrent_joiners, &[]), 0);
}

fn init_interrupt_stubs(sys: &Sys, _args: &[u8]) -> i32 {
    let t = sys.create_thread(return_ten, &[]).unwrap();
    assert_eq!(sys.thread_interrupt(t), Err(Error::NotSupported));
    assert!(!sys.thread_is_interrupted());
    sys.thread_clear_interrupt();
    sys.thread_join(t).unwrap();
    0
}

#[test]
fn interrupt_operations_are_stubs() {
    assert_eq!(boot(init_interrupt_stubs, &[]), 0);
}
