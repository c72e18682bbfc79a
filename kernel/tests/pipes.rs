//! Pipe integration tests: round trips, EOF, broken pipe, back-pressure.

use kernel::config::IO_BUFFER_CAPACITY;
use kernel::{boot, Error, Fid, Sys};

fn init_roundtrip(sys: &Sys, _args: &[u8]) -> i32 {
    let (r, w) = sys.pipe().unwrap();
    let message = b"through the kernel and back";
    assert_eq!(sys.write(w, message).unwrap(), message.len());

    let mut out = vec![0u8; message.len()];
    assert_eq!(sys.read(r, &mut out).unwrap(), message.len());
    assert_eq!(&out, message);

    sys.close(r).unwrap();
    sys.close(w).unwrap();
    0
}

#[test]
fn bytes_come_back_in_order() {
    assert_eq!(boot(init_roundtrip, &[]), 0);
}

fn init_eof(sys: &Sys, _args: &[u8]) -> i32 {
    let (r, w) = sys.pipe().unwrap();
    assert_eq!(sys.write(w, b"tail").unwrap(), 4);
    sys.close(w).unwrap();

    // Buffered bytes drain first, then end of stream.
    let mut out = [0u8; 16];
    assert_eq!(sys.read(r, &mut out).unwrap(), 4);
    assert_eq!(&out[..4], b"tail");
    assert_eq!(sys.read(r, &mut out).unwrap(), 0);
    assert_eq!(sys.read(r, &mut out).unwrap(), 0);

    sys.close(r).unwrap();
    0
}

#[test]
fn closed_writer_means_eof_after_drain() {
    assert_eq!(boot(init_eof, &[]), 0);
}

fn init_broken_pipe(sys: &Sys, _args: &[u8]) -> i32 {
    let (r, w) = sys.pipe().unwrap();
    sys.close(r).unwrap();
    assert_eq!(sys.write(w, b"nobody listens"), Err(Error::BrokenPipe));
    sys.close(w).unwrap();
    0
}

#[test]
fn writing_to_a_closed_read_end_fails_immediately() {
    assert_eq!(boot(init_broken_pipe, &[]), 0);
}

fn init_wrong_direction(sys: &Sys, _args: &[u8]) -> i32 {
    let (r, w) = sys.pipe().unwrap();
    let mut out = [0u8; 4];
    assert_eq!(sys.read(w, &mut out), Err(Error::NotSupported));
    assert_eq!(sys.write(r, b"zzzz"), Err(Error::NotSupported));
    assert_eq!(sys.read(Fid(13), &mut out), Err(Error::BadFid));
    sys.close(r).unwrap();
    sys.close(w).unwrap();
    0
}

#[test]
fn ends_reject_the_opposite_operation() {
    assert_eq!(boot(init_wrong_direction, &[]), 0);
}

fn init_short_write(sys: &Sys, _args: &[u8]) -> i32 {
    let (r, w) = sys.pipe().unwrap();
    // More than the ring holds: the first write is short, not blocking.
    let big = vec![0x42u8; IO_BUFFER_CAPACITY + 1000];
    assert_eq!(sys.write(w, &big).unwrap(), IO_BUFFER_CAPACITY);

    let mut out = vec![0u8; IO_BUFFER_CAPACITY];
    let mut drained = 0;
    while drained < IO_BUFFER_CAPACITY {
        drained += sys.read(r, &mut out[drained..]).unwrap();
    }
    sys.close(r).unwrap();
    sys.close(w).unwrap();
    0
}

#[test]
fn writes_are_short_rather_than_lossy() {
    assert_eq!(boot(init_short_write, &[]), 0);
}

// ---------------------------------------------------------------------------
// Back-pressure between a writer thread and a reading main thread
// ---------------------------------------------------------------------------

const STREAM_LEN: usize = 3 * IO_BUFFER_CAPACITY + 500;

fn streaming_writer(sys: &Sys, args: &[u8]) -> i32 {
    let w = Fid(args[0] as usize);
    let chunk = [0x5au8; 1024];
    let mut sent = 0;
    while sent < STREAM_LEN {
        let want = chunk.len().min(STREAM_LEN - sent);
        match sys.write(w, &chunk[..want]) {
            Ok(n) => sent += n,
            Err(_) => return -1,
        }
    }
    sent as i32
}

fn init_backpressure(sys: &Sys, _args: &[u8]) -> i32 {
    let (r, w) = sys.pipe().unwrap();
    let writer = sys.create_thread(streaming_writer, &[w.0 as u8]).unwrap();

    // The stream is several times the ring capacity, so both sides must
    // block and hand off repeatedly.
    let mut received = 0;
    let mut buf = [0u8; 700];
    while received < STREAM_LEN {
        let n = sys.read(r, &mut buf).unwrap();
        assert!(n > 0);
        assert!(buf[..n].iter().all(|&b| b == 0x5a));
        received += n;
    }
    assert_eq!(received, STREAM_LEN);
    assert_eq!(sys.thread_join(writer).unwrap(), STREAM_LEN as i32);

    sys.close(r).unwrap();
    sys.close(w).unwrap();
    0
}

#[test]
fn blocked_ends_hand_off_until_the_stream_completes() {
    assert_eq!(boot(init_backpressure, &[]), 0);
}
