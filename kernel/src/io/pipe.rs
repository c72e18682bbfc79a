//! Pipes.
//!
//! A pipe control block owns one ring buffer and two endpoint conditions:
//! `reader_var` (data available) and `writer_var` (space available). The
//! blocking protocol is signal-before-wait: a reader that finds the
//! buffer empty first signals `writer_var`, then sleeps on `reader_var`
//! (and symmetrically for writers), so two ends blocked on an empty/full
//! buffer at the same time cannot deadlock each other.
//!
//! Endpoints are detached by whoever owns them - the FCB close hooks for
//! descriptor pipes, socket teardown for socket-internal pipes - and the
//! PICB is freed once both ends are gone. Detaching either end wakes both
//! wait queues: sleepers revalidate and observe EOF or broken pipe.

use crate::error::{Error, Result};
use crate::io::buffer::IoBuffer;
use crate::io::streams::{self, StreamObj};
use crate::ke::kernel::{KGuard, Kernel, KernelState, Sys};
use crate::ke::sched::Tid;
use crate::ke::wait::{self, CondVar, WaitChannel};

/// Index into the pipe table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeId(usize);

/// Which end of a pipe an owner holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeEnd {
    Read,
    Write,
}

/// Pipe control block.
pub(crate) struct Picb {
    /// Shared ring buffer.
    pub buffer: IoBuffer,
    /// Latched once the read end is gone; writes fail from then on.
    pub read_closed: bool,
    /// Latched once the write end is gone; reads drain then return 0.
    pub write_closed: bool,
    /// Endpoints not yet detached. The PICB is freed at zero.
    pub ends: u8,
    /// Readers waiting for data.
    pub reader_var: CondVar,
    /// Writers waiting for space.
    pub writer_var: CondVar,
}

/// Kernel-wide pipe arena.
pub(crate) struct PipeTable {
    slots: Vec<Option<Picb>>,
    free: Vec<PipeId>,
}

impl PipeTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Allocate a fresh pipe with both ends attached.
    pub(crate) fn alloc(&mut self) -> PipeId {
        let picb = Picb {
            buffer: IoBuffer::new(),
            read_closed: false,
            write_closed: false,
            ends: 2,
            reader_var: CondVar::new(),
            writer_var: CondVar::new(),
        };
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0] = Some(picb);
                id
            }
            None => {
                self.slots.push(Some(picb));
                PipeId(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn get(&self, id: PipeId) -> Option<&Picb> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: PipeId) -> Option<&mut Picb> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    fn release(&mut self, id: PipeId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            if slot.take().is_some() {
                self.free.push(id);
            }
        }
    }
}

/// Detach one end of a pipe.
///
/// Marks the end closed, wakes both wait queues so sleepers can
/// revalidate, and frees the PICB once neither end remains.
pub(crate) fn detach_end(st: &mut KernelState, id: PipeId, end: PipeEnd) {
    let ends = match st.pipes.get_mut(id) {
        Some(picb) => {
            match end {
                PipeEnd::Read => picb.read_closed = true,
                PipeEnd::Write => picb.write_closed = true,
            }
            picb.ends = picb.ends.saturating_sub(1);
            picb.ends
        }
        None => return,
    };
    wait::cond_broadcast(st, WaitChannel::PipeReader(id));
    wait::cond_broadcast(st, WaitChannel::PipeWriter(id));
    if ends == 0 {
        st.pipes.release(id);
        log::debug!("[IO] pipe {:?} released", id);
    }
}

/// Blocking pipe read.
///
/// Drains buffered bytes; once the write end is closed and the buffer is
/// empty, latches the read end closed and reports end of stream.
pub(crate) fn pipe_read<'k>(
    kernel: &'k Kernel,
    tid: Tid,
    mut st: KGuard<'k>,
    id: PipeId,
    buf: &mut [u8],
) -> Result<usize> {
    loop {
        let (empty, write_closed) = {
            let picb = st.pipes.get(id).ok_or(Error::BadFid)?;
            (picb.buffer.is_empty(), picb.write_closed)
        };
        if empty && write_closed {
            // End of stream: nothing buffered and nothing can arrive.
            if let Some(picb) = st.pipes.get_mut(id) {
                picb.read_closed = true;
            }
            wait::cond_broadcast(&mut st, WaitChannel::PipeWriter(id));
            return Ok(0);
        }
        if !empty {
            break;
        }
        // Wake a writer that may be waiting for space before we sleep.
        wait::cond_signal(&mut st, WaitChannel::PipeWriter(id));
        st = wait::cond_wait(kernel, st, tid, WaitChannel::PipeReader(id));
    }

    wait::cond_broadcast(&mut st, WaitChannel::PipeWriter(id));
    let picb = st.pipes.get_mut(id).ok_or(Error::BadFid)?;
    Ok(picb.buffer.read(buf))
}

/// Blocking pipe write.
///
/// Fails with broken pipe whenever the read end is closed, including
/// after waking from a full-buffer sleep; never writes into a pipe no one
/// can read.
pub(crate) fn pipe_write<'k>(
    kernel: &'k Kernel,
    tid: Tid,
    mut st: KGuard<'k>,
    id: PipeId,
    buf: &[u8],
) -> Result<usize> {
    loop {
        let (full, read_closed) = {
            let picb = st.pipes.get(id).ok_or(Error::BadFid)?;
            (picb.buffer.is_full(), picb.read_closed)
        };
        if read_closed {
            return Err(Error::BrokenPipe);
        }
        if !full {
            break;
        }
        // Wake a reader that may be waiting for data before we sleep.
        wait::cond_signal(&mut st, WaitChannel::PipeReader(id));
        st = wait::cond_wait(kernel, st, tid, WaitChannel::PipeWriter(id));
    }

    wait::cond_broadcast(&mut st, WaitChannel::PipeReader(id));
    let picb = st.pipes.get_mut(id).ok_or(Error::BadFid)?;
    Ok(picb.buffer.write(buf))
}

impl Sys {
    /// Create a pipe.
    ///
    /// # Returns
    /// `(read_fid, write_fid)` for the two endpoints, or
    /// [`Error::FileLimit`] if the process cannot hold two more
    /// descriptors.
    pub fn pipe(&self) -> Result<(crate::io::streams::Fid, crate::io::streams::Fid)> {
        let mut st = self.kernel.lock();
        let reserved =
            streams::fcb_reserve(&mut st, self.pid, 2).ok_or(Error::FileLimit)?;
        let (read_fid, read_fcb) = reserved[0];
        let (write_fid, write_fcb) = reserved[1];

        let id = st.pipes.alloc();
        if let Some(fcb) = st.fcbs.get_mut(read_fcb) {
            fcb.stream = StreamObj::PipeRead(id);
        }
        if let Some(fcb) = st.fcbs.get_mut(write_fcb) {
            fcb.stream = StreamObj::PipeWrite(id);
        }

        log::debug!(
            "[IO] pipe {:?} created in process {} (fids {}/{})",
            id,
            self.pid.0,
            read_fid.0,
            write_fid.0
        );
        Ok((read_fid, write_fid))
    }
}
