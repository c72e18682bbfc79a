//! Stream control blocks and descriptor tables.
//!
//! A file descriptor (fid) is a small index into the owning process's
//! descriptor table; the slot holds a reference into the kernel-wide FCB
//! arena. FCBs are reference counted: descriptor inheritance at exec time
//! bumps the count, close drops it, and the holder that drops it to zero
//! runs the stream's close hook and frees the slot.
//!
//! Read/write/close dispatch on the stream object behind the FCB - a pipe
//! end or a socket.

use crate::config::MAX_FILEID;
use crate::error::{Error, Result};
use crate::io::pipe::{self, PipeEnd, PipeId};
use crate::ke::kernel::{KernelState, Sys};
use crate::net::socket::{self, SockId};
use crate::ps::process::Pid;

/// File descriptor: an index into a process's descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fid(pub usize);

/// Index into the kernel FCB arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcbId(usize);

/// The stream object a descriptor refers to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StreamObj {
    /// Reserved but not yet attached to a stream.
    Null,
    /// The read end of a pipe.
    PipeRead(PipeId),
    /// The write end of a pipe.
    PipeWrite(PipeId),
    /// A socket.
    Socket(SockId),
}

/// File control block: a reference-counted stream handle.
pub(crate) struct Fcb {
    pub refcount: u32,
    pub stream: StreamObj,
}

/// Kernel-wide FCB arena.
pub(crate) struct FcbTable {
    slots: Vec<Option<Fcb>>,
    free: Vec<FcbId>,
}

impl FcbTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self) -> FcbId {
        let fcb = Fcb {
            refcount: 1,
            stream: StreamObj::Null,
        };
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0] = Some(fcb);
                id
            }
            None => {
                self.slots.push(Some(fcb));
                FcbId(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn get(&self, id: FcbId) -> Option<&Fcb> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: FcbId) -> Option<&mut Fcb> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    fn release(&mut self, id: FcbId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            if slot.take().is_some() {
                self.free.push(id);
            }
        }
    }
}

/// Reserve `n` descriptor slots in `pid` and back each with a fresh FCB.
///
/// Fails without side effects if the process has fewer than `n` free
/// slots. The FCBs start with refcount 1 and a [`StreamObj::Null`]
/// stream; the caller attaches the real streams.
pub(crate) fn fcb_reserve(
    st: &mut KernelState,
    pid: Pid,
    n: usize,
) -> Option<Vec<(Fid, FcbId)>> {
    let fids: Vec<usize> = {
        let pcb = st.procs.get(pid)?;
        let free: Vec<usize> = (0..MAX_FILEID)
            .filter(|&i| pcb.fidt[i].is_none())
            .take(n)
            .collect();
        if free.len() < n {
            return None;
        }
        free
    };

    let mut reserved = Vec::with_capacity(n);
    for &i in &fids {
        reserved.push((Fid(i), st.fcbs.alloc()));
    }
    if let Some(pcb) = st.procs.get_mut(pid) {
        for &(fid, fcb) in &reserved {
            pcb.fidt[fid.0] = Some(fcb);
        }
    }
    Some(reserved)
}

/// Bump an FCB's reference count.
pub(crate) fn fcb_incref(st: &mut KernelState, id: FcbId) {
    if let Some(fcb) = st.fcbs.get_mut(id) {
        fcb.refcount += 1;
    }
}

/// Drop an FCB reference; the last holder runs the stream's close hook
/// and frees the slot.
pub(crate) fn fcb_decref(st: &mut KernelState, id: FcbId) {
    let stream = match st.fcbs.get_mut(id) {
        Some(fcb) => {
            fcb.refcount -= 1;
            if fcb.refcount > 0 {
                return;
            }
            fcb.stream
        }
        None => return,
    };
    st.fcbs.release(id);

    match stream {
        StreamObj::Null => {}
        StreamObj::PipeRead(pipe) => pipe::detach_end(st, pipe, PipeEnd::Read),
        StreamObj::PipeWrite(pipe) => pipe::detach_end(st, pipe, PipeEnd::Write),
        StreamObj::Socket(sock) => socket::socket_close(st, sock),
    }
}

/// Resolve a fid of `pid` to its stream object.
pub(crate) fn resolve_stream(st: &KernelState, pid: Pid, fid: Fid) -> Result<StreamObj> {
    if fid.0 >= MAX_FILEID {
        return Err(Error::BadFid);
    }
    let pcb = st.procs.get(pid).ok_or(Error::NoProcess)?;
    let id = pcb.fidt[fid.0].ok_or(Error::BadFid)?;
    let fcb = st.fcbs.get(id).ok_or(Error::BadFid)?;
    Ok(fcb.stream)
}

// ============================================================================
// System calls
// ============================================================================

impl Sys {
    /// Read from an open stream into `buf`.
    ///
    /// Blocks until at least one byte (or end of stream) is available.
    ///
    /// # Returns
    /// The number of bytes read; 0 means end of stream.
    pub fn read(&self, fid: Fid, buf: &mut [u8]) -> Result<usize> {
        let st = self.kernel.lock();
        let stream = resolve_stream(&st, self.pid, fid)?;
        match stream {
            StreamObj::PipeRead(pipe) => pipe::pipe_read(&self.kernel, self.tid, st, pipe, buf),
            StreamObj::Socket(sock) => {
                socket::socket_read(&self.kernel, self.tid, st, sock, buf)
            }
            _ => Err(Error::NotSupported),
        }
    }

    /// Write `buf` to an open stream.
    ///
    /// Blocks while the stream is full and its consumer is still around.
    ///
    /// # Returns
    /// The number of bytes written; may be short.
    pub fn write(&self, fid: Fid, buf: &[u8]) -> Result<usize> {
        let st = self.kernel.lock();
        let stream = resolve_stream(&st, self.pid, fid)?;
        match stream {
            StreamObj::PipeWrite(pipe) => {
                pipe::pipe_write(&self.kernel, self.tid, st, pipe, buf)
            }
            StreamObj::Socket(sock) => {
                socket::socket_write(&self.kernel, self.tid, st, sock, buf)
            }
            _ => Err(Error::NotSupported),
        }
    }

    /// Close a file descriptor, releasing its FCB reference.
    pub fn close(&self, fid: Fid) -> Result<()> {
        let mut st = self.kernel.lock();
        if fid.0 >= MAX_FILEID {
            return Err(Error::BadFid);
        }
        let id = {
            let pcb = st.procs.get_mut(self.pid).ok_or(Error::NoProcess)?;
            pcb.fidt[fid.0].take().ok_or(Error::BadFid)?
        };
        fcb_decref(&mut st, id);
        Ok(())
    }
}
