//! Socket layer.
//!
//! Sockets are a local rendezvous built on pipes, not a protocol stack.
//! A listener binds a port; connectors enqueue themselves on the
//! listener's pending queue; an accepter pairs with one queued connector
//! and the two ends exchange bytes over a pair of pipes, one per
//! direction.
//!
//! Socket roles:
//! - **Unbound**: fresh socket, optionally carrying a port number
//! - **Listener**: bound into the port table, accepts connections
//! - **ListenerPeer**: the listener's companion, created by the first
//!   accept; it replicates the listener's port and is the accept-side end
//!   of every connection the listener hands out
//! - **Peer**: a connector
//!
//! Shutdown detaches one or both pipe directions; the socket itself is
//! reference counted through its FCB and torn down on the last close.

use std::collections::VecDeque;
use std::time::Duration;

use bitflags::bitflags;

use crate::config::MAX_PORT;
use crate::error::{Error, Result};
use crate::io::pipe::{self, PipeEnd, PipeId};
use crate::io::streams::{self, Fid, StreamObj};
use crate::ke::kernel::{KGuard, Kernel, KernelState, Sys};
use crate::ke::sched::{self, Tid};
use crate::ke::wait::{self, CondVar, WaitChannel};
use crate::ps::process::Pid;

/// Port number. Valid ports are `1..=MAX_PORT`.
pub type Port = u16;

/// The "no port" sentinel.
pub const NOPORT: Port = 0;

bitflags! {
    /// Which direction(s) of a connection to shut down.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShutdownMode: u8 {
        /// Stop receiving; the peer's writes fail.
        const READ = 0b01;
        /// Stop sending; the peer's reads drain then report end of stream.
        const WRITE = 0b10;
        /// Both directions.
        const BOTH = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Socket roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SockType {
    /// Not yet bound or connected
    Unbound = 0,
    /// Bound into the port table
    Listener = 1,
    /// The listener's accept-side companion
    ListenerPeer = 2,
    /// A connector
    Peer = 3,
}

/// Index into the socket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockId(usize);

/// Socket control block.
pub(crate) struct Socb {
    /// Port carried by this socket (NOPORT if none).
    pub port: Port,
    /// Current role.
    pub stype: SockType,
    /// Descriptor this socket lives behind, in its owning process.
    pub fid: Fid,
    /// Owning process.
    pub owner: Pid,
    /// Pending connectors (listener role only).
    pub queue: VecDeque<SockId>,
    /// Accepters sleep here while the pending queue is empty.
    pub rendezvous: CondVar,
    /// Listener -> its companion, once the first accept created it.
    pub companion: Option<SockId>,
    /// Companion -> the listener it was created for.
    pub companion_of: Option<SockId>,
    /// Connector -> the listener queue it currently sits on.
    pub queued_on: Option<SockId>,
    /// The socket at the other end of the connection.
    pub peer: Option<SockId>,
    /// Pipe this socket writes to.
    pub send_pipe: Option<PipeId>,
    /// Pipe this socket reads from.
    pub recv_pipe: Option<PipeId>,
    /// Directions shut down so far.
    pub shut: ShutdownMode,
}

/// Kernel-wide socket arena.
pub(crate) struct SockTable {
    slots: Vec<Option<Socb>>,
    free: Vec<SockId>,
}

impl SockTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, port: Port, fid: Fid, owner: Pid) -> SockId {
        let socb = Socb {
            port,
            stype: SockType::Unbound,
            fid,
            owner,
            queue: VecDeque::new(),
            rendezvous: CondVar::new(),
            companion: None,
            companion_of: None,
            queued_on: None,
            peer: None,
            send_pipe: None,
            recv_pipe: None,
            shut: ShutdownMode::empty(),
        };
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0] = Some(socb);
                id
            }
            None => {
                self.slots.push(Some(socb));
                SockId(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn get(&self, id: SockId) -> Option<&Socb> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: SockId) -> Option<&mut Socb> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    fn release(&mut self, id: SockId) -> Option<Socb> {
        let socb = self.slots.get_mut(id.0).and_then(|s| s.take());
        if socb.is_some() {
            self.free.push(id);
        }
        socb
    }
}

/// Port number to listener bindings. Mutated only under the kernel lock.
pub(crate) struct PortTable {
    slots: Vec<Option<SockId>>,
}

impl PortTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![None; MAX_PORT as usize + 1],
        }
    }

    pub(crate) fn get(&self, port: Port) -> Option<SockId> {
        self.slots.get(port as usize).copied().flatten()
    }

    fn bind(&mut self, port: Port, id: SockId) {
        if let Some(slot) = self.slots.get_mut(port as usize) {
            *slot = Some(id);
        }
    }

    fn unbind(&mut self, port: Port, id: SockId) {
        if let Some(slot) = self.slots.get_mut(port as usize) {
            if *slot == Some(id) {
                *slot = None;
            }
        }
    }
}

fn resolve_socket(st: &KernelState, pid: Pid, fid: Fid) -> Result<SockId> {
    match streams::resolve_stream(st, pid, fid)? {
        StreamObj::Socket(id) => Ok(id),
        _ => Err(Error::NotSupported),
    }
}

// ============================================================================
// Data path
// ============================================================================

/// Read from a connected socket by draining its receive pipe.
pub(crate) fn socket_read<'k>(
    kernel: &'k Kernel,
    tid: Tid,
    st: KGuard<'k>,
    id: SockId,
    buf: &mut [u8],
) -> Result<usize> {
    let pipe = {
        let socb = st.socks.get(id).ok_or(Error::BadFid)?;
        if socb.shut.contains(ShutdownMode::READ) {
            return Err(Error::NotSupported);
        }
        socb.recv_pipe.ok_or(Error::NotConnected)?
    };
    pipe::pipe_read(kernel, tid, st, pipe, buf)
}

/// Write to a connected socket through its send pipe.
pub(crate) fn socket_write<'k>(
    kernel: &'k Kernel,
    tid: Tid,
    st: KGuard<'k>,
    id: SockId,
    buf: &[u8],
) -> Result<usize> {
    let pipe = {
        let socb = st.socks.get(id).ok_or(Error::BadFid)?;
        if socb.shut.contains(ShutdownMode::WRITE) {
            return Err(Error::NotSupported);
        }
        socb.send_pipe.ok_or(Error::NotConnected)?
    };
    pipe::pipe_write(kernel, tid, st, pipe, buf)
}

// ============================================================================
// Teardown
// ============================================================================

/// Close hook: the socket's FCB refcount reached zero.
///
/// Unbinds listeners from the port table, wakes anyone sleeping on the
/// socket, unlinks every cross-reference and detaches whatever pipe ends
/// the socket still held.
pub(crate) fn socket_close(st: &mut KernelState, id: SockId) {
    let mut socb = match st.socks.release(id) {
        Some(socb) => socb,
        None => return,
    };

    // Accepters sleeping on this socket revalidate and fail.
    let own_waiters = socb.rendezvous.take();
    sched::wake_list(&mut st.threads, own_waiters);

    if socb.stype == SockType::Listener {
        st.ports.unbind(socb.port, id);
        for conn in socb.queue.drain(..) {
            if let Some(q) = st.socks.get_mut(conn) {
                q.queued_on = None;
            }
        }
        if let Some(comp) = socb.companion {
            if let Some(c) = st.socks.get_mut(comp) {
                c.companion_of = None;
            }
            wait::cond_broadcast(st, WaitChannel::Rendezvous(comp));
        }
    }
    if let Some(listener) = socb.companion_of {
        if let Some(l) = st.socks.get_mut(listener) {
            l.companion = None;
        }
    }
    if let Some(listener) = socb.queued_on {
        if let Some(l) = st.socks.get_mut(listener) {
            if let Some(i) = l.queue.iter().position(|c| *c == id) {
                l.queue.remove(i);
            }
        }
    }
    if let Some(peer) = socb.peer {
        if let Some(p) = st.socks.get_mut(peer) {
            p.peer = None;
        }
    }

    if !socb.shut.contains(ShutdownMode::WRITE) {
        if let Some(pipe) = socb.send_pipe {
            pipe::detach_end(st, pipe, PipeEnd::Write);
        }
    }
    if !socb.shut.contains(ShutdownMode::READ) {
        if let Some(pipe) = socb.recv_pipe {
            pipe::detach_end(st, pipe, PipeEnd::Read);
        }
    }
    log::debug!("[NET] socket {:?} of process {} closed", id, socb.owner.0);
}

// ============================================================================
// System calls
// ============================================================================

impl Sys {
    /// Create an unbound socket carrying `port`.
    ///
    /// `NOPORT` is allowed and produces a socket that can connect but
    /// never listen.
    pub fn socket(&self, port: Port) -> Result<Fid> {
        let mut st = self.kernel.lock();
        if port > MAX_PORT {
            return Err(Error::BadPort);
        }
        let reserved = streams::fcb_reserve(&mut st, self.pid, 1).ok_or(Error::FileLimit)?;
        let (fid, fcb) = reserved[0];
        let id = st.socks.alloc(port, fid, self.pid);
        if let Some(f) = st.fcbs.get_mut(fcb) {
            f.stream = StreamObj::Socket(id);
        }
        log::debug!(
            "[NET] socket {:?} created on port {} by process {}",
            id,
            port,
            self.pid.0
        );
        Ok(fid)
    }

    /// Turn the socket into a listener for its port.
    ///
    /// Fails if the socket has no port, is already a listener, or the
    /// port is bound to another live listener. A port whose previous
    /// listener has been closed is free for rebinding.
    pub fn listen(&self, sock: Fid) -> Result<()> {
        let mut st = self.kernel.lock();
        let id = resolve_socket(&st, self.pid, sock)?;

        let port = {
            let socb = st.socks.get(id).ok_or(Error::BadFid)?;
            if socb.port == NOPORT {
                return Err(Error::BadPort);
            }
            if socb.stype != SockType::Unbound {
                return Err(Error::AlreadyBound);
            }
            socb.port
        };
        if st.ports.get(port).is_some() {
            return Err(Error::PortBound);
        }

        if let Some(socb) = st.socks.get_mut(id) {
            socb.stype = SockType::Listener;
        }
        st.ports.bind(port, id);
        log::debug!("[NET] socket {:?} listening on port {}", id, port);
        Ok(())
    }

    /// Request a connection to the listener bound at `port`.
    ///
    /// The caller is enqueued on the listener's pending queue and a
    /// waiting accepter is signaled. The call itself does not block; the
    /// timeout is accepted for interface compatibility but not enforced.
    pub fn connect(&self, sock: Fid, port: Port, timeout: Option<Duration>) -> Result<()> {
        let mut st = self.kernel.lock();
        let id = resolve_socket(&st, self.pid, sock)?;

        if port == NOPORT || port > MAX_PORT {
            return Err(Error::BadPort);
        }
        {
            let socb = st.socks.get(id).ok_or(Error::BadFid)?;
            if socb.stype != SockType::Unbound {
                return Err(Error::AlreadyConnected);
            }
        }
        let lid = st.ports.get(port).ok_or(Error::PortUnbound)?;
        let companion = match st.socks.get(lid) {
            Some(l) if l.stype == SockType::Listener => l.companion,
            _ => return Err(Error::PortUnbound),
        };

        if let Some(socb) = st.socks.get_mut(id) {
            socb.stype = SockType::Peer;
            socb.queued_on = Some(lid);
        }
        if let Some(l) = st.socks.get_mut(lid) {
            l.queue.push_back(id);
        }
        if let Some(comp) = companion {
            wait::cond_signal(&mut st, WaitChannel::Rendezvous(comp));
        }
        if timeout.is_some() {
            log::trace!("[NET] connect timeout requested but not enforced");
        }
        log::debug!("[NET] socket {:?} queued on port {}", id, port);
        Ok(())
    }

    /// Accept one pending connection on a listener.
    ///
    /// The first accept creates the listener's companion socket (one new
    /// descriptor - the call fails if none is free); every accept returns
    /// that same companion, re-wired to the connection just taken. Blocks
    /// while the pending queue is empty; fails if the listener goes away
    /// in the meantime.
    pub fn accept(&self, lsock: Fid) -> Result<Fid> {
        let kernel = &self.kernel;
        let mut st = kernel.lock();
        let lid = resolve_socket(&st, self.pid, lsock)?;

        let (lport, existing) = {
            let l = st.socks.get(lid).ok_or(Error::BadFid)?;
            if l.stype != SockType::Listener {
                return Err(Error::NotListener);
            }
            (l.port, l.companion)
        };

        let comp = match existing {
            Some(comp) => comp,
            None => {
                let reserved =
                    streams::fcb_reserve(&mut st, self.pid, 1).ok_or(Error::FileLimit)?;
                let (cfid, cfcb) = reserved[0];
                let comp = st.socks.alloc(lport, cfid, self.pid);
                if let Some(c) = st.socks.get_mut(comp) {
                    c.stype = SockType::ListenerPeer;
                    c.companion_of = Some(lid);
                }
                if let Some(f) = st.fcbs.get_mut(cfcb) {
                    f.stream = StreamObj::Socket(comp);
                }
                if let Some(l) = st.socks.get_mut(lid) {
                    l.companion = Some(comp);
                }
                comp
            }
        };

        // The pipes carrying the new connection, one per direction.
        let to_conn = st.pipes.alloc();
        let from_conn = st.pipes.alloc();

        let abandon = |st: &mut KernelState| {
            pipe::detach_end(st, to_conn, PipeEnd::Read);
            pipe::detach_end(st, to_conn, PipeEnd::Write);
            pipe::detach_end(st, from_conn, PipeEnd::Read);
            pipe::detach_end(st, from_conn, PipeEnd::Write);
        };

        let conn = loop {
            match st.socks.get_mut(lid) {
                Some(l) if l.stype == SockType::Listener => {
                    if let Some(conn) = l.queue.pop_front() {
                        break conn;
                    }
                }
                // The listener was closed while we waited.
                _ => {
                    abandon(&mut st);
                    return Err(Error::NotListener);
                }
            }
            st = wait::cond_wait(kernel, st, self.tid, WaitChannel::Rendezvous(comp));
            if st.socks.get(comp).is_none() {
                abandon(&mut st);
                return Err(Error::NotListener);
            }
        };

        // Wire both ends. Re-wiring the companion detaches the pipes of
        // the connection it previously carried; that peer sees EOF.
        let (cfid, old_send, old_recv, old_peer) = match st.socks.get_mut(comp) {
            Some(c) => {
                let old_send = c.send_pipe.replace(to_conn);
                let old_recv = c.recv_pipe.replace(from_conn);
                let old_peer = c.peer.replace(conn);
                (c.fid, old_send, old_recv, old_peer)
            }
            None => {
                abandon(&mut st);
                return Err(Error::NotListener);
            }
        };
        if let Some(old) = old_send {
            pipe::detach_end(&mut st, old, PipeEnd::Write);
        }
        if let Some(old) = old_recv {
            pipe::detach_end(&mut st, old, PipeEnd::Read);
        }
        if let Some(old) = old_peer {
            if let Some(p) = st.socks.get_mut(old) {
                p.peer = None;
            }
        }
        if let Some(p) = st.socks.get_mut(conn) {
            p.send_pipe = Some(from_conn);
            p.recv_pipe = Some(to_conn);
            p.peer = Some(comp);
            p.queued_on = None;
        }

        log::debug!(
            "[NET] accepted connection on port {}: {:?} <-> {:?}",
            lport,
            comp,
            conn
        );
        Ok(cfid)
    }

    /// Shut down one or both directions of a connected socket.
    ///
    /// Shutting down a direction that is already down is not an error.
    pub fn shut_down(&self, sock: Fid, how: ShutdownMode) -> Result<()> {
        let mut st = self.kernel.lock();
        let id = resolve_socket(&st, self.pid, sock)?;

        let (stop_read, stop_write, recv, send) = {
            let socb = st.socks.get_mut(id).ok_or(Error::BadFid)?;
            if socb.send_pipe.is_none() && socb.recv_pipe.is_none() {
                return Err(Error::NotConnected);
            }
            let stop_read =
                how.contains(ShutdownMode::READ) && !socb.shut.contains(ShutdownMode::READ);
            let stop_write =
                how.contains(ShutdownMode::WRITE) && !socb.shut.contains(ShutdownMode::WRITE);
            socb.shut.insert(how & ShutdownMode::BOTH);
            (stop_read, stop_write, socb.recv_pipe, socb.send_pipe)
        };

        if stop_read {
            if let Some(pipe) = recv {
                pipe::detach_end(&mut st, pipe, PipeEnd::Read);
            }
        }
        if stop_write {
            if let Some(pipe) = send {
                pipe::detach_end(&mut st, pipe, PipeEnd::Write);
            }
        }
        log::debug!("[NET] socket {:?} shut down ({:?})", id, how);
        Ok(())
    }
}
