//! Per-socket state owned by the polling thread.

use crate::{sock, Action, Error, Handler, Packet, Pool};
use bytes::Buf;
use std::{
    any::Any,
    fmt, io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    time::{Duration, Instant},
};
use tracing::trace;

/// An accepted stream socket and the packets flowing through it.
///
/// The connection owns its descriptor (closed on drop), the in-progress inbound packet stashed
/// between reads, and the outbound bytes the socket could not take yet.
pub struct Connection {
    fd: OwnedFd,
    peer: String,
    pool: Pool,

    established: Instant,
    last_active: Instant,
    receive_timeout: Option<Duration>,

    inbound: Option<Packet>,
    outbound: Packet,

    user: Option<Box<dyn Any + Send>>,
}

impl Connection {
    pub(crate) fn new(fd: OwnedFd, peer: String, pool: Pool) -> Self {
        let now = Instant::now();
        Self {
            fd,
            peer,
            outbound: pool.packet(),
            pool,
            established: now,
            last_active: now,
            receive_timeout: None,
            inbound: None,
            user: None,
        }
    }

    /// Returns the socket descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Returns the peer address in presentation form.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns the pool the connection draws packets from.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn established(&self) -> Instant {
        self.established
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// Records activity now, pushing the receive deadline back.
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Sets how long the connection may stay silent before it is closed (`None` disables it).
    pub fn set_deadline(&mut self, timeout: Option<Duration>) {
        self.receive_timeout = timeout;
    }

    /// Returns the instant at which the connection expires, if a deadline is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.receive_timeout
            .map(|timeout| self.last_active + timeout)
    }

    /// Returns true if the receive deadline has passed at `now`.
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Attaches opaque user data, replacing any previous value.
    pub fn set_user<T: Any + Send>(&mut self, user: T) {
        self.user = Some(Box::new(user));
    }

    pub fn user<T: Any>(&self) -> Option<&T> {
        self.user.as_ref()?.downcast_ref()
    }

    pub fn user_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user.as_mut()?.downcast_mut()
    }

    /// Returns the stashed in-progress packet, or a new packet with one empty block.
    pub fn fetch(&mut self) -> Result<Packet, Error> {
        if let Some(packet) = self.inbound.take() {
            return Ok(packet);
        }
        let mut packet = self.pool.packet();
        packet.reserve_tail()?;
        Ok(packet)
    }

    /// Stashes an incomplete packet so the next read resumes filling it.
    pub fn store(&mut self, packet: Packet) {
        self.inbound = Some(packet);
    }

    /// Returns true if a partial message is stashed.
    pub fn has_stashed(&self) -> bool {
        self.inbound.is_some()
    }

    /// Reads until the socket would block, handing every read to `handler`.
    ///
    /// Each read lands in the tail of the fetched packet, so a stashed partial message keeps
    /// growing in place. Returns [Action::Close] when the peer closes or the handler asks
    /// for it, and the last requested [Action::Interest] otherwise.
    pub fn drain(&mut self, handler: &mut dyn Handler) -> Result<Action, Error> {
        let mut action = Action::Continue;
        loop {
            let mut packet = self.fetch()?;
            let tail = packet.reserve_tail()?;
            let read = sock::recv(self.fd(), tail.spare_mut()?);
            match read {
                Ok(0) => {
                    trace!(peer = %self.peer, "peer closed");
                    return Ok(Action::Close);
                }
                Ok(n) => {
                    tail.advance(n)?;
                    self.touch();
                    match handler.on_packet(self, packet)? {
                        Action::Continue => {}
                        Action::Close => return Ok(Action::Close),
                        interest => action = interest,
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !packet.is_empty() {
                        self.store(packet);
                    }
                    return Ok(action);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Returns true if output is waiting for the socket to become writable.
    pub fn wants_write(&self) -> bool {
        self.outbound.has_remaining()
    }

    /// Writes `data`, queueing whatever the socket cannot take now.
    ///
    /// Queued bytes are flushed when the socket becomes writable again. Returns the number of
    /// bytes written immediately.
    pub fn write_all(&mut self, data: &[u8]) -> Result<usize, Error> {
        let sent = if self.wants_write() {
            0
        } else {
            send(self.fd(), data)?
        };
        if sent < data.len() {
            self.outbound.write(&data[sent..])?;
        }
        Ok(sent)
    }

    /// Queues `packet` behind any pending output and flushes as much as possible.
    ///
    /// The packet's blocks are sent as is (no copy), so a handler can echo a received packet
    /// directly.
    pub fn queue(&mut self, packet: Packet) -> Result<(), Error> {
        self.outbound.append_packet(packet)?;
        self.flush()?;
        Ok(())
    }

    /// Writes queued output until it is empty or the socket would block.
    ///
    /// Returns true once nothing is left to write.
    pub fn flush(&mut self) -> Result<bool, Error> {
        while self.outbound.has_remaining() {
            let chunk = self.outbound.chunk();
            let len = chunk.len();
            let n = send(self.fd.as_raw_fd(), chunk)?;
            self.outbound.advance(n);
            if n < len {
                return Ok(false);
            }
        }

        // Drop empty blocks left behind by the read position
        self.outbound.free();
        Ok(true)
    }
}

/// Sends as much of `data` as the socket takes, reporting a vanished peer as [Error::PeerClosed].
fn send(fd: RawFd, data: &[u8]) -> Result<usize, Error> {
    sock::send_all(fd, data).map_err(|err| match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => Error::PeerClosed,
        _ => err.into(),
    })
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd())
            .field("peer", &self.peer)
            .field("stashed", &self.inbound.as_ref().map(Packet::len))
            .field("pending", &self.outbound.len())
            .finish()
    }
}
