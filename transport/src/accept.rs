//! Draining a listening socket.

use crate::{sock, Connection, Error, Handler};
use std::os::fd::{OwnedFd, RawFd};

/// Verifies accepted connections and picks the [Handler] serving each one.
///
/// Invoked on the polling thread for every accepted socket, before it is registered.
/// Returning `None` rejects the connection: its socket is closed without ever being polled.
pub trait Acceptor: Send {
    fn accept(&mut self, conn: &mut Connection) -> Option<Box<dyn Handler>>;
}

impl<F> Acceptor for F
where
    F: FnMut(&mut Connection) -> Option<Box<dyn Handler>> + Send,
{
    fn accept(&mut self, conn: &mut Connection) -> Option<Box<dyn Handler>> {
        self(conn)
    }
}

/// Accepts every pending connection on `listener`, passing each socket and its peer address to
/// `on_accepted`.
///
/// Loops until no connection is pending (required with edge-triggered readiness) and returns
/// how many were accepted. Aborted handshakes are skipped. Any other error stops the loop.
pub fn drain_accept(
    listener: RawFd,
    mut on_accepted: impl FnMut(OwnedFd, String),
) -> Result<usize, Error> {
    let mut accepted = 0;
    while let Some((fd, peer)) = sock::accept(listener)? {
        on_accepted(fd, peer);
        accepted += 1;
    }
    Ok(accepted)
}
