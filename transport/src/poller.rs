//! Edge-triggered epoll instance.

use crate::Error;
use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

/// Readiness a registered descriptor is interested in.
///
/// Registrations are always edge-triggered and always watch for reads (including peer
/// hang-ups). Write interest is only armed while output is pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interest {
    writable: bool,
}

impl Interest {
    /// Read readiness only.
    pub const READ: Self = Self { writable: false };

    /// Read and write readiness.
    pub const READ_WRITE: Self = Self { writable: true };

    /// Returns true if write readiness is requested.
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns this interest with write readiness added.
    pub const fn with_write(self) -> Self {
        Self::READ_WRITE
    }

    fn mask(self) -> u32 {
        let mut mask = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLET) as u32;
        if self.writable {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }
}

/// Readiness reported for one descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub fd: RawFd,
    /// Readable, peer hang-up, or socket error (all surface through a read).
    pub readable: bool,
    pub writable: bool,
}

/// Buffer of events filled by [Poller::wait].
pub(crate) struct Events {
    events: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
            len: 0,
        }
    }

    /// Iterates the events of the last wait, in delivery order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = Readiness> + '_ {
        self.events[..self.len].iter().map(|event| {
            let flags = event.events as libc::c_int;
            Readiness {
                fd: event.u64 as RawFd,
                readable: flags
                    & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR)
                    != 0,
                writable: flags & libc::EPOLLOUT != 0,
            }
        })
    }
}

/// An epoll instance, closed on drop.
pub(crate) struct Poller {
    fd: OwnedFd,
}

impl Poller {
    pub(crate) fn new() -> Result<Self, Error> {
        // SAFETY: Plain syscall, the returned descriptor is owned below.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: `fd` was just created and is not owned elsewhere.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.map_or(0, Interest::mask),
            u64: fd as u64,
        };
        // SAFETY: `event` is a valid epoll_event for the duration of the call.
        let ret = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Starts watching `fd`.
    pub(crate) fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(interest))
    }

    /// Re-arms `fd` with a new interest. A condition that is already true fires again.
    pub(crate) fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    /// Stops watching `fd`.
    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    /// Waits up to `timeout` for events, returning how many were delivered.
    ///
    /// Returns [Error::Timeout] if nothing became ready. An interrupted wait surfaces as an
    /// [io::ErrorKind::Interrupted] error so the caller can observe its stop flag.
    pub(crate) fn wait(&self, events: &mut Events, timeout: Duration) -> Result<usize, Error> {
        events.len = 0;
        let timeout = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: `events.events` is a writable buffer of the advertised length.
        let ready = unsafe {
            libc::epoll_pwait(
                self.fd.as_raw_fd(),
                events.events.as_mut_ptr(),
                events.events.len() as libc::c_int,
                timeout,
                std::ptr::null(),
            )
        };
        match ready {
            -1 => Err(io::Error::last_os_error().into()),
            0 => Err(Error::Timeout),
            n => {
                events.len = n as usize;
                Ok(events.len)
            }
        }
    }
}
