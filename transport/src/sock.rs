//! Thin non-blocking socket helpers over `libc`.
//!
//! Transient conditions are retried here and never surface: `EINTR` everywhere, plus
//! `ECONNABORTED` and `EPROTO` while accepting. `EAGAIN` surfaces as
//! [io::ErrorKind::WouldBlock] (or `Ok(None)` from [accept]).

use crate::Error;
use std::{
    env,
    ffi::CStr,
    io, mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

/// Environment variable overriding the listen backlog when set to a positive integer.
pub const BACKLOG_ENV: &str = "LISTENQ";

/// Returns the backlog to listen with: [BACKLOG_ENV] if it parses, else `default`.
pub fn backlog(default: i32) -> i32 {
    env::var(BACKLOG_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
        .filter(|backlog| *backlog > 0)
        .unwrap_or(default)
}

/// Converts a `-1` return value into the current `errno`.
fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

/// Opens a non-blocking, close-on-exec TCP listener bound to `addr`.
///
/// Only IPv4 addresses are supported.
pub fn listener(addr: SocketAddr, backlog: i32) -> Result<OwnedFd, Error> {
    let SocketAddr::V4(v4) = addr else {
        return Err(Error::UnsupportedFamily(addr));
    };

    // SAFETY: Plain syscall, the returned descriptor is owned below.
    let fd = check(unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;
    // SAFETY: `fd` was just created and is not owned elsewhere.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let enable: libc::c_int = 1;
    // SAFETY: `enable` outlives the call and the length matches its type.
    check(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &enable as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;

    let sin = sockaddr_in(&v4);
    // SAFETY: `sin` is a valid `sockaddr_in` and the length matches.
    check(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;

    // SAFETY: Plain syscall on an owned descriptor.
    check(unsafe { libc::listen(fd.as_raw_fd(), self::backlog(backlog)) })?;
    Ok(fd)
}

/// Accepts one pending connection as a non-blocking, close-on-exec socket.
///
/// Returns `Ok(None)` once no connection is pending.
pub fn accept(listener: RawFd) -> io::Result<Option<(OwnedFd, String)>> {
    loop {
        // SAFETY: `sockaddr_storage` is plain data.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // SAFETY: `storage` and `len` describe a writable buffer large enough for any address.
        let ret = unsafe {
            libc::accept4(
                listener,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::ECONNABORTED) | Some(libc::EPROTO) => continue,
                _ if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }

        // SAFETY: `ret` is a freshly accepted descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(ret) };
        let peer = ntop(&storage, len).unwrap_or_else(|_| "(unknown)".into());
        return Ok(Some((fd, peer)));
    }
}

/// Reads into `buf`, returning `Ok(0)` when the peer closed its side.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let ret = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Writes as much of `data` as the socket accepts without blocking.
///
/// Returns the number of bytes written, which is less than `data.len()` only if the socket
/// would block.
pub fn send_all(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let mut sent = 0;
    while sent < data.len() {
        let rest = &data[sent..];
        // SAFETY: `rest` is valid for reads of `rest.len()` bytes.
        let ret = unsafe {
            libc::send(
                fd,
                rest.as_ptr() as *const libc::c_void,
                rest.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if ret >= 0 {
            sent += ret as usize;
            continue;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => break,
            _ => return Err(err),
        }
    }
    Ok(sent)
}

/// Sets `O_NONBLOCK` on `fd`.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: Plain fcntl calls on a caller-provided descriptor.
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

/// Returns the address `fd` is bound to.
pub fn local_addr(fd: RawFd) -> Result<SocketAddr, Error> {
    // SAFETY: `sockaddr_storage` is plain data.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: `storage` and `len` describe a writable buffer large enough for any address.
    check(unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    })?;
    socket_addr(&storage, len).ok_or(Error::InvalidParameter)
}

/// Formats a raw socket address for presentation.
///
/// IPv4 renders as `a.b.c.d:port`, IPv6 as `[addr]:port`, and UNIX sockets as their path (or
/// `(no pathname bound)` for unnamed sockets).
pub fn ntop(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Result<String, Error> {
    if let Some(addr) = socket_addr(storage, len) {
        return Ok(addr.to_string());
    }
    if storage.ss_family as libc::c_int != libc::AF_UNIX {
        return Err(Error::InvalidParameter);
    }

    // SAFETY: The family is AF_UNIX and `sockaddr_storage` is large enough for `sockaddr_un`.
    let sun = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_un) };
    let path_len = (len as usize).saturating_sub(mem::size_of::<libc::sa_family_t>());
    if path_len == 0 || sun.sun_path[0] == 0 {
        return Ok("(no pathname bound)".into());
    }
    // SAFETY: `sun_path` is a fixed array; reading it as bytes is always valid.
    let bytes: &[u8] = unsafe {
        std::slice::from_raw_parts(
            sun.sun_path.as_ptr() as *const u8,
            path_len.min(sun.sun_path.len()),
        )
    };
    let path = match CStr::from_bytes_until_nul(bytes) {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    };
    Ok(path)
}

/// Decodes an IPv4 or IPv6 raw socket address.
fn socket_addr(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    let len = len as usize;
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: The family and length identify a `sockaddr_in`.
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: The family and length identify a `sockaddr_in6`.
            let sin6 =
                unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: `sockaddr_in` is plain data.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sin
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        net::TcpStream,
        os::{fd::IntoRawFd, unix::net::UnixStream},
    };
    use test_case::test_case;

    fn storage_of(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
        // SAFETY: `sockaddr_storage` is plain data.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = sockaddr_in(&v4);
                // SAFETY: `sockaddr_storage` is larger than `sockaddr_in`.
                unsafe {
                    *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in) = sin
                };
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                // SAFETY: `sockaddr_in6` is plain data.
                let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                // SAFETY: `sockaddr_storage` is larger than `sockaddr_in6`.
                unsafe {
                    *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6) = sin6
                };
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }

    #[test_case("10.1.2.3:8080"; "ipv4")]
    #[test_case("[::1]:443"; "ipv6 loopback")]
    #[test_case("[2001:db8::7]:9"; "ipv6")]
    fn test_ntop_ip(addr: &str) {
        let addr: SocketAddr = addr.parse().unwrap();
        let (storage, len) = storage_of(addr);
        assert_eq!(ntop(&storage, len).unwrap(), addr.to_string());
    }

    #[test]
    fn test_ntop_unix() {
        // SAFETY: `sockaddr_storage` is plain data.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
        let family = mem::size_of::<libc::sa_family_t>() as libc::socklen_t;
        assert_eq!(ntop(&storage, family).unwrap(), "(no pathname bound)");

        // SAFETY: `sockaddr_storage` is larger than `sockaddr_un`.
        let sun = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_un) };
        for (dst, src) in sun.sun_path.iter_mut().zip(b"/tmp/ember.sock\0") {
            *dst = *src as libc::c_char;
        }
        assert_eq!(ntop(&storage, family + 16).unwrap(), "/tmp/ember.sock");
    }

    #[test]
    fn test_ntop_unknown_family() {
        // SAFETY: `sockaddr_storage` is plain data.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        storage.ss_family = libc::AF_PACKET as libc::sa_family_t;
        assert!(matches!(ntop(&storage, 16), Err(Error::InvalidParameter)));
    }

    #[test]
    fn test_listener_rejects_ipv6() {
        let addr: SocketAddr = "[::1]:0".parse().unwrap();
        assert!(matches!(
            listener(addr, 16),
            Err(Error::UnsupportedFamily(a)) if a == addr
        ));
    }

    #[test]
    fn test_accept_drains_then_reports_empty() {
        let fd = listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = local_addr(fd.as_raw_fd()).unwrap();
        assert!(accept(fd.as_raw_fd()).unwrap().is_none());

        let clients: Vec<_> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
        let mut accepted = Vec::new();
        while accepted.len() < clients.len() {
            if let Some((conn, peer)) = accept(fd.as_raw_fd()).unwrap() {
                assert!(peer.starts_with("127.0.0.1:"));
                accepted.push(conn);
            }
        }
        assert!(accept(fd.as_raw_fd()).unwrap().is_none());
    }

    #[test]
    fn test_recv_and_send_all() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let ours = ours.into_raw_fd();
        // SAFETY: `ours` was just released from its owner.
        let ours = unsafe { OwnedFd::from_raw_fd(ours) };
        set_nonblocking(ours.as_raw_fd()).unwrap();

        let mut buf = [0u8; 8];
        let err = recv(ours.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        theirs.write_all(b"ping").unwrap();
        assert_eq!(recv(ours.as_raw_fd(), &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        assert_eq!(send_all(ours.as_raw_fd(), b"pong").unwrap(), 4);
        let mut reply = [0u8; 4];
        theirs.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");

        drop(theirs);
        assert_eq!(recv(ours.as_raw_fd(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_send_all_stops_when_full() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let data = vec![0u8; 16 * 1024 * 1024];
        let sent = send_all(ours.as_raw_fd(), &data).unwrap();
        assert!(sent > 0 && sent < data.len());
    }
}
