//! Edge-triggered epoll transport drawing all I/O memory from an [ember_pool::Pool].
//!
//! A [Transport] owns one epoll instance and one polling thread. Listening sockets and accepted
//! connections are registered with edge-triggered readiness, so every readiness event is drained
//! to exhaustion: the accept path loops until `EAGAIN`, and the read path keeps filling pooled
//! packets until the socket would block.
//!
//! # Roles
//!
//! Every registered descriptor has one explicit role, fixed when it is registered:
//!
//! - a listener, which drains pending connections and asks an [Acceptor] to verify each one
//!   (returning the [Handler] to install, or `None` to reject it),
//! - a stream, whose [Handler] is invoked synchronously from the polling thread with every
//!   [Packet] read from the socket.
//!
//! # Partial Messages
//!
//! A handler that receives an incomplete message can [Connection::store] the packet. The next
//! read resumes filling the same tail block with its write cursor preserved, so a message spanning
//! several readiness events arrives as one packet.
//!
//! # Shutdown
//!
//! The stop flag is checked after every wait, so [Transport::fini] returns within one
//! [Config::poll_timeout] of being called.
//!
//! # Example
//!
//! ```rust,no_run
//! use ember_pool::{Config as PoolConfig, Pool};
//! use ember_transport::{Config, Echo, Handler, Transport};
//! use prometheus_client::registry::Registry;
//!
//! let mut registry = Registry::default();
//! let pool = Pool::new(PoolConfig::default(), &mut registry).unwrap();
//! let mut transport = Transport::new(Config::default(), pool, &mut registry).unwrap();
//! transport.init().unwrap();
//!
//! let addr = transport
//!     .listen("127.0.0.1:0".parse().unwrap(), |_: &mut ember_transport::Connection| {
//!         Some(Box::new(Echo) as Box<dyn Handler>)
//!     })
//!     .unwrap();
//! println!("echoing on {addr}");
//!
//! transport.fini().unwrap();
//! transport.destroy().unwrap();
//! ```
//!
//! # Status
//!
//! `ember-transport` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use std::{io, net::SocketAddr, time::Duration};
use thiserror::Error;

mod accept;
pub use accept::{drain_accept, Acceptor};
mod connection;
pub use connection::Connection;
mod echo;
pub use echo::Echo;
mod poller;
pub use poller::Interest;
mod reactor;
pub use reactor::{Action, Handler, State, Transport};
pub mod sock;

pub use ember_pool::{Buffer, Packet, Pool};

/// Errors that can occur when interacting with the transport.
#[derive(Error, Debug)]
pub enum Error {
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("invalid state")]
    InvalidState,
    #[error("not initialized")]
    NotInitialized,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("unsupported")]
    Unsupported,
    #[error("unsupported address family: {0}")]
    UnsupportedFamily(SocketAddr),
    #[error("peer closed")]
    PeerClosed,
    #[error("timeout")]
    Timeout,
    #[error("pool error: {0}")]
    Pool(#[from] ember_pool::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration for a [Transport].
#[derive(Clone, Debug)]
pub struct Config {
    /// Label attached to the polling thread name and to every log line it emits.
    pub label: String,
    /// Maximum time a single wait blocks. Bounds the latency of [Transport::fini].
    pub poll_timeout: Duration,
    /// Maximum number of events returned by a single wait.
    pub max_events: usize,
    /// Listen backlog, unless overridden by the [sock::BACKLOG_ENV] environment variable.
    pub backlog: i32,
    /// CPU the polling thread is pinned to, if any.
    pub cpu: Option<usize>,
    /// Receive deadline applied to every accepted connection. A connection that receives
    /// nothing for this long is closed.
    pub receive_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            label: "transport".into(),
            poll_timeout: Duration::from_secs(3),
            max_events: 10,
            backlog: 1024,
            cpu: None,
            receive_timeout: None,
        }
    }
}

impl Config {
    /// See [Config]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// See [Config]
    pub const fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// See [Config]
    pub const fn with_cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// See [Config]
    pub const fn with_receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = Some(receive_timeout);
        self
    }

    /// Validates the configuration, panicking on invalid values.
    ///
    /// # Panics
    ///
    /// - `poll_timeout` is zero or does not fit in an `i32` of milliseconds
    /// - `max_events` is zero or does not fit in an `i32`
    /// - `backlog` is not positive
    /// - `cpu` is beyond `CPU_SETSIZE`
    pub(crate) fn validate(&self) {
        assert!(
            !self.poll_timeout.is_zero(),
            "poll_timeout must be non-zero"
        );
        assert!(
            self.poll_timeout.as_millis() <= i32::MAX as u128,
            "poll_timeout must fit in i32 milliseconds"
        );
        assert!(
            self.max_events > 0 && self.max_events <= i32::MAX as usize,
            "max_events ({}) must be in 1..=i32::MAX",
            self.max_events
        );
        assert!(self.backlog > 0, "backlog must be positive");
        if let Some(cpu) = self.cpu {
            assert!(
                cpu < libc::CPU_SETSIZE as usize,
                "cpu ({cpu}) must be < CPU_SETSIZE"
            );
        }
    }
}
