//! Transport handle and its polling thread.
//!
//! # Lifecycle
//!
//! ```text
//! Created --init--> Running --fini--> Stopping --> Stopped --(fini resets)--> Created
//!                      \--fatal wait error--> Stopped
//! ```
//!
//! # Dispatch
//!
//! The polling thread owns every registered descriptor. An entry is removed from the registry
//! while it is being serviced and reinserted afterwards, so handlers run without holding the
//! registry lock and can never observe a concurrent callback for the same descriptor.

use crate::{
    accept::drain_accept,
    poller::{Events, Interest, Poller, Readiness},
    sock, Acceptor, Config, Connection, Error, Packet, Pool,
};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    collections::HashMap,
    io, mem,
    net::SocketAddr,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Instant,
};
use tracing::{debug, error, info, info_span, trace, warn};

/// Lifecycle phase of a [Transport].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Not polling. [Transport::init] may be called.
    Created,
    /// The polling thread is running.
    Running,
    /// [Transport::fini] was called and the polling thread is exiting.
    Stopping,
    /// The polling thread exited (on request or after a fatal wait error).
    Stopped,
}

/// What the polling thread should do with a connection after a callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Keep the current registration.
    Continue,
    /// Deregister and close the connection.
    Close,
    /// Re-arm the connection with a new interest.
    Interest(Interest),
}

/// Per-connection callbacks, invoked synchronously on the polling thread.
pub trait Handler: Send {
    /// Called with every packet read from the connection.
    ///
    /// An incomplete message can be stashed with [Connection::store] to continue filling it on
    /// the next read. Returning an error closes the connection.
    fn on_packet(&mut self, conn: &mut Connection, packet: Packet) -> Result<Action, Error>;

    /// Called when the socket became writable and all queued output has been flushed.
    ///
    /// By default, write interest is cleared.
    fn on_writable(&mut self, conn: &mut Connection) -> Result<Action, Error> {
        let _ = conn;
        Ok(Action::Interest(Interest::READ))
    }
}

impl<F> Handler for F
where
    F: FnMut(&mut Connection, Packet) -> Result<Action, Error> + Send,
{
    fn on_packet(&mut self, conn: &mut Connection, packet: Packet) -> Result<Action, Error> {
        self(conn, packet)
    }
}

/// Role of a registered descriptor.
enum Entry {
    Listener {
        fd: OwnedFd,
        acceptor: Box<dyn Acceptor>,
    },
    Stream {
        connection: Connection,
        handler: Box<dyn Handler>,
        interest: Interest,
    },
}

struct Metrics {
    accepted: Counter,
    rejected: Counter,
    expired: Counter,
    connections: Gauge,
    events: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            accepted: Counter::default(),
            rejected: Counter::default(),
            expired: Counter::default(),
            connections: Gauge::default(),
            events: Counter::default(),
        };
        registry.register(
            "transport_accepted",
            "Total number of connections accepted",
            metrics.accepted.clone(),
        );
        registry.register(
            "transport_rejected",
            "Total number of connections rejected by the acceptor",
            metrics.rejected.clone(),
        );
        registry.register(
            "transport_expired",
            "Total number of connections closed after their receive deadline",
            metrics.expired.clone(),
        );
        registry.register(
            "transport_connections",
            "Number of open connections",
            metrics.connections.clone(),
        );
        registry.register(
            "transport_events",
            "Total number of readiness events delivered",
            metrics.events.clone(),
        );
        metrics
    }
}

/// State shared between the handle and its polling thread.
struct Shared {
    cfg: Config,
    pool: Pool,
    state: Mutex<State>,
    stop: AtomicBool,
    poller: Mutex<Option<Arc<Poller>>>,
    registry: Mutex<HashMap<RawFd, Entry>>,
    listeners: Mutex<Vec<SocketAddr>>,
    metrics: Metrics,
}

/// A non-blocking transport multiplexing sockets on one polling thread.
pub struct Transport {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Transport {
    /// Creates a transport in the [State::Created] phase, registering its metrics on `registry`.
    ///
    /// # Panics
    ///
    /// Panics if `cfg` is invalid (see [Config]).
    pub fn new(cfg: Config, pool: Pool, registry: &mut Registry) -> Result<Self, Error> {
        cfg.validate();
        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                pool,
                state: Mutex::new(State::Created),
                stop: AtomicBool::new(false),
                poller: Mutex::new(None),
                registry: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                metrics: Metrics::new(registry),
            }),
            worker: None,
        })
    }

    /// Returns the current lifecycle phase.
    pub fn state(&self) -> State {
        *self.shared.state.lock().unwrap()
    }

    /// Returns the pool connections draw packets from.
    pub fn pool(&self) -> &Pool {
        &self.shared.pool
    }

    /// Returns the number of open connections.
    pub fn connections(&self) -> usize {
        self.shared.metrics.connections.get().max(0) as usize
    }

    /// Returns the addresses of every listener registered since the last [Transport::init].
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.shared.listeners.lock().unwrap().clone()
    }

    /// Creates the epoll instance and starts the polling thread.
    ///
    /// Fails with [Error::InvalidState] unless the transport is in [State::Created].
    pub fn init(&mut self) -> Result<(), Error> {
        let mut state = self.shared.state.lock().unwrap();
        if *state != State::Created || self.worker.is_some() {
            return Err(Error::InvalidState);
        }

        let poller = Arc::new(Poller::new()?);
        *self.shared.poller.lock().unwrap() = Some(poller.clone());
        self.shared.stop.store(false, Ordering::Release);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-poll", self.shared.cfg.label))
            .spawn(move || shared.run(poller));
        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                *state = State::Running;
                info!(label = %self.shared.cfg.label, "transport started");
                Ok(())
            }
            Err(err) => {
                *self.shared.poller.lock().unwrap() = None;
                Err(err.into())
            }
        }
    }

    /// Stops the polling thread and waits for it to exit, then closes every registered socket.
    ///
    /// Returns within one [Config::poll_timeout]. Afterwards the transport is back in
    /// [State::Created] and may be initialized again.
    pub fn fini(&mut self) -> Result<(), Error> {
        let Some(worker) = self.worker.take() else {
            return Err(Error::InvalidState);
        };
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state == State::Running {
                *state = State::Stopping;
            }
        }
        self.shared.stop.store(true, Ordering::Release);
        let joined = worker.join();

        // Sockets registered with the old epoll instance cannot be polled again
        let entries: Vec<_> = self.shared.registry.lock().unwrap().drain().collect();
        self.shared.metrics.connections.set(0);
        self.shared.listeners.lock().unwrap().clear();
        *self.shared.poller.lock().unwrap() = None;
        *self.shared.state.lock().unwrap() = State::Created;
        info!(
            label = %self.shared.cfg.label,
            closed = entries.len(),
            "transport stopped"
        );
        drop(entries);

        joined.map_err(|_| Error::InvalidState)
    }

    /// Releases the transport.
    ///
    /// Must be called after [Transport::fini]. If the polling thread is still running, it is
    /// stopped anyway and [Error::InvalidState] is returned.
    pub fn destroy(self) -> Result<(), Error> {
        if self.worker.is_some() {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    /// Listens on `addr`, handing every accepted connection to `acceptor`.
    ///
    /// Returns the bound address (useful when `addr` has port 0). Only IPv4 is supported.
    pub fn listen(
        &self,
        addr: SocketAddr,
        acceptor: impl Acceptor + 'static,
    ) -> Result<SocketAddr, Error> {
        if self.state() != State::Running {
            return Err(Error::NotInitialized);
        }
        let poller = self
            .shared
            .poller
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotInitialized)?;

        let fd = sock::listener(addr, sock::backlog(self.shared.cfg.backlog))?;
        let local = sock::local_addr(fd.as_raw_fd())?;
        let raw = fd.as_raw_fd();

        // Insert before arming so the first readiness event always finds its entry
        self.shared.registry.lock().unwrap().insert(
            raw,
            Entry::Listener {
                fd,
                acceptor: Box::new(acceptor),
            },
        );
        if let Err(err) = poller.add(raw, Interest::READ) {
            self.shared.registry.lock().unwrap().remove(&raw);
            return Err(err.into());
        }

        self.shared.listeners.lock().unwrap().push(local);
        info!(%local, "listening");
        Ok(local)
    }

    /// Actively opens a connection. Not supported.
    pub fn connect(
        &self,
        _addr: SocketAddr,
        _handler: impl Handler + 'static,
    ) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Sends `packet` outside of the connection's callbacks. Not supported: use
    /// [Connection::queue] from a [Handler] instead.
    pub fn send(&self, _conn: &mut Connection, _packet: Packet) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Receives a packet outside of the connection's callbacks. Not supported: packets are
    /// delivered to [Handler::on_packet].
    pub fn recv(&self, _conn: &mut Connection) -> Result<Packet, Error> {
        Err(Error::Unsupported)
    }

    /// Closes a connection outside of its callbacks. Not supported: return [Action::Close]
    /// from a [Handler] instead.
    pub fn close(&self, _conn: &mut Connection) -> Result<(), Error> {
        Err(Error::Unsupported)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        if let Err(err) = self.fini() {
            warn!(?err, "failed to stop transport");
        }
    }
}

impl Shared {
    /// Body of the polling thread.
    fn run(&self, poller: Arc<Poller>) {
        let span = info_span!("transport", label = %self.cfg.label);
        let _guard = span.enter();

        if let Some(cpu) = self.cfg.cpu {
            match pin(cpu) {
                Ok(()) => debug!(cpu, "pinned polling thread"),
                Err(err) => warn!(cpu, ?err, "failed to pin polling thread"),
            }
        }

        let mut events = Events::with_capacity(self.cfg.max_events);
        loop {
            match poller.wait(&mut events, self.cfg.poll_timeout) {
                Ok(ready) => {
                    self.metrics.events.inc_by(ready as u64);
                    for readiness in events.iter() {
                        self.dispatch(&poller, readiness);
                    }
                }
                Err(Error::Timeout) => trace!("poll timeout"),
                Err(Error::Io(err)) if err.kind() == io::ErrorKind::Interrupted => {
                    trace!("poll interrupted")
                }
                Err(err) => {
                    error!(?err, "poll failed");
                    break;
                }
            }
            self.expire(&poller);
            if self.stop.load(Ordering::Acquire) {
                break;
            }
        }

        *self.state.lock().unwrap() = State::Stopped;
        debug!("polling thread exited");
    }

    /// Services one readiness event.
    fn dispatch(&self, poller: &Poller, ready: Readiness) {
        let Some(mut entry) = self.registry.lock().unwrap().remove(&ready.fd) else {
            trace!(fd = ready.fd, "event for unregistered descriptor");
            return;
        };

        let keep = match &mut entry {
            Entry::Listener { fd, acceptor } => {
                self.accept(poller, fd.as_raw_fd(), acceptor.as_mut());
                true
            }
            Entry::Stream {
                connection,
                handler,
                interest,
            } => self.service(poller, connection, handler.as_mut(), interest, ready),
        };

        if keep {
            self.registry.lock().unwrap().insert(ready.fd, entry);
        } else {
            self.close(poller, ready.fd, entry);
        }
    }

    /// Accepts every pending connection on `listener` and registers the ones `acceptor` keeps.
    fn accept(&self, poller: &Poller, listener: RawFd, acceptor: &mut dyn Acceptor) {
        let drained = drain_accept(listener, |fd, peer| {
            let mut connection = Connection::new(fd, peer, self.pool.clone());
            connection.set_deadline(self.cfg.receive_timeout);
            let Some(handler) = acceptor.accept(&mut connection) else {
                self.metrics.rejected.inc();
                warn!(peer = connection.peer(), "rejected connection");
                return;
            };

            let fd = connection.fd();
            debug!(peer = connection.peer(), fd, "accepted connection");
            self.registry.lock().unwrap().insert(
                fd,
                Entry::Stream {
                    connection,
                    handler,
                    interest: Interest::READ,
                },
            );
            if let Err(err) = poller.add(fd, Interest::READ) {
                warn!(fd, ?err, "failed to register connection");
                self.registry.lock().unwrap().remove(&fd);
                return;
            }
            self.metrics.accepted.inc();
            self.metrics.connections.inc();
        });
        match drained {
            Ok(count) => trace!(count, "drained listener"),
            Err(err) => warn!(?err, "accept failed"),
        }
    }

    /// Runs a connection's callbacks, returning false if it must be closed.
    fn service(
        &self,
        poller: &Poller,
        conn: &mut Connection,
        handler: &mut dyn Handler,
        interest: &mut Interest,
        ready: Readiness,
    ) -> bool {
        let action = match handle(conn, handler, ready) {
            Ok(action) => action,
            Err(Error::PeerClosed) => {
                trace!(peer = conn.peer(), "peer closed while writing");
                return false;
            }
            Err(err) => {
                debug!(peer = conn.peer(), ?err, "connection failed");
                return false;
            }
        };
        let mut next = match action {
            Action::Continue => *interest,
            Action::Close => return false,
            Action::Interest(next) => next,
        };

        // Pending output always needs write readiness
        if conn.wants_write() {
            next = next.with_write();
        }
        if next != *interest {
            if let Err(err) = poller.modify(conn.fd(), next) {
                warn!(peer = conn.peer(), ?err, "failed to re-arm connection");
                return false;
            }
            *interest = next;
        }
        true
    }

    /// Closes every connection whose receive deadline has passed.
    fn expire(&self, poller: &Poller) {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut registry = self.registry.lock().unwrap();
            let fds: Vec<RawFd> = registry
                .iter()
                .filter(|(_, entry)| {
                    matches!(entry, Entry::Stream { connection, .. } if connection.expired(now))
                })
                .map(|(fd, _)| *fd)
                .collect();
            fds.into_iter()
                .filter_map(|fd| registry.remove(&fd).map(|entry| (fd, entry)))
                .collect()
        };
        for (fd, entry) in expired {
            self.metrics.expired.inc();
            debug!(fd, "receive deadline passed");
            self.close(poller, fd, entry);
        }
    }

    fn close(&self, poller: &Poller, fd: RawFd, entry: Entry) {
        if let Err(err) = poller.delete(fd) {
            trace!(fd, ?err, "failed to deregister descriptor");
        }
        if let Entry::Stream { connection, .. } = &entry {
            self.metrics.connections.dec();
            debug!(peer = connection.peer(), "closed connection");
        }
    }
}

/// Flushes pending output and drains input, returning the resulting action.
fn handle(
    conn: &mut Connection,
    handler: &mut dyn Handler,
    ready: Readiness,
) -> Result<Action, Error> {
    let mut action = Action::Continue;
    if ready.writable && conn.flush()? {
        action = handler.on_writable(conn)?;
        if action == Action::Close {
            return Ok(action);
        }
    }
    if ready.readable {
        match conn.drain(handler)? {
            Action::Continue => {}
            other => action = other,
        }
    }
    Ok(action)
}

/// Pins the calling thread to `cpu`.
fn pin(cpu: usize) -> io::Result<()> {
    // SAFETY: `cpu_set_t` is plain data and `cpu` was validated against `CPU_SETSIZE`.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
