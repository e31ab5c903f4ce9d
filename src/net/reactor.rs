//! Readiness layer
//!
//! A single mio-driven thread owns every descriptor: it accepts sockets,
//! translates readability and writability into reader and writer stage
//! events, and ticks the idle and soft-deadline timers. Stages never touch
//! the poll; they reach back through the [`Readiness`] trait to change a
//! connection's interest set or drop it from the poll.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::eds::job::Job;
use crate::http::handler::{CloseReason, HandlerStage};
use crate::http::reader::ReaderStage;
use crate::http::writer::WriterStage;
use crate::net::conn::{ConnState, Connection, ConnectionFactory};
use crate::net::server::ServerStats;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN_TOKEN: usize = 2;

/// Interest management stages use to cooperate with the poll.
pub trait Readiness: Send + Sync {
    /// Adds writability to the connection's interest set.
    fn arm_writable(&self, conn: &Arc<Connection>);
    /// Drops back to read-only interest.
    fn disarm_writable(&self, conn: &Arc<Connection>);
    /// Removes the connection from the poll and the live set.
    fn deregister(&self, conn: &Arc<Connection>);
}

/// The epoll-driven accept and readiness thread.
pub struct Reactor {
    registry: Registry,
    waker: Waker,
    connections: Arc<DashMap<usize, Arc<Connection>>>,
    next_token: AtomicUsize,
    accepting: AtomicBool,
    running: AtomicBool,
    reader: Arc<ReaderStage>,
    writer: Arc<WriterStage>,
    handler: Arc<HandlerStage>,
    factory: Arc<dyn ConnectionFactory>,
    stats: Arc<ServerStats>,
    idle_timeout: Duration,
    max_connections: usize,
    boot: Mutex<Option<(Poll, TcpListener)>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut listener: TcpListener,
        reader: Arc<ReaderStage>,
        writer: Arc<WriterStage>,
        handler: Arc<HandlerStage>,
        factory: Arc<dyn ConnectionFactory>,
        stats: Arc<ServerStats>,
        idle_timeout: Duration,
        max_connections: usize,
    ) -> std::io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Arc::new(Self {
            registry,
            waker,
            connections: Arc::new(DashMap::new()),
            next_token: AtomicUsize::new(FIRST_CONN_TOKEN),
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(false),
            reader,
            writer,
            handler,
            factory,
            stats,
            idle_timeout,
            max_connections,
            boot: Mutex::new(Some((poll, listener))),
            thread: Mutex::new(None),
        }))
    }

    /// Spawns the reactor thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let Some((poll, listener)) = self.boot.lock().expect("boot mutex poisoned").take() else {
            return;
        };
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || this.run(poll, listener))
            .expect("failed to spawn reactor thread");
        *self.thread.lock().expect("thread mutex poisoned") = Some(handle);
    }

    /// The connections currently registered.
    pub fn live_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stops accepting new connections; existing ones keep running.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("no longer accepting connections");
    }

    /// Stops the reactor thread and joins it.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.waker.wake().ok();
        if let Some(handle) = self.thread.lock().expect("thread mutex poisoned").take() {
            if handle.join().is_err() {
                error!("reactor thread terminated abnormally");
            }
        }
        // Any connection still registered is torn down here.
        for entry in self.connections.iter() {
            entry.value().shutdown_socket();
            entry.value().set_state(ConnState::Closed);
            entry.value().clear_handler_inbox();
        }
        self.connections.clear();
        info!("reactor stopped");
    }

    fn run(self: Arc<Self>, mut poll: Poll, mut listener: TcpListener) {
        debug!("reactor running");
        let mut events = Events::with_capacity(1024);
        let mut last_tick = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(250))) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                break;
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(&mut listener),
                    WAKER => {}
                    token => {
                        let Some(conn) = self
                            .connections
                            .get(&token.0)
                            .map(|entry| Arc::clone(entry.value()))
                        else {
                            continue;
                        };
                        if event.is_readable() {
                            self.reader.post_data_available(&conn).ok();
                        }
                        if event.is_writable() {
                            self.writer.post_writable(&conn).ok();
                        }
                    }
                }
            }
            if last_tick.elapsed() >= Duration::from_secs(1) {
                self.tick_timers();
                last_tick = Instant::now();
            }
        }
        debug!("reactor loop exited");
    }

    fn accept_ready(&self, listener: &mut TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if !self.accepting.load(Ordering::SeqCst) {
                        drop(stream);
                        continue;
                    }
                    if self.connections.len() >= self.max_connections {
                        warn!(%peer, "connection limit reached, refusing");
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "could not set TCP_NODELAY");
                    }
                    let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
                    let conn = self.factory.new_connection(stream, peer);
                    conn.set_token(token);
                    if let Err(e) = self.registry_register(&conn, token) {
                        warn!(%peer, error = %e, "could not register connection");
                        continue;
                    }
                    self.stats.record_accepted();
                    let stats = Arc::clone(&self.stats);
                    conn.core().add_destroy_listener(move |id| {
                        stats.record_destroyed();
                        debug!(conn = %id, "connection job destroyed");
                    });
                    self.connections.insert(token.0, Arc::clone(&conn));
                    debug!(%peer, token = token.0, "accepted connection");
                    self.reader.post_data_available(&conn).ok();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn registry_register(&self, conn: &Arc<Connection>, token: Token) -> std::io::Result<()> {
        conn.register(&self.registry, token, Interest::READABLE)
    }

    fn tick_timers(&self) {
        let now = Instant::now();
        // Collect first: posting can block on a full queue and must not
        // hold map shards while it does.
        let mut deadline_expired = Vec::new();
        let mut idle = Vec::new();
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.take_expired_deadline(now) {
                deadline_expired.push(Arc::clone(conn));
            } else if conn.state() == ConnState::Reading && conn.idle_for(now) >= self.idle_timeout
            {
                idle.push(Arc::clone(conn));
            }
        }
        for conn in deadline_expired {
            debug!(conn = %conn.core().id(), "request deadline expired");
            self.handler.post_close(&conn, CloseReason::Timeout).ok();
        }
        for conn in idle {
            debug!(conn = %conn.core().id(), "idle timeout");
            self.reader.post_close(&conn).ok();
        }
    }
}

impl Readiness for Reactor {
    fn arm_writable(&self, conn: &Arc<Connection>) {
        if conn
            .reregister(&self.registry, Interest::READABLE | Interest::WRITABLE)
            .is_err()
        {
            debug!(conn = %conn.core().id(), "arm_writable on deregistered connection");
        }
    }

    fn disarm_writable(&self, conn: &Arc<Connection>) {
        if conn.reregister(&self.registry, Interest::READABLE).is_err() {
            debug!(conn = %conn.core().id(), "disarm_writable on deregistered connection");
        }
    }

    fn deregister(&self, conn: &Arc<Connection>) {
        self.connections.remove(&conn.token().0);
        conn.deregister(&self.registry).ok();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("connections", &self.connections.len())
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
