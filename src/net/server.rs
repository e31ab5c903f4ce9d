//! Server assembly and lifecycle
//!
//! Builds the stage pipeline, binds the listening socket, and owns
//! graceful shutdown: stop accepting, close every live connection, then
//! stop the stages in reverse dependency order so in-flight responses
//! finish before their stage goes away.

use std::net::SocketAddr;
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::TcpListener;
use tracing::{info, warn};

use crate::access_log::AccessLog;
use crate::config::ServerConfig;
use crate::domain_types::ListenBacklog;
use crate::eds::helpers::database::{DbClient, DbHelperStage};
use crate::eds::helpers::file_io::FileIoStage;
use crate::error::{HalleyError, Result};
use crate::http::handler::{CloseReason, HandlerStage};
use crate::http::mime::MimeTypes;
use crate::http::reader::ReaderStage;
use crate::http::writer::{Watermarks, WriterStage};
use crate::net::conn::{ConnectionFactory, DefaultConnectionFactory};
use crate::net::reactor::Reactor;

/// Process-wide serving counters, exposed through the status module.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    open: AtomicUsize,
    requests: AtomicU64,
}

impl ServerStats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self) {
        self.open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn open(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// The assembled staged HTTP server.
pub struct Server {
    config: ServerConfig,
    stats: Arc<ServerStats>,
    reader: Arc<ReaderStage>,
    handler: Arc<HandlerStage>,
    writer: Arc<WriterStage>,
    file_io: Arc<FileIoStage>,
    db: Mutex<Option<Arc<DbHelperStage>>>,
    reactor: Arc<Reactor>,
    local_addr: SocketAddr,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Server {
    /// Builds the full pipeline from configuration. Fails with
    /// [`HalleyError::Bind`] when the port cannot be bound and
    /// [`HalleyError::Config`] for configuration problems.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        match MimeTypes::load(&config.mime_types) {
            Ok(table) => {
                MimeTypes::install_global(table);
            }
            Err(e) => {
                warn!(path = %config.mime_types.display(), error = %e,
                    "mime table unavailable, using built-in defaults");
                MimeTypes::install_global(MimeTypes::builtin());
            }
        }

        let access_log = match &config.access_log {
            Some(path) => Some(
                AccessLog::open(path)
                    .map_err(|e| crate::config::ConfigError::Io { source: e })?,
            ),
            None => None,
        };

        let stats = Arc::new(ServerStats::default());

        let watermarks = Watermarks {
            high_parts: config.high_water_parts.as_usize(),
            high_bytes: config.high_water_bytes.as_usize(),
            low_parts: config.low_water_parts.as_usize(),
            low_bytes: config.low_water_bytes.as_usize(),
        };
        let writer = WriterStage::new(
            config.queue_capacity,
            config.writer_workers,
            watermarks,
            access_log,
        );
        let file_io = FileIoStage::new(config.queue_capacity, config.file_io_workers);

        let handler = HandlerStage::new(config.queue_capacity, config.handler_workers, Arc::clone(&writer));
        handler.set_io_helper(Arc::clone(&file_io));
        handler.set_stats(Arc::clone(&stats));

        let root = crate::modules::build_chain(&config.modules, Arc::clone(&stats))?;
        handler.set_root_module(root)?;

        let reader = ReaderStage::new(
            config.queue_capacity,
            config.reader_workers,
            Arc::clone(&handler),
            Arc::clone(&writer),
        );
        writer.set_handler(Arc::clone(&handler));
        writer.set_reader(Arc::clone(&reader));

        let listener = bind_listener(config.port, config.backlog)?;
        let local_addr = listener.local_addr()?;

        let factory: Arc<dyn ConnectionFactory> = Arc::new(DefaultConnectionFactory::new(
            config.max_header_bytes.as_usize(),
        ));
        let reactor = Reactor::new(
            listener,
            Arc::clone(&reader),
            Arc::clone(&writer),
            Arc::clone(&handler),
            factory,
            Arc::clone(&stats),
            config.idle_timeout_secs.as_duration(),
            config.max_connections.as_usize(),
        )?;
        writer.set_readiness(reactor.clone());
        reader.set_readiness(reactor.clone());

        Ok(Self {
            config,
            stats,
            reader,
            handler,
            writer,
            file_io,
            db: Mutex::new(None),
            reactor,
            local_addr,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Attaches a database client, creating the DB helper stage. Must run
    /// before [`start`](Self::start).
    pub fn attach_db_client(&self, client: Arc<dyn DbClient>) {
        let helper = DbHelperStage::new(
            self.config.queue_capacity,
            self.config.db_workers,
            client,
        );
        self.handler.set_db_helper(Arc::clone(&helper));
        *self.db.lock().expect("db mutex poisoned") = Some(helper);
    }

    /// Starts helpers, stages, and the reactor. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        // Broken pipes surface as write errors, not signals.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        self.file_io.start();
        if let Some(db) = self.db.lock().expect("db mutex poisoned").as_ref() {
            db.start();
        }
        self.writer.start();
        self.handler.start();
        self.reader.start();
        self.reactor.start();
        info!(addr = %self.local_addr, "server listening");
    }

    /// Graceful stop: no new connections, close the live ones letting
    /// in-flight responses finish, then stop the stages in reverse
    /// dependency order. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("server stopping");
        self.reactor.stop_accepting();
        for conn in self.reactor.live_connections() {
            self.handler.post_close(&conn, CloseReason::Drain).ok();
        }
        self.reader.stop();
        self.handler.stop();
        self.writer.stop();
        self.file_io.stop();
        if let Some(db) = self.db.lock().expect("db mutex poisoned").as_ref() {
            db.stop();
        }
        self.reactor.shutdown();
        info!("server stopped");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn open_connections(&self) -> usize {
        self.reactor.connection_count()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.local_addr)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Creates the listening socket by hand so the configured backlog is
/// honored: socket, SO_REUSEADDR, bind, listen, then non-blocking for the
/// poll.
fn bind_listener(port: u16, backlog: ListenBacklog) -> Result<TcpListener> {
    let bind_err = |source: std::io::Error| HalleyError::Bind { port, source };

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(bind_err(std::io::Error::last_os_error()));
    }
    // From here the fd is owned; errors must close it.
    let std_listener = unsafe {
        let reuse: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(reuse).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(bind_err(e));
        }

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        if libc::bind(
            fd,
            std::ptr::addr_of!(addr).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(bind_err(e));
        }

        if libc::listen(fd, backlog.as_c_int()) != 0 {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(bind_err(e));
        }

        std::net::TcpListener::from_raw_fd(fd)
    };
    std_listener
        .set_nonblocking(true)
        .map_err(bind_err)?;
    Ok(TcpListener::from_std(std_listener))
}
