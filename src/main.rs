//! Halley server binary
//!
//! Configuration layering: defaults, then the optional TOML config file,
//! then `HALLEY_*` environment variables, then command-line flags. Exit
//! codes: 0 clean stop, 1 bind failure, 2 configuration error, 64
//! internal error.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use halley::{HalleyError, Server, ServerConfig};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "halley", about = "A staged event-driven HTTP server")]
struct Cli {
    /// Port to listen on
    #[arg(value_name = "PORT")]
    port: Option<u16>,

    /// Port to listen on (alternative to the positional form)
    #[arg(short = 'p', long = "port", conflicts_with = "port")]
    port_flag: Option<u16>,

    /// Config file selecting the module chain
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen backlog
    #[arg(long)]
    backlog: Option<u32>,

    /// Reader stage workers
    #[arg(long)]
    reader_workers: Option<usize>,

    /// Handler stage workers
    #[arg(long)]
    workers: Option<usize>,

    /// Writer stage workers
    #[arg(long)]
    writer_workers: Option<usize>,

    /// MIME table file
    #[arg(long, value_name = "FILE")]
    mime_types: Option<PathBuf>,

    /// Access log file (append-only, one line per completed request)
    #[arg(long, value_name = "FILE")]
    access_log: Option<PathBuf>,

    /// Maximum simultaneous connections
    #[arg(long)]
    max_connections: Option<usize>,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signal: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("halley=info".parse().expect("valid directive"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return 2;
        }
    };

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(HalleyError::Bind { port, source }) => {
            error!(port, error = %source, "cannot bind");
            return 1;
        }
        Err(HalleyError::Config(e)) => {
            error!(error = %e, "configuration error");
            return 2;
        }
        Err(e) => {
            error!(error = %e, "server setup failed");
            return 64;
        }
    };

    let handler = on_terminate as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    server.start();
    info!(addr = %server.local_addr(), "halley serving");

    while !STOP.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutdown requested");
    server.stop();
    0
}

fn build_config(cli: &Cli) -> Result<ServerConfig, HalleyError> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load_file(path).map_err(HalleyError::Config)?,
        None => ServerConfig::default(),
    };
    config.apply_env().map_err(HalleyError::Config)?;

    let invalid = |field: &str, reason: String| {
        HalleyError::Config(halley::config::ConfigError::Validation {
            field: field.to_string(),
            reason,
        })
    };

    if let Some(port) = cli.port.or(cli.port_flag) {
        config.port = port;
    }
    if let Some(backlog) = cli.backlog {
        config.backlog = halley::domain_types::ListenBacklog::try_new(backlog)
            .map_err(|e| invalid("backlog", e.to_string()))?;
    }
    if let Some(n) = cli.reader_workers {
        config.reader_workers = halley::domain_types::WorkerCount::try_new(n)
            .map_err(|e| invalid("reader_workers", e.to_string()))?;
    }
    if let Some(n) = cli.workers {
        config.handler_workers = halley::domain_types::WorkerCount::try_new(n)
            .map_err(|e| invalid("workers", e.to_string()))?;
    }
    if let Some(n) = cli.writer_workers {
        config.writer_workers = halley::domain_types::WorkerCount::try_new(n)
            .map_err(|e| invalid("writer_workers", e.to_string()))?;
    }
    if let Some(path) = &cli.mime_types {
        config.mime_types = path.clone();
    }
    if let Some(path) = &cli.access_log {
        config.access_log = Some(path.clone());
    }
    if let Some(n) = cli.max_connections {
        config.max_connections = halley::domain_types::MaxConnections::try_new(n)
            .map_err(|e| invalid("max_connections", e.to_string()))?;
    }

    config.validate().map_err(HalleyError::Config)?;
    Ok(config)
}
