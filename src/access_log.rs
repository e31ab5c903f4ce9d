//! Append-only access log, one line per completed request

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Request fields captured when the head arrives, completed by the writer
/// when the response finishes.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub method: String,
    pub target: String,
    pub version: &'static str,
}

/// Shared append-only log file.
pub struct AccessLog {
    out: Mutex<BufWriter<File>>,
}

impl AccessLog {
    /// Opens (creating if needed) the log file in append mode.
    pub fn open(path: &Path) -> std::io::Result<Arc<Self>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Arc::new(Self {
            out: Mutex::new(BufWriter::new(file)),
        }))
    }

    /// Appends one line for a completed request and flushes it.
    pub fn record(&self, peer: SocketAddr, record: &AccessRecord, status: u16, bytes_sent: u64) {
        let mut out = self.out.lock().expect("access log mutex poisoned");
        let line = format!(
            "{peer} \"{} {} {}\" {status} {bytes_sent}\n",
            record.method, record.target, record.version
        );
        if out
            .write_all(line.as_bytes())
            .and_then(|()| out.flush())
            .is_err()
        {
            warn!("access log write failed");
        }
    }
}

impl std::fmt::Debug for AccessLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_one_line_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let log = AccessLog::open(&path).unwrap();

        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let record = AccessRecord {
            method: "GET".into(),
            target: "/hello".into(),
            version: "HTTP/1.1",
        };
        log.record(peer, &record, 200, 2);
        log.record(peer, &record, 404, 9);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "127.0.0.1:5000 \"GET /hello HTTP/1.1\" 200 2");
        assert!(lines[1].ends_with("404 9"));
    }
}
