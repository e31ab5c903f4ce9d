//! File I/O helper stage
//!
//! Performs `open`/`read`/`write` on its own worker pool so request-handler
//! workers never block on disk. Completion is posted back to the issuing
//! stage through a sink, carrying the continuation token the issuer
//! supplied; the issuer switches on the token to resume where it left off.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::domain_types::{QueueCapacity, WorkerCount};
use crate::eds::event::StageEvent;
use crate::eds::job::Job;
use crate::eds::queue::QueueError;
use crate::eds::stage::{EventHandler, EventHandlerFactory, Stage};

/// Opaque value round-tripped through a helper stage so the issuer can
/// resume processing at the right point when the completion arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationToken {
    pub kind: u32,
    pub data: u64,
}

impl ContinuationToken {
    pub fn new(kind: u32, data: u64) -> Self {
        Self { kind, data }
    }
}

/// Successful result of a file operation.
pub enum IoOutcome {
    Opened { file: Arc<File>, len: u64 },
    Read { data: Bytes },
    Written { bytes: usize },
}

impl std::fmt::Debug for IoOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoOutcome::Opened { len, .. } => f.debug_struct("Opened").field("len", len).finish(),
            IoOutcome::Read { data } => {
                f.debug_struct("Read").field("len", &data.len()).finish()
            }
            IoOutcome::Written { bytes } => {
                f.debug_struct("Written").field("bytes", bytes).finish()
            }
        }
    }
}

/// Receives file-operation completions on behalf of the issuing stage.
pub trait IoCompletionSink: Send + Sync {
    fn io_complete(
        &self,
        job: Arc<dyn Job>,
        token: ContinuationToken,
        result: io::Result<IoOutcome>,
    );
}

/// Events accepted by the file I/O helper stage.
pub enum FileIoEvent {
    Open {
        job: Arc<dyn Job>,
        path: PathBuf,
        token: ContinuationToken,
        sink: Arc<dyn IoCompletionSink>,
    },
    Read {
        job: Arc<dyn Job>,
        file: Arc<File>,
        offset: u64,
        len: usize,
        token: ContinuationToken,
        sink: Arc<dyn IoCompletionSink>,
    },
    Write {
        job: Arc<dyn Job>,
        file: Arc<File>,
        offset: u64,
        data: Bytes,
        token: ContinuationToken,
        sink: Arc<dyn IoCompletionSink>,
    },
}

impl StageEvent for FileIoEvent {
    fn describe(&self) -> &'static str {
        match self {
            FileIoEvent::Open { .. } => "open",
            FileIoEvent::Read { .. } => "read",
            FileIoEvent::Write { .. } => "write",
        }
    }
}

/// Thread pool isolating blocking file syscalls from request workers.
pub struct FileIoStage {
    stage: Arc<Stage<FileIoEvent>>,
}

impl FileIoStage {
    pub fn new(capacity: QueueCapacity, workers: WorkerCount) -> Arc<Self> {
        Arc::new(Self {
            stage: Stage::new("file-io", capacity, workers, Arc::new(FileIoHandlerFactory)),
        })
    }

    pub fn start(&self) {
        self.stage.start();
    }

    pub fn stop(&self) {
        self.stage.stop();
    }

    /// Queues an `open` of `path`; the completion carries the opened file
    /// and its length.
    pub fn open(
        &self,
        job: Arc<dyn Job>,
        path: PathBuf,
        token: ContinuationToken,
        sink: Arc<dyn IoCompletionSink>,
    ) -> Result<(), QueueError> {
        self.stage.post(FileIoEvent::Open { job, path, token, sink })
    }

    /// Queues a positioned read of up to `len` bytes.
    pub fn read(
        &self,
        job: Arc<dyn Job>,
        file: Arc<File>,
        offset: u64,
        len: usize,
        token: ContinuationToken,
        sink: Arc<dyn IoCompletionSink>,
    ) -> Result<(), QueueError> {
        self.stage.post(FileIoEvent::Read {
            job,
            file,
            offset,
            len,
            token,
            sink,
        })
    }

    /// Queues a positioned write of `data`.
    pub fn write(
        &self,
        job: Arc<dyn Job>,
        file: Arc<File>,
        offset: u64,
        data: Bytes,
        token: ContinuationToken,
        sink: Arc<dyn IoCompletionSink>,
    ) -> Result<(), QueueError> {
        self.stage.post(FileIoEvent::Write {
            job,
            file,
            offset,
            data,
            token,
            sink,
        })
    }
}

impl std::fmt::Debug for FileIoStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIoStage").finish_non_exhaustive()
    }
}

struct FileIoHandlerFactory;

impl EventHandlerFactory<FileIoEvent> for FileIoHandlerFactory {
    fn new_handler(&self) -> Box<dyn EventHandler<FileIoEvent>> {
        Box::new(FileIoHandler)
    }
}

struct FileIoHandler;

impl EventHandler<FileIoEvent> for FileIoHandler {
    fn handle_event(&mut self, event: FileIoEvent) -> crate::Result<()> {
        match event {
            FileIoEvent::Open { job, path, token, sink } => {
                debug!(path = %path.display(), "file open");
                let result = File::open(&path).and_then(|file| {
                    let len = file.metadata()?.len();
                    Ok(IoOutcome::Opened {
                        file: Arc::new(file),
                        len,
                    })
                });
                sink.io_complete(job, token, result);
            }
            FileIoEvent::Read {
                job,
                file,
                offset,
                len,
                token,
                sink,
            } => {
                let mut buf = vec![0u8; len];
                let result = file.read_at(&mut buf, offset).map(|n| {
                    buf.truncate(n);
                    IoOutcome::Read {
                        data: Bytes::from(buf),
                    }
                });
                sink.io_complete(job, token, result);
            }
            FileIoEvent::Write {
                job,
                file,
                offset,
                data,
                token,
                sink,
            } => {
                let result = file
                    .write_at(&data, offset)
                    .map(|bytes| IoOutcome::Written { bytes });
                sink.io_complete(job, token, result);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eds::job::JobCore;
    use std::io::Write as _;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Plain {
        core: JobCore,
    }

    impl Job for Plain {
        fn core(&self) -> &JobCore {
            &self.core
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
            self
        }
    }

    struct ChannelSink {
        tx: Mutex<mpsc::Sender<(ContinuationToken, io::Result<IoOutcome>)>>,
    }

    impl IoCompletionSink for ChannelSink {
        fn io_complete(
            &self,
            _job: Arc<dyn Job>,
            token: ContinuationToken,
            result: io::Result<IoOutcome>,
        ) {
            self.tx.lock().unwrap().send((token, result)).ok();
        }
    }

    #[test]
    fn open_then_read_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"staged event driven").unwrap();

        let helper = FileIoStage::new(
            QueueCapacity::try_new(16).unwrap(),
            WorkerCount::try_new(1).unwrap(),
        );
        helper.start();

        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(ChannelSink { tx: Mutex::new(tx) });
        let job: Arc<dyn Job> = Arc::new(Plain { core: JobCore::new() });

        helper
            .open(
                Arc::clone(&job),
                tmp.path().to_path_buf(),
                ContinuationToken::new(1, 0),
                Arc::clone(&sink) as Arc<dyn IoCompletionSink>,
            )
            .unwrap();

        let (token, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(token.kind, 1);
        let (file, len) = match result.unwrap() {
            IoOutcome::Opened { file, len } => (file, len),
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(len, 19);

        helper
            .read(
                job,
                file,
                7,
                5,
                ContinuationToken::new(2, 7),
                sink as Arc<dyn IoCompletionSink>,
            )
            .unwrap();
        let (token, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(token, ContinuationToken::new(2, 7));
        match result.unwrap() {
            IoOutcome::Read { data } => assert_eq!(&data[..], b"event"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        helper.stop();
    }

    #[test]
    fn open_missing_file_reports_error() {
        let helper = FileIoStage::new(
            QueueCapacity::try_new(4).unwrap(),
            WorkerCount::try_new(1).unwrap(),
        );
        helper.start();

        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(ChannelSink { tx: Mutex::new(tx) });
        let job: Arc<dyn Job> = Arc::new(Plain { core: JobCore::new() });

        helper
            .open(
                job,
                PathBuf::from("/definitely/not/here"),
                ContinuationToken::new(1, 0),
                sink as Arc<dyn IoCompletionSink>,
            )
            .unwrap();
        let (_, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(result.is_err());
        helper.stop();
    }
}
