//! Writer stage
//!
//! Serializes body parts onto the socket in strict index order. Parts that
//! arrive ahead of their predecessors wait in the connection's reorder
//! heap; when the heap grows past the high-water mark the handler stage is
//! paused for that connection, resuming once the heap drains below the
//! low-water mark. A write that would block re-arms writability with the
//! readiness layer and resumes on the `Writable` event.

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::access_log::AccessLog;
use crate::domain_types::{
    EventPriority, HighWaterBytes, HighWaterParts, LowWaterBytes, LowWaterParts, QueueCapacity,
    WorkerCount,
};
use crate::eds::event::StageEvent;
use crate::eds::job::Job;
use crate::eds::queue::QueueError;
use crate::eds::stage::{EventHandler, EventHandlerFactory, Stage};
use crate::http::body::{BodyPart, BodyPayload};
use crate::http::handler::HandlerStage;
use crate::http::reader::ReaderStage;
use crate::http::response::Response;
use crate::net::conn::{ConnState, Connection, OrderedPart, WriteOp, WriterState};
use crate::net::reactor::Readiness;

/// Pause and resume thresholds for the per-connection reorder heap.
#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    pub high_parts: usize,
    pub high_bytes: usize,
    pub low_parts: usize,
    pub low_bytes: usize,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            high_parts: HighWaterParts::default().as_usize(),
            high_bytes: HighWaterBytes::default().as_usize(),
            low_parts: LowWaterParts::default().as_usize(),
            low_bytes: LowWaterBytes::default().as_usize(),
        }
    }
}

/// Events accepted by the writer stage.
pub enum WriterEvent {
    /// A body part produced for this connection's response.
    Emit { conn: Arc<Connection>, part: BodyPart },
    /// The readiness layer reports the socket writable again.
    Writable { conn: Arc<Connection> },
    /// Close once previously queued parts have been processed.
    Close { conn: Arc<Connection> },
}

impl StageEvent for WriterEvent {
    fn priority(&self) -> EventPriority {
        match self {
            // Sorted after queued emits so a closing connection first
            // finishes the output it already produced.
            WriterEvent::Close { .. } => EventPriority::deferred(),
            _ => EventPriority::normal(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            WriterEvent::Emit { .. } => "emit",
            WriterEvent::Writable { .. } => "writable",
            WriterEvent::Close { .. } => "close",
        }
    }
}

enum PumpOutcome {
    Idle,
    Blocked,
}

/// The stage that owns all socket output.
pub struct WriterStage {
    stage: Arc<Stage<WriterEvent>>,
    watermarks: Watermarks,
    access_log: Option<Arc<AccessLog>>,
    // Weak back-references: the server owns the stages and the reactor;
    // strong links here would form cycles.
    readiness: OnceLock<Weak<dyn Readiness>>,
    handler: OnceLock<Weak<HandlerStage>>,
    reader: OnceLock<Weak<ReaderStage>>,
}

impl WriterStage {
    pub fn new(
        capacity: QueueCapacity,
        workers: WorkerCount,
        watermarks: Watermarks,
        access_log: Option<Arc<AccessLog>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<WriterStage>| Self {
            stage: Stage::new(
                "http-writer",
                capacity,
                workers,
                Arc::new(WriterHandlerFactory { stage: me.clone() }),
            ),
            watermarks,
            access_log,
            readiness: OnceLock::new(),
            handler: OnceLock::new(),
            reader: OnceLock::new(),
        })
    }

    pub fn set_readiness(&self, readiness: Arc<dyn Readiness>) {
        let _ = self.readiness.set(Arc::downgrade(&readiness));
    }

    pub fn set_handler(&self, handler: Arc<HandlerStage>) {
        let _ = self.handler.set(Arc::downgrade(&handler));
    }

    pub fn set_reader(&self, reader: Arc<ReaderStage>) {
        let _ = self.reader.set(Arc::downgrade(&reader));
    }

    pub fn start(&self) {
        self.stage.start();
    }

    pub fn stop(&self) {
        self.stage.stop();
    }

    pub fn queue_len(&self) -> usize {
        self.stage.queue_len()
    }

    /// Queues a body part for ordered emission.
    pub fn emit(&self, conn: &Arc<Connection>, part: BodyPart) -> Result<(), QueueError> {
        self.stage.post(WriterEvent::Emit {
            conn: Arc::clone(conn),
            part,
        })
    }

    pub fn post_writable(&self, conn: &Arc<Connection>) -> Result<(), QueueError> {
        self.stage.post(WriterEvent::Writable {
            conn: Arc::clone(conn),
        })
    }

    /// Queues a close that runs after this connection's pending output.
    pub fn post_close(&self, conn: &Arc<Connection>) -> Result<(), QueueError> {
        self.stage.post(WriterEvent::Close {
            conn: Arc::clone(conn),
        })
    }

    /// Builds and emits a short `text/plain` error response. Callers use
    /// this only before any part of a response has been emitted.
    pub fn send_error(
        &self,
        conn: &Arc<Connection>,
        status: u16,
        body: &str,
    ) -> Result<(), QueueError> {
        let mut response = Response::new(status);
        response.set_header("Content-Type", "text/plain");
        response.set_header("Content-Length", body.len().to_string());
        conn.set_response(response);
        self.emit(conn, BodyPart::inline(0, Bytes::copy_from_slice(body.as_bytes()), true))
    }

    fn readiness(&self) -> Option<Arc<dyn Readiness>> {
        self.readiness.get().and_then(Weak::upgrade)
    }

    fn on_emit(&self, conn: &Arc<Connection>, part: BodyPart) -> crate::Result<()> {
        if matches!(conn.state(), ConnState::Closed) {
            return Ok(());
        }
        if conn.state() == ConnState::Processing {
            conn.set_state(ConnState::Writing);
        }

        let mut finished = false;
        let mut failed = false;
        {
            let mut w = conn.writer.lock().expect("writer state mutex poisoned");
            if part.index == w.next_expected {
                if let Err(e) = self.stage_part(conn, &mut w, part) {
                    warn!(conn = %conn.core().id(), error = %e, "cannot stage body part");
                    failed = true;
                } else {
                    w.next_expected += 1;
                    self.drain_ready(conn, &mut w, &mut failed);
                }
            } else {
                w.heap_bytes += part.byte_len();
                w.heap.push(OrderedPart(part));
                if !conn.output_paused()
                    && (w.heap.len() >= self.watermarks.high_parts
                        || w.heap_bytes >= self.watermarks.high_bytes)
                {
                    debug!(conn = %conn.core().id(), parts = w.heap.len(), bytes = w.heap_bytes,
                        "reorder heap at high water, pausing output");
                    conn.set_output_paused(true);
                }
            }

            if !failed {
                match self.pump(conn, &mut w) {
                    Ok(PumpOutcome::Blocked) => {}
                    Ok(PumpOutcome::Idle) => {
                        finished = w.finishing && w.ops.is_empty();
                    }
                    Err(e) => {
                        warn!(conn = %conn.core().id(), error = %e, "socket write failed");
                        failed = true;
                    }
                }
            }

            self.maybe_resume(conn, &w);
        }

        if failed {
            self.close_conn(conn);
        } else if finished {
            self.complete_response(conn);
        }
        Ok(())
    }

    /// Flushes contiguous parts waiting in the reorder heap.
    fn drain_ready(&self, conn: &Arc<Connection>, w: &mut WriterState, failed: &mut bool) {
        while let Some(top) = w.heap.peek() {
            if top.0.index != w.next_expected {
                break;
            }
            let part = w.heap.pop().expect("peeked entry vanished").0;
            w.heap_bytes = w.heap_bytes.saturating_sub(part.byte_len());
            if self.stage_part(conn, w, part).is_err() {
                *failed = true;
                return;
            }
            w.next_expected += 1;
        }
    }

    /// Serializes one part into pending write operations. The response
    /// head goes out before part zero.
    fn stage_part(
        &self,
        conn: &Arc<Connection>,
        w: &mut WriterState,
        part: BodyPart,
    ) -> crate::Result<()> {
        if !w.head_written {
            let Some(mut response) = conn.take_response() else {
                return Err(crate::HalleyError::Internal(
                    "body part emitted before any response was set".into(),
                ));
            };
            if response.content_length().is_none() {
                response.set_header("Transfer-Encoding", "chunked");
                w.chunked = true;
            }
            w.status = response.status;
            w.ops.push_back(WriteOp::Buf {
                data: response.serialize_head(),
                pos: 0,
            });
            w.head_written = true;
        }

        let is_close = matches!(part.payload, BodyPayload::Close);
        w.body_bytes += part.byte_len() as u64;
        match part.payload {
            BodyPayload::Inline(data) => {
                if !data.is_empty() {
                    if w.chunked {
                        w.ops.push_back(WriteOp::Buf {
                            data: Bytes::from(format!("{:x}\r\n", data.len())),
                            pos: 0,
                        });
                        w.ops.push_back(WriteOp::Buf { data, pos: 0 });
                        w.ops.push_back(WriteOp::Buf {
                            data: Bytes::from_static(b"\r\n"),
                            pos: 0,
                        });
                    } else {
                        w.ops.push_back(WriteOp::Buf { data, pos: 0 });
                    }
                }
            }
            BodyPayload::File { file, offset, len } => {
                if len > 0 {
                    if w.chunked {
                        w.ops.push_back(WriteOp::Buf {
                            data: Bytes::from(format!("{len:x}\r\n")),
                            pos: 0,
                        });
                        w.ops.push_back(WriteOp::File {
                            file,
                            offset,
                            remaining: len,
                        });
                        w.ops.push_back(WriteOp::Buf {
                            data: Bytes::from_static(b"\r\n"),
                            pos: 0,
                        });
                    } else {
                        w.ops.push_back(WriteOp::File {
                            file,
                            offset,
                            remaining: len,
                        });
                    }
                }
            }
            BodyPayload::Close => {
                w.close_after = true;
            }
        }

        if part.is_last {
            if w.chunked && !is_close {
                w.ops.push_back(WriteOp::Buf {
                    data: Bytes::from_static(b"0\r\n\r\n"),
                    pos: 0,
                });
            }
            w.finishing = true;
        }
        Ok(())
    }

    /// Writes pending operations until done or the socket pushes back.
    fn pump(&self, conn: &Arc<Connection>, w: &mut WriterState) -> crate::Result<PumpOutcome> {
        let fd = conn.raw_fd();
        while let Some(op) = w.ops.front_mut() {
            let done = match op {
                WriteOp::Buf { data, pos } => loop {
                    if *pos >= data.len() {
                        break true;
                    }
                    match send_nosignal(fd, &data[*pos..]) {
                        Ok(n) => {
                            *pos += n;
                            w.bytes_sent += n as u64;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            w.blocked = true;
                            if let Some(r) = self.readiness() {
                                r.arm_writable(conn);
                            }
                            return Ok(PumpOutcome::Blocked);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e.into()),
                    }
                },
                WriteOp::File {
                    file,
                    offset,
                    remaining,
                } => loop {
                    if *remaining == 0 {
                        break true;
                    }
                    match sendfile_some(fd, file, offset, *remaining) {
                        Ok(0) => {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "file shrank during sendfile",
                            )
                            .into());
                        }
                        Ok(n) => {
                            *remaining -= n as u64;
                            w.bytes_sent += n as u64;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            w.blocked = true;
                            if let Some(r) = self.readiness() {
                                r.arm_writable(conn);
                            }
                            return Ok(PumpOutcome::Blocked);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e.into()),
                    }
                },
            };
            if done {
                w.ops.pop_front();
            }
        }
        if w.blocked {
            w.blocked = false;
            if let Some(r) = self.readiness() {
                r.disarm_writable(conn);
            }
        }
        Ok(PumpOutcome::Idle)
    }

    fn maybe_resume(&self, conn: &Arc<Connection>, w: &WriterState) {
        if conn.output_paused()
            && w.heap.len() <= self.watermarks.low_parts
            && w.heap_bytes <= self.watermarks.low_bytes
        {
            debug!(conn = %conn.core().id(), "reorder heap below low water, resuming output");
            conn.set_output_paused(false);
            if let Some(handler) = self.handler.get().and_then(Weak::upgrade) {
                handler.post_resume_output(conn).ok();
            }
        }
    }

    /// Runs when the `is_last` part has fully flushed.
    fn complete_response(&self, conn: &Arc<Connection>) {
        let (status, body_bytes, close_after) = {
            let w = conn.writer.lock().expect("writer state mutex poisoned");
            (w.status, w.body_bytes, w.close_after)
        };

        if let (Some(log), Some(record)) = (&self.access_log, conn.take_access_record()) {
            log.record(conn.peer(), &record, status, body_bytes);
        }

        let closing = close_after || !conn.keep_alive() || conn.state() == ConnState::Closing;
        if closing {
            self.close_conn(conn);
            return;
        }

        {
            let mut w = conn.writer.lock().expect("writer state mutex poisoned");
            w.reset_for_next_response();
        }
        conn.set_state(ConnState::Reading);
        conn.touch();
        // Re-arm the reader; a pipelined request may already be buffered.
        if let Some(reader) = self.reader.get().and_then(Weak::upgrade) {
            reader.post_data_available(conn).ok();
        }
    }

    fn on_writable(&self, conn: &Arc<Connection>) {
        if matches!(conn.state(), ConnState::Closed) {
            return;
        }
        let mut finished = false;
        let mut failed = false;
        {
            let mut w = conn.writer.lock().expect("writer state mutex poisoned");
            match self.pump(conn, &mut w) {
                Ok(PumpOutcome::Blocked) => {}
                Ok(PumpOutcome::Idle) => finished = w.finishing && w.ops.is_empty(),
                Err(e) => {
                    warn!(conn = %conn.core().id(), error = %e, "socket write failed");
                    failed = true;
                }
            }
        }
        if failed {
            self.close_conn(conn);
        } else if finished {
            self.complete_response(conn);
        }
    }

    fn on_close(&self, conn: &Arc<Connection>) {
        if matches!(conn.state(), ConnState::Closed) {
            return;
        }
        // Best-effort flush of whatever is already serialized.
        {
            let mut w = conn.writer.lock().expect("writer state mutex poisoned");
            let _ = self.pump(conn, &mut w);
        }
        self.close_conn(conn);
    }

    fn close_conn(&self, conn: &Arc<Connection>) {
        conn.set_state(ConnState::Closing);
        if let Some(r) = self.readiness() {
            r.deregister(conn);
        }
        conn.shutdown_socket();
        conn.set_state(ConnState::Closed);
        conn.core().set_alive(false);
        conn.clear_handler_inbox();
        debug!(conn = %conn.core().id(), "connection closed");
    }
}

impl std::fmt::Debug for WriterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterStage")
            .field("watermarks", &self.watermarks)
            .finish_non_exhaustive()
    }
}

struct WriterHandlerFactory {
    stage: Weak<WriterStage>,
}

impl EventHandlerFactory<WriterEvent> for WriterHandlerFactory {
    fn new_handler(&self) -> Box<dyn EventHandler<WriterEvent>> {
        Box::new(WriterEventHandler {
            stage: self.stage.clone(),
        })
    }
}

struct WriterEventHandler {
    stage: Weak<WriterStage>,
}

impl EventHandler<WriterEvent> for WriterEventHandler {
    fn handle_event(&mut self, event: WriterEvent) -> crate::Result<()> {
        let Some(stage) = self.stage.upgrade() else {
            return Ok(());
        };
        match event {
            WriterEvent::Emit { conn, part } => stage.on_emit(&conn, part),
            WriterEvent::Writable { conn } => {
                stage.on_writable(&conn);
                Ok(())
            }
            WriterEvent::Close { conn } => {
                stage.on_close(&conn);
                Ok(())
            }
        }
    }
}

fn send_nosignal(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    let sent = unsafe {
        libc::send(
            fd,
            buf.as_ptr().cast::<libc::c_void>(),
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if sent < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(sent as usize)
    }
}

fn sendfile_some(
    out_fd: RawFd,
    file: &File,
    offset: &mut u64,
    remaining: u64,
) -> std::io::Result<usize> {
    // Cap each call so one huge file cannot monopolize the worker.
    let count = remaining.min(512 * 1024) as usize;
    let mut off = *offset as libc::off_t;
    let sent = unsafe { libc::sendfile(out_fd, file.as_raw_fd(), &mut off, count) };
    if sent < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        *offset = off as u64;
        Ok(sent as usize)
    }
}
