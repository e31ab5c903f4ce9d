//! Reader stage
//!
//! Drains readable sockets into per-connection buffers, runs the
//! incremental parser, and hands complete request heads and streamed body
//! parts to the handler stage in arrival order. Serial HTTP/1.1 means at
//! most one request in flight per connection: bytes of a pipelined
//! follow-up stay buffered until the writer re-arms the connection.

use std::sync::{Arc, OnceLock, Weak};

use tracing::{debug, warn};

use crate::domain_types::{QueueCapacity, WorkerCount};
use crate::eds::event::StageEvent;
use crate::eds::job::Job;
use crate::eds::queue::QueueError;
use crate::eds::stage::{EventHandler, EventHandlerFactory, Stage};
use crate::http::body::BodyPart;
use crate::http::handler::{CloseReason, HandlerStage};
use crate::http::parser::ParseYield;
use crate::http::writer::WriterStage;
use crate::net::conn::{ConnState, Connection};
use crate::net::reactor::Readiness;

/// Events accepted by the reader stage.
pub enum ReaderEvent {
    /// Readiness notification: bytes may be waiting on the socket.
    DataAvailable(Arc<Connection>),
    /// Close the connection and release its reference.
    Close(Arc<Connection>),
}

impl StageEvent for ReaderEvent {
    fn describe(&self) -> &'static str {
        match self {
            ReaderEvent::DataAvailable(_) => "data-available",
            ReaderEvent::Close(_) => "close",
        }
    }
}

/// The stage that owns all socket input.
pub struct ReaderStage {
    stage: Arc<Stage<ReaderEvent>>,
    handler: Arc<HandlerStage>,
    writer: Arc<WriterStage>,
    readiness: OnceLock<Weak<dyn Readiness>>,
}

impl ReaderStage {
    pub fn new(
        capacity: QueueCapacity,
        workers: WorkerCount,
        handler: Arc<HandlerStage>,
        writer: Arc<WriterStage>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<ReaderStage>| Self {
            stage: Stage::new(
                "http-reader",
                capacity,
                workers,
                Arc::new(ReaderFactory { stage: me.clone() }),
            ),
            handler,
            writer,
            readiness: OnceLock::new(),
        })
    }

    pub fn set_readiness(&self, readiness: Arc<dyn Readiness>) {
        let _ = self.readiness.set(Arc::downgrade(&readiness));
    }

    pub fn start(&self) {
        self.stage.start();
    }

    pub fn stop(&self) {
        self.stage.stop();
    }

    pub fn post_data_available(&self, conn: &Arc<Connection>) -> Result<(), QueueError> {
        self.stage
            .post(ReaderEvent::DataAvailable(Arc::clone(conn)))
    }

    pub fn post_close(&self, conn: &Arc<Connection>) -> Result<(), QueueError> {
        self.stage.post(ReaderEvent::Close(Arc::clone(conn)))
    }

    fn on_data_available(&self, conn: &Arc<Connection>) {
        if matches!(conn.state(), ConnState::Closing | ConnState::Closed) {
            return;
        }
        conn.touch();

        let mut saw_eof = false;
        let mut io_failed = false;
        let mut idle_at_boundary = false;
        let mut mid_request = false;
        {
            let mut r = conn.reader.lock().expect("reader state mutex poisoned");

            // Serial mode: while a request is being processed, bytes of
            // the next one stay in the kernel buffer until the writer
            // re-arms this connection.
            if conn.state() != ConnState::Reading && r.parser.at_request_boundary() {
                return;
            }

            let mut chunk = [0u8; 8 * 1024];
            loop {
                match conn.read_some(&mut chunk) {
                    Ok(0) => {
                        saw_eof = true;
                        break;
                    }
                    Ok(n) => r.buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!(conn = %conn.core().id(), error = %e, "socket read failed");
                        io_failed = true;
                        break;
                    }
                }
            }

            if !io_failed {
                while conn.state() == ConnState::Reading || !r.parser.at_request_boundary() {
                    let yields = {
                        let state = &mut *r;
                        match state.parser.feed(&mut state.buf) {
                            Ok(yields) => yields,
                            Err(e) => {
                                warn!(conn = %conn.core().id(), error = %e, "malformed request");
                                conn.set_keep_alive(false);
                                state.buf.clear();
                                self.writer.send_error(conn, 400, "Bad Request").ok();
                                break;
                            }
                        }
                    };
                    if yields.is_empty() {
                        break;
                    }
                    for item in yields {
                        match item {
                            ParseYield::Head(request) => {
                                r.next_input_index = 0;
                                // Serial mode: the state flips before the
                                // next head could be parsed.
                                conn.set_state(ConnState::Processing);
                                self.handler.post_request(conn, request).ok();
                            }
                            ParseYield::BodyChunk { data, is_last } => {
                                let part =
                                    BodyPart::inline(r.next_input_index, data, is_last);
                                r.next_input_index += 1;
                                self.handler.post_input_body(conn, part).ok();
                            }
                        }
                    }
                }
            }

            mid_request = !r.parser.at_request_boundary();
            idle_at_boundary = conn.state() == ConnState::Reading
                && r.parser.at_request_boundary();
        }

        if io_failed {
            self.close_now(conn);
        } else if saw_eof {
            if mid_request {
                // Peer went away mid-request: the handler stage gets a
                // synthetic close so module state unwinds.
                debug!(conn = %conn.core().id(), "peer disconnected mid-request");
                if self
                    .handler
                    .post_close(conn, CloseReason::Drain)
                    .is_err()
                {
                    self.close_now(conn);
                }
            } else if idle_at_boundary {
                // Peer hung up between requests, possibly leaving a
                // partial head that can never complete.
                self.close_now(conn);
            } else {
                // Half-close while a response is in flight: no further
                // requests can arrive, but the response still goes out.
                conn.set_keep_alive(false);
            }
        }
    }

    fn close_now(&self, conn: &Arc<Connection>) {
        conn.set_state(ConnState::Closing);
        if let Some(readiness) = self.readiness.get().and_then(Weak::upgrade) {
            readiness.deregister(conn);
        }
        conn.shutdown_socket();
        conn.set_state(ConnState::Closed);
        conn.core().set_alive(false);
        conn.clear_handler_inbox();
        debug!(conn = %conn.core().id(), "connection closed by reader");
    }
}

impl std::fmt::Debug for ReaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderStage").finish_non_exhaustive()
    }
}

struct ReaderFactory {
    stage: Weak<ReaderStage>,
}

impl EventHandlerFactory<ReaderEvent> for ReaderFactory {
    fn new_handler(&self) -> Box<dyn EventHandler<ReaderEvent>> {
        Box::new(ReaderEventHandler {
            stage: self.stage.clone(),
        })
    }
}

struct ReaderEventHandler {
    stage: Weak<ReaderStage>,
}

impl EventHandler<ReaderEvent> for ReaderEventHandler {
    fn handle_event(&mut self, event: ReaderEvent) -> crate::Result<()> {
        let Some(stage) = self.stage.upgrade() else {
            return Ok(());
        };
        match event {
            ReaderEvent::DataAvailable(conn) => stage.on_data_available(&conn),
            ReaderEvent::Close(conn) => stage.close_now(&conn),
        }
        Ok(())
    }
}
