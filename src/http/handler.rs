//! Handler stage
//!
//! Runs the per-request module chain. The input direction starts when the
//! reader delivers a request head and continues with streamed body parts;
//! the output direction carries response parts through the chain's filters
//! and hands them to the writer. Helper-stage completions re-enter here
//! carrying the continuation token the issuing module chose.

use std::sync::{Arc, OnceLock, RwLock, Weak};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::access_log::AccessRecord;
use crate::domain_types::{QueueCapacity, WorkerCount};
use crate::eds::event::StageEvent;
use crate::eds::helpers::database::{DbCompletionSink, DbError, DbHelperStage, DbOutcome};
use crate::eds::helpers::file_io::{
    ContinuationToken, FileIoStage, IoCompletionSink, IoOutcome,
};
use crate::eds::job::Job;
use crate::eds::queue::QueueError;
use crate::eds::stage::{EventHandler, EventHandlerFactory, Stage, StageId};
use crate::http::body::BodyPart;
use crate::http::module::{HandlerData, HelperResult, HttpModule, ModuleError, ModuleOutcome};
use crate::http::request::Request;
use crate::http::writer::WriterStage;
use crate::net::conn::{ConnState, Connection};
use crate::net::server::ServerStats;

/// Why a connection is being closed through the handler stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit close: client went away, server shutdown, module request.
    Drain,
    /// A per-request soft deadline expired.
    Timeout,
}

/// Events accepted by the handler stage.
///
/// Connection-targeted events travel through the connection's ordered
/// inbox; the stage queue carries one `Drain` marker per inbox entry so
/// the queue bound still back-pressures producers while a single worker
/// at a time processes any given connection in posting order.
pub enum HandlerEvent {
    /// Marker: drain the connection's inbox.
    Drain {
        conn: Arc<Connection>,
    },
    RequestArrived {
        conn: Arc<Connection>,
        request: Request,
    },
    NextInputModule {
        conn: Arc<Connection>,
        module: Option<Arc<dyn HttpModule>>,
        part: Option<BodyPart>,
    },
    InputBodyToModule {
        conn: Arc<Connection>,
        module: Option<Arc<dyn HttpModule>>,
        part: BodyPart,
    },
    NextOutputModule {
        conn: Arc<Connection>,
        module: Option<Arc<dyn HttpModule>>,
        part: Option<BodyPart>,
    },
    OutputBodyToModule {
        conn: Arc<Connection>,
        module: Arc<dyn HttpModule>,
        part: BodyPart,
    },
    ResumeOutput {
        conn: Arc<Connection>,
    },
    CloseConnection {
        conn: Arc<Connection>,
        reason: CloseReason,
    },
    HelperComplete {
        conn: Arc<Connection>,
        token: ContinuationToken,
        result: HelperResult,
    },
}

impl HandlerEvent {
    /// The connection this event targets.
    pub fn conn(&self) -> &Arc<Connection> {
        match self {
            HandlerEvent::Drain { conn }
            | HandlerEvent::RequestArrived { conn, .. }
            | HandlerEvent::NextInputModule { conn, .. }
            | HandlerEvent::InputBodyToModule { conn, .. }
            | HandlerEvent::NextOutputModule { conn, .. }
            | HandlerEvent::OutputBodyToModule { conn, .. }
            | HandlerEvent::ResumeOutput { conn }
            | HandlerEvent::CloseConnection { conn, .. }
            | HandlerEvent::HelperComplete { conn, .. } => conn,
        }
    }
}

impl StageEvent for HandlerEvent {
    fn describe(&self) -> &'static str {
        match self {
            HandlerEvent::Drain { .. } => "drain",
            HandlerEvent::RequestArrived { .. } => "request-arrived",
            HandlerEvent::NextInputModule { .. } => "next-input-module",
            HandlerEvent::InputBodyToModule { .. } => "input-body-to-module",
            HandlerEvent::NextOutputModule { .. } => "next-output-module",
            HandlerEvent::OutputBodyToModule { .. } => "output-body-to-module",
            HandlerEvent::ResumeOutput { .. } => "resume-output",
            HandlerEvent::CloseConnection { .. } => "close-connection",
            HandlerEvent::HelperComplete { .. } => "helper-complete",
        }
    }
}

/// The stage that runs the module chain.
pub struct HandlerStage {
    stage: Arc<Stage<HandlerEvent>>,
    me: Weak<HandlerStage>,
    writer: Arc<WriterStage>,
    root_module: RwLock<Option<Arc<dyn HttpModule>>>,
    file_io: OnceLock<Arc<FileIoStage>>,
    db: OnceLock<Arc<DbHelperStage>>,
    stats: OnceLock<Arc<ServerStats>>,
}

impl HandlerStage {
    pub fn new(
        capacity: QueueCapacity,
        workers: WorkerCount,
        writer: Arc<WriterStage>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<HandlerStage>| Self {
            stage: Stage::new(
                "http-handler",
                capacity,
                workers,
                Arc::new(HandlerFactory { stage: me.clone() }),
            ),
            me: me.clone(),
            writer,
            root_module: RwLock::new(None),
            file_io: OnceLock::new(),
            db: OnceLock::new(),
            stats: OnceLock::new(),
        })
    }

    /// Installs the root of the module chain, rejecting cyclic graphs.
    pub fn set_root_module(&self, module: Arc<dyn HttpModule>) -> Result<(), ModuleError> {
        crate::http::module::validate_chain(&module)?;
        *self
            .root_module
            .write()
            .expect("root module lock poisoned") = Some(module);
        Ok(())
    }

    /// Wires in the file I/O helper stage.
    pub fn set_io_helper(&self, helper: Arc<FileIoStage>) {
        let _ = self.file_io.set(helper);
    }

    /// Wires in the database helper stage.
    pub fn set_db_helper(&self, helper: Arc<DbHelperStage>) {
        let _ = self.db.set(helper);
    }

    pub fn set_stats(&self, stats: Arc<ServerStats>) {
        let _ = self.stats.set(stats);
    }

    pub fn file_io(&self) -> Option<&Arc<FileIoStage>> {
        self.file_io.get()
    }

    pub fn db(&self) -> Option<&Arc<DbHelperStage>> {
        self.db.get()
    }

    /// This stage as a file-completion sink for helper calls.
    pub fn io_sink(&self) -> Arc<dyn IoCompletionSink> {
        self.self_arc()
    }

    /// This stage as a database-completion sink for helper calls.
    pub fn db_sink(&self) -> Arc<dyn DbCompletionSink> {
        self.self_arc()
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

    fn self_arc(&self) -> Arc<HandlerStage> {
        self.me.upgrade().expect("handler stage still alive")
    }

    fn stage_id(&self) -> StageId {
        self.stage.id()
    }

    fn root(&self) -> Option<Arc<dyn HttpModule>> {
        self.root_module
            .read()
            .expect("root module lock poisoned")
            .clone()
    }

    /// Queues a connection-targeted event: the payload goes into the
    /// connection's ordered inbox, a drain marker into the stage queue.
    fn post_to_conn(&self, conn: &Arc<Connection>, event: HandlerEvent) -> Result<(), QueueError> {
        conn.enqueue_handler_event(event);
        match self.stage.post(HandlerEvent::Drain {
            conn: Arc::clone(conn),
        }) {
            Ok(()) => Ok(()),
            Err(e) => {
                // No marker will ever drain it; an orphaned entry would
                // keep the connection alive through its own reference.
                conn.discard_last_handler_event();
                Err(e)
            }
        }
    }

    /// Posts a new request into the stage. Used by the reader.
    pub fn post_request(&self, conn: &Arc<Connection>, request: Request) -> Result<(), QueueError> {
        self.post_to_conn(
            conn,
            HandlerEvent::RequestArrived {
                conn: Arc::clone(conn),
                request,
            },
        )
    }

    /// Posts an input body part. With no explicit module it goes to the
    /// connection's current input module.
    pub fn post_input_body(&self, conn: &Arc<Connection>, part: BodyPart) -> Result<(), QueueError> {
        self.post_to_conn(
            conn,
            HandlerEvent::InputBodyToModule {
                conn: Arc::clone(conn),
                module: None,
                part,
            },
        )
    }

    /// Sends input to be processed by a specific module. Routers use this
    /// to dispatch a matched request.
    pub fn input_to_module(
        &self,
        conn: Arc<Connection>,
        module: Arc<dyn HttpModule>,
        part: Option<BodyPart>,
    ) -> Result<(), QueueError> {
        self.post_to_conn(
            &Arc::clone(&conn),
            HandlerEvent::NextInputModule {
                conn,
                module: Some(module),
                part,
            },
        )
    }

    /// Sends output to be processed by a specific module.
    pub fn output_to_module(
        &self,
        conn: Arc<Connection>,
        module: Arc<dyn HttpModule>,
        part: BodyPart,
    ) -> Result<(), QueueError> {
        self.post_to_conn(
            &Arc::clone(&conn),
            HandlerEvent::OutputBodyToModule { conn, module, part },
        )
    }

    /// Requests an orderly close of the connection.
    pub fn post_close(&self, conn: &Arc<Connection>, reason: CloseReason) -> Result<(), QueueError> {
        self.post_to_conn(
            conn,
            HandlerEvent::CloseConnection {
                conn: Arc::clone(conn),
                reason,
            },
        )
    }

    /// Writer-side notification that a paused connection may produce
    /// output again.
    pub fn post_resume_output(&self, conn: &Arc<Connection>) -> Result<(), QueueError> {
        self.post_to_conn(
            conn,
            HandlerEvent::ResumeOutput {
                conn: Arc::clone(conn),
            },
        )
    }

    /// Routes a response part into the output chain. Called by modules
    /// from inside `process_input` or a helper completion.
    pub fn send_output(&self, conn: &Arc<Connection>, part: BodyPart) -> Result<(), QueueError> {
        let module = self.root();
        self.post_to_conn(
            conn,
            HandlerEvent::NextOutputModule {
                conn: Arc::clone(conn),
                module,
                part: Some(part),
            },
        )
    }

    /// Drains the connection's inbox if no other worker is already on it.
    fn drain_conn(&self, conn: &Arc<Connection>) {
        if !conn.try_begin_handler_drain() {
            return;
        }
        loop {
            match conn.pop_handler_event() {
                Some(event) => self.process_conn_event(conn, event),
                None => {
                    conn.end_handler_drain();
                    // A producer may have appended between the failed pop
                    // and the release; reclaim or leave it to its marker.
                    if conn.handler_inbox_is_empty() || !conn.try_begin_handler_drain() {
                        return;
                    }
                }
            }
        }
    }

    fn process_conn_event(&self, conn: &Arc<Connection>, event: HandlerEvent) {
        match event {
            HandlerEvent::Drain { .. } => {}
            HandlerEvent::RequestArrived { request, .. } => {
                self.on_request_arrived(conn, request);
            }
            HandlerEvent::NextInputModule { module, part, .. } => match module {
                Some(module) => self.deliver_input(conn, module, part),
                None => {
                    if part.is_none() {
                        self.input_fell_off_chain(conn);
                    }
                }
            },
            HandlerEvent::InputBodyToModule { module, part, .. } => {
                self.on_input_body(conn, module, part);
            }
            HandlerEvent::NextOutputModule { module, part, .. } => {
                self.on_output(conn, module, part);
            }
            HandlerEvent::OutputBodyToModule { module, part, .. } => {
                self.on_output(conn, Some(module), Some(part));
            }
            HandlerEvent::ResumeOutput { .. } => self.on_resume_output(conn),
            HandlerEvent::CloseConnection { reason, .. } => self.on_close(conn, reason),
            HandlerEvent::HelperComplete { token, result, .. } => {
                self.on_helper_complete(conn, token, result);
            }
        }
    }

    /// Convenience used by terminal modules: installs the response head
    /// and emits `body` as the single final part through the output chain.
    pub fn respond(
        &self,
        conn: &Arc<Connection>,
        data: &mut HandlerData,
        mut response: crate::http::response::Response,
        body: Bytes,
    ) -> Result<(), QueueError> {
        if response.content_length().is_none() {
            response.set_header("Content-Length", body.len().to_string());
        }
        conn.set_response(response);
        let part = data.next_part(body, true);
        self.send_output(conn, part)
    }

    /// Emits a plain-text error response for the current request.
    pub fn respond_error(
        &self,
        conn: &Arc<Connection>,
        data: &mut HandlerData,
        status: u16,
        body: &str,
    ) -> Result<(), QueueError> {
        data.mark_emitted();
        self.writer.send_error(conn, status, body)
    }

    // Event handling below runs on this stage's workers.

    fn on_request_arrived(&self, conn: &Arc<Connection>, request: Request) {
        if let Some(stats) = self.stats.get() {
            stats.record_request();
        }
        debug!(conn = %conn.core().id(), method = %request.method, target = %request.target,
            "request arrived");
        conn.set_keep_alive(request.keep_alive());
        conn.set_access_record(AccessRecord {
            method: request.method.as_str().to_string(),
            target: request.target.clone(),
            version: request.version.as_str(),
        });
        conn.set_state(ConnState::Processing);

        let root = self.root();
        conn.core()
            .reset_stage_data(self.stage_id(), HandlerData::new(request));

        match root {
            Some(module) => self.deliver_input(conn, module, None),
            None => self.error_response(conn, 404, "Not Found"),
        }
    }

    fn deliver_input(
        &self,
        conn: &Arc<Connection>,
        module: Arc<dyn HttpModule>,
        part: Option<BodyPart>,
    ) {
        let mut slot = part;
        let outcome = conn.core().try_with_stage_data::<HandlerData, _>(
            self.stage_id(),
            |data| {
                data.input_module = Some(Arc::clone(&module));
                data.resume_module = Some(Arc::clone(&module));
                module.process_input(conn, data, self, &mut slot)
            },
        );
        match outcome {
            None => {} // no request in flight any more
            Some(Ok(ModuleOutcome::Continue)) => match (module.next_module().cloned(), slot) {
                (Some(next), remaining) => {
                    self.post_to_conn(
                        conn,
                        HandlerEvent::NextInputModule {
                            conn: Arc::clone(conn),
                            module: Some(next),
                            part: remaining,
                        },
                    )
                    .ok();
                }
                (None, None) => self.input_fell_off_chain(conn),
                (None, Some(_)) => {} // body part past the chain end
            },
            Some(Ok(ModuleOutcome::Stop)) => {}
            Some(Ok(ModuleOutcome::StopAndEmit)) => self.finalize_response(conn),
            Some(Err(e)) => self.module_failed(conn, &e),
        }
    }

    /// The request head reached the end of the chain unhandled.
    fn input_fell_off_chain(&self, conn: &Arc<Connection>) {
        if !self.response_started(conn) {
            self.error_response(conn, 404, "Not Found");
        }
    }

    fn on_input_body(
        &self,
        conn: &Arc<Connection>,
        module: Option<Arc<dyn HttpModule>>,
        part: BodyPart,
    ) {
        let target = module.or_else(|| {
            conn.core()
                .try_with_stage_data::<HandlerData, _>(self.stage_id(), |data| {
                    data.input_module.clone()
                })
                .flatten()
        });
        match target.or_else(|| self.root()) {
            Some(module) => self.deliver_input(conn, module, Some(part)),
            None => debug!(conn = %conn.core().id(), "input body with no consumer, dropped"),
        }
    }

    fn on_output(
        &self,
        conn: &Arc<Connection>,
        module: Option<Arc<dyn HttpModule>>,
        part: Option<BodyPart>,
    ) {
        let Some(module) = module else {
            if let Some(part) = part {
                self.emit_to_writer(conn, part);
            }
            return;
        };
        let mut slot = part;
        let outcome = conn.core().try_with_stage_data::<HandlerData, _>(
            self.stage_id(),
            |data| module.process_output(conn, data, self, &mut slot),
        );
        match outcome {
            None => {}
            Some(Ok(ModuleOutcome::Continue)) => {
                self.post_to_conn(
                    conn,
                    HandlerEvent::NextOutputModule {
                        conn: Arc::clone(conn),
                        module: module.next_module().cloned(),
                        part: slot,
                    },
                )
                .ok();
            }
            Some(Ok(ModuleOutcome::Stop)) => {}
            Some(Ok(ModuleOutcome::StopAndEmit)) => {
                if let Some(part) = slot {
                    self.emit_to_writer(conn, part);
                }
            }
            Some(Err(e)) => self.module_failed(conn, &e),
        }
    }

    /// Hands a part to the writer, or holds it while the writer has this
    /// connection paused.
    fn emit_to_writer(&self, conn: &Arc<Connection>, part: BodyPart) {
        if conn.output_paused() {
            conn.pending_output
                .lock()
                .expect("pending output mutex poisoned")
                .push_back(part);
            return;
        }
        if self.writer.emit(conn, part).is_err() {
            debug!(conn = %conn.core().id(), "writer stage gone, part dropped");
        }
    }

    fn on_resume_output(&self, conn: &Arc<Connection>) {
        loop {
            if conn.output_paused() {
                break;
            }
            let Some(part) = conn
                .pending_output
                .lock()
                .expect("pending output mutex poisoned")
                .pop_front()
            else {
                break;
            };
            if self.writer.emit(conn, part).is_err() {
                break;
            }
        }
    }

    fn on_close(&self, conn: &Arc<Connection>, reason: CloseReason) {
        debug!(conn = %conn.core().id(), ?reason, "close requested");
        match reason {
            CloseReason::Timeout => {
                conn.set_keep_alive(false);
                if self.response_started(conn) {
                    self.writer.post_close(conn).ok();
                } else {
                    self.error_response(conn, 408, "Request Timeout");
                }
            }
            CloseReason::Drain => {
                self.writer.post_close(conn).ok();
            }
        }
    }

    fn on_helper_complete(
        &self,
        conn: &Arc<Connection>,
        token: ContinuationToken,
        result: HelperResult,
    ) {
        let module = conn
            .core()
            .try_with_stage_data::<HandlerData, _>(self.stage_id(), |data| {
                data.resume_module.clone()
            })
            .flatten();
        let Some(module) = module else {
            warn!(conn = %conn.core().id(), "helper completion with no module to resume");
            return;
        };
        let outcome = conn.core().try_with_stage_data::<HandlerData, _>(
            self.stage_id(),
            |data| module.on_helper_complete(conn, data, self, token, result),
        );
        match outcome {
            None => {}
            Some(Ok(ModuleOutcome::Continue | ModuleOutcome::Stop)) => {}
            Some(Ok(ModuleOutcome::StopAndEmit)) => self.finalize_response(conn),
            Some(Err(e)) => self.module_failed(conn, &e),
        }
    }

    /// Completes the response as it stands, emitting the final empty part
    /// when the module chain has not produced one.
    fn finalize_response(&self, conn: &Arc<Connection>) {
        let final_part = conn
            .core()
            .try_with_stage_data::<HandlerData, _>(self.stage_id(), |data| {
                if data.emitted_last() {
                    None
                } else {
                    Some(data.next_part(Bytes::new(), true))
                }
            })
            .flatten();
        if let Some(part) = final_part {
            self.emit_to_writer(conn, part);
        }
    }

    fn response_started(&self, conn: &Arc<Connection>) -> bool {
        conn.core()
            .try_with_stage_data::<HandlerData, _>(self.stage_id(), |data| {
                data.next_output_index() > 0
            })
            .unwrap_or(false)
    }

    fn module_failed(&self, conn: &Arc<Connection>, error: &ModuleError) {
        warn!(conn = %conn.core().id(), error = %error, "module chain failed");
        if self.response_started(conn) {
            conn.set_keep_alive(false);
            self.writer.post_close(conn).ok();
        } else {
            self.error_response(conn, 500, "Internal Server Error");
        }
    }

    fn error_response(&self, conn: &Arc<Connection>, status: u16, body: &str) {
        let _ = conn
            .core()
            .try_with_stage_data::<HandlerData, _>(self.stage_id(), |data| data.mark_emitted());
        if self.writer.send_error(conn, status, body).is_err() {
            debug!(conn = %conn.core().id(), "writer stage gone, error response dropped");
        }
    }
}

impl std::fmt::Debug for HandlerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerStage").finish_non_exhaustive()
    }
}

impl IoCompletionSink for HandlerStage {
    fn io_complete(
        &self,
        job: Arc<dyn Job>,
        token: ContinuationToken,
        result: std::io::Result<IoOutcome>,
    ) {
        let Ok(conn) = job.as_any().downcast::<Connection>() else {
            warn!("file completion for a job that is not a connection");
            return;
        };
        self.stage
            .post(HandlerEvent::HelperComplete {
                conn,
                token,
                result: HelperResult::Io(result),
            })
            .ok();
    }
}

impl DbCompletionSink for HandlerStage {
    fn db_complete(
        &self,
        job: Arc<dyn Job>,
        token: ContinuationToken,
        result: Result<DbOutcome, DbError>,
    ) {
        let Ok(conn) = job.as_any().downcast::<Connection>() else {
            warn!("database completion for a job that is not a connection");
            return;
        };
        self.stage
            .post(HandlerEvent::HelperComplete {
                conn,
                token,
                result: HelperResult::Db(result),
            })
            .ok();
    }
}

struct HandlerFactory {
    stage: Weak<HandlerStage>,
}

impl EventHandlerFactory<HandlerEvent> for HandlerFactory {
    fn new_handler(&self) -> Box<dyn EventHandler<HandlerEvent>> {
        Box::new(HandlerEventHandler {
            stage: self.stage.clone(),
        })
    }
}

struct HandlerEventHandler {
    stage: Weak<HandlerStage>,
}

impl EventHandler<HandlerEvent> for HandlerEventHandler {
    fn handle_event(&mut self, event: HandlerEvent) -> crate::Result<()> {
        let Some(stage) = self.stage.upgrade() else {
            return Ok(());
        };
        match event {
            HandlerEvent::Drain { conn } => stage.drain_conn(&conn),
            // Events posted without a marker still honor the per-
            // connection ordering discipline.
            other => {
                let conn = Arc::clone(other.conn());
                conn.enqueue_handler_event(other);
                stage.drain_conn(&conn);
            }
        }
        Ok(())
    }
}
