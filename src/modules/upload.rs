//! Streamed-upload terminal module

use std::sync::Arc;

use bytes::BytesMut;

use crate::http::body::BodyPart;
use crate::http::handler::HandlerStage;
use crate::http::module::{HandlerData, HttpModule, ModuleError, ModuleOutcome};
use crate::http::response::Response;
use crate::net::conn::Connection;

const STATE_KEY: &str = "upload";

/// Collects the streamed request body and echoes it back once the last
/// part has arrived.
#[derive(Debug, Default)]
pub struct UploadModule;

impl UploadModule {
    pub fn new() -> Self {
        Self
    }

    fn finish(
        &self,
        conn: &Arc<Connection>,
        data: &mut HandlerData,
        stage: &HandlerStage,
    ) -> Result<ModuleOutcome, ModuleError> {
        let collected = std::mem::take(data.module_state_mut(STATE_KEY, BytesMut::new));
        let mut response = Response::with_version(200, data.request.version);
        response.set_header("Content-Type", "application/octet-stream");
        response.set_header("Content-Length", collected.len().to_string());
        stage
            .respond(conn, data, response, collected.freeze())
            .map_err(|_| ModuleError::Failed {
                module: self.name().to_string(),
                reason: "writer unavailable".to_string(),
            })?;
        Ok(ModuleOutcome::Stop)
    }
}

impl HttpModule for UploadModule {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn process_input(
        &self,
        conn: &Arc<Connection>,
        data: &mut HandlerData,
        stage: &HandlerStage,
        part: &mut Option<BodyPart>,
    ) -> Result<ModuleOutcome, ModuleError> {
        match part.take() {
            None => {
                // Head delivery. A bodyless request uploads nothing.
                if data.request.has_body() {
                    Ok(ModuleOutcome::Stop)
                } else {
                    self.finish(conn, data, stage)
                }
            }
            Some(part) => {
                let is_last = part.is_last;
                if let Some(bytes) = part.data() {
                    data.module_state_mut(STATE_KEY, BytesMut::new)
                        .extend_from_slice(bytes);
                }
                if is_last {
                    self.finish(conn, data, stage)
                } else {
                    Ok(ModuleOutcome::Stop)
                }
            }
        }
    }
}
