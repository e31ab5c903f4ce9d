//! Fixed-content terminal module

use std::sync::Arc;

use bytes::Bytes;

use crate::http::body::BodyPart;
use crate::http::handler::HandlerStage;
use crate::http::module::{HandlerData, HttpModule, ModuleError, ModuleOutcome};
use crate::http::response::Response;
use crate::net::conn::Connection;

/// Responds to every request with one configured body.
#[derive(Debug)]
pub struct ContentModule {
    body: Bytes,
    content_type: Option<String>,
}

impl ContentModule {
    pub fn new(body: impl Into<Bytes>, content_type: Option<String>) -> Self {
        Self {
            body: body.into(),
            content_type,
        }
    }
}

impl HttpModule for ContentModule {
    fn name(&self) -> &'static str {
        "content"
    }

    fn process_input(
        &self,
        conn: &Arc<Connection>,
        data: &mut HandlerData,
        stage: &HandlerStage,
        part: &mut Option<BodyPart>,
    ) -> Result<ModuleOutcome, ModuleError> {
        // Request body parts are irrelevant here; consume and ignore them.
        if part.take().is_some() {
            return Ok(ModuleOutcome::Stop);
        }
        let mut response = Response::with_version(200, data.request.version);
        response.set_header("Content-Length", self.body.len().to_string());
        if let Some(content_type) = &self.content_type {
            response.set_header("Content-Type", content_type.clone());
        }
        stage
            .respond(conn, data, response, self.body.clone())
            .map_err(|_| ModuleError::Failed {
                module: self.name().to_string(),
                reason: "writer unavailable".to_string(),
            })?;
        Ok(ModuleOutcome::Stop)
    }
}
