//! JSON status terminal module

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::http::body::BodyPart;
use crate::http::handler::HandlerStage;
use crate::http::module::{HandlerData, HttpModule, ModuleError, ModuleOutcome};
use crate::http::response::Response;
use crate::net::conn::Connection;
use crate::net::server::ServerStats;

/// Reports serving counters as a JSON document.
#[derive(Debug)]
pub struct StatusModule {
    stats: Arc<ServerStats>,
    started_at: Instant,
}

impl StatusModule {
    pub fn new(stats: Arc<ServerStats>) -> Self {
        Self {
            stats,
            started_at: Instant::now(),
        }
    }
}

impl HttpModule for StatusModule {
    fn name(&self) -> &'static str {
        "status"
    }

    fn process_input(
        &self,
        conn: &Arc<Connection>,
        data: &mut HandlerData,
        stage: &HandlerStage,
        part: &mut Option<BodyPart>,
    ) -> Result<ModuleOutcome, ModuleError> {
        if part.take().is_some() {
            return Ok(ModuleOutcome::Stop);
        }
        let body = serde_json::json!({
            "connections_open": self.stats.open(),
            "connections_accepted": self.stats.accepted(),
            "requests": self.stats.requests(),
            "uptime_secs": self.started_at.elapsed().as_secs(),
        })
        .to_string();
        let mut response = Response::with_version(200, data.request.version);
        response.set_header("Content-Type", "application/json");
        response.set_header("Content-Length", body.len().to_string());
        stage
            .respond(conn, data, response, Bytes::from(body))
            .map_err(|_| ModuleError::Failed {
                module: self.name().to_string(),
                reason: "writer unavailable".to_string(),
            })?;
        Ok(ModuleOutcome::Stop)
    }
}
