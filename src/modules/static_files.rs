//! Static file terminal module
//!
//! Opens files through the file I/O helper so handler workers never touch
//! the disk. The open result comes back as a helper completion carrying
//! this module's continuation token, and the file itself goes out as a
//! sendfile body part.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::eds::helpers::file_io::{ContinuationToken, IoOutcome};
use crate::eds::job::Job;
use crate::http::body::BodyPart;
use crate::http::handler::HandlerStage;
use crate::http::mime::MimeTypes;
use crate::http::module::{
    HandlerData, HelperResult, HttpModule, ModuleError, ModuleOutcome,
};
use crate::http::response::Response;
use crate::http::url;
use crate::net::conn::Connection;

const TOKEN_OPEN: u32 = 1;

/// Serves files under a root directory.
#[derive(Debug)]
pub struct StaticFilesModule {
    root: PathBuf,
    strip_prefix: String,
}

impl StaticFilesModule {
    pub fn new(root: PathBuf, strip_prefix: String) -> Self {
        Self { root, strip_prefix }
    }

    /// Maps a request path onto the filesystem, refusing traversal out of
    /// the root.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = url::unescape(request_path);
        let relative = decoded
            .strip_prefix(self.strip_prefix.as_str())
            .unwrap_or(decoded.as_str())
            .trim_start_matches('/');
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }

    fn fail(&self, reason: &str) -> ModuleError {
        ModuleError::Failed {
            module: self.name().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl HttpModule for StaticFilesModule {
    fn name(&self) -> &'static str {
        "static-files"
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
        let Some(path) = self.resolve(data.request.path()) else {
            stage
                .respond_error(conn, data, 403, "Forbidden")
                .map_err(|_| self.fail("writer unavailable"))?;
            return Ok(ModuleOutcome::Stop);
        };
        let file_io = stage.file_io().ok_or_else(|| self.fail("no file helper"))?;
        debug!(path = %path.display(), "static file requested");
        file_io
            .open(
                Arc::clone(conn) as Arc<dyn Job>,
                path,
                ContinuationToken::new(TOKEN_OPEN, 0),
                stage.io_sink(),
            )
            .map_err(|_| self.fail("file helper unavailable"))?;
        Ok(ModuleOutcome::Stop)
    }

    fn on_helper_complete(
        &self,
        conn: &Arc<Connection>,
        data: &mut HandlerData,
        stage: &HandlerStage,
        token: ContinuationToken,
        result: HelperResult,
    ) -> Result<ModuleOutcome, ModuleError> {
        if token.kind != TOKEN_OPEN {
            return Err(self.fail("unexpected continuation token"));
        }
        let HelperResult::Io(result) = result else {
            return Err(self.fail("unexpected helper result"));
        };
        match result {
            Ok(IoOutcome::Opened { file, len }) => {
                let mut response = Response::with_version(200, data.request.version);
                response.set_header("Content-Length", len.to_string());
                let decoded = url::unescape(data.request.path());
                if let Some(mime) = MimeTypes::global().for_path(Path::new(&decoded)) {
                    response.set_header("Content-Type", mime.to_string());
                }
                conn.set_response(response);
                let part = data.next_file_part(file, 0, len, true);
                stage
                    .send_output(conn, part)
                    .map_err(|_| self.fail("handler unavailable"))?;
                Ok(ModuleOutcome::Stop)
            }
            Ok(_) => Err(self.fail("unexpected file outcome")),
            Err(e) => {
                debug!(error = %e, "static file open failed");
                stage
                    .respond_error(conn, data, 404, "Not Found")
                    .map_err(|_| self.fail("writer unavailable"))?;
                Ok(ModuleOutcome::Stop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_under_root() {
        let module = StaticFilesModule::new(PathBuf::from("/srv/www"), "/static/".into());
        assert_eq!(
            module.resolve("/static/css/site.css"),
            Some(PathBuf::from("/srv/www/css/site.css"))
        );
    }

    #[test]
    fn rejects_parent_traversal() {
        let module = StaticFilesModule::new(PathBuf::from("/srv/www"), "/static/".into());
        assert_eq!(module.resolve("/static/../etc/passwd"), None);
        assert_eq!(module.resolve("/static/%2e%2e/etc/passwd"), None);
    }
}
