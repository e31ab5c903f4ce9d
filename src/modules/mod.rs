//! Terminal modules and chain assembly
//!
//! The modules here are the handler-chain leaves the binary can compose
//! from configuration: fixed content, static files through the file I/O
//! helper, streamed uploads, and a JSON status page.

pub mod content;
pub mod static_files;
pub mod status;
pub mod upload;

use std::sync::Arc;

use regex::Regex;

use crate::config::{ConfigError, ModuleSpec, RouteSpec};
use crate::http::module::HttpModule;
use crate::http::router::{ContainsLocation, UrlMatcher, UrlRouter};
use crate::net::server::ServerStats;

pub use content::ContentModule;
pub use static_files::StaticFilesModule;
pub use status::StatusModule;
pub use upload::UploadModule;

fn build_matcher(route: &RouteSpec) -> Result<UrlMatcher, ConfigError> {
    Ok(match route {
        RouteSpec::Exact { path } => UrlMatcher::Exact(path.clone()),
        RouteSpec::Prefix { pattern } => UrlMatcher::Contains {
            pattern: pattern.clone(),
            location: ContainsLocation::Prefix,
        },
        RouteSpec::Suffix { pattern } => UrlMatcher::Contains {
            pattern: pattern.clone(),
            location: ContainsLocation::Suffix,
        },
        RouteSpec::Middle { pattern } => UrlMatcher::Contains {
            pattern: pattern.clone(),
            location: ContainsLocation::Middle,
        },
        RouteSpec::Regex { pattern } => {
            let regex = Regex::new(pattern).map_err(|e| ConfigError::Validation {
                field: "modules.route.pattern".into(),
                reason: e.to_string(),
            })?;
            UrlMatcher::Regex(regex)
        }
    })
}

/// Builds the configured module chain: a URL router whose targets are the
/// configured modules. With no routes every request falls through to 404.
pub fn build_chain(
    specs: &[ModuleSpec],
    stats: Arc<ServerStats>,
) -> Result<Arc<dyn HttpModule>, ConfigError> {
    let router = UrlRouter::new(None);
    for spec in specs {
        let (route, module): (&RouteSpec, Arc<dyn HttpModule>) = match spec {
            ModuleSpec::Content {
                route,
                body,
                content_type,
            } => (
                route,
                Arc::new(ContentModule::new(body.clone(), content_type.clone())),
            ),
            ModuleSpec::StaticFiles { route, root } => {
                let prefix = match route {
                    RouteSpec::Prefix { pattern } => pattern.clone(),
                    _ => String::new(),
                };
                (route, Arc::new(StaticFilesModule::new(root.clone(), prefix)))
            }
            ModuleSpec::Upload { route } => (route, Arc::new(UploadModule::new())),
            ModuleSpec::Status { route } => {
                (route, Arc::new(StatusModule::new(Arc::clone(&stats))))
            }
        };
        router.add_route(build_matcher(route)?, module);
    }
    Ok(Arc::new(router))
}
