//! URL routing module
//!
//! Routes a request into the first module whose matcher accepts the path.
//! Matchers are tried in registration order; when none matches the router
//! defers to its `next` module, and with no `next` the handler stage
//! answers 404.

use std::sync::{Arc, Mutex};

use regex::Regex;
use tracing::debug;

use crate::http::body::BodyPart;
use crate::http::handler::HandlerStage;
use crate::http::module::{HandlerData, HttpModule, ModuleError, ModuleOutcome};
use crate::net::conn::Connection;

/// Where in the path a contains-pattern must sit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainsLocation {
    Prefix,
    Middle,
    Suffix,
}

/// A path matcher.
#[derive(Debug, Clone)]
pub enum UrlMatcher {
    /// The whole path equals the pattern.
    Exact(String),
    /// The path contains the pattern at the given location. `Middle`
    /// requires at least one character on each side of the match.
    Contains {
        pattern: String,
        location: ContainsLocation,
    },
    /// The path matches a regular expression.
    Regex(Regex),
}

impl UrlMatcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            UrlMatcher::Exact(pattern) => path == pattern,
            UrlMatcher::Contains { pattern, location } => match location {
                ContainsLocation::Prefix => path.starts_with(pattern.as_str()),
                ContainsLocation::Suffix => path.ends_with(pattern.as_str()),
                ContainsLocation::Middle => path
                    .match_indices(pattern.as_str())
                    .any(|(at, matched)| at > 0 && at + matched.len() < path.len()),
            },
            UrlMatcher::Regex(regex) => regex.is_match(path),
        }
    }
}

/// Module whose state is an ordered list of `(matcher, module)` pairs.
/// First match wins; ties break by registration order.
pub struct UrlRouter {
    routes: Mutex<Vec<(UrlMatcher, Arc<dyn HttpModule>)>>,
    next: Option<Arc<dyn HttpModule>>,
}

impl UrlRouter {
    pub fn new(default_module: Option<Arc<dyn HttpModule>>) -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            next: default_module,
        }
    }

    /// Appends a route. Registration order is match order.
    pub fn add_route(&self, matcher: UrlMatcher, module: Arc<dyn HttpModule>) {
        self.routes
            .lock()
            .expect("route list mutex poisoned")
            .push((matcher, module));
    }

    fn resolve(&self, path: &str) -> Option<Arc<dyn HttpModule>> {
        let routes = self.routes.lock().expect("route list mutex poisoned");
        routes
            .iter()
            .find(|(matcher, _)| matcher.matches(path))
            .map(|(_, module)| Arc::clone(module))
    }
}

impl std::fmt::Debug for UrlRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = self.routes.lock().expect("route list mutex poisoned");
        f.debug_struct("UrlRouter")
            .field("routes", &routes.len())
            .field("has_default", &self.next.is_some())
            .finish()
    }
}

impl HttpModule for UrlRouter {
    fn name(&self) -> &'static str {
        "url-router"
    }

    fn next_module(&self) -> Option<&Arc<dyn HttpModule>> {
        self.next.as_ref()
    }

    fn child_modules(&self) -> Vec<Arc<dyn HttpModule>> {
        self.routes
            .lock()
            .expect("route list mutex poisoned")
            .iter()
            .map(|(_, module)| Arc::clone(module))
            .collect()
    }

    fn process_input(
        &self,
        conn: &Arc<Connection>,
        data: &mut HandlerData,
        stage: &HandlerStage,
        part: &mut Option<BodyPart>,
    ) -> Result<ModuleOutcome, ModuleError> {
        let path = data.request.path().to_string();
        match self.resolve(&path) {
            Some(module) => {
                debug!(path = %path, module = module.name(), "routed");
                stage
                    .input_to_module(Arc::clone(conn), module, part.take())
                    .map_err(|_| ModuleError::Failed {
                        module: self.name().to_string(),
                        reason: "handler stage unavailable".to_string(),
                    })?;
                Ok(ModuleOutcome::Stop)
            }
            None => Ok(ModuleOutcome::Continue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_matches_whole_path() {
        let matcher = UrlMatcher::Exact("/hello".into());
        assert!(matcher.matches("/hello"));
        assert!(!matcher.matches("/hello/"));
        assert!(!matcher.matches("/hell"));
    }

    #[test]
    fn prefix_and_suffix_contains() {
        let prefix = UrlMatcher::Contains {
            pattern: "/static/".into(),
            location: ContainsLocation::Prefix,
        };
        assert!(prefix.matches("/static/app.js"));
        assert!(!prefix.matches("/api/static/"));

        let suffix = UrlMatcher::Contains {
            pattern: ".html".into(),
            location: ContainsLocation::Suffix,
        };
        assert!(suffix.matches("/index.html"));
        assert!(!suffix.matches("/index.html.bak"));
    }

    #[test]
    fn middle_needs_a_character_on_each_side() {
        let middle = UrlMatcher::Contains {
            pattern: "static".into(),
            location: ContainsLocation::Middle,
        };
        assert!(middle.matches("/static/"));
        assert!(middle.matches("xstaticx"));
        assert!(!middle.matches("static/"));
        assert!(!middle.matches("/static"));
        assert!(!middle.matches("static"));
    }

    #[test]
    fn regex_matcher() {
        let matcher = UrlMatcher::Regex(Regex::new(r"^/items/\d+$").unwrap());
        assert!(matcher.matches("/items/42"));
        assert!(!matcher.matches("/items/abc"));
    }
}
