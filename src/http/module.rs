//! The per-request module chain
//!
//! A module is a node in the processing graph for one request. The input
//! direction carries the request head and its streamed body parts toward a
//! terminal handler; the output direction carries response body parts
//! through any filters and on to the writer. Modules cooperate through the
//! handler stage: they never call each other directly, they post events.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::eds::helpers::database::{DbError, DbOutcome};
use crate::eds::helpers::file_io::{ContinuationToken, IoOutcome};
use crate::http::body::BodyPart;
use crate::http::handler::HandlerStage;
use crate::http::request::Request;
use crate::net::conn::Connection;

/// Module failures.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module chain cycle at {module}")]
    ChainCycle { module: String },

    #[error("module {module} failed: {reason}")]
    Failed { module: String, reason: String },
}

/// What a module tells the chain driver after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOutcome {
    /// Not handled here; the chain advances to the next module.
    Continue,
    /// Handled; the module owns what happens next (it may have posted
    /// events of its own or be waiting on a helper completion).
    Stop,
    /// Handled; finish the current response as it stands.
    StopAndEmit,
}

/// A helper-stage completion delivered back into the module chain.
pub enum HelperResult {
    Io(std::io::Result<IoOutcome>),
    Db(Result<DbOutcome, DbError>),
}

impl std::fmt::Debug for HelperResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HelperResult::Io(result) => f.debug_tuple("Io").field(result).finish(),
            HelperResult::Db(result) => f.debug_tuple("Db").field(result).finish(),
        }
    }
}

/// Per-connection, per-root-module scratch state for one request.
pub struct HandlerData {
    pub request: Request,
    /// Module currently consuming streamed input body parts.
    pub input_module: Option<Arc<dyn HttpModule>>,
    /// Module that receives the next helper completion.
    pub resume_module: Option<Arc<dyn HttpModule>>,
    next_output_index: u64,
    emitted_last: bool,
    module_state: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl HandlerData {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            input_module: None,
            resume_module: None,
            next_output_index: 0,
            emitted_last: false,
            module_state: HashMap::new(),
        }
    }

    /// Builds the next output body part, assigning the next dense index.
    pub fn next_part(&mut self, data: impl Into<Bytes>, is_last: bool) -> BodyPart {
        let index = self.next_output_index;
        self.next_output_index += 1;
        self.emitted_last |= is_last;
        BodyPart::inline(index, data, is_last)
    }

    /// Builds the next output part backed by a file range.
    pub fn next_file_part(
        &mut self,
        file: Arc<std::fs::File>,
        offset: u64,
        len: u64,
        is_last: bool,
    ) -> BodyPart {
        let index = self.next_output_index;
        self.next_output_index += 1;
        self.emitted_last |= is_last;
        BodyPart::file(index, file, offset, len, is_last)
    }

    /// True once a part with `is_last` has been produced.
    pub fn emitted_last(&self) -> bool {
        self.emitted_last
    }

    /// Marks the response complete without producing a part here, used
    /// when an error response is emitted directly to the writer.
    pub fn mark_emitted(&mut self) {
        self.emitted_last = true;
        self.next_output_index += 1;
    }

    /// Index the next emitted part will carry.
    pub fn next_output_index(&self) -> u64 {
        self.next_output_index
    }

    /// Mutable access to a module's private scratch state, created with
    /// `init` on first use. Keyed by module name.
    pub fn module_state_mut<T: Send + 'static>(
        &mut self,
        key: &'static str,
        init: impl FnOnce() -> T,
    ) -> &mut T {
        self.module_state
            .entry(key)
            .or_insert_with(|| Box::new(init()))
            .downcast_mut::<T>()
            .expect("module state type is fixed per module")
    }
}

impl std::fmt::Debug for HandlerData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerData")
            .field("target", &self.request.target)
            .field("next_output_index", &self.next_output_index)
            .field("emitted_last", &self.emitted_last)
            .finish_non_exhaustive()
    }
}

/// A node in the per-request processing graph.
///
/// `process_input` receives the request head as `part = None` and each
/// streamed body part as `part = Some(..)`. A module that wants the part
/// takes it out of the option; whatever remains is forwarded when the
/// module returns [`ModuleOutcome::Continue`].
pub trait HttpModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// The module after this one in the chain, if any.
    fn next_module(&self) -> Option<&Arc<dyn HttpModule>> {
        None
    }

    /// Modules reachable from this one outside the `next` chain, used for
    /// cycle checking at registration. Routers return their targets.
    fn child_modules(&self) -> Vec<Arc<dyn HttpModule>> {
        Vec::new()
    }

    fn process_input(
        &self,
        conn: &Arc<Connection>,
        data: &mut HandlerData,
        stage: &HandlerStage,
        part: &mut Option<BodyPart>,
    ) -> Result<ModuleOutcome, ModuleError>;

    /// Output-side filter hook. The default passes parts through.
    fn process_output(
        &self,
        _conn: &Arc<Connection>,
        _data: &mut HandlerData,
        _stage: &HandlerStage,
        _part: &mut Option<BodyPart>,
    ) -> Result<ModuleOutcome, ModuleError> {
        Ok(ModuleOutcome::Continue)
    }

    /// Called when a helper completion carrying this module's continuation
    /// token arrives.
    fn on_helper_complete(
        &self,
        _conn: &Arc<Connection>,
        _data: &mut HandlerData,
        _stage: &HandlerStage,
        _token: ContinuationToken,
        _result: HelperResult,
    ) -> Result<ModuleOutcome, ModuleError> {
        Ok(ModuleOutcome::Stop)
    }
}

/// Rejects module graphs with a cycle in their `next` pointers.
///
/// Runs at registration time; a cyclic chain would otherwise bounce a
/// request between modules forever.
pub fn validate_chain(root: &Arc<dyn HttpModule>) -> Result<(), ModuleError> {
    fn visit(
        module: &Arc<dyn HttpModule>,
        visiting: &mut Vec<*const ()>,
        done: &mut Vec<*const ()>,
    ) -> Result<(), ModuleError> {
        let ptr = Arc::as_ptr(module).cast::<()>();
        if done.contains(&ptr) {
            return Ok(());
        }
        if visiting.contains(&ptr) {
            return Err(ModuleError::ChainCycle {
                module: module.name().to_string(),
            });
        }
        visiting.push(ptr);
        if let Some(next) = module.next_module() {
            visit(next, visiting, done)?;
        }
        for child in module.child_modules() {
            visit(&child, visiting, done)?;
        }
        visiting.pop();
        done.push(ptr);
        Ok(())
    }

    let mut visiting = Vec::new();
    let mut done = Vec::new();
    visit(root, &mut visiting, &mut done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Link {
        label: &'static str,
        children: Mutex<Vec<Arc<dyn HttpModule>>>,
    }

    impl Link {
        fn new(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                children: Mutex::new(Vec::new()),
            })
        }

        fn chain_to(&self, next: Arc<dyn HttpModule>) {
            self.children.lock().unwrap().push(next);
        }
    }

    impl HttpModule for Link {
        fn name(&self) -> &'static str {
            self.label
        }

        fn child_modules(&self) -> Vec<Arc<dyn HttpModule>> {
            self.children.lock().unwrap().clone()
        }

        fn process_input(
            &self,
            _conn: &Arc<Connection>,
            _data: &mut HandlerData,
            _stage: &HandlerStage,
            _part: &mut Option<BodyPart>,
        ) -> Result<ModuleOutcome, ModuleError> {
            Ok(ModuleOutcome::Continue)
        }
    }

    #[test]
    fn accepts_acyclic_chain() {
        let a = Link::new("a");
        let b = Link::new("b");
        let c = Link::new("c");
        a.chain_to(b.clone());
        b.chain_to(c);
        assert!(validate_chain(&(a as Arc<dyn HttpModule>)).is_ok());
    }

    #[test]
    fn accepts_shared_tail() {
        let tail = Link::new("tail");
        let a = Link::new("a");
        let b = Link::new("b");
        a.chain_to(b.clone());
        a.chain_to(tail.clone());
        b.chain_to(tail);
        assert!(validate_chain(&(a as Arc<dyn HttpModule>)).is_ok());
    }

    #[test]
    fn rejects_cycle() {
        let a = Link::new("a");
        let b = Link::new("b");
        a.chain_to(b.clone());
        b.chain_to(a.clone());
        let result = validate_chain(&(a as Arc<dyn HttpModule>));
        assert!(matches!(result, Err(ModuleError::ChainCycle { .. })));
    }

    #[test]
    fn state_slots_are_per_module_key() {
        use crate::http::request::{BodyKind, Headers, Method, Request, Version};
        let request = Request {
            method: Method::Get,
            target: "/".into(),
            version: Version::Http11,
            headers: Headers::new(),
            body: BodyKind::None,
        };
        let mut data = HandlerData::new(request);
        *data.module_state_mut("counter", || 0u32) += 5;
        assert_eq!(*data.module_state_mut("counter", || 0u32), 5);
        assert_eq!(*data.module_state_mut("other", || 1u32), 1);
    }

    #[test]
    fn part_indices_are_dense() {
        use crate::http::request::{BodyKind, Headers, Method, Request, Version};
        let request = Request {
            method: Method::Get,
            target: "/".into(),
            version: Version::Http11,
            headers: Headers::new(),
            body: BodyKind::None,
        };
        let mut data = HandlerData::new(request);
        let first = data.next_part(&b"a"[..], false);
        let second = data.next_part(&b"b"[..], true);
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert!(data.emitted_last());
    }
}
