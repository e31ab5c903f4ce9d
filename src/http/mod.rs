//! The HTTP pipeline: parser, module chain, and the three core stages

pub mod body;
pub mod handler;
pub mod mime;
pub mod module;
pub mod parser;
pub mod reader;
pub mod request;
pub mod response;
pub mod router;
pub mod url;
pub mod writer;

pub use body::{BodyPart, BodyPayload};
pub use handler::{CloseReason, HandlerEvent, HandlerStage};
pub use module::{HandlerData, HelperResult, HttpModule, ModuleError, ModuleOutcome};
pub use parser::{ParseError, ParseYield, RequestParser};
pub use reader::{ReaderEvent, ReaderStage};
pub use request::{BodyKind, Headers, Method, Request, Version};
pub use response::Response;
pub use router::{ContainsLocation, UrlMatcher, UrlRouter};
pub use writer::{Watermarks, WriterEvent, WriterStage};
