//! HTTP response head and status codes

use bytes::{BufMut, Bytes, BytesMut};

use crate::http::request::{Headers, Version};

/// Reason phrase for the status codes this server emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// A response head. The body streams separately as indexed body parts.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub headers: Headers,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            version: Version::Http11,
            status,
            headers: Headers::new(),
        }
    }

    pub fn with_version(status: u16, version: Version) -> Self {
        Self {
            version,
            status,
            headers: Headers::new(),
        }
    }

    /// Sets a header, replacing any existing value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.set(name, value);
        self
    }

    /// Declared content length, when the response carries one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Serializes the status line and headers, terminated by the blank
    /// line. Only headers actually present are written.
    pub fn serialize_head(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(128);
        out.put_slice(self.version.as_str().as_bytes());
        out.put_slice(b" ");
        out.put_slice(self.status.to_string().as_bytes());
        out.put_slice(b" ");
        out.put_slice(reason_phrase(self.status).as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.freeze()
    }
}
