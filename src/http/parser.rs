//! Incremental HTTP/1.x request parser
//!
//! A resumable push parser: bytes arrive in whatever segmentation the
//! network produced and the parser yields the same sequence of heads and
//! body chunks regardless. Parsing stops at each request boundary so a
//! pipelined follow-up request stays buffered until the connection is
//! ready to read again.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::http::request::{BodyKind, Headers, Method, Request, Version};

/// Parse failures. All of them are client protocol errors that produce a
/// 400 response and a close.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,

    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),

    #[error("malformed header line")]
    BadHeader,

    #[error("invalid content-length")]
    BadContentLength,

    #[error("malformed chunked encoding")]
    BadChunk,

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
}

/// One parsed item.
#[derive(Debug)]
pub enum ParseYield {
    /// A complete request head.
    Head(Request),
    /// A run of body bytes. `is_last` marks the end of the body; for
    /// chunked framing the terminator arrives as an empty last chunk.
    BodyChunk { data: Bytes, is_last: bool },
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataCrLf,
    Trailer,
}

#[derive(Debug)]
enum State {
    Head,
    BodyLength { remaining: u64 },
    BodyChunked(ChunkState),
}

/// Resumable request parser. One lives per connection.
#[derive(Debug)]
pub struct RequestParser {
    state: State,
    max_head_bytes: usize,
}

impl RequestParser {
    pub fn new(max_head_bytes: usize) -> Self {
        Self {
            state: State::Head,
            max_head_bytes,
        }
    }

    /// True when the parser sits between requests.
    pub fn at_request_boundary(&self) -> bool {
        matches!(self.state, State::Head)
    }

    /// Consumes whatever it can from `buf` and returns the items produced.
    ///
    /// Returns after completing at most one request; bytes belonging to a
    /// pipelined successor remain in `buf`.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<Vec<ParseYield>, ParseError> {
        let mut yields = Vec::new();
        loop {
            match &mut self.state {
                State::Head => {
                    let Some(head_end) = find_head_end(buf) else {
                        if buf.len() > self.max_head_bytes {
                            return Err(ParseError::HeadTooLarge {
                                limit: self.max_head_bytes,
                            });
                        }
                        return Ok(yields);
                    };
                    if head_end > self.max_head_bytes {
                        return Err(ParseError::HeadTooLarge {
                            limit: self.max_head_bytes,
                        });
                    }
                    let head = buf.split_to(head_end);
                    let request = parse_head(&head)?;
                    self.state = match request.body {
                        BodyKind::None | BodyKind::Length(0) => State::Head,
                        BodyKind::Length(n) => State::BodyLength { remaining: n },
                        BodyKind::Chunked => State::BodyChunked(ChunkState::Size),
                    };
                    let at_boundary = self.at_request_boundary();
                    yields.push(ParseYield::Head(request));
                    if at_boundary {
                        // Bodyless request complete; leave pipelined bytes
                        // for the next read cycle.
                        return Ok(yields);
                    }
                }
                State::BodyLength { remaining } => {
                    if buf.is_empty() {
                        return Ok(yields);
                    }
                    let take = (*remaining).min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    *remaining -= take as u64;
                    let is_last = *remaining == 0;
                    yields.push(ParseYield::BodyChunk { data, is_last });
                    if is_last {
                        self.state = State::Head;
                        return Ok(yields);
                    }
                }
                State::BodyChunked(chunk) => match chunk {
                    ChunkState::Size => {
                        let Some(line_end) = find_crlf(buf) else {
                            if buf.len() > self.max_head_bytes {
                                return Err(ParseError::BadChunk);
                            }
                            return Ok(yields);
                        };
                        let line = buf.split_to(line_end + 2);
                        let text = std::str::from_utf8(&line[..line_end])
                            .map_err(|_| ParseError::BadChunk)?;
                        let size_text = text.split(';').next().unwrap_or("").trim();
                        let size =
                            u64::from_str_radix(size_text, 16).map_err(|_| ParseError::BadChunk)?;
                        if size == 0 {
                            *chunk = ChunkState::Trailer;
                        } else {
                            *chunk = ChunkState::Data { remaining: size };
                        }
                    }
                    ChunkState::Data { remaining } => {
                        if buf.is_empty() {
                            return Ok(yields);
                        }
                        let take = (*remaining).min(buf.len() as u64) as usize;
                        let data = buf.split_to(take).freeze();
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            *chunk = ChunkState::DataCrLf;
                        }
                        yields.push(ParseYield::BodyChunk {
                            data,
                            is_last: false,
                        });
                    }
                    ChunkState::DataCrLf => {
                        if buf.len() < 2 {
                            return Ok(yields);
                        }
                        if &buf[..2] != b"\r\n" {
                            return Err(ParseError::BadChunk);
                        }
                        buf.advance(2);
                        *chunk = ChunkState::Size;
                    }
                    ChunkState::Trailer => {
                        // Trailer fields are read and discarded; the empty
                        // line ends the body.
                        let Some(line_end) = find_crlf(buf) else {
                            return Ok(yields);
                        };
                        let _ = buf.split_to(line_end + 2);
                        if line_end == 0 {
                            self.state = State::Head;
                            yields.push(ParseYield::BodyChunk {
                                data: Bytes::new(),
                                is_last: true,
                            });
                            return Ok(yields);
                        }
                    }
                },
            }
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_head(head: &[u8]) -> Result<Request, ParseError> {
    let text = std::str::from_utf8(&head[..head.len() - 4])
        .map_err(|_| ParseError::BadRequestLine)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::BadRequestLine)?;
    let mut parts = request_line.split(' ');
    let method = parts.next().filter(|m| !m.is_empty()).ok_or(ParseError::BadRequestLine)?;
    let target = parts.next().filter(|t| !t.is_empty()).ok_or(ParseError::BadRequestLine)?;
    let version = parts.next().ok_or(ParseError::BadRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::BadRequestLine);
    }
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        other => return Err(ParseError::UnsupportedVersion(other.to_string())),
    };

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Continuation lines are not supported.
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ParseError::BadHeader);
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::BadHeader)?;
        if name.is_empty() {
            return Err(ParseError::BadHeader);
        }
        headers.append(name.trim(), value.trim());
    }

    let body = body_framing(&headers)?;
    Ok(Request {
        method: Method::from_token(method),
        target: target.to_string(),
        version,
        headers,
        body,
    })
}

fn body_framing(headers: &Headers) -> Result<BodyKind, ParseError> {
    if let Some(encoding) = headers.get("transfer-encoding") {
        if encoding
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
        {
            return Ok(BodyKind::Chunked);
        }
    }
    match headers.get("content-length") {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(BodyKind::Length)
            .map_err(|_| ParseError::BadContentLength),
        None => Ok(BodyKind::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut RequestParser, input: &[u8]) -> Vec<ParseYield> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        loop {
            let yields = parser.feed(&mut buf).unwrap();
            if yields.is_empty() {
                break;
            }
            out.extend(yields);
            if buf.is_empty() {
                break;
            }
        }
        out
    }

    #[test]
    fn parses_simple_get() {
        let mut parser = RequestParser::new(8192);
        let yields = feed_all(&mut parser, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(yields.len(), 1);
        match &yields[0] {
            ParseYield::Head(req) => {
                assert_eq!(req.method, Method::Get);
                assert_eq!(req.path(), "/hello");
                assert_eq!(req.version, Version::Http11);
                assert_eq!(req.headers.get("host"), Some("x"));
                assert!(!req.has_body());
            }
            other => panic!("unexpected yield: {other:?}"),
        }
        assert!(parser.at_request_boundary());
    }

    #[test]
    fn parses_content_length_body() {
        let mut parser = RequestParser::new(8192);
        let yields = feed_all(
            &mut parser,
            b"POST /upload HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert_eq!(yields.len(), 2);
        match &yields[1] {
            ParseYield::BodyChunk { data, is_last } => {
                assert_eq!(&data[..], b"hello");
                assert!(is_last);
            }
            other => panic!("unexpected yield: {other:?}"),
        }
    }

    #[test]
    fn parses_chunked_body_with_terminal_marker() {
        let mut parser = RequestParser::new(8192);
        let yields = feed_all(
            &mut parser,
            b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        );
        assert_eq!(yields.len(), 3);
        match &yields[1] {
            ParseYield::BodyChunk { data, is_last } => {
                assert_eq!(&data[..], b"abc");
                assert!(!is_last);
            }
            other => panic!("unexpected yield: {other:?}"),
        }
        match &yields[2] {
            ParseYield::BodyChunk { data, is_last } => {
                assert!(data.is_empty());
                assert!(is_last);
            }
            other => panic!("unexpected yield: {other:?}"),
        }
    }

    #[test]
    fn one_byte_segments_parse_identically() {
        let input = b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nxyz";
        let mut whole = RequestParser::new(8192);
        let whole_yields = feed_all(&mut whole, input);

        let mut trickle = RequestParser::new(8192);
        let mut buf = BytesMut::new();
        let mut trickle_yields = Vec::new();
        for &byte in input.iter() {
            buf.extend_from_slice(&[byte]);
            trickle_yields.extend(trickle.feed(&mut buf).unwrap());
        }

        let head_count = |ys: &[ParseYield]| {
            ys.iter().filter(|y| matches!(y, ParseYield::Head(_))).count()
        };
        let body: Vec<u8> = trickle_yields
            .iter()
            .filter_map(|y| match y {
                ParseYield::BodyChunk { data, .. } => Some(data.to_vec()),
                ParseYield::Head(_) => None,
            })
            .flatten()
            .collect();
        assert_eq!(head_count(&whole_yields), head_count(&trickle_yields));
        assert_eq!(body, b"xyz");
        assert!(matches!(
            trickle_yields.last(),
            Some(ParseYield::BodyChunk { is_last: true, .. })
        ));
    }

    #[test]
    fn stops_at_request_boundary_for_pipelining() {
        let mut parser = RequestParser::new(8192);
        let mut buf = BytesMut::from(
            &b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n"[..],
        );
        let first = parser.feed(&mut buf).unwrap();
        assert_eq!(first.len(), 1);
        // The second request's bytes are still buffered.
        assert!(buf.len() > 0);
        let second = parser.feed(&mut buf).unwrap();
        assert_eq!(second.len(), 1);
        match &second[0] {
            ParseYield::Head(req) => assert_eq!(req.path(), "/b"),
            other => panic!("unexpected yield: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_request_line() {
        let mut parser = RequestParser::new(8192);
        let mut buf = BytesMut::from(&b"NOT A REQUEST AT ALL\r\n\r\n"[..]);
        assert!(parser.feed(&mut buf).is_err());
    }

    #[test]
    fn rejects_oversized_head() {
        let mut parser = RequestParser::new(256);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n");
        for _ in 0..64 {
            buf.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        assert_eq!(
            parser.feed(&mut buf).unwrap_err(),
            ParseError::HeadTooLarge { limit: 256 }
        );
    }

    #[test]
    fn rejects_bad_content_length() {
        let mut parser = RequestParser::new(8192);
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n"[..]);
        assert_eq!(
            parser.feed(&mut buf).unwrap_err(),
            ParseError::BadContentLength
        );
    }

    #[test]
    fn rejects_unknown_version() {
        let mut parser = RequestParser::new(8192);
        let mut buf = BytesMut::from(&b"GET / HTTP/2.0\r\n\r\n"[..]);
        assert!(matches!(
            parser.feed(&mut buf).unwrap_err(),
            ParseError::UnsupportedVersion(_)
        ));
    }
}
