//! Connections: the primary job type
//!
//! A connection is shared between the reader, handler, and writer stages
//! through `Arc` handles carried inside events. Reader-side and
//! writer-side state live behind their own mutexes; each is only ever
//! touched by its owning stage's workers.

use std::collections::{BinaryHeap, VecDeque};
use std::fs::File;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::trace;

use crate::access_log::AccessRecord;
use crate::eds::job::{Job, JobCore};
use crate::http::body::BodyPart;
use crate::http::handler::HandlerEvent;
use crate::http::parser::RequestParser;
use crate::http::response::Response;

/// Connection lifecycle states. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Reading,
    Processing,
    Writing,
    Closing,
    Closed,
}

/// State owned by the reader stage.
#[derive(Debug)]
pub struct ReaderState {
    pub buf: BytesMut,
    pub parser: RequestParser,
    pub next_input_index: u64,
}

/// A body part ordered for the writer's reorder heap: smallest index pops
/// first.
#[derive(Debug)]
pub struct OrderedPart(pub BodyPart);

impl PartialEq for OrderedPart {
    fn eq(&self, other: &Self) -> bool {
        self.0.index == other.0.index
    }
}

impl Eq for OrderedPart {}

impl PartialOrd for OrderedPart {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedPart {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.index.cmp(&self.0.index)
    }
}

/// One pending unit of socket output.
pub enum WriteOp {
    Buf { data: Bytes, pos: usize },
    File {
        file: Arc<File>,
        offset: u64,
        remaining: u64,
    },
}

impl std::fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteOp::Buf { data, pos } => f
                .debug_struct("Buf")
                .field("len", &data.len())
                .field("pos", pos)
                .finish(),
            WriteOp::File { offset, remaining, .. } => f
                .debug_struct("File")
                .field("offset", offset)
                .field("remaining", remaining)
                .finish(),
        }
    }
}

/// State owned by the writer stage.
#[derive(Debug)]
pub struct WriterState {
    /// Next body-part index that may be written to the socket.
    pub next_expected: u64,
    /// Out-of-order parts waiting for their predecessors.
    pub heap: BinaryHeap<OrderedPart>,
    pub heap_bytes: usize,
    pub head_written: bool,
    pub chunked: bool,
    /// Serialized output not yet accepted by the socket.
    pub ops: VecDeque<WriteOp>,
    /// The part carrying `is_last` has been staged; the response is
    /// complete once `ops` drains.
    pub finishing: bool,
    /// A close marker was staged.
    pub close_after: bool,
    pub blocked: bool,
    pub status: u16,
    pub bytes_sent: u64,
    /// Body payload bytes of the current response, for the access log.
    pub body_bytes: u64,
}

impl WriterState {
    fn new() -> Self {
        Self {
            next_expected: 0,
            heap: BinaryHeap::new(),
            heap_bytes: 0,
            head_written: false,
            chunked: false,
            ops: VecDeque::new(),
            finishing: false,
            close_after: false,
            blocked: false,
            status: 0,
            bytes_sent: 0,
            body_bytes: 0,
        }
    }

    /// Resets per-response fields for the next request on a kept-alive
    /// connection.
    pub fn reset_for_next_response(&mut self) {
        self.next_expected = 0;
        self.heap_bytes = 0;
        self.head_written = false;
        self.chunked = false;
        self.finishing = false;
        self.blocked = false;
        self.status = 0;
        self.bytes_sent = 0;
        self.body_bytes = 0;
        self.heap.clear();
        self.ops.clear();
    }
}

/// A live client connection.
pub struct Connection {
    core: JobCore,
    stream: Mutex<TcpStream>,
    fd: RawFd,
    peer: SocketAddr,
    token: AtomicUsize,
    state: Mutex<ConnState>,
    pub reader: Mutex<ReaderState>,
    pub writer: Mutex<WriterState>,
    response: Mutex<Option<Response>>,
    access: Mutex<Option<AccessRecord>>,
    keep_alive: AtomicBool,
    output_paused: AtomicBool,
    pub pending_output: Mutex<VecDeque<BodyPart>>,
    // Per-connection FIFO for handler-stage events. Capturing order at
    // post time and draining from one worker at a time keeps request
    // heads and their body parts serial even with several handler
    // workers.
    handler_inbox: Mutex<VecDeque<HandlerEvent>>,
    handler_draining: AtomicBool,
    last_activity: Mutex<Instant>,
    deadline: Mutex<Option<Instant>>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, max_head_bytes: usize) -> Arc<Self> {
        let fd = stream.as_raw_fd();
        Arc::new(Self {
            core: JobCore::new(),
            stream: Mutex::new(stream),
            fd,
            peer,
            token: AtomicUsize::new(usize::MAX),
            state: Mutex::new(ConnState::Reading),
            reader: Mutex::new(ReaderState {
                buf: BytesMut::with_capacity(8 * 1024),
                parser: RequestParser::new(max_head_bytes),
                next_input_index: 0,
            }),
            writer: Mutex::new(WriterState::new()),
            response: Mutex::new(None),
            access: Mutex::new(None),
            keep_alive: AtomicBool::new(true),
            output_paused: AtomicBool::new(false),
            pending_output: Mutex::new(VecDeque::new()),
            handler_inbox: Mutex::new(VecDeque::new()),
            handler_draining: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            deadline: Mutex::new(None),
        })
    }

    /// Appends a handler event to this connection's ordered inbox.
    pub fn enqueue_handler_event(&self, event: HandlerEvent) {
        self.handler_inbox
            .lock()
            .expect("handler inbox mutex poisoned")
            .push_back(event);
    }

    /// Claims the right to drain the inbox. At most one worker holds it.
    pub fn try_begin_handler_drain(&self) -> bool {
        !self.handler_draining.swap(true, Ordering::AcqRel)
    }

    pub fn end_handler_drain(&self) {
        self.handler_draining.store(false, Ordering::Release);
    }

    pub fn pop_handler_event(&self) -> Option<HandlerEvent> {
        self.handler_inbox
            .lock()
            .expect("handler inbox mutex poisoned")
            .pop_front()
    }

    pub fn handler_inbox_is_empty(&self) -> bool {
        self.handler_inbox
            .lock()
            .expect("handler inbox mutex poisoned")
            .is_empty()
    }

    /// Rolls back the most recent append after its drain marker could not
    /// be posted. Only called on a closed stage, so producers racing here
    /// all fail and all roll back.
    pub fn discard_last_handler_event(&self) {
        self.handler_inbox
            .lock()
            .expect("handler inbox mutex poisoned")
            .pop_back();
    }

    /// Drops any undelivered handler events. Inbox entries hold an `Arc`
    /// back to this connection, so a closing connection must not leave
    /// them behind.
    pub fn clear_handler_inbox(&self) {
        self.handler_inbox
            .lock()
            .expect("handler inbox mutex poisoned")
            .clear();
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        Token(self.token.load(Ordering::Acquire))
    }

    pub fn set_token(&self, token: Token) {
        self.token.store(token.0, Ordering::Release);
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("state mutex poisoned")
    }

    /// Transitions the state machine. `Closed` is terminal; transitions
    /// out of it are ignored.
    pub fn set_state(&self, next: ConnState) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if *state == ConnState::Closed {
            return;
        }
        trace!(conn = %self.core.id(), from = ?*state, to = ?next, "connection state");
        *state = next;
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Acquire)
    }

    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.keep_alive.store(keep_alive, Ordering::Release);
    }

    pub fn output_paused(&self) -> bool {
        self.output_paused.load(Ordering::Acquire)
    }

    pub fn set_output_paused(&self, paused: bool) {
        self.output_paused.store(paused, Ordering::Release);
    }

    pub fn set_response(&self, response: Response) {
        *self.response.lock().expect("response mutex poisoned") = Some(response);
    }

    pub fn take_response(&self) -> Option<Response> {
        self.response.lock().expect("response mutex poisoned").take()
    }

    pub fn set_access_record(&self, record: AccessRecord) {
        *self.access.lock().expect("access mutex poisoned") = Some(record);
    }

    pub fn take_access_record(&self) -> Option<AccessRecord> {
        self.access.lock().expect("access mutex poisoned").take()
    }

    /// Records read activity for the idle timer.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .expect("activity mutex poisoned") = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(
            *self
                .last_activity
                .lock()
                .expect("activity mutex poisoned"),
        )
    }

    /// Sets or clears the per-request soft deadline.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock().expect("deadline mutex poisoned") = deadline;
    }

    /// Takes the deadline when it has expired, so it fires once.
    pub fn take_expired_deadline(&self, now: Instant) -> bool {
        let mut deadline = self.deadline.lock().expect("deadline mutex poisoned");
        match *deadline {
            Some(at) if at <= now => {
                *deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Non-blocking read into `chunk`.
    pub fn read_some(&self, chunk: &mut [u8]) -> std::io::Result<usize> {
        use std::io::Read;
        self.stream
            .lock()
            .expect("stream mutex poisoned")
            .read(chunk)
    }

    pub fn register(&self, registry: &Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        registry.register(
            &mut *self.stream.lock().expect("stream mutex poisoned"),
            token,
            interests,
        )
    }

    pub fn reregister(&self, registry: &Registry, interests: Interest) -> std::io::Result<()> {
        registry.reregister(
            &mut *self.stream.lock().expect("stream mutex poisoned"),
            self.token(),
            interests,
        )
    }

    pub fn deregister(&self, registry: &Registry) -> std::io::Result<()> {
        registry.deregister(&mut *self.stream.lock().expect("stream mutex poisoned"))
    }

    /// Tears the socket down. Errors are ignored; the peer may already be
    /// gone.
    pub fn shutdown_socket(&self) {
        let stream = self.stream.lock().expect("stream mutex poisoned");
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Job for Connection {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.core.id())
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builds connections for accepted sockets. Servers embedding this crate
/// may substitute their own factory.
pub trait ConnectionFactory: Send + Sync {
    fn new_connection(&self, stream: TcpStream, peer: SocketAddr) -> Arc<Connection>;
}

/// Factory producing plain connections with the configured head limit.
#[derive(Debug)]
pub struct DefaultConnectionFactory {
    max_head_bytes: usize,
}

impl DefaultConnectionFactory {
    pub fn new(max_head_bytes: usize) -> Self {
        Self { max_head_bytes }
    }
}

impl ConnectionFactory for DefaultConnectionFactory {
    fn new_connection(&self, stream: TcpStream, peer: SocketAddr) -> Arc<Connection> {
        Connection::new(stream, peer, self.max_head_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_parts_pop_smallest_index_first() {
        let mut heap = BinaryHeap::new();
        heap.push(OrderedPart(BodyPart::inline(3, &b"d"[..], true)));
        heap.push(OrderedPart(BodyPart::inline(1, &b"b"[..], false)));
        heap.push(OrderedPart(BodyPart::inline(2, &b"c"[..], false)));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|p| p.0.index)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn closed_is_terminal() {
        let (listener, addr) = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let a = l.local_addr().unwrap();
            (l, a)
        };
        let std_stream = std::net::TcpStream::connect(addr).unwrap();
        std_stream.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(std_stream);
        let conn = Connection::new(stream, addr, 8192);
        drop(listener);

        conn.set_state(ConnState::Closing);
        conn.set_state(ConnState::Closed);
        conn.set_state(ConnState::Reading);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn expired_deadline_fires_once() {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = l.local_addr().unwrap();
        let std_stream = std::net::TcpStream::connect(addr).unwrap();
        std_stream.set_nonblocking(true).unwrap();
        let conn = Connection::new(TcpStream::from_std(std_stream), addr, 8192);

        let now = Instant::now();
        conn.set_deadline(Some(now - Duration::from_secs(1)));
        assert!(conn.take_expired_deadline(now));
        assert!(!conn.take_expired_deadline(now));
    }
}
