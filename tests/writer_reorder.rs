//! Writer stage ordering and back-pressure tests
//!
//! Drives the writer directly against a loopback socket pair: parts are
//! emitted out of index order and must hit the wire densely ordered, with
//! the reorder heap's watermarks pausing and resuming production.

use std::io::Read;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use halley::domain_types::{QueueCapacity, WorkerCount};
use halley::http::body::BodyPart;
use halley::http::response::Response;
use halley::http::writer::{Watermarks, WriterStage};
use halley::net::conn::Connection;
use halley::net::reactor::Readiness;

/// The writer under test has no reactor; a blocked socket would stall the
/// test, so payloads stay far below socket buffer sizes.
struct NoReadiness;

impl Readiness for NoReadiness {
    fn arm_writable(&self, _conn: &Arc<Connection>) {}
    fn disarm_writable(&self, _conn: &Arc<Connection>) {}
    fn deregister(&self, _conn: &Arc<Connection>) {}
}

fn socket_pair() -> (Arc<Connection>, std::net::TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let (server_side, peer) = listener.accept().unwrap();
    server_side.set_nonblocking(true).unwrap();
    let conn = Connection::new(mio::net::TcpStream::from_std(server_side), peer, 8192);
    (conn, client)
}

fn writer_with_watermarks(watermarks: Watermarks) -> Arc<WriterStage> {
    let writer = WriterStage::new(
        QueueCapacity::try_new(64).unwrap(),
        WorkerCount::try_new(1).unwrap(),
        watermarks,
        None,
    );
    writer.set_readiness(Arc::new(NoReadiness));
    writer.start();
    writer
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn read_len(stream: &mut std::net::TcpStream, total: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(5);
    while out.len() < total && Instant::now() < deadline {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    out
}

#[test_log::test]
fn out_of_order_parts_hit_the_wire_in_index_order() {
    let writer = writer_with_watermarks(Watermarks {
        high_parts: 64,
        high_bytes: 1 << 20,
        low_parts: 8,
        low_bytes: 1 << 16,
    });
    let (conn, mut client) = socket_pair();

    let mut response = Response::new(200);
    response.set_header("Content-Length", "4");
    conn.set_response(response);

    // Emitted 3, 1, 2, 0: nothing may be written until 0 arrives.
    writer
        .emit(&conn, BodyPart::inline(3, &b"d"[..], true))
        .unwrap();
    writer
        .emit(&conn, BodyPart::inline(1, &b"b"[..], false))
        .unwrap();
    writer
        .emit(&conn, BodyPart::inline(2, &b"c"[..], false))
        .unwrap();
    writer
        .emit(&conn, BodyPart::inline(0, &b"a"[..], false))
        .unwrap();

    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nabcd";
    let got = read_len(&mut client, expected.len());
    assert_eq!(String::from_utf8_lossy(&got), String::from_utf8_lossy(expected));
    writer.stop();
}

#[test_log::test]
fn heap_at_high_water_pauses_and_resumes_below_low_water() {
    let writer = writer_with_watermarks(Watermarks {
        high_parts: 3,
        high_bytes: 1 << 20,
        low_parts: 1,
        low_bytes: 1 << 16,
    });
    let (conn, mut client) = socket_pair();

    let mut response = Response::new(200);
    response.set_header("Content-Length", "4");
    conn.set_response(response);

    // Three out-of-order parts reach exactly the high-water mark.
    writer
        .emit(&conn, BodyPart::inline(1, &b"b"[..], false))
        .unwrap();
    writer
        .emit(&conn, BodyPart::inline(2, &b"c"[..], false))
        .unwrap();
    writer
        .emit(&conn, BodyPart::inline(3, &b"d"[..], true))
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || conn.output_paused()),
        "reorder heap at high water did not pause the connection"
    );

    // Filling the gap drains the heap past the low-water mark.
    writer
        .emit(&conn, BodyPart::inline(0, &b"a"[..], false))
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || !conn.output_paused()),
        "drained heap did not resume the connection"
    );

    let got = read_len(&mut client, 42);
    assert!(String::from_utf8_lossy(&got).ends_with("abcd"));
    writer.stop();
}

#[test]
fn chunked_framing_when_no_content_length() {
    let writer = writer_with_watermarks(Watermarks::default());
    let (conn, mut client) = socket_pair();

    conn.set_response(Response::new(200));
    writer
        .emit(&conn, BodyPart::inline(0, &b"hello "[..], false))
        .unwrap();
    writer
        .emit(&conn, BodyPart::inline(1, &b"world"[..], false))
        .unwrap();
    writer
        .emit(&conn, BodyPart::inline(2, Bytes::new(), true))
        .unwrap();

    let expected = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n";
    let got = read_len(&mut client, expected.len());
    assert_eq!(String::from_utf8_lossy(&got), String::from_utf8_lossy(expected));
    writer.stop();
}

#[test]
fn close_event_runs_after_queued_emits() {
    let writer = writer_with_watermarks(Watermarks::default());
    let (conn, mut client) = socket_pair();

    let mut response = Response::new(200);
    response.set_header("Content-Length", "2");
    conn.set_response(response);
    conn.set_keep_alive(false);

    writer
        .emit(&conn, BodyPart::inline(0, &b"ok"[..], true))
        .unwrap();
    writer.post_close(&conn).unwrap();

    let mut all = Vec::new();
    client.read_to_end(&mut all).ok();
    assert!(String::from_utf8_lossy(&all).ends_with("ok"));
    writer.stop();
}
