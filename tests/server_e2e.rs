//! End-to-end tests over real TCP connections

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use halley::config::{ModuleSpec, RouteSpec, ServerConfig};
use halley::Server;

fn test_config(modules: Vec<ModuleSpec>) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.port = 0;
    config.mime_types = "/nonexistent/mime.types".into();
    config.modules = modules;
    config
}

fn start_server(modules: Vec<ModuleSpec>) -> Server {
    let server = Server::new(test_config(modules)).expect("server builds");
    server.start();
    server
}

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(1)))
        .unwrap();
    stream
}

/// Reads until `total` bytes arrived or the deadline passes.
fn read_exact_len(stream: &mut TcpStream, total: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(total);
    let mut chunk = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while out.len() < total && Instant::now() < deadline {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                break
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
    out
}

fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).ok();
    out
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn hello_module() -> ModuleSpec {
    ModuleSpec::Content {
        route: RouteSpec::Exact {
            path: "/hello".into(),
        },
        body: "hi".into(),
        content_type: None,
    }
}

#[test]
fn exact_match_produces_literal_response() {
    let server = start_server(vec![hello_module()]);
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
    let response = read_exact_len(&mut stream, expected.len());
    assert_eq!(
        String::from_utf8_lossy(&response),
        String::from_utf8_lossy(expected)
    );
    server.stop();
}

#[test]
fn pipelined_requests_answer_in_order() {
    let server = start_server(vec![
        ModuleSpec::Content {
            route: RouteSpec::Exact { path: "/a".into() },
            body: "AA".into(),
            content_type: None,
        },
        ModuleSpec::Content {
            route: RouteSpec::Exact { path: "/b".into() },
            body: "BB".into(),
            content_type: None,
        },
    ]);
    let mut stream = connect(&server);
    stream
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();

    let one = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n";
    let total = (one.len() + 2) * 2;
    let response = read_exact_len(&mut stream, total);
    let text = String::from_utf8_lossy(&response);
    let first_body = text.find("AA").expect("first response present");
    let second_body = text.find("BB").expect("second response present");
    assert!(first_body < second_body, "responses out of order: {text}");
    server.stop();
}

#[test]
fn unmatched_path_is_404_text_plain() {
    let server = start_server(vec![hello_module()]);
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let head = b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\n";
    let response = read_exact_len(&mut stream, head.len() + 32);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{text}");
    assert!(text.contains("Content-Type: text/plain\r\n"), "{text}");
    server.stop();
}

#[test]
fn chunked_upload_is_delivered_and_echoed() {
    let server = start_server(vec![ModuleSpec::Upload {
        route: RouteSpec::Exact {
            path: "/upload".into(),
        },
    }]);
    let mut stream = connect(&server);
    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        )
        .unwrap();

    let response = read_exact_len(&mut stream, 128);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("Content-Length: 3\r\n"), "{text}");
    assert!(text.ends_with("abc"), "{text}");
    server.stop();
}

#[test]
fn graceful_stop_completes_inflight_response() {
    let server = start_server(vec![hello_module()]);
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    // Wait for the request to be in flight, then stop mid-processing.
    assert!(wait_until(Duration::from_secs(5), || {
        server.stats().requests() >= 1
    }));
    server.stop();

    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("hi"), "{text}");

    // No new connections are accepted afterwards.
    let refused = match TcpStream::connect(server.local_addr()) {
        Err(_) => true,
        Ok(mut late) => {
            late.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
            late.write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").ok();
            read_to_eof(&mut late).is_empty()
        }
    };
    assert!(refused, "server accepted work after stop");
}

#[test]
fn client_disconnect_after_head_releases_the_job() {
    let server = start_server(vec![ModuleSpec::Upload {
        route: RouteSpec::Exact {
            path: "/upload".into(),
        },
    }]);
    {
        let mut stream = connect(&server);
        // Head promises a body that never arrives.
        stream
            .write_all(b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
    } // dropped: client disconnects

    assert!(
        wait_until(Duration::from_secs(5), || server.open_connections() == 0),
        "connection not torn down"
    );
    assert!(
        wait_until(Duration::from_secs(5), || server.stats().open() == 0),
        "job not destroyed (destroy listener never ran)"
    );
    server.stop();
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let server = start_server(vec![hello_module()]);
    let mut stream = connect(&server);

    for _ in 0..3 {
        stream
            .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let response = read_exact_len(&mut stream, expected.len());
        assert_eq!(&response[..], &expected[..]);
    }
    server.stop();
}

#[test]
fn connection_close_header_closes_after_response() {
    let server = start_server(vec![hello_module()]);
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("hi"), "{text}");
    server.stop();
}

#[test]
fn malformed_request_gets_400_and_close() {
    let server = start_server(vec![hello_module()]);
    let mut stream = connect(&server);
    stream.write_all(b"TOTAL GARBAGE\r\n\r\n").unwrap();

    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
    server.stop();
}

#[test]
fn status_module_reports_json() {
    let server = start_server(vec![ModuleSpec::Status {
        route: RouteSpec::Exact {
            path: "/status".into(),
        },
    }]);
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /status HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("Content-Type: application/json\r\n"), "{text}");
    assert!(text.contains("\"requests\":"), "{text}");
    server.stop();
}

#[test]
fn static_files_are_served_with_mime_types() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.html"), b"<h1>staged</h1>").unwrap();

    let mime_file = dir.path().join("mime.types");
    std::fs::write(&mime_file, "text/html html htm\n").unwrap();

    let mut config = test_config(vec![ModuleSpec::StaticFiles {
        route: RouteSpec::Prefix {
            pattern: "/static/".into(),
        },
        root: dir.path().to_path_buf(),
    }]);
    config.mime_types = mime_file;
    let server = Server::new(config).unwrap();
    server.start();

    let mut stream = connect(&server);
    stream
        .write_all(b"GET /static/page.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("Content-Length: 15\r\n"), "{text}");
    assert!(text.ends_with("<h1>staged</h1>"), "{text}");

    // Missing files answer 404 through the same helper path.
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /static/nope.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{text}");

    server.stop();
}

#[test]
fn oversized_head_is_rejected() {
    let mut config = test_config(vec![hello_module()]);
    config.max_header_bytes = halley::domain_types::MaxHeaderBytes::try_new(512).unwrap();
    let server = Server::new(config).unwrap();
    server.start();

    let mut stream = connect(&server);
    stream.write_all(b"GET /hello HTTP/1.1\r\n").unwrap();
    for _ in 0..64 {
        // The server may close mid-write once the head limit is hit.
        if stream
            .write_all(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n")
            .is_err()
        {
            break;
        }
    }
    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
    server.stop();
}

#[test]
fn one_byte_segments_parse_like_one_write() {
    let server = start_server(vec![hello_module()]);
    let mut stream = connect(&server);
    for &byte in b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n" {
        stream.write_all(&[byte]).unwrap();
        stream.flush().unwrap();
    }
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
    let response = read_exact_len(&mut stream, expected.len());
    assert_eq!(&response[..], &expected[..]);
    server.stop();
}

#[test]
fn access_log_gets_one_line_per_completed_request() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("access.log");
    let mut config = test_config(vec![hello_module()]);
    config.access_log = Some(log_path.clone());
    let server = Server::new(config).unwrap();
    server.start();

    let mut stream = connect(&server);
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
    let response = read_exact_len(&mut stream, expected.len());
    assert_eq!(&response[..], &expected[..]);

    assert!(wait_until(Duration::from_secs(5), || {
        std::fs::read_to_string(&log_path)
            .map(|text| text.lines().count() == 1)
            .unwrap_or(false)
    }));
    let text = std::fs::read_to_string(&log_path).unwrap();
    assert!(text.contains("\"GET /hello HTTP/1.1\" 200 2"), "{text}");
    server.stop();
}

#[test]
fn idle_connections_are_timed_out() {
    let mut config = test_config(vec![hello_module()]);
    config.idle_timeout_secs = halley::domain_types::IdleTimeoutSecs::try_new(1).unwrap();
    let server = Server::new(config).unwrap();
    server.start();

    let mut stream = connect(&server);
    // Never send a byte; the reactor's idle timer should close us.
    let response = read_to_eof(&mut stream);
    assert!(response.is_empty());
    assert!(
        wait_until(Duration::from_secs(5), || server.open_connections() == 0),
        "idle connection not closed"
    );
    server.stop();
}

#[test]
fn http10_without_keep_alive_closes() {
    let server = start_server(vec![hello_module()]);
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /hello HTTP/1.0\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_to_eof(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.ends_with("hi"), "{text}");
    server.stop();
}
