use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use etude_core::{EtudeResult, Metrics, Server};

const INDEX: &[u8] = b"<h1>Hello from etude</h1>\n";

struct TestServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    handle: Option<JoinHandle<EtudeResult<()>>>,
    _root: tempfile::TempDir,
}

impl TestServer {
    fn start(workers: usize) -> Self {
        etude_core::logging::try_init_logging_with_level("info");

        let root = tempfile::tempdir().unwrap();
        let index = root.path().join("index.html");
        fs::write(&index, INDEX).unwrap();
        fs::set_permissions(&index, fs::Permissions::from_mode(0o644)).unwrap();

        let server = Server::bind("127.0.0.1:0")
            .doc_root(root.path())
            .workers(workers)
            .max_requests(1024)
            .max_connections(256)
            .listen()
            .unwrap();

        let addr = server.local_addr();
        let stop = server.shutdown_handle();
        let metrics = server.metrics();
        let handle = thread::spawn(move || server.run());

        Self {
            addr,
            stop,
            metrics,
            handle: Some(handle),
            _root: root,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.set_nodelay(true).unwrap();
        stream
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Reads exactly one response, using Content-Length to find its end.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 1, "connection closed mid-header: {:?}", String::from_utf8_lossy(&raw));
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .expect("Content-Length header")
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn request(server: &TestServer, raw: &[u8]) -> String {
    let mut stream = server.connect();
    stream.write_all(raw).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn serves_file_and_closes() {
    let server = TestServer::start(2);
    let response = request(&server, b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains(&format!("Content-Length: {}\r\n", INDEX.len())));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with(std::str::from_utf8(INDEX).unwrap()));
    server.stop();
}

#[test]
fn error_statuses() {
    let server = TestServer::start(2);

    let response = request(&server, b"GET /nope.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", response);
    assert!(response.ends_with("The requested file was not found on this server.\n"));

    let response = request(&server, b"POST /index.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);

    let response = request(&server, b"GET /index.html HTTP/1.0\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);

    let response = request(&server, b"GET /../index.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", response);

    server.stop();
}

#[test]
fn keep_alive_reuses_the_connection() {
    let server = TestServer::start(2);
    let mut stream = server.connect();

    for _ in 0..3 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(body, INDEX);
    }

    // The last request without keep-alive gets the connection closed.
    stream.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    assert_eq!(server.metrics.snapshot().requests, 4);
    server.stop();
}

#[test]
fn fragmented_request_is_reassembled() {
    let server = TestServer::start(2);
    let mut stream = server.connect();

    let raw = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nUser-Agent: test\r\n\r\n";
    for chunk in raw.chunks(3) {
        stream.write_all(chunk).unwrap();
        thread::sleep(Duration::from_millis(2));
    }
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with(INDEX));
    server.stop();
}

#[test]
fn many_concurrent_clients() {
    let server = TestServer::start(4);
    let addr = server.addr;

    let clients: Vec<_> = (0..16)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                for _ in 0..10 {
                    stream
                        .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                        .unwrap();
                    let (head, body) = read_response(&mut stream);
                    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
                    assert_eq!(body, INDEX);
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    let snap = server.metrics.snapshot();
    assert_eq!(snap.requests, 160);
    assert_eq!(snap.rejected, 0);
    server.stop();
}

#[test]
fn shutdown_closes_live_connections() {
    let server = TestServer::start(2);
    let mut idle = server.connect();
    let metrics = server.metrics.clone();

    // Make sure the reactor has accepted the idle socket.
    idle.write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    read_response(&mut idle);
    assert_eq!(metrics.snapshot().live_connections, 1);

    server.stop();
    assert_eq!(metrics.snapshot().live_connections, 0);

    let mut rest = Vec::new();
    assert_eq!(idle.read_to_end(&mut rest).unwrap(), 0);
}
