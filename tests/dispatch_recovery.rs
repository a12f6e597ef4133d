//! Crash isolation and listener restart in the dispatch engine

use sdshare::http::{self, Listen, Request, Response};
use sdshare::{DispatchConfig, Error, Handler, HttpServer, Result};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Routes;

impl Handler for Routes {
    fn handle<'h>(&'h self, request: &mut Request<'_>, response: &mut Response<'h>) -> Result<()> {
        match request.path()?.as_str() {
            "/boom" => panic!("handler blew up"),
            "/missing" => Err(Error::NotFound("/missing".to_string())),
            "/half" => {
                response.set_header("X-Partial", "yes");
                response.stream(10, io::repeat(b'h'));
                panic!("panicked mid-body");
            }
            _ => {
                response.send_typed(200, "text/plain", "ok");
                Ok(())
            }
        }
    }
}

fn config() -> DispatchConfig {
    DispatchConfig {
        workers: 1,
        queue_depth: 4,
        restart_backoff_ms: 20,
        ..DispatchConfig::default()
    }
}

fn get(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).unwrap();
    write!(
        stream,
        "GET {} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
        path
    )
    .unwrap();
    let mut out = String::new();
    let _ = stream.read_to_string(&mut out);
    let status = out
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (status, out)
}

#[test]
fn test_panic_becomes_500_and_worker_survives() {
    let server = HttpServer::new("test", Arc::new(Routes), config())
        .start("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let addr = server.local_addr();

    assert_eq!(get(addr, "/boom").0, 500);
    // Single worker: this only works if it survived the panic
    let (status, body) = get(addr, "/");
    assert_eq!(status, 200);
    assert!(body.ends_with("ok"));

    assert_eq!(get(addr, "/missing").0, 404);
    assert_eq!(server.stats().handler_failures.load(Ordering::SeqCst), 1);
    server.shutdown();
}

#[test]
fn test_panic_discards_partial_response() {
    let server = HttpServer::new("test", Arc::new(Routes), config())
        .start("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let addr = server.local_addr();

    let (status, text) = get(addr, "/half");
    assert_eq!(status, 500);
    assert!(!text.contains("X-Partial"));
    assert!(!text.contains("hhhh"));
    assert_eq!(get(addr, "/").0, 200);
    server.shutdown();
}

/// Fails its first receive, then behaves
struct FlakyListener {
    inner: Arc<dyn Listen>,
    failures_left: AtomicUsize,
}

impl Listen for FlakyListener {
    fn recv(&self) -> io::Result<tiny_http::Request> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated receive failure"));
        }
        self.inner.recv()
    }

    fn unblock(&self) {
        self.inner.unblock()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[test]
fn test_listener_restarts_after_receive_failure() {
    let base = http::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();

    let server = HttpServer::new("flaky", Arc::new(Routes), config())
        .start_with(Box::new(move || -> io::Result<Arc<dyn Listen>> {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            Ok(Arc::new(FlakyListener {
                inner: Arc::clone(&base),
                failures_left: AtomicUsize::new(usize::from(first)),
            }))
        }))
        .unwrap();
    let addr = server.local_addr();

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.stats().listener_restarts.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.stats().listener_restarts.load(Ordering::SeqCst), 1);

    assert_eq!(get(addr, "/").0, 200);
    assert!(builds.load(Ordering::SeqCst) >= 2);
    server.shutdown();
}

#[test]
fn test_shutdown_wakes_blocked_listener() {
    let server = HttpServer::new("idle", Arc::new(Routes), config())
        .start("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let started = Instant::now();
    server.shutdown();
    assert!(started.elapsed() < Duration::from_secs(5));
}
