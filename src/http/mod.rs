//! Request dispatch engine
//!
//! Each server runs one supervisor thread and a fixed pool of workers:
//!
//! ```text
//!  supervisor: bind ──▶ recv loop ──(bounded queue)──▶ worker × N ──▶ Handler
//!       ▲                   │ recv error
//!       └── backoff ◀── drop listener
//! ```
//!
//! `tiny_http` parses request heads and frames responses; everything above
//! that is ours. A panic or error inside a handler becomes an error response
//! for that request only. A receive failure tears the listener down and the
//! supervisor builds a new one after a pause.

pub mod message;

pub use message::{Request, Response};

use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Route handler for one server
pub trait Handler: Send + Sync + 'static {
    /// Handle one request; an `Err` replaces whatever the response held with its status code
    ///
    /// A streamed body may borrow from the handler; it is read while the response is sent.
    fn handle<'h>(&'h self, request: &mut Request<'_>, response: &mut Response<'h>) -> Result<()>;
}

/// Source of parsed requests
pub trait Listen: Send + Sync {
    /// Block until the next request; an error means the listener must be rebuilt
    fn recv(&self) -> io::Result<tiny_http::Request>;

    /// Wake a blocked `recv` so it returns an error
    fn unblock(&self);

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listen for tiny_http::Server {
    fn recv(&self) -> io::Result<tiny_http::Request> {
        tiny_http::Server::recv(self)
    }

    fn unblock(&self) {
        tiny_http::Server::unblock(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server_addr()
            .to_ip()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "listener has no IP address"))
    }
}

/// Bind a `tiny_http` server
pub fn bind(addr: SocketAddr) -> io::Result<Arc<dyn Listen>> {
    let server =
        tiny_http::Server::http(addr).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(Arc::new(server))
}

/// Builds a fresh listener; called at start and after every receive failure
pub type ListenerFactory = Box<dyn FnMut() -> io::Result<Arc<dyn Listen>> + Send>;

/// Request waiting for a worker
struct PendingRequest {
    exchange: tiny_http::Request,
    received: Instant,
}

/// Counters for one server
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub accepted: AtomicU64,
    pub served: AtomicU64,
    pub handler_failures: AtomicU64,
    pub listener_restarts: AtomicU64,
}

/// Configured but not yet running server
pub struct HttpServer {
    name: String,
    handler: Arc<dyn Handler>,
    config: DispatchConfig,
}

impl HttpServer {
    pub fn new(name: &str, handler: Arc<dyn Handler>, config: DispatchConfig) -> Self {
        HttpServer {
            name: name.to_string(),
            handler,
            config,
        }
    }

    /// Bind `addr` and start serving
    ///
    /// The first bind happens before this returns, so a bad address is
    /// reported to the caller. Restarts rebind the address actually obtained.
    pub fn start(self, addr: SocketAddr) -> Result<ServerHandle> {
        let first = bind(addr).map_err(|e| Error::from_io("bind", &addr.to_string(), e))?;
        let bound = first
            .local_addr()
            .map_err(|e| Error::from_io("bind", &addr.to_string(), e))?;

        let mut first = Some(first);
        self.start_with(Box::new(move || match first.take() {
            Some(listener) => Ok(listener),
            None => bind(bound),
        }))
    }

    /// Start serving requests from listeners produced by `factory`
    pub fn start_with(self, mut factory: ListenerFactory) -> Result<ServerHandle> {
        let listener = factory().map_err(|e| Error::from_io("listen", &self.name, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::from_io("listen", &self.name, e))?;

        let name = self.name;
        let config = self.config;
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(DispatchStats::default());
        let current = Arc::new(Mutex::new(None));
        let (tx, rx) = channel::bounded::<PendingRequest>(config.queue_depth.max(1));

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers.max(1) {
            let worker = Worker {
                server: name.clone(),
                handler: Arc::clone(&self.handler),
                stats: Arc::clone(&stats),
            };
            let queue = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", name, index))
                .spawn(move || worker.run(queue))
                .map_err(|e| Error::from_io("spawn worker", &name, e))?;
            workers.push(spawned);
        }
        drop(rx);

        let supervisor = Supervisor {
            name: name.clone(),
            config,
            shutdown: Arc::clone(&shutdown),
            stats: Arc::clone(&stats),
            current: Arc::clone(&current),
        };
        let supervisor_thread = thread::Builder::new()
            .name(format!("{}-accept", name))
            .spawn(move || supervisor.run(listener, factory, tx))
            .map_err(|e| Error::from_io("spawn supervisor", &name, e))?;

        info!("{}: listening on {}", name, local_addr);

        Ok(ServerHandle {
            name,
            local_addr,
            shutdown,
            stats,
            current,
            supervisor: Some(supervisor_thread),
            workers,
        })
    }
}

/// Listener the supervisor is currently blocked on, so shutdown can wake it
type CurrentListener = Arc<Mutex<Option<Arc<dyn Listen>>>>;

struct Supervisor {
    name: String,
    config: DispatchConfig,
    shutdown: Arc<AtomicBool>,
    stats: Arc<DispatchStats>,
    current: CurrentListener,
}

impl Supervisor {
    fn run(
        self,
        first: Arc<dyn Listen>,
        mut factory: ListenerFactory,
        queue: Sender<PendingRequest>,
    ) {
        let mut listener = Some(first);

        while !self.shutdown.load(Ordering::SeqCst) {
            let active = match listener.take() {
                Some(active) => active,
                None => match factory() {
                    Ok(fresh) => {
                        info!("{}: listener restarted", self.name);
                        fresh
                    }
                    Err(e) => {
                        error!("{}: failed to restart listener: {}", self.name, e);
                        thread::sleep(self.config.restart_backoff());
                        continue;
                    }
                },
            };

            *self.current.lock() = Some(Arc::clone(&active));
            // Shutdown may have looked at the slot before it was filled
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let outcome = self.recv_loop(active.as_ref(), &queue);
            *self.current.lock() = None;
            drop(active);

            match outcome {
                Ok(()) => break,
                Err(e) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    self.stats.listener_restarts.fetch_add(1, Ordering::SeqCst);
                    error!(
                        "[{:?}:{}] Receive failed, restarting listener: {}",
                        thread::current().id(),
                        self.name,
                        e
                    );
                    thread::sleep(self.config.restart_backoff());
                }
            }
        }

        *self.current.lock() = None;
        debug!("{}: supervisor stopped", self.name);
    }

    /// `Ok` on shutdown, `Err` when the listener must be rebuilt
    fn recv_loop(&self, listener: &dyn Listen, queue: &Sender<PendingRequest>) -> io::Result<()> {
        loop {
            let exchange = listener.recv()?;
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            self.stats.accepted.fetch_add(1, Ordering::SeqCst);
            let pending = PendingRequest {
                exchange,
                received: Instant::now(),
            };
            if queue.send(pending).is_err() {
                warn!("{}: all workers gone, stopping receive loop", self.name);
                return Ok(());
            }
        }
    }
}

struct Worker {
    server: String,
    handler: Arc<dyn Handler>,
    stats: Arc<DispatchStats>,
}

impl Worker {
    fn run(self, queue: Receiver<PendingRequest>) {
        for pending in queue.iter() {
            self.serve(pending);
        }
    }

    fn serve(&self, pending: PendingRequest) {
        let mut exchange = pending.exchange;
        let mut response = Response::new();
        {
            let mut request = Request::from_http(&mut exchange);
            info!("{}: {} {}", self.server, request.method(), request.target());
            self.dispatch(&mut request, &mut response);
        }

        let status = response.status();
        let sent = exchange.respond(response.into_http());

        self.stats.served.fetch_add(1, Ordering::SeqCst);
        if status != 200 {
            info!("Response: {}", status);
        }
        debug!(
            "{}: handled in {} ms",
            self.server,
            pending.received.elapsed().as_millis()
        );
        if let Err(e) = sent {
            warn!("{}: exception closing response: {}", self.server, e);
        }
    }

    /// Run the handler, turning an error or panic into a bare status response
    fn dispatch<'h>(&'h self, request: &mut Request<'_>, response: &mut Response<'h>) {
        let handler: &'h dyn Handler = self.handler.as_ref();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request, response)));

        let status = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                let status = e.status_code();
                if status >= 500 {
                    error!("{}: {} {} failed: {}", self.server, request.method(), request.target(), e);
                } else {
                    debug!("{}: {} {} -> {}", self.server, request.method(), request.target(), e);
                }
                status
            }
            Err(payload) => {
                self.stats.handler_failures.fetch_add(1, Ordering::SeqCst);
                error!(
                    "[{:?}:{}] Uncaught panic in handler: {}",
                    thread::current().id(),
                    self.server,
                    panic_message(payload.as_ref())
                );
                500
            }
        };

        // Drops any half-built payload, and with it a held bus guard
        *response = Response::error(status);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Running server; dropping it stops the server
pub struct ServerHandle {
    name: String,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    stats: Arc<DispatchStats>,
    current: CurrentListener,
    supervisor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Block until the server stops on its own (it normally never does)
    pub fn join(mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Stop receiving, let workers finish queued requests, then join
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(listener) = self.current.lock().as_ref() {
            listener.unblock();
        }

        if let Some(supervisor) = self.supervisor.take() {
            if supervisor.join().is_err() {
                warn!("{}: supervisor panicked", self.name);
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("{}: worker panicked", self.name);
            }
        }
        info!("{}: stopped", self.name);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run a raw request through a handler the way a worker does, without a socket
///
/// Returns the status and a rendering of headers and body.
#[cfg(test)]
pub(crate) fn exchange(handler: &dyn Handler, raw: &str) -> (u16, String) {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let mut body = io::Cursor::new(body.as_bytes().to_vec());
    let mut request = Request::new(method, target, headers, &mut body);
    let mut response = Response::new();
    if let Err(e) = handler.handle(&mut request, &mut response) {
        response = Response::error(e.status_code());
    }

    let status = response.status();
    let mut text = String::new();
    for (name, value) in response.headers() {
        text.push_str(&format!("{}: {}\r\n", name, value));
    }
    text.push_str(&format!("Content-Length: {}\r\n\r\n", response.content_length()));
    let body = response.into_body().unwrap();
    text.push_str(&String::from_utf8_lossy(&body));
    (status, text)
}
