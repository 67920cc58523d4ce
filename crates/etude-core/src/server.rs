// src/server.rs
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use libc::c_int;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DEFAULT_MAX_CONNECTIONS};
use crate::error::{EtudeError, EtudeResult};
use crate::metrics::Metrics;
use crate::pool::{DEFAULT_MAX_REQUESTS, DEFAULT_WORKERS, Task, ThreadPool};
use crate::slab::{ConnHandle, ConnectionSlab};
use crate::sync::Locker;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, Interest, epoll_event,
};

const LISTENER_TOKEN: u64 = u64::MAX;
const MAX_EVENTS: usize = 1024;
/// Upper bound on how long a shutdown request goes unnoticed.
const WAIT_TIMEOUT_MS: i32 = 100;
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Connections a worker could not re-arm, as `(token, fd)`. The reactor
/// drains it every loop iteration and frees the slots.
type CloseQueue = Arc<Locker<Vec<(u64, c_int)>>>;

/// A queued request: the connection plus what the worker needs to re-arm it.
pub struct ConnTask {
    conn: ConnHandle,
    epoll: Arc<Epoll>,
    token: u64,
    closed: CloseQueue,
}

impl Task for ConnTask {
    fn process(self) {
        let mut conn = self.conn.lock();
        if !conn.is_open() {
            return;
        }
        let fd = conn.fd();
        match conn.process().interest() {
            Some(interest) => {
                if let Err(e) = self.epoll.rearm(fd, self.token, interest) {
                    warn!(fd, error = %e, "re-arm failed, closing");
                    syscalls::shutdown_socket(fd);
                    self.closed.lock().push((self.token, fd));
                }
            }
            None => {
                // The reactor owns the slab; hand the close back to it via
                // the hang-up this produces.
                syscalls::shutdown_socket(fd);
                if let Err(e) = self.epoll.rearm(fd, self.token, Interest::Readable) {
                    warn!(fd, error = %e, "re-arm after shutdown failed");
                    self.closed.lock().push((self.token, fd));
                }
            }
        }
    }
}

/// Server builder.
///
/// ```rust,no_run
/// use etude_core::Server;
///
/// Server::bind("0.0.0.0:8080")
///     .doc_root("/var/www/html")
///     .workers(8)
///     .serve()
///     .unwrap();
/// ```
pub struct Server {
    host_port: String,
    workers: usize,
    max_requests: usize,
    max_connections: usize,
    doc_root: PathBuf,
    pin_workers: bool,
}

impl Server {
    pub fn bind(host_port: &str) -> Self {
        Self {
            host_port: host_port.to_string(),
            workers: DEFAULT_WORKERS,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            doc_root: PathBuf::from("/var/www/html"),
            pin_workers: false,
        }
    }

    pub fn from_config(config: &Config) -> EtudeResult<Self> {
        config.validate()?;
        Ok(Self {
            host_port: config.socket_addr()?.to_string(),
            workers: config.workers,
            max_requests: config.max_requests,
            max_connections: config.max_connections,
            doc_root: config.doc_root.clone(),
            pin_workers: false,
        })
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn doc_root(mut self, doc_root: impl Into<PathBuf>) -> Self {
        self.doc_root = doc_root.into();
        self
    }

    /// Pin worker threads round-robin to CPU cores.
    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    /// Opens the listener and starts the worker pool. Nothing is accepted
    /// until [`Listening::run`] is called.
    pub fn listen(self) -> EtudeResult<Listening> {
        let addr: SocketAddr = self.host_port.parse()?;
        if self.max_connections == 0 {
            return Err(EtudeError::config("max_connections must be positive"));
        }
        if !self.doc_root.is_dir() {
            return Err(EtudeError::config(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }

        let pool = if self.pin_workers {
            ThreadPool::new_pinned(self.workers, self.max_requests)?
        } else {
            ThreadPool::new(self.workers, self.max_requests)?
        };

        let epoll = Arc::new(Epoll::new()?);
        let listen_fd = syscalls::create_listen_socket(&addr)?;
        let listener = Listener(listen_fd);
        let local_addr = syscalls::local_addr(listen_fd)?;
        epoll.add_listener(listen_fd, LISTENER_TOKEN)?;

        let metrics = Arc::new(Metrics::new());
        let doc_root: Arc<Path> = Arc::from(self.doc_root.as_path());
        let slab = ConnectionSlab::new(self.max_connections, doc_root, metrics.clone());

        info!(
            addr = %local_addr,
            root = %self.doc_root.display(),
            workers = self.workers,
            max_requests = self.max_requests,
            max_connections = self.max_connections,
            "listening"
        );

        Ok(Listening {
            listener,
            local_addr,
            epoll,
            slab,
            pool,
            metrics,
            closed: Arc::new(Locker::new(Vec::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Listens and runs until Ctrl-C.
    pub fn serve(self) -> EtudeResult<()> {
        let server = self.listen()?;
        let shutdown = server.shutdown_handle();
        ctrlc::set_handler(move || {
            info!("received SIGINT, initiating graceful shutdown");
            shutdown.store(true, Ordering::SeqCst);
        })?;
        server.run()
    }
}

struct Listener(c_int);

impl Drop for Listener {
    fn drop(&mut self) {
        syscalls::close_fd(self.0);
    }
}

/// A bound server with its worker pool running.
pub struct Listening {
    // Fields drop in declaration order: the pool joins its workers before
    // the connections they may still reference are closed.
    pool: ThreadPool<ConnTask>,
    slab: ConnectionSlab,
    listener: Listener,
    epoll: Arc<Epoll>,
    local_addr: SocketAddr,
    metrics: Arc<Metrics>,
    closed: CloseQueue,
    shutdown: Arc<AtomicBool>,
}

impl Listening {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Setting the flag makes [`Listening::run`] return.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Event loop. Returns once the shutdown flag is set, after the pool has
    /// drained and every live connection is closed.
    pub fn run(mut self) -> EtudeResult<()> {
        let reporter = spawn_reporter(self.metrics.clone(), self.shutdown.clone());
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let result = loop {
            if self.shutdown.load(Ordering::Acquire) {
                break Ok(());
            }

            let n = match self.epoll.wait(&mut events, WAIT_TIMEOUT_MS) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll_wait failed");
                    break Err(e);
                }
            };

            for ev in &events[..n] {
                let token = ev.u64;
                let flags = ev.events;
                if token == LISTENER_TOKEN {
                    self.accept_all();
                } else {
                    self.on_conn_event(token as usize, flags);
                }
            }
            self.reap_closed();
        };

        self.shutdown.store(true, Ordering::Release);
        self.pool.shutdown();
        let live: Vec<usize> = self.slab.live().collect();
        for idx in live {
            self.close_conn(idx);
        }
        if let Some(handle) = reporter {
            let _ = handle.join();
        }

        let snap = self.metrics.snapshot();
        info!(
            requests = snap.requests,
            bytes_sent = snap.bytes_sent,
            rejected = snap.rejected,
            "server shut down"
        );
        result
    }

    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listener.0) {
                Ok(Some((fd, peer))) => match self.slab.allocate(fd, peer) {
                    Some(idx) => {
                        if let Err(e) = self.epoll.add_conn(fd, idx as u64) {
                            warn!(fd, error = %e, "failed to register connection");
                            self.slab.free(idx);
                        } else {
                            debug!(fd, peer = ?peer, token = idx, "accepted");
                        }
                    }
                    None => {
                        warn!(fd, "server busy, connection table full");
                        syscalls::close_fd(fd);
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn on_conn_event(&mut self, idx: usize, flags: u32) {
        let Some(conn) = self.slab.get(idx).cloned() else {
            return;
        };

        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
            self.close_conn(idx);
        } else if flags & EPOLLIN as u32 != 0 {
            if !conn.lock().read() {
                self.close_conn(idx);
                return;
            }
            let task = ConnTask {
                conn,
                epoll: self.epoll.clone(),
                token: idx as u64,
                closed: self.closed.clone(),
            };
            if let Err(rejected) = self.pool.append(task) {
                warn!(token = idx, reason = ?rejected.reason, "work queue refused request");
                self.metrics.inc_rejected();
                self.close_conn(idx);
            }
        } else if flags & EPOLLOUT as u32 != 0 {
            let (fd, next) = {
                let mut conn = conn.lock();
                (conn.fd(), conn.write())
            };
            match next.interest() {
                Some(interest) => {
                    if let Err(e) = self.epoll.rearm(fd, idx as u64, interest) {
                        warn!(fd, error = %e, "re-arm failed");
                        self.close_conn(idx);
                    }
                }
                None => self.close_conn(idx),
            }
        }
    }

    /// Frees connections whose worker failed to re-arm them. A slot that was
    /// already freed and reused for another fd is left alone.
    fn reap_closed(&mut self) {
        let closed = std::mem::take(&mut *self.closed.lock());
        for (token, fd) in closed {
            let idx = token as usize;
            let current = self.slab.get(idx).map(|conn| conn.lock().fd());
            if current == Some(fd) {
                self.close_conn(idx);
            }
        }
    }

    fn close_conn(&mut self, idx: usize) {
        let Some(conn) = self.slab.get(idx) else {
            return;
        };
        let fd = conn.lock().fd();
        if let Err(e) = self.epoll.delete(fd) {
            debug!(fd, error = %e, "epoll delete failed");
        }
        self.slab.free(idx);
        debug!(fd, token = idx, "closed");
    }
}

fn spawn_reporter(metrics: Arc<Metrics>, shutdown: Arc<AtomicBool>) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("etude-metrics".to_string())
        .spawn(move || {
            let mut last = Instant::now();
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(100));
                if last.elapsed() < METRICS_INTERVAL {
                    continue;
                }
                last = Instant::now();
                let snap = metrics.snapshot();
                info!(
                    live_connections = snap.live_connections,
                    requests = snap.requests,
                    bytes_sent = snap.bytes_sent,
                    rejected = snap.rejected,
                    "metrics"
                );
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "failed to start metrics reporter");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_rejects_bad_settings() {
        let root = tempfile::tempdir().unwrap();

        assert!(matches!(
            Server::bind("not an address").doc_root(root.path()).listen(),
            Err(EtudeError::AddrParse(_))
        ));
        assert!(matches!(
            Server::bind("127.0.0.1:0")
                .doc_root(root.path())
                .workers(0)
                .listen(),
            Err(EtudeError::Config(_))
        ));
        assert!(matches!(
            Server::bind("127.0.0.1:0")
                .doc_root(root.path().join("missing"))
                .listen(),
            Err(EtudeError::Config(_))
        ));
    }

    #[test]
    fn binds_ephemeral_port_and_stops() {
        let root = tempfile::tempdir().unwrap();
        let server = Server::bind("127.0.0.1:0")
            .doc_root(root.path())
            .workers(2)
            .listen()
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let stop = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn failed_rearm_frees_the_slot() {
        use std::io::Write;
        use std::os::unix::io::IntoRawFd;
        use std::os::unix::net::UnixStream;

        let root = tempfile::tempdir().unwrap();
        let mut server = Server::bind("127.0.0.1:0")
            .doc_root(root.path())
            .workers(1)
            .listen()
            .unwrap();

        // Never registered with epoll, so the worker's re-arm fails.
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let fd = ours.into_raw_fd();
        let idx = server.slab.allocate(fd, None).unwrap();
        theirs.write_all(b"GET /index.html HTTP/1.1\r\n").unwrap();

        let conn = server.slab.get(idx).unwrap().clone();
        assert!(conn.lock().read());
        assert_eq!(server.metrics.snapshot().live_connections, 1);

        let task = ConnTask {
            conn,
            epoll: server.epoll.clone(),
            token: idx as u64,
            closed: server.closed.clone(),
        };
        task.process();
        assert_eq!(*server.closed.lock(), vec![(idx as u64, fd)]);

        server.reap_closed();
        assert!(server.slab.is_empty());
        assert!(server.closed.lock().is_empty());
        assert_eq!(server.metrics.snapshot().live_connections, 0);
    }

    #[test]
    fn stale_close_entries_are_ignored() {
        use std::os::unix::io::IntoRawFd;
        use std::os::unix::net::UnixStream;

        let root = tempfile::tempdir().unwrap();
        let mut server = Server::bind("127.0.0.1:0")
            .doc_root(root.path())
            .workers(1)
            .listen()
            .unwrap();

        let (ours, _theirs) = UnixStream::pair().unwrap();
        let fd = ours.into_raw_fd();
        let idx = server.slab.allocate(fd, None).unwrap();

        // Same slot, different fd: the entry belongs to an earlier occupant.
        server.closed.lock().push((idx as u64, fd + 1000));
        server.reap_closed();
        assert_eq!(server.slab.len(), 1);

        server.close_conn(idx);
        assert!(server.slab.is_empty());
    }

    #[test]
    fn from_config_validates() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            doc_root: root.path().to_path_buf(),
            workers: 2,
            ..Config::default()
        };
        let server = Server::from_config(&config).unwrap().listen().unwrap();
        assert!(server.local_addr().ip().is_loopback());

        let bad = Config {
            workers: 0,
            ..config
        };
        assert!(Server::from_config(&bad).is_err());
    }
}
