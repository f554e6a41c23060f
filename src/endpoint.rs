/*
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::acceptor;
use crate::config::{Settings, SettingsError};
use crate::net::{self, Conn};
use crate::poller::Poller;
use crate::sendfile::{self, Sendfile, SendfileData, SendfileStatus};
use crate::tls::{self, TlsError};
use crate::worker::{self, Assignment, WorkerPool};
use log::{debug, error, warn};
use openssl::ssl::SslContext;
use std::cmp;
use std::fmt;
use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

// wake-up request sent on pause/stop when deferred accept is on. the
// OPTIONS * form gets through even BSD accept filters
const WAKEUP_REQUEST: &[u8] =
    b"OPTIONS * HTTP/1.0\r\nUser-Agent: Tomcat wakeup connection\r\n\r\n";

const ACCEPTOR_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Status delivered to `Handler::event` for comet-style connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Open,
    Stop,
    Timeout,
    Disconnect,
    Error,
}

/// Result of a handler invocation.
///
/// `Closed` destroys the socket. `Long` re-registers it with a poller for
/// the next request. `Open` means the handler handed the connection off
/// (it must have detached it, e.g. into a sendfile transfer or into the
/// application); an `Open` result with the connection still attached is
/// closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    Closed,
    Long,
}

/// Application entry point, invoked from worker threads.
pub trait Handler: Send + Sync {
    fn process(&self, conn: &mut Conn) -> SocketState;

    fn event(&self, conn: &mut Conn, status: SocketStatus) -> SocketState {
        let _ = (conn, status);

        SocketState::Closed
    }
}

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// External dispatcher. When installed, the endpoint builds one task per
/// dispatch instead of using its own worker pool. Tasks swallow their own
/// errors.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Tls(TlsError),
    Settings(SettingsError),
    /// A previous `init` failed and its resources have not been released.
    /// `destroy` clears this state.
    PreviousInitFailed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::Tls(e) => write!(f, "{}", e),
            Self::Settings(e) => write!(f, "{}", e),
            Self::PreviousInitFailed => {
                write!(f, "a previous init failed; destroy the endpoint first")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Self::Tls(e)
    }
}

impl From<SettingsError> for Error {
    fn from(e: SettingsError) -> Self {
        Self::Settings(e)
    }
}

pub(crate) fn apply_thread_priority(priority: i32) {
    if priority == 0 {
        return;
    }

    #[cfg(unix)]
    unsafe {
        // on linux this adjusts the calling thread
        libc::setpriority(libc::PRIO_PROCESS as _, 0, priority as libc::c_int);
    }
}

/// State shared by all stages.
pub(crate) struct Core {
    pub(crate) settings: Settings,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) workers: WorkerPool,
    executor: RwLock<Option<Arc<dyn Executor>>>,
    running: AtomicBool,
    paused: AtomicBool,
    defer_accept: AtomicBool,
    use_sendfile: AtomicBool,
    listener: RwLock<Option<Arc<TcpListener>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    ssl: RwLock<Option<SslContext>>,
    pollers: RwLock<Vec<Arc<Poller>>>,
    comet_pollers: RwLock<Vec<Arc<Poller>>>,
    sendfiles: RwLock<Vec<Arc<Sendfile>>>,
    poller_rr: AtomicUsize,
    comet_poller_rr: AtomicUsize,
    sendfile_rr: AtomicUsize,
}

impl Core {
    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub(crate) fn defer_accept(&self) -> bool {
        self.defer_accept.load(Ordering::Relaxed)
    }

    /// Closes a connection. With ownership-based resource management this
    /// is a drop; the value is accepted by move so the close is explicit at
    /// every call site.
    pub(crate) fn destroy_socket(&self, conn: Conn) {
        debug!("closing connection from {}", conn.peer_addr());

        drop(conn);
    }

    /// Applies the configured socket options and, when TLS is enabled,
    /// performs the server handshake. Returns false if the socket should be
    /// closed.
    pub(crate) fn set_socket_options(&self, conn: &mut Conn) -> bool {
        let s = &self.settings;

        let result = (|| -> io::Result<()> {
            if s.so_linger >= 0 {
                conn.set_linger(Some(Duration::from_secs(s.so_linger as u64)))?;
            }

            if s.tcp_no_delay {
                conn.set_nodelay(true)?;
            }

            if s.so_timeout > 0 {
                conn.set_io_timeout(s.so_timeout)?;
            }

            Ok(())
        })();

        if let Err(e) = result {
            debug!(
                "failed to set socket options on {}: {}",
                conn.peer_addr(),
                e
            );

            return false;
        }

        let ctx = self.ssl.read().unwrap().clone();

        if let Some(ctx) = ctx {
            if let Err(e) = tls::handshake(&ctx, conn) {
                debug!("handshake failed with {}: {}", conn.peer_addr(), e);

                return false;
            }
        }

        true
    }

    /// Registers a connection with a normal poller, round-robin.
    pub(crate) fn keep_alive(self: &Arc<Self>, conn: Conn) {
        let pollers = self.pollers.read().unwrap();

        if pollers.is_empty() {
            drop(pollers);
            self.destroy_socket(conn);
            return;
        }

        let i = self.poller_rr.fetch_add(1, Ordering::Relaxed) % pollers.len();

        pollers[i].add(self, conn);
    }

    /// Registers a connection with a comet poller, round-robin.
    pub(crate) fn comet_keep_alive(self: &Arc<Self>, conn: Conn) {
        let pollers = self.comet_pollers.read().unwrap();

        if pollers.is_empty() {
            drop(pollers);
            self.destroy_socket(conn);
            return;
        }

        let i = self.comet_poller_rr.fetch_add(1, Ordering::Relaxed) % pollers.len();

        pollers[i].add(self, conn);
    }

    pub(crate) fn process_socket_with_options(self: &Arc<Self>, conn: Conn) -> Result<(), Conn> {
        self.dispatch(conn, None, true)
    }

    pub(crate) fn process_socket(self: &Arc<Self>, conn: Conn) -> Result<(), Conn> {
        self.dispatch(conn, None, false)
    }

    pub(crate) fn process_socket_event(
        self: &Arc<Self>,
        conn: Conn,
        status: SocketStatus,
    ) -> Result<(), Conn> {
        self.dispatch(conn, Some(status), false)
    }

    fn dispatch(
        self: &Arc<Self>,
        conn: Conn,
        status: Option<SocketStatus>,
        options: bool,
    ) -> Result<(), Conn> {
        let executor = self.executor.read().unwrap().clone();

        if let Some(executor) = executor {
            let core = Arc::clone(self);
            let assignment = Assignment {
                conn,
                status,
                options,
            };

            executor.execute(Box::new(move || {
                worker::process_assignment(&core, assignment)
            }));

            return Ok(());
        }

        match self.workers.get(self) {
            Some(worker) => {
                worker.assign(conn, status, options);

                Ok(())
            }
            None => {
                error!("failed to dispatch connection from {}", conn.peer_addr());

                Err(conn)
            }
        }
    }
}

#[derive(Clone)]
struct Derived {
    acceptor_threads: usize,
    poller_threads: usize,
    poller_size: usize,
    sendfile_threads: usize,
    sendfile_size: usize,
}

fn derive_split(threads: usize, size: usize) -> (usize, usize) {
    if threads != 0 {
        return (threads, size);
    }

    // large poll sets perform poorly on windows; split them into 1024-sized
    // pollers there
    if cfg!(windows) && size > 1024 {
        (size / 1024, size - (size % 1024))
    } else {
        (1, size)
    }
}

struct Lifecycle {
    initialized: bool,
    bound: bool,
    derived: Option<Derived>,
    acceptors: Vec<thread::JoinHandle<()>>,
}

fn unlock_accept(
    addr: SocketAddr,
    so_timeout_ms: i64,
    unlock_timeout_ms: i64,
    defer_accept: bool,
) -> io::Result<()> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    let read_timeout = cmp::max(so_timeout_ms, 60_000) as u64;
    socket.set_read_timeout(Some(Duration::from_millis(read_timeout)))?;
    socket.set_linger(Some(Duration::from_secs(0)))?;

    let connect_timeout = cmp::max(unlock_timeout_ms, 1) as u64;
    socket.connect_timeout(&addr.into(), Duration::from_millis(connect_timeout))?;

    if defer_accept {
        // with a kernel accept filter in the way, connecting is not enough
        // to wake the acceptor. send a dummy request it will discard
        let mut stream: std::net::TcpStream = socket.into();

        stream.write_all(WAKEUP_REQUEST)?;
        stream.flush()?;
    }

    Ok(())
}

/// A TCP connection endpoint: one listening socket, acceptor threads, two
/// poller fleets, optional sendfile threads, and a bounded worker pool
/// invoking the supplied `Handler`.
///
/// Lifecycle: `init` binds, `start` spawns the stages, `pause`/`resume`
/// gate accepting, `stop` halts the stages, `destroy` releases everything
/// so `init` can run again.
pub struct Endpoint {
    core: Arc<Core>,
    lifecycle: Mutex<Lifecycle>,
}

impl Endpoint {
    pub fn new(settings: Settings, handler: Arc<dyn Handler>) -> Result<Self, Error> {
        settings.validate()?;

        Ok(Self {
            core: Arc::new(Core {
                settings,
                handler,
                workers: WorkerPool::new(),
                executor: RwLock::new(None),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                defer_accept: AtomicBool::new(false),
                use_sendfile: AtomicBool::new(false),
                listener: RwLock::new(None),
                local_addr: RwLock::new(None),
                ssl: RwLock::new(None),
                pollers: RwLock::new(Vec::new()),
                comet_pollers: RwLock::new(Vec::new()),
                sendfiles: RwLock::new(Vec::new()),
                poller_rr: AtomicUsize::new(0),
                comet_poller_rr: AtomicUsize::new(0),
                sendfile_rr: AtomicUsize::new(0),
            }),
            lifecycle: Mutex::new(Lifecycle {
                initialized: false,
                bound: false,
                derived: None,
                acceptors: Vec::new(),
            }),
        })
    }

    /// Installs an external dispatcher in place of the internal worker
    /// pool. Takes effect for dispatches after the call; normally installed
    /// before `start`.
    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self.core.executor.write().unwrap() = Some(executor);
    }

    pub fn init(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().unwrap();

        self.init_locked(&mut lifecycle)
    }

    fn init_locked(&self, lifecycle: &mut Lifecycle) -> Result<(), Error> {
        if lifecycle.initialized {
            return Ok(());
        }

        if lifecycle.bound {
            // a previous init failed. that failure must be surfaced and the
            // partial state released via destroy, not silently retried
            return Err(Error::PreviousInitFailed);
        }

        lifecycle.bound = true;

        let s = &self.core.settings;

        let (listener, local_addr, defer_accept) = net::build_listener(s)?;

        *self.core.listener.write().unwrap() = Some(Arc::new(listener));
        *self.core.local_addr.write().unwrap() = Some(local_addr);
        self.core.defer_accept.store(defer_accept, Ordering::Relaxed);

        let mut use_sendfile = s.use_sendfile && sendfile::supported();

        let acceptor_threads = if s.acceptor_thread_count == 0 {
            1
        } else {
            s.acceptor_thread_count
        };

        let (poller_threads, poller_size) = derive_split(s.poller_thread_count, s.poller_size);
        let (sendfile_threads, sendfile_size) =
            derive_split(s.sendfile_thread_count, s.sendfile_size);

        if s.ssl_enabled {
            let ctx = tls::create_context(s)?;

            *self.core.ssl.write().unwrap() = Some(ctx);

            // sendfile writes behind the TLS layer's back
            use_sendfile = false;
        }

        self.core.use_sendfile.store(use_sendfile, Ordering::Relaxed);

        lifecycle.derived = Some(Derived {
            acceptor_threads,
            poller_threads,
            poller_size,
            sendfile_threads,
            sendfile_size,
        });

        lifecycle.initialized = true;

        Ok(())
    }

    pub fn start(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().unwrap();

        if !lifecycle.initialized {
            self.init_locked(&mut lifecycle)?;
        }

        if self.core.running() {
            return Ok(());
        }

        self.core.running.store(true, Ordering::Relaxed);
        self.core.paused.store(false, Ordering::Relaxed);

        let derived = lifecycle.derived.as_ref().expect("initialized").clone();
        let s = &self.core.settings;

        if self.core.executor.read().unwrap().is_none() {
            self.core.workers.open(s.max_threads);
        }

        let per_poller = cmp::max(derived.poller_size / derived.poller_threads, 1);

        let mut pollers = Vec::with_capacity(derived.poller_threads);
        for i in 0..derived.poller_threads {
            pollers.push(Arc::new(Poller::new(&self.core, i, false, per_poller)?));
        }
        *self.core.pollers.write().unwrap() = pollers;

        let mut comet_pollers = Vec::with_capacity(derived.poller_threads);
        for i in 0..derived.poller_threads {
            comet_pollers.push(Arc::new(Poller::new(&self.core, i, true, per_poller)?));
        }
        *self.core.comet_pollers.write().unwrap() = comet_pollers;

        if self.core.use_sendfile.load(Ordering::Relaxed) {
            let per_sendfile = cmp::max(derived.sendfile_size / derived.sendfile_threads, 1);

            let mut sendfiles = Vec::with_capacity(derived.sendfile_threads);
            for i in 0..derived.sendfile_threads {
                sendfiles.push(Arc::new(Sendfile::new(&self.core, i, per_sendfile)?));
            }
            *self.core.sendfiles.write().unwrap() = sendfiles;
        }

        let listener = self
            .core
            .listener
            .read()
            .unwrap()
            .clone()
            .expect("initialized");

        for i in 0..derived.acceptor_threads {
            let core = Arc::clone(&self.core);
            let listener = Arc::clone(&listener);
            let priority = s.thread_priority;

            let handle = thread::Builder::new()
                .name(format!("{}-Acceptor-{}", s.name, i))
                .spawn(move || {
                    apply_thread_priority(priority);
                    acceptor::run(core, listener);
                })?;

            lifecycle.acceptors.push(handle);
        }

        Ok(())
    }

    /// Stops accepting new connections. Established connections keep being
    /// served. Idempotent.
    pub fn pause(&self) {
        if self.core.running() && !self.core.paused() {
            self.core.paused.store(true, Ordering::Relaxed);
            self.unlock();
        }
    }

    /// Resumes accepting. Idempotent.
    pub fn resume(&self) {
        if self.core.running() {
            self.core.paused.store(false, Ordering::Relaxed);
        }
    }

    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap();

        self.stop_locked(&mut lifecycle);
    }

    fn stop_locked(&self, lifecycle: &mut Lifecycle) {
        if self.core.running() && !self.core.paused() {
            self.core.paused.store(true, Ordering::Relaxed);
            self.unlock();
        }

        if !self.core.running() {
            self.core.paused.store(false, Ordering::Relaxed);
            return;
        }

        self.core.running.store(false, Ordering::Relaxed);
        self.unlock();

        for handle in lifecycle.acceptors.drain(..) {
            let deadline = Instant::now() + ACCEPTOR_JOIN_TIMEOUT;

            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }

            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("acceptor did not stop in time, shutting down the listener");

                // force the blocked accept to return. the thread is left to
                // finish on its own
                if let Some(listener) = &*self.core.listener.read().unwrap() {
                    unsafe {
                        libc::shutdown(listener.as_raw_fd(), libc::SHUT_RD);
                    }
                }
            }
        }

        let pollers: Vec<Arc<Poller>> = self.core.pollers.write().unwrap().drain(..).collect();
        for poller in &pollers {
            poller.destroy();
        }

        let comet_pollers: Vec<Arc<Poller>> =
            self.core.comet_pollers.write().unwrap().drain(..).collect();
        for poller in &comet_pollers {
            poller.destroy();
        }

        let sendfiles: Vec<Arc<Sendfile>> =
            self.core.sendfiles.write().unwrap().drain(..).collect();
        for sendfile in &sendfiles {
            sendfile.destroy();
        }

        self.core.workers.shutdown();

        self.core.paused.store(false, Ordering::Relaxed);
    }

    /// Releases all resources. A subsequent `init` starts a fresh lifetime.
    pub fn destroy(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap();

        self.stop_locked(&mut lifecycle);

        *self.core.listener.write().unwrap() = None;
        *self.core.local_addr.write().unwrap() = None;
        *self.core.ssl.write().unwrap() = None;

        lifecycle.derived = None;
        lifecycle.initialized = false;
        lifecycle.bound = false;
    }

    fn unlock(&self) {
        let addr = match *self.core.local_addr.read().unwrap() {
            Some(addr) => addr,
            None => return,
        };

        // an unspecified bind address is reachable over loopback
        let ip = match addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };

        let addr = SocketAddr::new(ip, addr.port());

        debug!("about to unlock socket for {}", addr);

        if let Err(e) = unlock_accept(
            addr,
            self.core.settings.so_timeout,
            self.core.settings.unlock_timeout,
            self.core.defer_accept(),
        ) {
            debug!("failed to unlock acceptor at {}: {}", addr, e);
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.core.settings
    }

    /// Whether the comet poller fleet is meant for application use. Both
    /// fleets are always started; this only reflects the configuration.
    pub fn use_comet(&self) -> bool {
        self.core.settings.use_comet
    }

    pub fn is_running(&self) -> bool {
        self.core.running()
    }

    pub fn is_paused(&self) -> bool {
        self.core.paused()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.core.local_addr.read().unwrap()
    }

    /// Whether sendfile is in effect after init (requested, supported, and
    /// not disabled by TLS).
    pub fn sendfile_enabled(&self) -> bool {
        self.core.use_sendfile.load(Ordering::Relaxed)
    }

    /// Hands a file range transfer to a sendfile thread, round-robin.
    pub fn add_sendfile(&self, data: SendfileData) -> SendfileStatus {
        let sendfiles = self.core.sendfiles.read().unwrap();

        if sendfiles.is_empty() {
            drop(sendfiles);

            return SendfileStatus::Failed(data.into_conn());
        }

        let i = self.core.sendfile_rr.fetch_add(1, Ordering::Relaxed) % sendfiles.len();

        sendfiles[i].add(&self.core, data)
    }

    /// Number of sockets currently parked in the normal poller fleet.
    pub fn keep_alive_count(&self) -> usize {
        self.core
            .pollers
            .read()
            .unwrap()
            .iter()
            .map(|p| p.keep_alive_count())
            .sum()
    }

    /// Number of transfers currently parked in the sendfile stage.
    pub fn sendfile_count(&self) -> usize {
        self.core
            .sendfiles
            .read()
            .unwrap()
            .iter()
            .map(|s| s.count())
            .sum()
    }

    /// Worker threads alive, or None when an external executor is in use.
    pub fn current_thread_count(&self) -> Option<usize> {
        if self.core.executor.read().unwrap().is_some() {
            return None;
        }

        Some(self.core.workers.cur_threads())
    }

    /// Worker threads currently processing, or None when an external
    /// executor is in use.
    pub fn current_threads_busy(&self) -> Option<usize> {
        if self.core.executor.read().unwrap().is_some() {
            return None;
        }

        Some(self.core.workers.cur_threads_busy())
    }

    /// Live-resizes the worker pool. Shrinking retires idle workers
    /// immediately and busy ones as they finish.
    pub fn set_max_threads(&self, max_threads: i32) {
        self.core.workers.resize(max_threads);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;

    fn test_settings() -> Settings {
        Settings {
            address: Some("127.0.0.1".to_string()),
            defer_accept: false,
            so_timeout: 5000,
            max_threads: 8,
            ..Default::default()
        }
    }

    fn wait_for<F: Fn() -> bool>(f: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if f() {
                return true;
            }

            thread::sleep(Duration::from_millis(10));
        }

        f()
    }

    /// Replies "ok" to anything and closes.
    struct CloseHandler;

    impl Handler for CloseHandler {
        fn process(&self, conn: &mut Conn) -> SocketState {
            let mut buf = [0u8; 1024];

            if conn.read(&mut buf).is_err() {
                return SocketState::Closed;
            }

            let _ = conn.write_all(b"ok");

            SocketState::Closed
        }
    }

    /// Echoes one read back and keeps the connection alive.
    struct EchoHandler;

    impl Handler for EchoHandler {
        fn process(&self, conn: &mut Conn) -> SocketState {
            let mut buf = [0u8; 1024];

            let n = match conn.read(&mut buf) {
                Ok(0) | Err(_) => return SocketState::Closed,
                Ok(n) => n,
            };

            if conn.write_all(&buf[..n]).is_err() {
                return SocketState::Closed;
            }

            SocketState::Long
        }
    }

    #[test]
    fn unlock_wire_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        unlock_accept(addr, -1, 250, true).unwrap();

        let (mut stream, _) = listener.accept().unwrap();

        // the unlock socket closes with linger(0), so the payload may be
        // followed by a reset instead of an orderly shutdown
        let mut received = Vec::new();
        let mut buf = [0u8; 256];

        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }

        assert_eq!(received, WAKEUP_REQUEST);
    }

    #[test]
    fn init_destroy_round_trip() {
        let ep = Endpoint::new(test_settings(), Arc::new(CloseHandler)).unwrap();

        ep.init().unwrap();
        let addr = ep.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // init is idempotent
        ep.init().unwrap();
        assert_eq!(ep.local_addr().unwrap(), addr);

        ep.destroy();
        assert!(ep.local_addr().is_none());
        assert!(!ep.is_running());

        // a fresh lifetime works
        ep.init().unwrap();
        ep.destroy();
    }

    #[test]
    fn port_reopens_after_destroy() {
        let ep = Endpoint::new(test_settings(), Arc::new(CloseHandler)).unwrap();

        ep.start().unwrap();
        let port = ep.local_addr().unwrap().port();

        ep.stop();
        ep.destroy();

        // the released port can be bound again
        let mut settings = test_settings();
        settings.port = port;

        let ep = Endpoint::new(settings, Arc::new(CloseHandler)).unwrap();
        ep.start().unwrap();
        assert_eq!(ep.local_addr().unwrap().port(), port);

        ep.stop();
        ep.destroy();
    }

    #[test]
    fn failed_init_requires_destroy() {
        let mut settings = test_settings();
        settings.ssl_enabled = true;
        settings.ssl_protocol = "SSLv3+bogus".to_string();

        let ep = Endpoint::new(settings, Arc::new(CloseHandler)).unwrap();

        let e = ep.init().unwrap_err();
        assert!(e.to_string().contains("invalid SSL protocol"));

        // retrying without destroy is refused
        assert!(matches!(ep.init().unwrap_err(), Error::PreviousInitFailed));

        ep.destroy();

        // after destroy, init runs again (and fails for the original reason)
        assert!(matches!(ep.init().unwrap_err(), Error::Tls(_)));
    }

    #[test]
    fn tls_disables_sendfile() {
        let mut settings = test_settings();
        settings.ssl_enabled = true;
        settings.use_sendfile = true;

        let ep = Endpoint::new(settings, Arc::new(CloseHandler)).unwrap();
        ep.init().unwrap();

        assert!(!ep.sendfile_enabled());

        ep.destroy();
    }

    #[test]
    fn request_close_cycle() {
        let ep = Endpoint::new(test_settings(), Arc::new(CloseHandler)).unwrap();
        ep.start().unwrap();

        let addr = ep.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"hello\n").unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();

        // response received and socket closed by the endpoint
        assert_eq!(response, b"ok");

        assert!(wait_for(
            || ep.current_threads_busy() == Some(0),
            Duration::from_secs(5)
        ));

        // the stack accounting holds up
        assert_eq!(
            ep.core.workers.cur_threads(),
            ep.core.workers.idle_count() + ep.core.workers.cur_threads_busy()
        );

        ep.stop();
        ep.destroy();
    }

    #[test]
    fn keep_alive_serves_multiple_requests() {
        let ep = Endpoint::new(test_settings(), Arc::new(EchoHandler)).unwrap();
        ep.start().unwrap();

        let addr = ep.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();

        for msg in [&b"first"[..], &b"second"[..], &b"third"[..]] {
            client.write_all(msg).unwrap();

            let mut buf = vec![0u8; msg.len()];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(buf, msg);
        }

        // between requests the socket parks in a poller
        assert!(wait_for(|| ep.keep_alive_count() == 1, Duration::from_secs(5)));

        ep.stop();
        ep.destroy();
    }

    #[test]
    fn keep_alive_timeout_destroys_socket() {
        let mut settings = test_settings();
        settings.so_timeout = 1000;
        settings.keep_alive_timeout = 50;

        let ep = Endpoint::new(settings, Arc::new(EchoHandler)).unwrap();
        ep.start().unwrap();

        let addr = ep.local_addr().unwrap();

        // connect and send nothing: the socket parks in a poller and the
        // maintain sweep expires it
        let mut client = TcpStream::connect(addr).unwrap();

        assert!(wait_for(|| ep.keep_alive_count() == 1, Duration::from_secs(5)));

        let mut buf = [0u8; 16];
        client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        assert!(wait_for(|| ep.keep_alive_count() == 0, Duration::from_secs(5)));

        ep.stop();
        ep.destroy();
    }

    #[test]
    fn pause_resume_idempotent() {
        let ep = Endpoint::new(test_settings(), Arc::new(CloseHandler)).unwrap();
        ep.start().unwrap();

        ep.pause();
        ep.pause();
        assert!(ep.is_paused());
        assert!(ep.is_running());

        ep.resume();
        ep.resume();
        assert!(!ep.is_paused());

        // the endpoint still serves after the cycle. the acceptor may sleep
        // up to a second before noticing the resume
        let addr = ep.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"ok");

        ep.stop();
        ep.destroy();

        assert!(!ep.is_running());
        assert!(!ep.is_paused());
    }

    struct GatedHandler {
        started: AtomicUsize,
        gate: AtomicBool,
    }

    impl Handler for GatedHandler {
        fn process(&self, conn: &mut Conn) -> SocketState {
            let mut buf = [0u8; 16];

            if conn.read(&mut buf).is_err() {
                return SocketState::Closed;
            }

            self.started.fetch_add(1, Ordering::SeqCst);

            while !self.gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }

            let _ = conn.write_all(b"ok");

            SocketState::Closed
        }
    }

    #[test]
    fn worker_pool_bounds_dispatch() {
        let mut settings = test_settings();
        settings.max_threads = 2;

        let handler = Arc::new(GatedHandler {
            started: AtomicUsize::new(0),
            gate: AtomicBool::new(false),
        });

        let ep = Endpoint::new(settings, Arc::clone(&handler) as Arc<dyn Handler>).unwrap();
        ep.start().unwrap();

        let addr = ep.local_addr().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(b"go").unwrap();
            clients.push(client);
        }

        // both workers get busy; the third request has no worker to run on
        assert!(wait_for(
            || handler.started.load(Ordering::SeqCst) == 2,
            Duration::from_secs(5)
        ));
        assert_eq!(ep.current_threads_busy(), Some(2));

        thread::sleep(Duration::from_millis(200));
        assert_eq!(handler.started.load(Ordering::SeqCst), 2);

        // opening the gate lets the first two finish and the third proceed
        handler.gate.store(true, Ordering::SeqCst);

        for client in &mut clients {
            let mut response = Vec::new();
            client.read_to_end(&mut response).unwrap();
            assert_eq!(response, b"ok");
        }

        assert!(wait_for(
            || ep.current_threads_busy() == Some(0),
            Duration::from_secs(5)
        ));

        ep.stop();
        ep.destroy();
    }

    #[test]
    fn unbounded_workers_never_block() {
        let mut settings = test_settings();
        settings.max_threads = -1;

        let ep = Endpoint::new(settings, Arc::new(CloseHandler)).unwrap();
        ep.start().unwrap();

        let addr = ep.local_addr().unwrap();

        let mut clients = Vec::new();
        for _ in 0..5 {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(b"x").unwrap();
            clients.push(client);
        }

        for client in &mut clients {
            let mut response = Vec::new();
            client.read_to_end(&mut response).unwrap();
            assert_eq!(response, b"ok");
        }

        ep.stop();
        ep.destroy();
    }

    struct ThreadExecutor;

    impl Executor for ThreadExecutor {
        fn execute(&self, task: Task) {
            thread::spawn(task);
        }
    }

    #[test]
    fn external_executor_dispatch() {
        let ep = Endpoint::new(test_settings(), Arc::new(CloseHandler)).unwrap();
        ep.set_executor(Arc::new(ThreadExecutor));
        ep.start().unwrap();

        assert_eq!(ep.current_thread_count(), None);
        assert_eq!(ep.current_threads_busy(), None);

        let addr = ep.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"ok");

        ep.stop();
        ep.destroy();
    }

    #[cfg(target_os = "linux")]
    mod sendfile_tests {
        use super::*;
        use socket2::{Domain, Protocol, SockRef, Socket, Type};
        use std::io::Write as _;

        fn connected_pair() -> (Conn, TcpStream) {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();

            let client = TcpStream::connect(addr).unwrap();
            let (server, peer_addr) = listener.accept().unwrap();

            (Conn::new(server, peer_addr), client)
        }

        /// A pair with tiny kernel buffers on both sides, so a bulk write
        /// is guaranteed to hit EAGAIN.
        fn small_buffer_pair() -> (Conn, TcpStream) {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();

            let client_socket =
                Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
            client_socket.set_recv_buffer_size(4096).unwrap();
            client_socket.connect(&addr.into()).unwrap();
            let client: TcpStream = client_socket.into();

            let (server, peer_addr) = listener.accept().unwrap();
            SockRef::from(&server).set_send_buffer_size(4096).unwrap();

            (Conn::new(server, peer_addr), client)
        }

        #[test]
        fn small_file_completes_inline() {
            let mut settings = test_settings();
            settings.use_sendfile = true;

            let ep = Endpoint::new(settings, Arc::new(CloseHandler)).unwrap();
            ep.start().unwrap();
            assert!(ep.sendfile_enabled());

            let mut file = tempfile::NamedTempFile::new().unwrap();
            let body = vec![b'a'; 1024];
            file.write_all(&body).unwrap();
            file.flush().unwrap();

            let (conn, mut client) = connected_pair();

            let data = SendfileData::new(file.path().to_path_buf(), 0, 1024, false, conn);

            match ep.add_sendfile(data) {
                SendfileStatus::Done(conn) => drop(conn),
                SendfileStatus::Pending => {}
                SendfileStatus::Failed(_) => panic!("sendfile failed"),
            }

            let mut received = Vec::new();
            client.read_to_end(&mut received).unwrap();
            assert_eq!(received, body);

            ep.stop();
            ep.destroy();
        }

        #[test]
        fn large_file_falls_through_to_poll_loop() {
            let mut settings = test_settings();
            settings.use_sendfile = true;

            let ep = Endpoint::new(settings, Arc::new(EchoHandler)).unwrap();
            ep.start().unwrap();

            let mut file = tempfile::NamedTempFile::new().unwrap();
            let body: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
            file.write_all(&body).unwrap();
            file.flush().unwrap();

            let (conn, mut client) = small_buffer_pair();

            let data = SendfileData::new(
                file.path().to_path_buf(),
                0,
                body.len() as u64,
                true,
                conn,
            );

            // the inline loop fills the tiny buffers and hits EAGAIN
            assert!(matches!(ep.add_sendfile(data), SendfileStatus::Pending));

            // read everything; the poll loop finishes the transfer
            let mut received = vec![0u8; body.len()];
            client.read_exact(&mut received).unwrap();
            assert_eq!(received, body);

            assert!(wait_for(|| ep.sendfile_count() == 0, Duration::from_secs(5)));

            // keep_alive: the socket is re-registered with a normal poller
            // instead of being closed
            assert!(wait_for(|| ep.keep_alive_count() == 1, Duration::from_secs(5)));

            ep.stop();
            ep.destroy();
        }
    }
}
