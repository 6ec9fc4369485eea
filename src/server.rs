//! Server core: listener setup, the acceptor loop, and worker lifecycle.
//!
//! One listening socket per IP family (IPv4 `0.0.0.0`, IPv6 `::` with
//! `IPV6_V6ONLY` so the two never clash on the port); the server is viable
//! if at least one family binds. The acceptor thread runs the readiness
//! poll: its wait set multiplexes the listeners, the shutdown waker, and
//! every client socket. Client readiness is translated into completion
//! notifications for the worker pool; the acceptor itself only accepts.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, warn};

use crate::pool::{AllocError, ClientPool, MAX_CLIENTS};
use crate::queue::CompletionQueue;
use crate::worker;

/// Port used when the configured port is zero.
pub const DEFAULT_PORT: u16 = 3144;

// Client tokens are slot keys (0..MAX_CLIENTS); control tokens sit at the
// top of the token space.
const LISTENER_V4: Token = Token(usize::MAX - 2);
const LISTENER_V6: Token = Token(usize::MAX - 1);
const SHUTDOWN: Token = Token(usize::MAX);

/// Configuration the embedding layer hands to [`run`]. Zero values select
/// the defaults: port 3144, threads = logical processor count.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub port: u16,
    pub threads: usize,
}

/// External stop signal.
///
/// Created by the embedding layer and triggered from any thread; [`run`]
/// installs its poll waker here at startup so a trigger interrupts the
/// acceptor's wait.
pub struct Shutdown {
    triggered: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            triggered: AtomicBool::new(false),
            waker: Mutex::new(None),
        }
    }

    /// Request server shutdown. Idempotent.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::Release);
        if let Some(waker) = self.waker.lock().unwrap().as_ref() {
            if let Err(e) = waker.wake() {
                error!(error = %e, "couldn't wake the acceptor for shutdown");
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    fn install(&self, waker: Waker) {
        *self.waker.lock().unwrap() = Some(waker);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the relay until `shutdown` fires or setup fails.
///
/// This is the single entry point the startup layer calls; it blocks for
/// the server's whole lifetime. Per-connection failures never surface
/// here; only setup failures (no listening socket, no spawnable worker)
/// are fatal.
pub fn run(options: ServerOptions, shutdown: Arc<Shutdown>) -> io::Result<()> {
    let port = if options.port == 0 {
        DEFAULT_PORT
    } else {
        options.port
    };
    let threads = if options.threads == 0 {
        num_cpus()
    } else {
        options.threads
    };

    // The acceptor is one of the `threads`; the rest service completions.
    let worker_count = threads.saturating_sub(1);
    if worker_count == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "worker pool needs at least two threads",
        ));
    }

    let mut listeners = setup_listeners(port)?;

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);

    for (listener, token, family) in listeners.iter_mut() {
        poll.registry()
            .register(listener, *token, Interest::READABLE)?;
        info!(family = *family, port, "listening");
    }

    shutdown.install(Waker::new(poll.registry(), SHUTDOWN)?);

    let pool = Arc::new(ClientPool::new(poll.registry().try_clone()?));
    let queue = Arc::new(CompletionQueue::new(MAX_CLIENTS));

    let mut handles = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let pool = Arc::clone(&pool);
        let queue = Arc::clone(&queue);
        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker::run(id, pool, queue))?;
        handles.push(handle);
    }
    info!(workers = worker_count, "worker pool running");

    // A trigger that raced ahead of waker installation must not be lost.
    let result = if shutdown.is_triggered() {
        Ok(())
    } else {
        accept_loop(&mut poll, &mut events, &listeners, &pool, &queue, &shutdown)
    };

    info!("shutting down");
    queue.close();
    for handle in handles {
        let _ = handle.join();
    }
    info!("server stopped");
    result
}

/// The acceptor's multiplexed wait: listeners, shutdown waker, client
/// readiness.
fn accept_loop(
    poll: &mut Poll,
    events: &mut Events,
    listeners: &[(TcpListener, Token, &'static str)],
    pool: &Arc<ClientPool>,
    queue: &Arc<CompletionQueue>,
    shutdown: &Arc<Shutdown>,
) -> io::Result<()> {
    loop {
        if let Err(e) = poll.poll(events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                SHUTDOWN => {
                    if shutdown.is_triggered() {
                        info!("shutdown signal received");
                        return Ok(());
                    }
                }
                token @ (LISTENER_V4 | LISTENER_V6) => {
                    for (listener, listener_token, family) in listeners {
                        if *listener_token == token {
                            accept_ready(listener, family, pool, queue);
                        }
                    }
                }
                Token(key) => queue.notify(key),
            }
        }
    }
}

/// Accept until the listener runs dry.
fn accept_ready(
    listener: &TcpListener,
    family: &str,
    pool: &Arc<ClientPool>,
    queue: &Arc<CompletionQueue>,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => match pool.allocate(stream) {
                Ok(key) => {
                    queue.reset(key);
                    info!(
                        client = key,
                        peer = %peer,
                        clients = pool.active_count(),
                        "accepted connection"
                    );
                }
                Err(AllocError::Full) => {
                    // The connection was closed by the failed allocation;
                    // existing clients are unaffected.
                    warn!(peer = %peer, "client pool full, rejecting connection");
                }
                Err(AllocError::Attach(e)) => {
                    warn!(peer = %peer, error = %e, "couldn't admit connection");
                }
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!(family, error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Bind both address families; at least one must succeed.
fn setup_listeners(port: u16) -> io::Result<Vec<(TcpListener, Token, &'static str)>> {
    let mut listeners = Vec::with_capacity(2);

    match bind_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))) {
        Ok(listener) => listeners.push((listener, LISTENER_V4, "ipv4")),
        Err(e) => warn!(error = %e, "couldn't bind IPv4 listener"),
    }
    match bind_listener(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))) {
        Ok(listener) => listeners.push((listener, LISTENER_V6, "ipv6")),
        Err(e) => warn!(error = %e, "couldn't bind IPv6 listener"),
    }

    if listeners.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "couldn't establish any listening socket",
        ));
    }
    Ok(listeners)
}

/// Create a non-blocking listener for one family. The IPv6 socket is
/// restricted to IPv6 traffic so both families can share the port.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into()))
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listener_both_families() {
        // Ephemeral ports so the test never collides.
        let v4 = bind_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).unwrap();
        assert!(v4.local_addr().unwrap().is_ipv4());

        let v6 = bind_listener(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))).unwrap();
        assert!(v6.local_addr().unwrap().is_ipv6());
    }

    #[test]
    fn test_families_share_a_port() {
        let v4 = bind_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).unwrap();
        let port = v4.local_addr().unwrap().port();

        // IPV6_V6ONLY keeps the v6 bind from clashing with the v4 one.
        let v6 = bind_listener(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))).unwrap();
        assert_eq!(v6.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_zero_workers_is_a_setup_error() {
        let shutdown = Arc::new(Shutdown::new());
        let err = run(ServerOptions { port: 1, threads: 1 }, shutdown).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
