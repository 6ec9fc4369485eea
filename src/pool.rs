//! Fixed-capacity client slot pool.
//!
//! Exactly [`MAX_CLIENTS`] connections can be live at once; the cap is an
//! explicit design constant, not a tunable. Slots live in a slab guarded by
//! a single mutex, which is the only cross-thread mutable state in the
//! server: allocation, release, nickname recording, and the entire
//! broadcast fan-out all happen under it.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use slab::Slab;
use tracing::{debug, warn};

use crate::broadcast;
use crate::codec::MAX_NICKNAME;
use crate::session::Session;

/// Hard cap on concurrently connected clients.
pub const MAX_CLIENTS: usize = 62;

/// One live connection.
pub struct ClientSlot {
    stream: Arc<TcpStream>,
    fd: RawFd,
    nickname: [u8; MAX_NICKNAME],
    nickname_len: u8,
    registered: bool,
    /// Receive state; `None` while a worker has it checked out.
    session: Option<Box<Session>>,
}

impl ClientSlot {
    /// The registered nickname, for lifecycle logging.
    fn nickname(&self) -> &[u8] {
        &self.nickname[..self.nickname_len as usize]
    }
}

/// Why a connection could not be admitted. Either way the connection is
/// closed by the time the error is returned.
#[derive(Debug)]
pub enum AllocError {
    /// All [`MAX_CLIENTS`] slots are taken.
    Full,
    /// The connection could not be attached to the readiness poll.
    Attach(io::Error),
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocError::Full => write!(f, "client pool full ({MAX_CLIENTS} slots)"),
            AllocError::Attach(e) => write!(f, "couldn't attach connection to the poll: {e}"),
        }
    }
}

impl std::error::Error for AllocError {}

/// The pool of client slots.
pub struct ClientPool {
    slots: Mutex<Slab<ClientSlot>>,
    registry: Registry,
}

impl ClientPool {
    /// Pool whose connections report readiness through `registry`.
    pub fn new(registry: Registry) -> Self {
        ClientPool {
            slots: Mutex::new(Slab::with_capacity(MAX_CLIENTS)),
            registry,
        }
    }

    /// Admit a connection: reserve a slot, seed a fresh [`Session`], and
    /// register the socket for readiness under the slot's key.
    ///
    /// On failure the connection is closed (dropped) before returning.
    pub fn allocate(&self, stream: TcpStream) -> Result<usize, AllocError> {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() >= MAX_CLIENTS {
            return Err(AllocError::Full);
        }

        let fd = stream.as_raw_fd();
        let key = slots.insert(ClientSlot {
            stream: Arc::new(stream),
            fd,
            nickname: [0; MAX_NICKNAME],
            nickname_len: 0,
            registered: false,
            session: Some(Box::new(Session::new())),
        });

        if let Err(e) = self
            .registry
            .register(&mut SourceFd(&fd), Token(key), Interest::READABLE)
        {
            slots.remove(key);
            return Err(AllocError::Attach(e));
        }

        Ok(key)
    }

    /// Release a slot: detach from the poll, close the connection, free the
    /// entry. Releasing an already-free slot is a no-op.
    pub fn release(&self, key: usize) {
        let mut slots = self.slots.lock().unwrap();
        let Some(slot) = slots.try_remove(key) else {
            return;
        };
        if let Err(e) = self.registry.deregister(&mut SourceFd(&slot.fd)) {
            debug!(client = key, error = %e, "couldn't detach connection from the poll");
        }
        if slot.registered {
            debug!(
                client = key,
                nickname = %String::from_utf8_lossy(slot.nickname()),
                "client slot released"
            );
        } else {
            debug!(client = key, "client slot released");
        }
        // Dropping the slot drops the last pool-held reference; the socket
        // closes once the servicing worker lets go of its clone.
    }

    /// Take exclusive ownership of a slot's receive state.
    ///
    /// `None` when the slot is free or another worker already holds the
    /// session; either way the caller has nothing to service.
    pub fn checkout(&self, key: usize) -> Option<(Arc<TcpStream>, Box<Session>)> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(key)?;
        let session = slot.session.take()?;
        Some((Arc::clone(&slot.stream), session))
    }

    /// Hand a session back after a drain pass. A slot released while its
    /// session was out simply discards it.
    pub fn checkin(&self, key: usize, session: Box<Session>) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(key) {
            slot.session = Some(session);
        }
    }

    /// Record the nickname once registration completes. Set once; the slot
    /// keeps it for lifecycle logging until release.
    pub fn set_nickname(&self, key: usize, nickname: &[u8]) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(key) {
            let len = nickname.len().min(MAX_NICKNAME);
            slot.nickname[..len].copy_from_slice(&nickname[..len]);
            slot.nickname_len = len as u8;
            slot.registered = true;
        }
    }

    /// Deliver `frame` to every active client, sender included.
    ///
    /// The pool lock is held across all sends: broadcasts reach every
    /// client in slot order and never interleave. Per-client failures are
    /// logged and skipped. Returns the number of full-frame deliveries.
    pub fn broadcast(&self, frame: &[u8]) -> usize {
        debug_assert!(frame.len() <= crate::codec::MAX_FRAME);
        let slots = self.slots.lock().unwrap();
        let mut delivered = 0;
        for (key, slot) in slots.iter() {
            match broadcast::send_all(&slot.stream, slot.fd, frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(client = key, error = %e, "couldn't send message to client");
                }
            }
        }
        delivered
    }

    /// Number of currently occupied slots.
    pub fn active_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn test_pool() -> (ClientPool, mio::Poll) {
        let poll = mio::Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        (ClientPool::new(registry), poll)
    }

    /// Established loopback connection as a non-blocking mio stream, plus
    /// the peer end to keep it alive.
    fn connect(listener: &TcpListener) -> (TcpStream, std::net::TcpStream) {
        let ours = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        ours.set_nonblocking(true).unwrap();
        (TcpStream::from_std(ours), peer)
    }

    #[test]
    fn test_pool_capacity_is_exact() {
        let (pool, _poll) = test_pool();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut peers = Vec::new();

        for _ in 0..MAX_CLIENTS {
            let (stream, peer) = connect(&listener);
            pool.allocate(stream).unwrap();
            peers.push(peer);
        }
        assert_eq!(pool.active_count(), MAX_CLIENTS);

        let (stream, _peer) = connect(&listener);
        assert!(matches!(pool.allocate(stream), Err(AllocError::Full)));
        assert_eq!(pool.active_count(), MAX_CLIENTS);
    }

    #[test]
    fn test_release_frees_slot_for_reuse() {
        let (pool, _poll) = test_pool();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let (stream, _peer_a) = connect(&listener);
        let key = pool.allocate(stream).unwrap();

        pool.release(key);
        assert_eq!(pool.active_count(), 0);

        // Releasing again is a no-op.
        pool.release(key);

        let (stream, _peer_b) = connect(&listener);
        let reused = pool.allocate(stream).unwrap();
        assert_eq!(reused, key);
    }

    #[test]
    fn test_checkout_is_exclusive() {
        let (pool, _poll) = test_pool();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let (stream, _peer) = connect(&listener);
        let key = pool.allocate(stream).unwrap();

        let (stream, session) = pool.checkout(key).unwrap();
        assert!(pool.checkout(key).is_none());

        pool.checkin(key, session);
        assert!(pool.checkout(key).is_some());
        drop(stream);
    }

    #[test]
    fn test_checkout_of_free_slot_is_none() {
        let (pool, _poll) = test_pool();
        assert!(pool.checkout(0).is_none());
    }

    #[test]
    fn test_broadcast_reaches_all_active() {
        use std::io::Read;

        let (pool, _poll) = test_pool();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let (stream_a, mut peer_a) = connect(&listener);
        let (stream_b, mut peer_b) = connect(&listener);
        pool.allocate(stream_a).unwrap();
        pool.allocate(stream_b).unwrap();

        let frame = b"\x05alice\x02hi";
        assert_eq!(pool.broadcast(frame), 2);

        for peer in [&mut peer_a, &mut peer_b] {
            let mut got = [0u8; 9];
            peer.read_exact(&mut got).unwrap();
            assert_eq!(&got, frame);
        }
    }

    #[test]
    fn test_broadcast_skips_released() {
        use std::io::Read;

        let (pool, _poll) = test_pool();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let (stream_a, _peer_a) = connect(&listener);
        let (stream_b, mut peer_b) = connect(&listener);
        let key_a = pool.allocate(stream_a).unwrap();
        pool.allocate(stream_b).unwrap();

        pool.release(key_a);

        let frame = b"\x03bob\x00";
        assert_eq!(pool.broadcast(frame), 1);

        let mut got = [0u8; 5];
        peer_b.read_exact(&mut got).unwrap();
        assert_eq!(&got, frame);
    }
}
