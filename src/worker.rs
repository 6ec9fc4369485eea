//! Worker pool: services completion notifications.
//!
//! Each worker blocks on the completion queue, checks out the ready
//! connection's session, and drives the protocol state machine: read
//! exactly the bytes the current phase wants, feed the count to the
//! machine, and react to what completes. A zero-byte read is a graceful
//! disconnect; a transport error is treated the same way. Both release the
//! slot. A drained socket (`WouldBlock`) parks the session back in the
//! pool unless readiness arrived mid-service, in which case the same
//! worker runs another pass.

use std::io::{self, Read};
use std::sync::Arc;

use mio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::pool::ClientPool;
use crate::queue::CompletionQueue;
use crate::session::{Session, Step};

/// Worker thread body: drain the completion queue until it is closed.
pub fn run(id: usize, pool: Arc<ClientPool>, queue: Arc<CompletionQueue>) {
    debug!(worker = id, "worker ready");
    while let Some(key) = queue.recv() {
        service(key, &pool, &queue);
    }
    debug!(worker = id, "completion queue closed, worker exiting");
}

/// Service one completion notification for slot `key`.
fn service(key: usize, pool: &ClientPool, queue: &CompletionQueue) {
    loop {
        // Exclusive ownership of the receive state; a free slot or a
        // session already held elsewhere means nothing to do.
        let Some((stream, mut session)) = pool.checkout(key) else {
            return;
        };
        queue.begin(key);

        match drain(key, &stream, &mut session, pool) {
            Drained::WouldBlock => {
                // Park first, then consult the gate: readiness that lands
                // in between flips the gate and is picked up either by the
                // re-run below or by whoever re-checks out the session.
                pool.checkin(key, session);
                if !queue.finish(key) {
                    return;
                }
            }
            Drained::Closed => {
                pool.release(key);
                queue.reset(key);
                return;
            }
        }
    }
}

enum Drained {
    /// Socket has no more data for now; session was still live.
    WouldBlock,
    /// Connection ended (EOF, transport error, or protocol violation) and
    /// the slot must be released.
    Closed,
}

/// Feed the state machine until the socket runs dry or the connection
/// ends.
fn drain(key: usize, mut stream: &TcpStream, session: &mut Session, pool: &ClientPool) -> Drained {
    loop {
        let wanted = session.wanted();
        let n = if wanted == 0 {
            // Zero-length nickname or message: the phase completes without
            // touching the socket, so EOF stays unambiguous.
            0
        } else {
            match stream.read(session.read_target()) {
                Ok(0) => {
                    info!(client = key, "client disconnected");
                    return Drained::Closed;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Drained::WouldBlock;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Forcible resets and friends: same cleanup as a
                    // graceful disconnect.
                    info!(client = key, error = %e, phase = ?session.phase(), "client connection lost");
                    return Drained::Closed;
                }
            }
        };

        match session.advance(n) {
            Ok(Step::Continue) => {}
            Ok(Step::Registered) => {
                pool.set_nickname(key, session.nickname());
                info!(
                    client = key,
                    nickname = %String::from_utf8_lossy(session.nickname()),
                    "client registered"
                );
            }
            Ok(Step::MessageReady) => match session.frame() {
                Ok(frame) => {
                    let delivered = pool.broadcast(&frame);
                    info!(
                        client = key,
                        nickname = %String::from_utf8_lossy(session.nickname()),
                        bytes = frame.len(),
                        delivered,
                        "message relayed"
                    );
                }
                Err(e) => {
                    warn!(client = key, error = %e, "dropping unencodable message");
                    return Drained::Closed;
                }
            },
            Err(e) => {
                warn!(client = key, error = %e, "protocol violation, closing connection");
                return Drained::Closed;
            }
        }
    }
}
