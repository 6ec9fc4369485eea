//! Broadcast send machinery.
//!
//! A broadcast delivers one frame to every active client, sender included.
//! Delivery is fully buffered per client: partial writes are retried until
//! the whole frame is on the wire or the client's transport fails. The
//! sockets are non-blocking (they belong to the readiness poll), so a full
//! kernel send buffer is waited out with `poll(2)` on `POLLOUT`, which
//! restores the blocking-send semantics the relay's ordering model assumes.
//!
//! The caller (the slot pool) holds the pool lock for the whole fan-out, so
//! two broadcasts never interleave their bytes on the wire and arrive in
//! the same relative order at every client. A slow client therefore delays
//! everyone; a deliberate trade-off at the 62-client scale.

use std::io::{self, Write};
use std::os::unix::io::RawFd;

use mio::net::TcpStream;

/// Write the entire frame to one client, waiting out `WouldBlock`.
pub fn send_all(mut stream: &TcpStream, fd: RawFd, frame: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < frame.len() {
        match stream.write(&frame[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned 0",
                ));
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => wait_writable(fd)?,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Block until `fd` accepts more output.
fn wait_writable(fd: RawFd) -> io::Result<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;

    /// Loopback pair: a non-blocking mio stream on our side, a blocking
    /// std stream on the peer side.
    fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ours = std::net::TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        ours.set_nonblocking(true).unwrap();
        (TcpStream::from_std(ours), peer)
    }

    #[test]
    fn test_send_all_delivers_frame() {
        let (ours, mut peer) = stream_pair();
        let frame = b"\x05alice\x02hi";

        send_all(&ours, ours.as_raw_fd(), frame).unwrap();

        let mut got = [0u8; 9];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, frame);
    }

    #[test]
    fn test_send_all_survives_full_send_buffer() {
        let (ours, mut peer) = stream_pair();

        // Large enough to overrun the kernel send buffer, forcing the
        // WouldBlock + POLLOUT path while the peer drains slowly.
        let frame = vec![0xabu8; 4 * 1024 * 1024];
        let expected = frame.len();

        let reader = std::thread::spawn(move || {
            let mut total = 0;
            let mut chunk = [0u8; 64 * 1024];
            loop {
                match peer.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(e) => panic!("peer read failed: {e}"),
                }
                if total == expected {
                    break;
                }
            }
            total
        });

        send_all(&ours, ours.as_raw_fd(), &frame).unwrap();
        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn test_send_all_reports_broken_peer() {
        let (ours, peer) = stream_pair();
        drop(peer);

        // The first writes may land in the kernel buffer; keep pushing
        // until the broken pipe surfaces.
        let frame = vec![0u8; 1024 * 1024];
        let mut result = Ok(());
        for _ in 0..64 {
            result = send_all(&ours, ours.as_raw_fd(), &frame);
            if result.is_err() {
                break;
            }
        }
        assert!(result.is_err());
    }
}
