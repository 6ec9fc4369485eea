//! Wire framing for the chat relay.
//!
//! Every unit on the wire is a single-byte length prefix followed by that
//! many payload bytes:
//! - registration (client to server): `[nickname_len: u8][nickname]`
//! - chat message (client to server): `[message_len: u8][message]`
//! - broadcast (server to every client):
//!   `[nickname_len: u8][nickname][message_len: u8][message]`
//!
//! Zero-length nicknames and messages are legal; nothing here special-cases
//! them. This module is pure encode/decode and performs no I/O.

use bytes::{BufMut, BytesMut};

/// Longest nickname a client may register.
pub const MAX_NICKNAME: usize = 32;

/// Longest message payload (bounded by the single-byte length prefix).
pub const MAX_MESSAGE: usize = 255;

/// Largest possible broadcast frame:
/// `[nickname_len][nickname][message_len][message]`.
pub const MAX_FRAME: usize = 1 + MAX_NICKNAME + 1 + MAX_MESSAGE;

/// Framing errors.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Nickname longer than [`MAX_NICKNAME`].
    NicknameTooLong(usize),
    /// Message longer than [`MAX_MESSAGE`].
    MessageTooLong(usize),
    /// Input ended before the lengths it declares were satisfied.
    Truncated,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::NicknameTooLong(n) => {
                write!(f, "nickname of {n} bytes exceeds the {MAX_NICKNAME}-byte limit")
            }
            FrameError::MessageTooLong(n) => {
                write!(f, "message of {n} bytes exceeds the {MAX_MESSAGE}-byte limit")
            }
            FrameError::Truncated => write!(f, "frame shorter than its declared lengths"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Compose a broadcast frame from a registered nickname and a complete
/// message.
///
/// The frame is built by bounds-checked concatenation into a fresh buffer;
/// callers never see a partially initialized frame.
pub fn encode_frame(nickname: &[u8], message: &[u8]) -> Result<BytesMut, FrameError> {
    if nickname.len() > MAX_NICKNAME {
        return Err(FrameError::NicknameTooLong(nickname.len()));
    }
    if message.len() > MAX_MESSAGE {
        return Err(FrameError::MessageTooLong(message.len()));
    }

    let mut frame = BytesMut::with_capacity(2 + nickname.len() + message.len());
    frame.put_u8(nickname.len() as u8);
    frame.put_slice(nickname);
    frame.put_u8(message.len() as u8);
    frame.put_slice(message);
    Ok(frame)
}

/// Split a broadcast frame back into its `(nickname, message)` fields.
///
/// Rejects frames that are shorter than their declared lengths, carry an
/// over-long nickname, or have trailing bytes.
pub fn decode_frame(frame: &[u8]) -> Result<(&[u8], &[u8]), FrameError> {
    let (&nickname_len, rest) = frame.split_first().ok_or(FrameError::Truncated)?;
    let nickname_len = nickname_len as usize;
    if nickname_len > MAX_NICKNAME {
        return Err(FrameError::NicknameTooLong(nickname_len));
    }
    if rest.len() < nickname_len {
        return Err(FrameError::Truncated);
    }
    let (nickname, rest) = rest.split_at(nickname_len);

    let (&message_len, rest) = rest.split_first().ok_or(FrameError::Truncated)?;
    if rest.len() != message_len as usize {
        return Err(FrameError::Truncated);
    }

    Ok((nickname, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_lengths() {
        for nickname_len in 0..=MAX_NICKNAME {
            for message_len in 0..=MAX_MESSAGE {
                let nickname = vec![b'n'; nickname_len];
                let message = vec![b'm'; message_len];

                let frame = encode_frame(&nickname, &message).unwrap();
                assert_eq!(frame.len(), 2 + nickname_len + message_len);

                let (n, m) = decode_frame(&frame).unwrap();
                assert_eq!(n, &nickname[..]);
                assert_eq!(m, &message[..]);
            }
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(b"alice", b"hi").unwrap();
        assert_eq!(&frame[..], b"\x05alice\x02hi");
    }

    #[test]
    fn test_empty_fields_are_legal() {
        let frame = encode_frame(b"", b"").unwrap();
        assert_eq!(&frame[..], b"\x00\x00");
        assert_eq!(decode_frame(&frame).unwrap(), (&b""[..], &b""[..]));
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let long_nickname = [0u8; MAX_NICKNAME + 1];
        assert_eq!(
            encode_frame(&long_nickname, b"hi"),
            Err(FrameError::NicknameTooLong(MAX_NICKNAME + 1))
        );

        let long_message = vec![0u8; MAX_MESSAGE + 1];
        assert_eq!(
            encode_frame(b"bob", &long_message),
            Err(FrameError::MessageTooLong(MAX_MESSAGE + 1))
        );
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert_eq!(decode_frame(b""), Err(FrameError::Truncated));
        assert_eq!(decode_frame(b"\x05ali"), Err(FrameError::Truncated));
        assert_eq!(decode_frame(b"\x05alice"), Err(FrameError::Truncated));
        assert_eq!(decode_frame(b"\x05alice\x05hi"), Err(FrameError::Truncated));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        assert_eq!(decode_frame(b"\x05alice\x02hi!"), Err(FrameError::Truncated));
    }

    #[test]
    fn test_decode_rejects_oversize_nickname() {
        let mut frame = vec![33u8];
        frame.extend_from_slice(&[b'x'; 33]);
        frame.push(0);
        assert_eq!(decode_frame(&frame), Err(FrameError::NicknameTooLong(33)));
    }

    #[test]
    fn test_max_frame_constant() {
        let nickname = [b'n'; MAX_NICKNAME];
        let message = [b'm'; MAX_MESSAGE];
        let frame = encode_frame(&nickname, &message).unwrap();
        assert_eq!(frame.len(), MAX_FRAME);
    }
}
