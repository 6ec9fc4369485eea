//! Per-connection protocol state machine.
//!
//! A connection registers a nickname, then sends length-prefixed messages
//! indefinitely. The machine is advanced strictly by "n bytes arrived"
//! events: the caller reads into [`Session::read_target`] and reports the
//! count to [`Session::advance`]. It performs no I/O itself, so partial TCP
//! delivery (one byte at a time) exercises exactly the same transitions as
//! a single full read.

use bytes::BytesMut;

use crate::codec::{self, FrameError, MAX_MESSAGE, MAX_NICKNAME};

/// What a connection expects to receive next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The single nickname-length byte.
    NicknameLength,
    /// The remaining bytes of the nickname.
    Nickname,
    /// The single message-length byte.
    MessageLength,
    /// The remaining bytes of the current message.
    Message,
}

/// Peer violated the wire protocol; the connection is closed in response.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared nickname length exceeds [`MAX_NICKNAME`]. The declared
    /// length is never used as a receive size.
    NicknameTooLong(u8),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::NicknameTooLong(n) => {
                write!(f, "declared nickname length {n} exceeds the {MAX_NICKNAME}-byte limit")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Outcome of feeding received bytes into the machine.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// The current phase still needs more bytes.
    Continue,
    /// Registration completed; [`Session::nickname`] is now final.
    Registered,
    /// A complete message arrived; [`Session::frame`] yields the broadcast
    /// frame until the next `advance` call.
    MessageReady,
}

/// Receive-progress state for one connection.
///
/// Owned by exactly one worker while that connection's completion is being
/// serviced; it travels through the slot pool between workers.
#[derive(Debug)]
pub struct Session {
    phase: Phase,
    nickname: [u8; MAX_NICKNAME],
    nickname_len: u8,
    /// Message-length byte of the message currently being received.
    expected: u8,
    /// Progress toward the current phase's target.
    received: usize,
    /// Staging for the two single-byte length reads.
    len_byte: [u8; 1],
    message: [u8; MAX_MESSAGE],
}

impl Session {
    /// A fresh connection awaits its nickname-length byte.
    pub fn new() -> Self {
        Session {
            phase: Phase::NicknameLength,
            nickname: [0; MAX_NICKNAME],
            nickname_len: 0,
            expected: 0,
            received: 0,
            len_byte: [0],
            message: [0; MAX_MESSAGE],
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The registered nickname. Only meaningful once `advance` has returned
    /// [`Step::Registered`]; before that it is empty.
    pub fn nickname(&self) -> &[u8] {
        &self.nickname[..self.nickname_len as usize]
    }

    /// Bytes still required to complete the current phase.
    ///
    /// Zero-length nicknames and messages make this 0; the caller must then
    /// call `advance(0)` without touching the socket, so an empty field is
    /// never confused with an end-of-stream read.
    pub fn wanted(&self) -> usize {
        match self.phase {
            Phase::NicknameLength | Phase::MessageLength => 1,
            Phase::Nickname => self.nickname_len as usize - self.received,
            Phase::Message => self.expected as usize - self.received,
        }
    }

    /// Buffer region the next received bytes must land in.
    pub fn read_target(&mut self) -> &mut [u8] {
        match self.phase {
            Phase::NicknameLength | Phase::MessageLength => &mut self.len_byte,
            Phase::Nickname => &mut self.nickname[self.received..self.nickname_len as usize],
            Phase::Message => &mut self.message[self.received..self.expected as usize],
        }
    }

    /// Advance the machine on "`n` bytes arrived" (into `read_target`).
    pub fn advance(&mut self, n: usize) -> Result<Step, ProtocolError> {
        match self.phase {
            Phase::NicknameLength => {
                debug_assert_eq!(n, 1);
                let declared = self.len_byte[0];
                if declared as usize > MAX_NICKNAME {
                    return Err(ProtocolError::NicknameTooLong(declared));
                }
                self.nickname_len = declared;
                self.received = 0;
                self.phase = Phase::Nickname;
                // An empty nickname completes on the caller's next
                // zero-byte advance.
                Ok(Step::Continue)
            }
            Phase::Nickname => {
                self.received += n;
                if self.received == self.nickname_len as usize {
                    self.phase = Phase::MessageLength;
                    Ok(Step::Registered)
                } else {
                    Ok(Step::Continue)
                }
            }
            Phase::MessageLength => {
                debug_assert_eq!(n, 1);
                self.expected = self.len_byte[0];
                self.received = 0;
                self.phase = Phase::Message;
                Ok(Step::Continue)
            }
            Phase::Message => {
                self.received += n;
                if self.received == self.expected as usize {
                    // `expected` and the message bytes stay valid for
                    // `frame` until the next length byte arrives.
                    self.phase = Phase::MessageLength;
                    Ok(Step::MessageReady)
                } else {
                    Ok(Step::Continue)
                }
            }
        }
    }

    /// Broadcast frame for the message that just completed.
    pub fn frame(&self) -> Result<BytesMut, FrameError> {
        codec::encode_frame(self.nickname(), &self.message[..self.expected as usize])
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
