//! Wire protocol definitions for braid
//!
//! ## Frame Format
//!
//! ```text
//! +--------+--------+--------+--------+--------+-- - - - --+-- - - - --+
//! | Length (4 bytes, big-endian)     | Cmd    | Sid (8 BE) | Payload   |
//! +--------+--------+--------+--------+--------+-- - - - --+-- - - - --+
//! ```
//!
//! The length field counts every byte after itself: one command byte, eight
//! session-id bytes, and the payload. The smallest legal frame is therefore
//! a 9-byte body (an empty-payload Heartbeat).
//!
//! The protocol carries no transport security of its own; peers authenticate
//! with a name/token login exchange and everything after that is plaintext.

pub mod codec;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::{Command, Frame, LoginReply, LoginRequest};

/// Width of the length prefix
pub const LENGTH_FIELD_LEN: usize = 4;

/// Minimum frame body: command byte + session id
pub const MIN_FRAME_LEN: usize = 1 + 8;

/// Default upper bound on a frame body (1 MiB)
///
/// Large enough for any relay read, small enough to keep one misbehaving
/// peer from ballooning memory.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// DialBack payload on success; anything else is an error message
pub const DIAL_BACK_OK: &str = "OK";
