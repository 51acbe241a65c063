//! # braid-common
//!
//! Shared components for the braid tunneling mesh.
//!
//! This crate contains:
//! - Wire protocol definitions and the frame codec
//! - Path expression parsing
//! - Shared error definitions
//!
//! The common crate is designed to be minimal and stable: every node in a
//! mesh must agree on the frame layout, so changes here are wire changes.

pub mod error;
pub mod path;
pub mod protocol;

// Re-export commonly used items at crate root
pub use error::{BraidError, Result};
pub use protocol::codec::FrameCodec;
pub use protocol::frame::{Command, Frame, LoginReply, LoginRequest};
