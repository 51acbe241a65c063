//! # braid-router
//!
//! The router core of the braid tunneling mesh. A [`Router`] is
//! simultaneously:
//!
//! - a **client**: [`Router::login`] authenticates outbound channels to
//!   named peers;
//! - a **server**: [`Router::listen`] accepts and authenticates inbound
//!   channels;
//! - a **relay**: frames arriving on one channel are forwarded to the
//!   paired endpoint recorded in the session table.
//!
//! Sessions are established along `->` path expressions
//! (`master->slaver->tcp://host:port`): each hop forwards a `Dial` frame to
//! the next peer, the terminal hop dials the raw target, and a `DialBack`
//! acknowledgement propagates back before any stream bytes flow.
//!
//! Channels to the same peer name form a **bond** and are load-balanced by
//! least-used selection; a heartbeat task reaps channels that go silent.

mod bond;
mod channel;
mod dialer;
mod router;
mod state;
mod table;

pub use channel::ChannelId;
pub use dialer::{BoxedStream, RawDialer, RawStream, TcpRawDialer};
pub use router::{BondHandle, ChannelOptions, Router, RouterConfig};
pub use state::{BondState, ChannelState, EndpointState, RouterState, SessionState};

pub use braid_common::{BraidError, Result};
