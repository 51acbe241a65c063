//! Session and pending-dial tables
//!
//! The session table is the single authoritative registry of relayed
//! streams, keyed by `(endpoint id, sid)`. Every active session is two
//! symmetric entries (forward and reverse) inserted and removed together,
//! so a lookup from either side finds its peer in one step.
//!
//! A pending dial is a half-open session: the Dial frame has been forwarded
//! but no DialBack has come home yet. Pendings are keyed by the forwarded
//! side `(next channel, local sid)`; a key never exists in both tables at
//! once.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use braid_common::Result;

use crate::channel::{Channel, ChannelId, Link};
use crate::dialer::BoxedStream;

/// The peer side of one session entry
#[derive(Clone)]
pub(crate) struct SessionHalf {
    pub peer: Link,
    pub peer_sid: u64,
}

/// Where a pending dial came from
pub(crate) enum PendingOrigin {
    /// Forwarded on behalf of an upstream channel; DialBack is relayed to it
    Channel { chan: Arc<Channel>, sid: u64 },
    /// Initiated locally via `Router::dial`; the stream attaches on success
    Local {
        stream: BoxedStream,
        label: String,
        notify: oneshot::Sender<Result<()>>,
    },
}

/// One half-open session awaiting DialBack
pub(crate) struct PendingDial {
    /// Channel the Dial frame was forwarded on
    pub next: Arc<Channel>,
    pub origin: PendingOrigin,
}

/// Everything torn off by removing one endpoint
#[derive(Default)]
pub(crate) struct Cascade {
    /// Peer halves of removed sessions, to be notified with Closed
    pub peers: Vec<SessionHalf>,
    /// Pendings that were forwarded on the removed channel (fail the origin)
    pub pendings_via: Vec<(u64, PendingDial)>,
    /// Pendings whose origin was the removed channel (cancel downstream)
    pub pendings_from: Vec<(u64, PendingDial)>,
}

#[derive(Default)]
pub(crate) struct Tables {
    sessions: HashMap<(ChannelId, u64), SessionHalf>,
    pendings: HashMap<(ChannelId, u64), PendingDial>,
}

impl Tables {
    /// Install both halves of a session.
    pub(crate) fn insert_session(&mut self, a: Link, a_sid: u64, b: Link, b_sid: u64) {
        self.sessions.insert(
            (a.id(), a_sid),
            SessionHalf {
                peer: b.clone(),
                peer_sid: b_sid,
            },
        );
        self.sessions.insert(
            (b.id(), b_sid),
            SessionHalf {
                peer: a,
                peer_sid: a_sid,
            },
        );
    }

    pub(crate) fn lookup_peer(&self, id: ChannelId, sid: u64) -> Option<SessionHalf> {
        self.sessions.get(&(id, sid)).cloned()
    }

    /// Remove both halves; returns the peer half for notification.
    ///
    /// A second removal of the same session is a no-op, which is what makes
    /// duplicate Closed frames harmless.
    pub(crate) fn remove_session(&mut self, id: ChannelId, sid: u64) -> Option<SessionHalf> {
        let half = self.sessions.remove(&(id, sid))?;
        self.sessions.remove(&(half.peer.id(), half.peer_sid));
        Some(half)
    }

    pub(crate) fn insert_pending(&mut self, local_sid: u64, pending: PendingDial) {
        self.pendings.insert((pending.next.id(), local_sid), pending);
    }

    pub(crate) fn remove_pending(&mut self, next_id: ChannelId, local_sid: u64) -> Option<PendingDial> {
        self.pendings.remove(&(next_id, local_sid))
    }

    /// Remove a pending by its origin endpoint (used when the origin closes
    /// before any DialBack arrives).
    pub(crate) fn remove_pending_by_origin(
        &mut self,
        origin_id: ChannelId,
        origin_sid: u64,
    ) -> Option<(u64, PendingDial)> {
        let key = self.pendings.iter().find_map(|(key, pending)| {
            match &pending.origin {
                PendingOrigin::Channel { chan, sid }
                    if chan.id() == origin_id && *sid == origin_sid =>
                {
                    Some(*key)
                }
                _ => None,
            }
        })?;
        self.pendings.remove(&key).map(|p| (key.1, p))
    }

    /// Tear out every session and pending touching one endpoint.
    pub(crate) fn remove_by_link(&mut self, id: ChannelId) -> Cascade {
        let mut cascade = Cascade::default();

        let keys: Vec<(ChannelId, u64)> = self
            .sessions
            .keys()
            .filter(|key| key.0 == id)
            .copied()
            .collect();
        for (_, sid) in keys {
            if let Some(half) = self.remove_session(id, sid) {
                cascade.peers.push(half);
            }
        }

        let pending_keys: Vec<(ChannelId, u64)> = self
            .pendings
            .iter()
            .filter(|(key, pending)| {
                key.0 == id
                    || matches!(&pending.origin,
                        PendingOrigin::Channel { chan, .. } if chan.id() == id)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in pending_keys {
            if let Some(pending) = self.pendings.remove(&key) {
                if key.0 == id {
                    cascade.pendings_via.push((key.1, pending));
                } else {
                    cascade.pendings_from.push((key.1, pending));
                }
            }
        }

        cascade
    }

    /// Drain everything (router shutdown).
    pub(crate) fn drain(&mut self) -> Cascade {
        let mut cascade = Cascade::default();
        // Each session contributes both halves; notifying both endpoints is
        // correct on shutdown, and removal stays symmetric.
        while let Some(&(id, sid)) = self.sessions.keys().next() {
            if let Some(half) = self.remove_session(id, sid) {
                cascade.peers.push(half);
            }
        }
        cascade.pendings_via = self
            .pendings
            .drain()
            .map(|((_, local_sid), pending)| (local_sid, pending))
            .collect();
        cascade
    }

    /// Sessions rendered once per pair, for the state snapshot.
    pub(crate) fn session_pairs(&self) -> Vec<((Link, u64), (Link, u64))> {
        self.sessions
            .iter()
            .filter(|((id, sid), half)| (*id, *sid) < (half.peer.id(), half.peer_sid))
            .filter_map(|(&(_, sid), half)| {
                let back = self.sessions.get(&(half.peer.id(), half.peer_sid))?;
                Some(((back.peer.clone(), sid), (half.peer.clone(), half.peer_sid)))
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn assert_symmetric(&self) {
        for (&(id, sid), half) in &self.sessions {
            let back = self
                .sessions
                .get(&(half.peer.id(), half.peer_sid))
                .expect("missing reverse half");
            assert_eq!(back.peer.id(), id);
            assert_eq!(back.peer_sid, sid);
        }
        for key in self.pendings.keys() {
            assert!(
                !self.sessions.contains_key(key),
                "pending key also present in session table"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
