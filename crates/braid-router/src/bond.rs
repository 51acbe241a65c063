//! Bonds: channel sets fronting one logical peer
//!
//! All channels authenticated under the same peer name form a bond. Dials
//! through the bond pick the least-used channel, ties broken by lowest
//! index, so N parallel connections to a peer share load evenly.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::channel::Channel;

/// Channels sharing one peer name, keyed by slot index
#[derive(Default)]
pub(crate) struct Bond {
    channels: BTreeMap<u32, Arc<Channel>>,
}

impl Bond {
    /// Next free slot in the bond.
    pub(crate) fn assign_index(&self) -> u32 {
        (0..).find(|idx| !self.channels.contains_key(idx)).unwrap()
    }

    pub(crate) fn insert(&mut self, chan: Arc<Channel>) {
        self.channels.insert(chan.index(), chan);
    }

    /// Remove a channel by index, but only if it is this very channel
    /// (a reconnect may have taken the slot over in the meantime).
    pub(crate) fn remove(&mut self, chan: &Arc<Channel>) {
        if let Some(current) = self.channels.get(&chan.index()) {
            if current.id() == chan.id() {
                self.channels.remove(&chan.index());
            }
        }
    }

    /// Least-used channel; ties broken by lowest index.
    pub(crate) fn select(&self) -> Option<Arc<Channel>> {
        self.channels
            .values()
            .min_by_key(|c| (c.used(), c.index()))
            .cloned()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub(crate) fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }
}
