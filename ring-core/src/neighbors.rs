//! Local view of the ring: predecessor, successor and second-hop successor.

use crate::protocol::{PeerAddress, PointerUpdate};

/// A peer's three neighbor slots.
///
/// Detached peers have every slot unset. A peer alone in the ring points `prev` and `next_1`
/// at itself with `next_2` unset. `next_2` is only a bypass shortcut for crash repair and may
/// be stale while a repair is in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeighborTable {
    prev: Option<PeerAddress>,
    next_1: Option<PeerAddress>,
    next_2: Option<PeerAddress>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table of a ring of size one.
    pub fn alone(own: PeerAddress) -> Self {
        Self {
            prev: Some(own),
            next_1: Some(own),
            next_2: None,
        }
    }

    pub fn prev(&self) -> Option<PeerAddress> {
        self.prev
    }

    pub fn next_1(&self) -> Option<PeerAddress> {
        self.next_1
    }

    pub fn next_2(&self) -> Option<PeerAddress> {
        self.next_2
    }

    pub(crate) fn set_prev(&mut self, addr: Option<PeerAddress>) {
        self.prev = addr;
    }

    pub(crate) fn set_next_1(&mut self, addr: Option<PeerAddress>) {
        self.next_1 = addr;
    }

    pub(crate) fn set_next_2(&mut self, addr: Option<PeerAddress>) {
        self.next_2 = addr;
    }

    pub fn is_detached(&self) -> bool {
        self.next_1.is_none()
    }

    /// True when there is no other member to talk to.
    pub fn is_alone(&self, own: PeerAddress) -> bool {
        match self.next_1 {
            None => true,
            Some(next) => next == own,
        }
    }

    /// Does any slot point at `addr`?
    pub fn references(&self, addr: PeerAddress) -> bool {
        [self.prev, self.next_1, self.next_2].contains(&Some(addr))
    }

    /// Apply the non-`Same` fields of a rewiring envelope.
    pub fn apply(&mut self, prev: PointerUpdate, next_1: PointerUpdate, next_2: PointerUpdate) {
        if let PointerUpdate::Set(addr) = prev {
            self.prev = addr;
        }
        if let PointerUpdate::Set(addr) = next_1 {
            self.next_1 = addr;
        }
        if let PointerUpdate::Set(addr) = next_2 {
            self.next_2 = addr;
        }
    }

    /// Collapse degenerate shapes after a rewiring step. Returns true if the peer is now alone.
    ///
    /// Two members need no shortcut; a successor equal to ourselves means ring size one.
    pub fn normalize(&mut self, own: PeerAddress) -> bool {
        if self.next_2 == Some(own) {
            self.next_2 = None;
        }
        if self.next_1.is_some() && self.next_1 == self.prev {
            self.next_2 = None;
        }
        if self.next_1 == Some(own) {
            self.reset_alone(own);
            return true;
        }
        false
    }

    pub fn reset_alone(&mut self, own: PeerAddress) {
        *self = Self::alone(own);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
