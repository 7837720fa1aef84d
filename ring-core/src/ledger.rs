//! Pending ledger (in-flight messages, FIFO display authority) and history set.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::fingerprint::Fingerprint;
use crate::protocol::{ChatMessage, Envelope};

/// Whether the local round trip of a message has been confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Dirty,
    Clean,
}

/// Message content held while in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Global(ChatMessage),
    Direct { message: ChatMessage, target: String },
}

impl Payload {
    pub fn message(&self) -> &ChatMessage {
        match self {
            Payload::Global(message) => message,
            Payload::Direct { message, .. } => message,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Payload::Global(_))
    }

    /// Envelope to re-forward this payload unchanged.
    pub fn envelope(&self) -> Envelope {
        match self {
            Payload::Global(message) => Envelope::Global {
                message: message.clone(),
            },
            Payload::Direct { message, target } => Envelope::Direct {
                message: message.clone(),
                target: target.clone(),
            },
        }
    }
}

/// A message surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub origin: String,
    pub text: String,
    pub direct: bool,
}

impl From<&Payload> for ChatLine {
    fn from(payload: &Payload) -> Self {
        let message = payload.message();
        ChatLine {
            origin: message.origin.clone(),
            text: message.text.clone(),
            direct: !payload.is_global(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub status: EntryStatus,
    pub payload: Payload,
    /// Username of the message's author.
    pub originator: String,
    /// Tick at which the entry was created or last re-circulated.
    pub arrived_tick: u64,
    pub checkup_sent: bool,
    pub checkup_tick: u64,
    /// Re-circulations after a liveness sweep.
    pub resends: u32,
    /// Own broadcast: acknowledgment already sent backward.
    pub response_sent: bool,
}

impl PendingEntry {
    pub fn new(status: EntryStatus, payload: Payload, tick: u64) -> Self {
        let originator = payload.message().origin.clone();
        Self {
            status,
            payload,
            originator,
            arrived_tick: tick,
            checkup_sent: false,
            checkup_tick: 0,
            resends: 0,
            response_sent: false,
        }
    }
}

/// Insertion-ordered in-flight messages. The oldest entry is the only one allowed to flush
/// its acknowledgment or trigger timeout handling.
#[derive(Debug, Default)]
pub struct PendingLedger {
    order: VecDeque<Fingerprint>,
    entries: HashMap<Fingerprint, PendingEntry>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the tail. An existing entry keeps its place and state; returns false then.
    pub fn insert(&mut self, id: Fingerprint, entry: PendingEntry) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.order.push_back(id);
        self.entries.insert(id, entry);
        true
    }

    pub fn get(&self, id: &Fingerprint) -> Option<&PendingEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &Fingerprint) -> Option<&mut PendingEntry> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &Fingerprint) -> Option<PendingEntry> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|k| k != id);
        Some(entry)
    }

    /// Oldest entry.
    pub fn head(&self) -> Option<(Fingerprint, &PendingEntry)> {
        let id = *self.order.front()?;
        self.entries.get(&id).map(|e| (id, e))
    }

    pub fn head_id(&self) -> Option<Fingerprint> {
        self.order.front().copied()
    }

    /// Drop every entry authored by `originator` (its round trips can never complete).
    pub fn purge_originator(&mut self, originator: &str) -> Vec<Fingerprint> {
        let doomed: Vec<Fingerprint> = self
            .order
            .iter()
            .filter(|id| {
                self.entries
                    .get(*id)
                    .is_some_and(|e| e.originator == originator)
            })
            .copied()
            .collect();
        for id in &doomed {
            self.entries.remove(id);
        }
        self.order.retain(|id| !doomed.contains(id));
        doomed
    }

    pub fn authored_by(&self, originator: &str) -> usize {
        self.entries
            .values()
            .filter(|e| e.originator == originator)
            .count()
    }

    /// Entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (Fingerprint, &PendingEntry)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (*id, e)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

/// Fingerprints already displayed.
#[derive(Debug, Default)]
pub struct HistorySet {
    seen: HashSet<Fingerprint>,
}

impl HistorySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the fingerprint was already recorded.
    pub fn insert(&mut self, id: Fingerprint) -> bool {
        self.seen.insert(id)
    }

    pub fn contains(&self, id: &Fingerprint) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
