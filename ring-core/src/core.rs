//! Host-driven API: RingCore receives datagrams and ticks from the host, returns actions.
//!
//! One `RingCore` holds exactly one peer's state. Steady-state message handling (broadcast
//! circulation, direct routing, ledger staleness) lives here; join, leave and crash repair
//! live in `membership`.

use tracing::{debug, info, warn};

use crate::config::RingConfig;
use crate::error::RingError;
use crate::fingerprint::Fingerprint;
use crate::ledger::{ChatLine, EntryStatus, HistorySet, Payload, PendingEntry, PendingLedger};
use crate::membership::JoinSequencer;
use crate::neighbors::NeighborTable;
use crate::protocol::{ChatMessage, Envelope, PeerAddress, Purpose};
use crate::wire;

/// Head sequences joins; everyone else is a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Head,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Session {
    Detached,
    /// Waiting for the rendezvous to name the head.
    Registering { attempts: u32, since: u64 },
    /// Waiting for the head's welcome.
    Joining { head: PeerAddress, since: u64 },
    Joined,
    Left,
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    SendMessage(PeerAddress, Vec<u8>),
    /// Surface a message to the user (exactly once per fingerprint).
    Display(ChatLine),
    Notify(Notice),
}

/// Status changes worth telling the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Joined { prev: PeerAddress, next_1: PeerAddress },
    /// No other member left to talk to.
    Alone,
    /// A direct message circled the ring without finding its target.
    TargetMissing(String),
    DirectDelivered(String),
    /// An own message was dropped after exhausting its re-circulations.
    DeliveryAbandoned(ChatLine),
    Left,
    Rejoining,
}

pub(crate) fn push_send(
    actions: &mut Vec<OutboundAction>,
    to: PeerAddress,
    envelope: &Envelope,
) -> Result<(), RingError> {
    let bytes = wire::encode_datagram(envelope)?;
    debug!(purpose = %envelope.purpose(), %to, "send");
    actions.push(OutboundAction::SendMessage(to, bytes));
    Ok(())
}

/// Main coordinator for one peer. Host passes events; core returns actions.
pub struct RingCore {
    pub(crate) username: String,
    pub(crate) addr: PeerAddress,
    pub(crate) rendezvous: PeerAddress,
    pub(crate) role: Role,
    pub(crate) session: Session,
    pub(crate) neighbors: NeighborTable,
    pub(crate) pending: PendingLedger,
    pub(crate) history: HistorySet,
    pub(crate) sequencer: JoinSequencer,
    pub(crate) config: RingConfig,
    pub(crate) tick_count: u64,
    next_seq: u64,
}

impl RingCore {
    /// The head: a ring of size one from the start.
    pub fn head(
        username: impl Into<String>,
        addr: PeerAddress,
        rendezvous: PeerAddress,
        config: RingConfig,
    ) -> Self {
        let mut core = Self::with_role(Role::Head, username.into(), addr, rendezvous, config);
        core.neighbors = NeighborTable::alone(addr);
        core.session = Session::Joined;
        core
    }

    /// A member; detached until `connect` completes.
    pub fn member(
        username: impl Into<String>,
        addr: PeerAddress,
        rendezvous: PeerAddress,
        config: RingConfig,
    ) -> Self {
        Self::with_role(Role::Member, username.into(), addr, rendezvous, config)
    }

    fn with_role(
        role: Role,
        username: String,
        addr: PeerAddress,
        rendezvous: PeerAddress,
        config: RingConfig,
    ) -> Self {
        Self {
            username,
            addr,
            rendezvous,
            role,
            session: Session::Detached,
            neighbors: NeighborTable::new(),
            pending: PendingLedger::new(),
            history: HistorySet::new(),
            sequencer: JoinSequencer::default(),
            config,
            tick_count: 0,
            next_seq: 0,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn addr(&self) -> PeerAddress {
        self.addr
    }

    pub fn is_head(&self) -> bool {
        self.role == Role::Head
    }

    pub fn is_joined(&self) -> bool {
        self.session == Session::Joined
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn pending(&self) -> &PendingLedger {
        &self.pending
    }

    pub fn history(&self) -> &HistorySet {
        &self.history
    }

    /// Author a broadcast and send it to the successor.
    pub fn send_global(&mut self, text: &str) -> Result<Vec<OutboundAction>, RingError> {
        if !self.is_joined() {
            return Err(RingError::NotJoined);
        }
        if self.neighbors.is_alone(self.addr) {
            return Ok(vec![OutboundAction::Notify(Notice::Alone)]);
        }
        let next = self.next_hop()?;
        let message = self.author(text);
        let id = Fingerprint::of_global(&message)?;
        let mut actions = Vec::new();
        push_send(
            &mut actions,
            next,
            &Envelope::Global {
                message: message.clone(),
            },
        )?;
        self.pending.insert(
            id,
            PendingEntry::new(EntryStatus::Dirty, Payload::Global(message), self.tick_count),
        );
        Ok(actions)
    }

    /// Author a direct message; it travels the ring until `target` claims it.
    pub fn send_direct(
        &mut self,
        target: &str,
        text: &str,
    ) -> Result<Vec<OutboundAction>, RingError> {
        if !self.is_joined() {
            return Err(RingError::NotJoined);
        }
        let target = target.trim();
        if target.is_empty() || target == self.username {
            return Err(RingError::InvalidTarget(target.to_string()));
        }
        if self.neighbors.is_alone(self.addr) {
            return Ok(vec![OutboundAction::Notify(Notice::Alone)]);
        }
        let next = self.next_hop()?;
        let message = self.author(text);
        let id = Fingerprint::of_direct(&message, target)?;
        let payload = Payload::Direct {
            message,
            target: target.to_string(),
        };
        let mut actions = Vec::new();
        push_send(&mut actions, next, &payload.envelope())?;
        self.pending.insert(
            id,
            PendingEntry::new(EntryStatus::Dirty, payload, self.tick_count),
        );
        Ok(actions)
    }

    /// Decode and handle one datagram.
    pub fn on_datagram(
        &mut self,
        from: PeerAddress,
        bytes: &[u8],
    ) -> Result<Vec<OutboundAction>, RingError> {
        let envelope = wire::decode_datagram(bytes)?;
        self.on_envelope(from, envelope)
    }

    /// Dispatch an envelope to its purpose handler.
    pub fn on_envelope(
        &mut self,
        from: PeerAddress,
        envelope: Envelope,
    ) -> Result<Vec<OutboundAction>, RingError> {
        debug!(purpose = %envelope.purpose(), %from, "received");
        let mut actions = Vec::new();
        match envelope {
            Envelope::Connect { username, addr } => {
                self.on_connect(&mut actions, from, username, addr)?
            }
            Envelope::Leader { leader } => self.on_leader(&mut actions, from, leader)?,
            Envelope::Rejected { error } => self.on_rejected(from, error)?,
            Envelope::Welcome { next_1, next_2 } => {
                self.on_welcome(&mut actions, from, next_1, next_2)?
            }
            Envelope::UpdatePointers { prev } => self.on_update_pointers(&mut actions, from, prev)?,
            Envelope::UpdateLastNode { next_2 } => {
                self.on_update_last_node(&mut actions, from, next_2)?
            }
            Envelope::PointersUpdated { curr_next } => {
                self.on_pointers_updated(&mut actions, from, curr_next)?
            }
            Envelope::Global { message } => self.on_global(&mut actions, from, message)?,
            Envelope::GlobalResponse {
                origin, message_id, ..
            } => self.on_global_response(&mut actions, &origin, message_id)?,
            Envelope::Direct { message, target } => {
                self.on_direct(&mut actions, from, message, target)?
            }
            Envelope::DmResponse {
                username,
                message_id,
            } => self.on_dm_response(&mut actions, username, message_id)?,
            Envelope::Disconnect {
                prev,
                next_1,
                next_2,
                cause,
                ..
            } => self.on_disconnect(&mut actions, prev, next_1, next_2, cause)?,
            Envelope::Crash {
                username,
                info,
                handled,
            } => self.on_crash(&mut actions, username, info, handled)?,
            Envelope::Checkup => {
                let reply = Envelope::CheckupRes {
                    username: self.username.clone(),
                };
                push_send(&mut actions, from, &reply)?;
            }
            Envelope::KickedOut { username, .. } => {
                warn!(by = %username, %from, "kicked out: neighbor view is stale");
                return Err(RingError::KickedOut(from));
            }
            Envelope::CheckupRes { .. } => {
                return Err(RingError::UnexpectedEnvelope {
                    purpose: Purpose::CheckupRes,
                    from,
                })
            }
        }
        Ok(actions)
    }

    /// Periodic tick: join timeouts, stale head-of-ledger handling.
    pub fn tick(&mut self) -> Result<Vec<OutboundAction>, RingError> {
        self.tick_count = self.tick_count.saturating_add(1);
        let mut actions = Vec::new();
        self.tick_membership(&mut actions)?;
        if self.is_joined() {
            self.tick_pending(&mut actions)?;
        }
        Ok(actions)
    }

    fn author(&mut self, text: &str) -> ChatMessage {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        ChatMessage {
            origin: self.username.clone(),
            addr: self.addr,
            text: text.to_string(),
            seq,
        }
    }

    pub(crate) fn prev_hop(&self) -> Result<PeerAddress, RingError> {
        self.neighbors.prev().ok_or(RingError::NoNeighbor("prev"))
    }

    pub(crate) fn next_hop(&self) -> Result<PeerAddress, RingError> {
        self.neighbors.next_1().ok_or(RingError::NoNeighbor("next"))
    }

    fn global_ack(&self, origin: &str, id: Fingerprint) -> Envelope {
        Envelope::GlobalResponse {
            username: self.username.clone(),
            origin: origin.to_string(),
            message_id: id,
        }
    }

    fn kick(&self, actions: &mut Vec<OutboundAction>, to: PeerAddress) -> Result<(), RingError> {
        warn!(%to, "message from a peer that is not my predecessor; kicking it out");
        let kicked = Envelope::KickedOut {
            username: self.username.clone(),
            addr: self.addr,
        };
        push_send(actions, to, &kicked)
    }

    fn on_global(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        from: PeerAddress,
        message: ChatMessage,
    ) -> Result<(), RingError> {
        let id = Fingerprint::of_global(&message)?;
        if self.history.contains(&id) {
            // Late or duplicate circulation: acknowledge again, do not reprocess.
            let prev = self.prev_hop()?;
            return push_send(actions, prev, &self.global_ack(&message.origin, id));
        }
        if message.origin == self.username {
            let Some(entry) = self.pending.get_mut(&id) else {
                debug!(%id, "own broadcast returned after it was dropped");
                return Ok(());
            };
            entry.status = EntryStatus::Clean;
            if self.pending.head_id() == Some(id) {
                return self.flush_head(actions);
            }
            debug!(%id, "round trip complete; held behind an older message");
            return Ok(());
        }
        if self.neighbors.prev() != Some(from) {
            return self.kick(actions, from);
        }
        let next = self.next_hop()?;
        push_send(
            actions,
            next,
            &Envelope::Global {
                message: message.clone(),
            },
        )?;
        self.pending.insert(
            id,
            PendingEntry::new(EntryStatus::Dirty, Payload::Global(message), self.tick_count),
        );
        Ok(())
    }

    fn on_global_response(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        origin: &str,
        id: Fingerprint,
    ) -> Result<(), RingError> {
        if origin == self.username {
            // Home again: display our own message and release whatever was held behind it.
            self.display(actions, id);
            return self.flush_head(actions);
        }
        let prev = self.prev_hop()?;
        if !self.display(actions, id) {
            debug!(%id, "response for an unknown or finalized message dropped");
            return Ok(());
        }
        push_send(actions, prev, &self.global_ack(origin, id))?;
        self.flush_head(actions)
    }

    fn on_direct(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        from: PeerAddress,
        message: ChatMessage,
        target: String,
    ) -> Result<(), RingError> {
        let id = Fingerprint::of_direct(&message, &target)?;
        if message.origin == self.username {
            if self.pending.remove(&id).is_some() {
                info!(%target, "direct message target does not exist");
                actions.push(OutboundAction::Notify(Notice::TargetMissing(target)));
                self.flush_head(actions)?;
            }
            return Ok(());
        }
        if self.neighbors.prev() != Some(from) {
            return self.kick(actions, from);
        }
        if target == self.username {
            let source = message.addr;
            let reply = Envelope::DmResponse {
                username: self.username.clone(),
                message_id: id,
            };
            if !self.history.contains(&id) {
                self.pending.insert(
                    id,
                    PendingEntry::new(
                        EntryStatus::Clean,
                        Payload::Direct { message, target },
                        self.tick_count,
                    ),
                );
                self.display(actions, id);
            }
            return push_send(actions, source, &reply);
        }
        let next = self.next_hop()?;
        push_send(actions, next, &Envelope::Direct { message, target })
    }

    fn on_dm_response(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        username: String,
        id: Fingerprint,
    ) -> Result<(), RingError> {
        if self.pending.remove(&id).is_none() {
            debug!(%id, "delivery confirmation for a message no longer pending");
            return Ok(());
        }
        self.history.insert(id);
        actions.push(OutboundAction::Notify(Notice::DirectDelivered(username)));
        self.flush_head(actions)
    }

    /// Move a pending message into history and surface it. False if already shown or unknown.
    pub(crate) fn display(&mut self, actions: &mut Vec<OutboundAction>, id: Fingerprint) -> bool {
        if self.history.contains(&id) {
            return false;
        }
        let Some(entry) = self.pending.remove(&id) else {
            return false;
        };
        self.history.insert(id);
        actions.push(OutboundAction::Display(ChatLine::from(&entry.payload)));
        true
    }

    /// Send the acknowledgment of an own broadcast once it is both clean and the oldest
    /// pending entry. Keeps finalization in ledger order.
    pub(crate) fn flush_head(&mut self, actions: &mut Vec<OutboundAction>) -> Result<(), RingError> {
        let Some(id) = self.pending.head_id() else {
            return Ok(());
        };
        let username = self.username.clone();
        let prev = self.prev_hop();
        let Some(entry) = self.pending.get_mut(&id) else {
            return Ok(());
        };
        if entry.status != EntryStatus::Clean
            || entry.originator != username
            || !entry.payload.is_global()
            || entry.response_sent
        {
            return Ok(());
        }
        let prev = prev?;
        entry.response_sent = true;
        push_send(actions, prev, &self.global_ack(&username, id))
    }

    /// Re-forward the oldest pending message after a gap in the ring was bridged.
    pub(crate) fn resume_head(&mut self, actions: &mut Vec<OutboundAction>) -> Result<(), RingError> {
        let Some((id, entry)) = self.pending.head() else {
            return Ok(());
        };
        match entry.status {
            EntryStatus::Dirty => {
                let envelope = entry.payload.envelope();
                let next = self.next_hop()?;
                info!(%id, %next, "resuming circulation across the repaired gap");
                push_send(actions, next, &envelope)
            }
            EntryStatus::Clean => self.flush_head(actions),
        }
    }

    /// Oldest own message stuck too long: ask the rendezvous to sweep, then retry, then give up.
    fn tick_pending(&mut self, actions: &mut Vec<OutboundAction>) -> Result<(), RingError> {
        let now = self.tick_count;
        let Some(id) = self.pending.head_id() else {
            return Ok(());
        };
        let username = self.username.clone();
        let (checkup_after, resend_after, max_attempts) = (
            self.config.checkup_after_ticks,
            self.config.resend_after_ticks,
            self.config.max_attempts,
        );
        let Some(entry) = self.pending.get_mut(&id) else {
            return Ok(());
        };
        if entry.originator != username {
            return Ok(());
        }
        if !entry.checkup_sent {
            if now.saturating_sub(entry.arrived_tick) < checkup_after {
                return Ok(());
            }
            entry.checkup_sent = true;
            entry.checkup_tick = now;
            warn!(%id, "oldest own message is stale; requesting a liveness sweep");
            return push_send(actions, self.rendezvous, &Envelope::Checkup);
        }
        if now.saturating_sub(entry.checkup_tick) < resend_after {
            return Ok(());
        }
        if entry.resends >= max_attempts {
            let resends = entry.resends;
            if let Some(entry) = self.pending.remove(&id) {
                warn!(%id, resends, "giving up on own message");
                actions.push(OutboundAction::Notify(Notice::DeliveryAbandoned(
                    ChatLine::from(&entry.payload),
                )));
            }
            return self.flush_head(actions);
        }
        entry.resends += 1;
        entry.checkup_sent = false;
        entry.response_sent = false;
        entry.arrived_tick = now;
        let status = entry.status;
        let envelope = entry.payload.envelope();
        info!(%id, "retrying circulation of own message");
        match status {
            EntryStatus::Dirty => {
                let next = self.next_hop()?;
                push_send(actions, next, &envelope)
            }
            EntryStatus::Clean => self.flush_head(actions),
        }
    }
}
