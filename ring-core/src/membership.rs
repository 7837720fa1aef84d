//! Membership: joining, head-side join sequencing, graceful leave, crash repair and rejoin.
//!
//! The head splices every joiner in directly after itself, one join at a time:
//! 1. successor adopts the joiner as `prev` (`update_pointers`, acked with its `next_1`);
//! 2. tail adopts the joiner as `next_2` (`update_last_node`);
//! 3. head points `next_1` at the joiner and sends `welcome`.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::core::{push_send, Notice, OutboundAction, RingCore, Role, Session};
use crate::error::RingError;
use crate::protocol::{Cause, Envelope, PeerAddress, PointerUpdate, Purpose, RejectReason};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Joiner {
    username: String,
    addr: PeerAddress,
    /// Head tick at which the join request arrived.
    queued_tick: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinStep {
    Successor,
    Tail,
}

/// The join in flight: which acknowledgment the head awaits, and what to resend.
#[derive(Debug, Clone)]
struct JoinJob {
    joiner: Joiner,
    step: JoinStep,
    to: PeerAddress,
    request: Envelope,
    attempts: u32,
    sent_tick: u64,
    /// Successor's `next_1` as reported in its acknowledgment.
    successor_next: Option<PeerAddress>,
}

/// Head-only serializer: joins are queued and processed one at a time.
#[derive(Debug, Default)]
pub(crate) struct JoinSequencer {
    queue: VecDeque<Joiner>,
    active: Option<JoinJob>,
}

impl JoinSequencer {
    fn is_known(&self, addr: PeerAddress) -> bool {
        self.queue.iter().any(|j| j.addr == addr)
            || self.active.as_ref().is_some_and(|job| job.joiner.addr == addr)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }
}

impl RingCore {
    /// Register with the rendezvous. The head is joined from the start and sends nothing.
    pub fn connect(&mut self) -> Result<Vec<OutboundAction>, RingError> {
        let mut actions = Vec::new();
        if self.role == Role::Head {
            return Ok(actions);
        }
        push_send(&mut actions, self.rendezvous, &self.connect_request())?;
        self.session = Session::Registering {
            attempts: 1,
            since: self.tick_count,
        };
        info!(rendezvous = %self.rendezvous, "registering");
        Ok(actions)
    }

    /// Abandon all local ring state and join again.
    pub fn rejoin(&mut self) -> Result<Vec<OutboundAction>, RingError> {
        if self.role == Role::Head {
            warn!("head was told its view is stale; keeping its table");
            return Ok(Vec::new());
        }
        warn!("abandoning local ring state and rejoining");
        self.neighbors.clear();
        self.pending.clear();
        self.history.clear();
        self.session = Session::Detached;
        let mut actions = vec![OutboundAction::Notify(Notice::Rejoining)];
        actions.extend(self.connect()?);
        Ok(actions)
    }

    /// Graceful departure: splice our neighbors together, deregister, go detached.
    pub fn leave(&mut self) -> Result<Vec<OutboundAction>, RingError> {
        if self.role == Role::Head {
            return Err(RingError::HeadCannotLeave);
        }
        if !self.is_joined() {
            return Err(RingError::NotJoined);
        }
        let owned = self.pending.authored_by(&self.username);
        if owned > 0 {
            return Err(RingError::PendingOwned(owned));
        }
        let mut actions = Vec::new();
        if !self.neighbors.is_alone(self.addr) {
            if let (Some(prev), Some(next)) = (self.neighbors.prev(), self.neighbors.next_1()) {
                let to_next = Envelope::rewire(
                    &self.username,
                    PointerUpdate::to(prev),
                    PointerUpdate::Same,
                    PointerUpdate::Same,
                    Cause::Disconnect,
                );
                let to_prev = Envelope::rewire(
                    &self.username,
                    PointerUpdate::Same,
                    PointerUpdate::to(next),
                    PointerUpdate::Set(self.neighbors.next_2()),
                    Cause::Disconnect,
                );
                push_send(&mut actions, next, &to_next)?;
                push_send(&mut actions, prev, &to_prev)?;
            }
        }
        let deregister = Envelope::rewire(
            &self.username,
            PointerUpdate::Same,
            PointerUpdate::Same,
            PointerUpdate::Same,
            Cause::Disconnect,
        );
        push_send(&mut actions, self.rendezvous, &deregister)?;
        self.neighbors.clear();
        self.pending.clear();
        self.session = Session::Left;
        info!("left the ring");
        actions.push(OutboundAction::Notify(Notice::Left));
        Ok(actions)
    }

    fn connect_request(&self) -> Envelope {
        Envelope::Connect {
            username: self.username.clone(),
            addr: self.addr,
        }
    }

    pub(crate) fn on_leader(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        from: PeerAddress,
        leader: PeerAddress,
    ) -> Result<(), RingError> {
        if !matches!(self.session, Session::Registering { .. }) {
            return Err(RingError::UnexpectedEnvelope {
                purpose: Purpose::Leader,
                from,
            });
        }
        info!(%leader, "registered; asking the head to join");
        push_send(actions, leader, &self.connect_request())?;
        self.session = Session::Joining {
            head: leader,
            since: self.tick_count,
        };
        Ok(())
    }

    pub(crate) fn on_rejected(
        &mut self,
        from: PeerAddress,
        error: RejectReason,
    ) -> Result<(), RingError> {
        match self.session {
            Session::Registering { .. } | Session::Joining { .. } => {
                self.session = Session::Detached;
                Err(RingError::Rejected(error))
            }
            _ => Err(RingError::UnexpectedEnvelope {
                purpose: Purpose::Rejected,
                from,
            }),
        }
    }

    pub(crate) fn on_welcome(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        from: PeerAddress,
        next_1: PeerAddress,
        next_2: Option<PeerAddress>,
    ) -> Result<(), RingError> {
        match self.session {
            Session::Joining { head, .. } if head == from => {}
            _ => {
                return Err(RingError::UnexpectedEnvelope {
                    purpose: Purpose::Welcome,
                    from,
                })
            }
        }
        self.neighbors.set_prev(Some(from));
        self.neighbors.set_next_1(Some(next_1));
        self.neighbors.set_next_2(next_2);
        self.neighbors.normalize(self.addr);
        self.session = Session::Joined;
        info!(prev = %from, %next_1, "joined the ring");
        actions.push(OutboundAction::Notify(Notice::Joined { prev: from, next_1 }));
        Ok(())
    }

    /// Join step 1 at the head's successor. Idempotent under resend.
    pub(crate) fn on_update_pointers(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        from: PeerAddress,
        joiner: PeerAddress,
    ) -> Result<(), RingError> {
        self.neighbors.set_prev(Some(joiner));
        if self.neighbors.next_2().is_none() {
            // Ring of two becoming three: our successor was the head.
            self.neighbors.set_next_2(Some(joiner));
            self.neighbors.set_next_1(Some(from));
        }
        debug!(%joiner, "adopted joiner as predecessor");
        let ack = Envelope::PointersUpdated {
            curr_next: self.neighbors.next_1(),
        };
        push_send(actions, from, &ack)
    }

    /// Join step 2 at the tail.
    pub(crate) fn on_update_last_node(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        from: PeerAddress,
        joiner: PeerAddress,
    ) -> Result<(), RingError> {
        self.neighbors.set_next_2(Some(joiner));
        debug!(%joiner, "adopted joiner as shortcut");
        push_send(actions, from, &Envelope::PointersUpdated { curr_next: None })
    }

    /// Head: queue a join request.
    pub(crate) fn on_connect(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        from: PeerAddress,
        username: String,
        addr: PeerAddress,
    ) -> Result<(), RingError> {
        if self.role != Role::Head {
            return Err(RingError::UnexpectedEnvelope {
                purpose: Purpose::Connect,
                from,
            });
        }
        if addr == self.addr || self.sequencer.is_known(addr) {
            debug!(%username, %addr, "duplicate join request ignored");
            return Ok(());
        }
        info!(%username, %addr, "join request queued");
        self.sequencer.queue.push_back(Joiner {
            username,
            addr,
            queued_tick: self.tick_count,
        });
        self.start_next_join(actions)
    }

    fn start_next_join(&mut self, actions: &mut Vec<OutboundAction>) -> Result<(), RingError> {
        while self.sequencer.active.is_none() {
            let Some(joiner) = self.sequencer.queue.pop_front() else {
                return Ok(());
            };
            match self.neighbors.next_1() {
                _ if !self.join_fits_deadline(&joiner) => {
                    warn!(
                        username = %joiner.username,
                        queued_for = self.tick_count.saturating_sub(joiner.queued_tick),
                        "joiner would give up before the splice; refusing"
                    );
                    let rejected = Envelope::Rejected {
                        error: RejectReason::JoinFailed,
                    };
                    push_send(actions, joiner.addr, &rejected)?;
                }
                Some(successor) if successor != self.addr => {
                    let request = Envelope::UpdatePointers { prev: joiner.addr };
                    push_send(actions, successor, &request)?;
                    self.sequencer.active = Some(JoinJob {
                        joiner,
                        step: JoinStep::Successor,
                        to: successor,
                        request,
                        attempts: 1,
                        sent_tick: self.tick_count,
                        successor_next: None,
                    });
                }
                _ => self.complete_join(actions, joiner, None)?,
            }
        }
        Ok(())
    }

    /// Whether both remote steps can still run to their last retry before the joiner's wait
    /// expires. One tick of slack covers the phase offset between the two clocks.
    fn join_fits_deadline(&self, joiner: &Joiner) -> bool {
        if self.neighbors.next_1().map_or(true, |n| n == self.addr) {
            return true;
        }
        let worst = 2 * u64::from(self.config.max_attempts) * self.config.join_step_timeout_ticks;
        let queued_for = self.tick_count.saturating_sub(joiner.queued_tick);
        queued_for + worst + 1 < self.config.join_wait_ticks
    }

    pub(crate) fn on_pointers_updated(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        from: PeerAddress,
        curr_next: Option<PeerAddress>,
    ) -> Result<(), RingError> {
        let own = self.addr;
        let tail = self.neighbors.prev();
        let now = self.tick_count;
        let Some(job) = self.sequencer.active.as_mut() else {
            debug!(%from, "acknowledgment with no join in flight");
            return Ok(());
        };
        if job.to != from {
            debug!(%from, "acknowledgment from a peer we are not waiting on");
            return Ok(());
        }
        if job.step == JoinStep::Successor {
            job.successor_next = curr_next;
            if let Some(tail) = tail.filter(|t| *t != own) {
                let request = Envelope::UpdateLastNode {
                    next_2: job.joiner.addr,
                };
                job.step = JoinStep::Tail;
                job.to = tail;
                job.request = request.clone();
                job.attempts = 1;
                job.sent_tick = now;
                return push_send(actions, tail, &request);
            }
        }
        let Some(job) = self.sequencer.active.take() else {
            return Ok(());
        };
        self.complete_join(actions, job.joiner, job.successor_next)?;
        self.start_next_join(actions)
    }

    /// Step 3: splice the joiner after the head and welcome it.
    fn complete_join(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        joiner: Joiner,
        successor_next: Option<PeerAddress>,
    ) -> Result<(), RingError> {
        let own = self.addr;
        let welcome = match self.neighbors.next_1() {
            Some(old_next) if old_next != own => {
                self.neighbors.set_next_2(Some(old_next));
                self.neighbors.set_next_1(Some(joiner.addr));
                Envelope::Welcome {
                    next_1: old_next,
                    next_2: successor_next,
                }
            }
            _ => {
                self.neighbors.set_prev(Some(joiner.addr));
                self.neighbors.set_next_1(Some(joiner.addr));
                self.neighbors.set_next_2(None);
                Envelope::Welcome {
                    next_1: own,
                    next_2: None,
                }
            }
        };
        info!(username = %joiner.username, addr = %joiner.addr, "joiner spliced in after head");
        push_send(actions, joiner.addr, &welcome)
    }

    /// Joiner-side timeouts and head-side join step retries.
    pub(crate) fn tick_membership(
        &mut self,
        actions: &mut Vec<OutboundAction>,
    ) -> Result<(), RingError> {
        let now = self.tick_count;
        match self.session {
            Session::Registering { attempts, since }
                if now.saturating_sub(since) >= self.config.join_step_timeout_ticks =>
            {
                if attempts >= self.config.max_attempts {
                    self.session = Session::Detached;
                    return Err(RingError::RendezvousUnreachable(attempts));
                }
                warn!(attempts, "rendezvous silent; retrying registration");
                push_send(actions, self.rendezvous, &self.connect_request())?;
                self.session = Session::Registering {
                    attempts: attempts + 1,
                    since: now,
                };
            }
            Session::Joining { since, .. }
                if now.saturating_sub(since) >= self.config.join_wait_ticks =>
            {
                self.session = Session::Detached;
                return Err(RingError::JoinTimedOut);
            }
            _ => {}
        }
        self.tick_join_job(actions)
    }

    fn tick_join_job(&mut self, actions: &mut Vec<OutboundAction>) -> Result<(), RingError> {
        let now = self.tick_count;
        let (step_timeout, max_attempts) =
            (self.config.join_step_timeout_ticks, self.config.max_attempts);
        let Some(job) = self.sequencer.active.as_mut() else {
            return Ok(());
        };
        if now.saturating_sub(job.sent_tick) < step_timeout {
            return Ok(());
        }
        if job.attempts < max_attempts {
            job.attempts += 1;
            job.sent_tick = now;
            warn!(to = %job.to, attempt = job.attempts, "join step unacknowledged; resending");
            let (to, request) = (job.to, job.request.clone());
            return push_send(actions, to, &request);
        }
        let Some(job) = self.sequencer.active.take() else {
            return Ok(());
        };
        warn!(username = %job.joiner.username, attempts = job.attempts, "join failed; rolling back");
        if job.step == JoinStep::Tail {
            // The successor already adopted the joiner as its predecessor.
            if let Some(successor) = self.neighbors.next_1() {
                let next_2 = if self.neighbors.next_2().is_none() {
                    PointerUpdate::Set(None)
                } else {
                    PointerUpdate::Same
                };
                let rollback = Envelope::rewire(
                    &self.username,
                    PointerUpdate::to(self.addr),
                    PointerUpdate::Same,
                    next_2,
                    Cause::Rollback,
                );
                push_send(actions, successor, &rollback)?;
                // The tail may have applied `update_last_node` with only its ack lost.
                if job.to != successor {
                    let rollback = Envelope::rewire(
                        &self.username,
                        PointerUpdate::Same,
                        PointerUpdate::Same,
                        PointerUpdate::to(successor),
                        Cause::Rollback,
                    );
                    push_send(actions, job.to, &rollback)?;
                }
            }
        }
        let rejected = Envelope::Rejected {
            error: RejectReason::JoinFailed,
        };
        push_send(actions, job.joiner.addr, &rejected)?;
        self.start_next_join(actions)
    }

    /// Apply a rewiring envelope and run any follow-up the cause calls for.
    pub(crate) fn on_disconnect(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        prev: PointerUpdate,
        next_1: PointerUpdate,
        next_2: PointerUpdate,
        cause: Cause,
    ) -> Result<(), RingError> {
        if self.neighbors.is_detached() {
            debug!("rewiring ignored while detached");
            return Ok(());
        }
        self.neighbors.apply(prev, next_1, next_2);
        if self.neighbors.normalize(self.addr) {
            info!("ring collapsed; alone");
            actions.push(OutboundAction::Notify(Notice::Alone));
            return Ok(());
        }
        match cause {
            // Our predecessor still holds the leaver as its shortcut.
            Cause::Disconnect if next_1.is_set() => {
                if let Some(p) = self.neighbors.prev() {
                    let refresh = Envelope::rewire(
                        &self.username,
                        PointerUpdate::Same,
                        PointerUpdate::Same,
                        PointerUpdate::Set(self.neighbors.next_1()),
                        Cause::Disconnect,
                    );
                    push_send(actions, p, &refresh)?;
                }
            }
            // A repairer bypassed a crashed peer to reach us: hand it its new shortcut.
            Cause::Crash if prev.is_set() => {
                let p = self.prev_hop()?;
                let reply = Envelope::rewire(
                    &self.username,
                    PointerUpdate::Same,
                    PointerUpdate::Same,
                    PointerUpdate::Set(self.neighbors.next_1()),
                    Cause::Crash,
                );
                push_send(actions, p, &reply)?;
            }
            // Repair complete at the repairer: resume whatever was stuck.
            Cause::Crash if !next_1.is_set() && next_2.is_set() => self.resume_head(actions)?,
            _ => {}
        }
        Ok(())
    }

    /// Crash alert: purge the dead peer's messages; bypass it if it was our successor.
    pub(crate) fn on_crash(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        username: String,
        info: PeerAddress,
        handled: bool,
    ) -> Result<(), RingError> {
        let mut handled = handled;
        if self.role == Role::Head {
            if handled {
                debug!(%username, "crash alert completed its circuit");
                return Ok(());
            }
            handled = true;
        }
        if self.neighbors.is_detached() {
            return Ok(());
        }
        warn!(%username, addr = %info, "peer crashed");
        let purged = self.pending.purge_originator(&username);
        if !purged.is_empty() {
            debug!(count = purged.len(), "purged messages of crashed peer");
            self.flush_head(actions)?;
        }
        let alert = Envelope::Crash {
            username,
            info,
            handled,
        };
        if self.neighbors.next_1() != Some(info) {
            if self.neighbors.is_alone(self.addr) {
                return Ok(());
            }
            let next = self.next_hop()?;
            return push_send(actions, next, &alert);
        }
        let Some(bypass) = self.neighbors.next_2() else {
            self.neighbors.reset_alone(self.addr);
            info!("successor crashed and no shortcut remains; alone");
            actions.push(OutboundAction::Notify(Notice::Alone));
            return Ok(());
        };
        self.neighbors.set_next_1(Some(bypass));
        if self.neighbors.normalize(self.addr) {
            actions.push(OutboundAction::Notify(Notice::Alone));
            return Ok(());
        }
        let prev = self.prev_hop()?;
        let to_prev = Envelope::rewire(
            &self.username,
            PointerUpdate::Same,
            PointerUpdate::to(self.addr),
            PointerUpdate::to(bypass),
            Cause::Crash,
        );
        let to_next = Envelope::rewire(
            &self.username,
            PointerUpdate::to(self.addr),
            PointerUpdate::Same,
            PointerUpdate::Same,
            Cause::Crash,
        );
        info!(%bypass, "bypassing crashed successor");
        push_send(actions, prev, &to_prev)?;
        push_send(actions, bypass, &to_next)?;
        push_send(actions, bypass, &alert)
    }
}
