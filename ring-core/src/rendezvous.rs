//! Rendezvous server: name registry, head lookup and liveness sweeps.
//!
//! Host-driven like `RingCore`: datagrams and ticks in, `OutboundAction::SendMessage` out.
//! New registrations are admitted only after a sweep finds every known member alive; a
//! sweep that finds casualties reports each one to the head as a `crash` alert.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::config::RingConfig;
use crate::core::{push_send, OutboundAction};
use crate::error::RingError;
use crate::protocol::{Envelope, PeerAddress, RejectReason};
use crate::wire;

#[derive(Debug)]
struct Sweep {
    started_tick: u64,
    /// Members that have not answered yet.
    outstanding: BTreeMap<String, PeerAddress>,
}

pub struct Rendezvous {
    head: PeerAddress,
    head_username: String,
    members: BTreeMap<String, PeerAddress>,
    /// Registrations parked until the running sweep completes.
    waiting: Vec<(String, PeerAddress)>,
    sweep: Option<Sweep>,
    last_sweep_tick: u64,
    tick_count: u64,
    config: RingConfig,
}

impl Rendezvous {
    pub fn new(head: PeerAddress, head_username: impl Into<String>, config: RingConfig) -> Self {
        Self {
            head,
            head_username: head_username.into(),
            members: BTreeMap::new(),
            waiting: Vec::new(),
            sweep: None,
            last_sweep_tick: 0,
            tick_count: 0,
            config,
        }
    }

    /// Registered members, excluding the head.
    pub fn members(&self) -> &BTreeMap<String, PeerAddress> {
        &self.members
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep.is_some()
    }

    pub fn on_datagram(
        &mut self,
        from: PeerAddress,
        bytes: &[u8],
    ) -> Result<Vec<OutboundAction>, RingError> {
        let envelope = wire::decode_datagram(bytes)?;
        self.on_envelope(from, envelope)
    }

    pub fn on_envelope(
        &mut self,
        from: PeerAddress,
        envelope: Envelope,
    ) -> Result<Vec<OutboundAction>, RingError> {
        debug!(purpose = %envelope.purpose(), %from, "received");
        let mut actions = Vec::new();
        match envelope {
            Envelope::Connect { username, addr } => {
                self.on_register(&mut actions, username, addr)?
            }
            Envelope::Disconnect { username, .. } => {
                if self.members.remove(&username).is_some() {
                    info!(%username, "deregistered");
                }
            }
            Envelope::Checkup => {
                info!(%from, "liveness sweep requested");
                self.start_sweep(&mut actions)?;
            }
            Envelope::CheckupRes { username } => {
                let Some(sweep) = self.sweep.as_mut() else {
                    debug!(%username, "checkup response outside a sweep");
                    return Ok(actions);
                };
                sweep.outstanding.remove(&username);
                if sweep.outstanding.is_empty() {
                    self.sweep = None;
                    self.finish_sweep(&mut actions, BTreeMap::new())?;
                }
            }
            other => {
                return Err(RingError::UnexpectedEnvelope {
                    purpose: other.purpose(),
                    from,
                })
            }
        }
        Ok(actions)
    }

    /// Sweep deadline and periodic sweeps.
    pub fn tick(&mut self) -> Result<Vec<OutboundAction>, RingError> {
        self.tick_count = self.tick_count.saturating_add(1);
        let now = self.tick_count;
        let mut actions = Vec::new();
        match self.sweep.as_ref() {
            Some(sweep) if now.saturating_sub(sweep.started_tick) >= self.config.sweep_timeout_ticks => {
                if let Some(sweep) = self.sweep.take() {
                    self.finish_sweep(&mut actions, sweep.outstanding)?;
                }
            }
            Some(_) => {}
            None => {
                let due = self
                    .config
                    .sweep_interval_ticks
                    .is_some_and(|every| now.saturating_sub(self.last_sweep_tick) >= every);
                if due && !self.members.is_empty() {
                    self.start_sweep(&mut actions)?;
                }
            }
        }
        Ok(actions)
    }

    fn on_register(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        username: String,
        addr: PeerAddress,
    ) -> Result<(), RingError> {
        let name_taken = username == self.head_username
            || self.members.get(&username).is_some_and(|a| *a != addr)
            || self.waiting.iter().any(|(n, a)| *n == username && *a != addr);
        let addr_taken = addr == self.head
            || self.members.iter().any(|(n, a)| *a == addr && *n != username)
            || self.waiting.iter().any(|(n, a)| *a == addr && *n != username);
        if name_taken || addr_taken {
            info!(%username, %addr, "registration refused: not unique");
            let rejected = Envelope::Rejected {
                error: RejectReason::UnUnique,
            };
            return push_send(actions, addr, &rejected);
        }
        if self.members.get(&username) == Some(&addr) {
            info!(%username, "member re-registered");
            return push_send(actions, addr, &Envelope::Leader { leader: self.head });
        }
        if self.waiting.iter().any(|(n, _)| *n == username) {
            debug!(%username, "registration retry while parked");
            return Ok(());
        }
        debug!(%username, %addr, "registration parked behind a liveness sweep");
        self.waiting.push((username, addr));
        self.start_sweep(actions)
    }

    /// Probe every member. Coalesces with a sweep already running.
    fn start_sweep(&mut self, actions: &mut Vec<OutboundAction>) -> Result<(), RingError> {
        if self.sweep.is_some() {
            return Ok(());
        }
        self.last_sweep_tick = self.tick_count;
        if self.members.is_empty() {
            return self.finish_sweep(actions, BTreeMap::new());
        }
        for addr in self.members.values() {
            push_send(actions, *addr, &Envelope::Checkup)?;
        }
        self.sweep = Some(Sweep {
            started_tick: self.tick_count,
            outstanding: self.members.clone(),
        });
        Ok(())
    }

    fn finish_sweep(
        &mut self,
        actions: &mut Vec<OutboundAction>,
        crashed: BTreeMap<String, PeerAddress>,
    ) -> Result<(), RingError> {
        for (username, addr) in &crashed {
            self.members.remove(username);
            warn!(%username, %addr, "no checkup response; reporting crash to head");
            let alert = Envelope::Crash {
                username: username.clone(),
                info: *addr,
                handled: false,
            };
            push_send(actions, self.head, &alert)?;
        }
        for (username, addr) in std::mem::take(&mut self.waiting) {
            if crashed.is_empty() {
                info!(%username, %addr, "registered");
                self.members.insert(username, addr);
                push_send(actions, addr, &Envelope::Leader { leader: self.head })?;
            } else {
                // Ring is under repair; the joiner must retry later.
                let rejected = Envelope::Rejected {
                    error: RejectReason::ServerDown,
                };
                push_send(actions, addr, &rejected)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_datagram;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::from(std::net::SocketAddr::from(([127, 0, 0, 1], port)))
    }

    const HEAD: u16 = 9100;

    fn rendezvous() -> Rendezvous {
        let config = RingConfig {
            sweep_interval_ticks: None,
            ..RingConfig::default()
        };
        Rendezvous::new(addr(HEAD), "head", config)
    }

    fn sent(actions: &[OutboundAction]) -> Vec<(PeerAddress, Envelope)> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::SendMessage(to, bytes) => Some((*to, decode_datagram(bytes).unwrap())),
                _ => None,
            })
            .collect()
    }

    fn connect(name: &str, port: u16) -> Envelope {
        Envelope::Connect {
            username: name.into(),
            addr: addr(port),
        }
    }

    fn register(server: &mut Rendezvous, name: &str, port: u16) {
        server.on_envelope(addr(port), connect(name, port)).unwrap();
        let members: Vec<String> = server.members().keys().cloned().collect();
        for member in members {
            server
                .on_envelope(addr(1), Envelope::CheckupRes { username: member })
                .unwrap();
        }
        assert!(!server.is_sweeping());
        assert_eq!(server.members().get(name), Some(&addr(port)));
    }

    #[test]
    fn first_registration_is_admitted_at_once() {
        let mut server = rendezvous();
        let out = sent(&server.on_envelope(addr(9001), connect("a", 9001)).unwrap());
        assert_eq!(out, vec![(addr(9001), Envelope::Leader { leader: addr(HEAD) })]);
        assert!(!server.is_sweeping());
    }

    #[test]
    fn duplicate_name_or_head_name_is_refused() {
        let mut server = rendezvous();
        register(&mut server, "a", 9001);
        let unique = Envelope::Rejected {
            error: RejectReason::UnUnique,
        };
        let out = sent(&server.on_envelope(addr(9002), connect("a", 9002)).unwrap());
        assert_eq!(out, vec![(addr(9002), unique.clone())]);
        let out = sent(&server.on_envelope(addr(9003), connect("head", 9003)).unwrap());
        assert_eq!(out, vec![(addr(9003), unique)]);
    }

    #[test]
    fn same_member_may_register_again() {
        let mut server = rendezvous();
        register(&mut server, "a", 9001);
        let out = sent(&server.on_envelope(addr(9001), connect("a", 9001)).unwrap());
        assert_eq!(out, vec![(addr(9001), Envelope::Leader { leader: addr(HEAD) })]);
    }

    #[test]
    fn registration_waits_for_sweep() {
        let mut server = rendezvous();
        register(&mut server, "a", 9001);
        let out = sent(&server.on_envelope(addr(9002), connect("b", 9002)).unwrap());
        assert_eq!(out, vec![(addr(9001), Envelope::Checkup)]);
        assert!(server.members().get("b").is_none());
        let out = sent(
            &server
                .on_envelope(addr(9001), Envelope::CheckupRes { username: "a".into() })
                .unwrap(),
        );
        assert_eq!(out, vec![(addr(9002), Envelope::Leader { leader: addr(HEAD) })]);
        assert_eq!(server.members().len(), 2);
    }

    #[test]
    fn silent_member_is_reported_and_registration_refused() {
        let mut server = rendezvous();
        register(&mut server, "a", 9001);
        server.on_envelope(addr(9002), connect("b", 9002)).unwrap();
        server.tick().unwrap();
        let out = sent(&server.tick().unwrap());
        assert_eq!(
            out,
            vec![
                (
                    addr(HEAD),
                    Envelope::Crash {
                        username: "a".into(),
                        info: addr(9001),
                        handled: false
                    }
                ),
                (
                    addr(9002),
                    Envelope::Rejected {
                        error: RejectReason::ServerDown
                    }
                ),
            ]
        );
        assert!(server.members().is_empty());
    }

    #[test]
    fn checkup_requests_coalesce() {
        let mut server = rendezvous();
        register(&mut server, "a", 9001);
        assert_eq!(sent(&server.on_envelope(addr(9001), Envelope::Checkup).unwrap()).len(), 1);
        assert!(sent(&server.on_envelope(addr(9001), Envelope::Checkup).unwrap()).is_empty());
    }

    #[test]
    fn deregistration_forgets_member() {
        let mut server = rendezvous();
        register(&mut server, "a", 9001);
        server
            .on_envelope(
                addr(9001),
                Envelope::rewire(
                    "a",
                    crate::protocol::PointerUpdate::Same,
                    crate::protocol::PointerUpdate::Same,
                    crate::protocol::PointerUpdate::Same,
                    crate::protocol::Cause::Disconnect,
                ),
            )
            .unwrap();
        assert!(server.members().is_empty());
    }

    #[test]
    fn periodic_sweep_runs_when_members_exist() {
        let config = RingConfig {
            sweep_interval_ticks: Some(3),
            ..RingConfig::default()
        };
        let mut server = Rendezvous::new(addr(HEAD), "head", config);
        assert!(sent(&server.tick().unwrap()).is_empty());
        server.on_envelope(addr(9001), connect("a", 9001)).unwrap();
        assert!(sent(&server.tick().unwrap()).is_empty());
        assert!(sent(&server.tick().unwrap()).is_empty());
        let out = sent(&server.tick().unwrap());
        assert_eq!(out, vec![(addr(9001), Envelope::Checkup)]);
    }
}
