//! Whole-ring scenarios over an in-memory datagram network.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use ring_core::{
    decode_datagram, ChatLine, Disposition, Envelope, Notice, OutboundAction, PeerAddress,
    Purpose, RejectReason, Rendezvous, RingConfig, RingCore, RingError,
};

const RENDEZVOUS: u16 = 6000;
const HEAD: u16 = 7000;

fn addr(port: u16) -> PeerAddress {
    PeerAddress::from(SocketAddr::from(([127, 0, 0, 1], port)))
}

fn config() -> RingConfig {
    RingConfig {
        sweep_interval_ticks: None,
        ..RingConfig::default()
    }
}

/// FIFO network with one `RingCore` per address and a rendezvous.
struct Sim {
    rendezvous: Rendezvous,
    nodes: BTreeMap<PeerAddress, RingCore>,
    queue: VecDeque<(PeerAddress, PeerAddress, Vec<u8>)>,
    crashed: HashSet<PeerAddress>,
    /// Datagrams of one purpose silently dropped on their way to one peer.
    dropped: Vec<(PeerAddress, Purpose)>,
    shown: HashMap<PeerAddress, Vec<ChatLine>>,
    notices: HashMap<PeerAddress, Vec<Notice>>,
    /// Datagrams addressed to nobody.
    lost: Vec<(PeerAddress, Envelope)>,
    errors: Vec<(PeerAddress, String)>,
}

impl Sim {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            addr(HEAD),
            RingCore::head("head", addr(HEAD), addr(RENDEZVOUS), config()),
        );
        Self {
            rendezvous: Rendezvous::new(addr(HEAD), "head", config()),
            nodes,
            queue: VecDeque::new(),
            crashed: HashSet::new(),
            dropped: Vec::new(),
            shown: HashMap::new(),
            notices: HashMap::new(),
            lost: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn absorb(&mut self, at: PeerAddress, result: Result<Vec<OutboundAction>, RingError>) {
        match result {
            Ok(actions) => {
                for action in actions {
                    match action {
                        OutboundAction::SendMessage(to, bytes) => self.queue.push_back((at, to, bytes)),
                        OutboundAction::Display(line) => self.shown.entry(at).or_default().push(line),
                        OutboundAction::Notify(notice) => {
                            self.notices.entry(at).or_default().push(notice)
                        }
                    }
                }
            }
            Err(err) if err.disposition() == Disposition::Rejoin => {
                if let Some(node) = self.nodes.get_mut(&at) {
                    let result = node.rejoin();
                    self.absorb(at, result);
                }
            }
            Err(err) => self.errors.push((at, err.to_string())),
        }
    }

    fn deliver(&mut self) {
        let mut budget = 100_000;
        while let Some((from, to, bytes)) = self.queue.pop_front() {
            budget -= 1;
            assert!(budget > 0, "datagram storm");
            if self.crashed.contains(&to) {
                continue;
            }
            if !self.dropped.is_empty() {
                let purpose = decode_datagram(&bytes).unwrap().purpose();
                if self.dropped.contains(&(to, purpose)) {
                    continue;
                }
            }
            if to == addr(RENDEZVOUS) {
                let result = self.rendezvous.on_datagram(from, &bytes);
                self.absorb(to, result);
                continue;
            }
            let Some(node) = self.nodes.get_mut(&to) else {
                self.lost.push((to, decode_datagram(&bytes).unwrap()));
                continue;
            };
            let result = node.on_datagram(from, &bytes);
            self.absorb(to, result);
        }
    }

    fn tick(&mut self, rounds: usize) {
        for _ in 0..rounds {
            let result = self.rendezvous.tick();
            self.absorb(addr(RENDEZVOUS), result);
            let live: Vec<PeerAddress> = self
                .nodes
                .keys()
                .copied()
                .filter(|a| !self.crashed.contains(a))
                .collect();
            for at in live {
                let result = self.nodes.get_mut(&at).unwrap().tick();
                self.absorb(at, result);
            }
            self.deliver();
        }
    }

    fn inject(&mut self, from: PeerAddress, to: PeerAddress, envelope: Envelope) {
        let bytes = ring_core::encode_datagram(&envelope).unwrap();
        self.queue.push_back((from, to, bytes));
        self.deliver();
    }

    /// Start a member and let the network settle, however far it gets.
    fn start_join(&mut self, name: &str, port: u16) {
        let at = addr(port);
        let mut node = RingCore::member(name, at, addr(RENDEZVOUS), config());
        let result = node.connect();
        self.nodes.insert(at, node);
        self.absorb(at, result);
        self.deliver();
    }

    fn join(&mut self, name: &str, port: u16) {
        self.start_join(name, port);
        assert!(self.node(port).is_joined(), "{name} failed to join: {:?}", self.errors);
    }

    fn node(&self, port: u16) -> &RingCore {
        &self.nodes[&addr(port)]
    }

    fn send_global(&mut self, port: u16, text: &str) {
        let result = self.nodes.get_mut(&addr(port)).unwrap().send_global(text);
        self.absorb(addr(port), result);
    }

    fn send_direct(&mut self, port: u16, target: &str, text: &str) {
        let result = self
            .nodes
            .get_mut(&addr(port))
            .unwrap()
            .send_direct(target, text);
        self.absorb(addr(port), result);
    }

    fn leave(&mut self, port: u16) {
        let result = self.nodes.get_mut(&addr(port)).unwrap().leave();
        self.absorb(addr(port), result);
        self.deliver();
    }

    fn texts(&self, port: u16) -> Vec<String> {
        self.shown
            .get(&addr(port))
            .map(|lines| lines.iter().map(|l| l.text.clone()).collect())
            .unwrap_or_default()
    }

    fn notices(&self, port: u16) -> &[Notice] {
        self.notices.get(&addr(port)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Follow `next_1` from the head until it closes.
    fn ring_order(&self) -> Vec<PeerAddress> {
        let mut order = vec![addr(HEAD)];
        let mut at = self.node(HEAD).neighbors().next_1().unwrap();
        while at != addr(HEAD) {
            order.push(at);
            assert!(order.len() <= self.nodes.len(), "ring does not close: {order:?}");
            at = self.nodes[&at].neighbors().next_1().unwrap();
        }
        order
    }

    /// Every member's prev and shortcut agree with the successor chain.
    fn assert_consistent(&self) {
        let order = self.ring_order();
        let n = order.len();
        for (i, at) in order.iter().enumerate() {
            let table = self.nodes[at].neighbors();
            assert_eq!(table.prev(), Some(order[(i + n - 1) % n]), "prev of {at}");
            let shortcut = if n > 2 { Some(order[(i + 2) % n]) } else { None };
            assert_eq!(table.next_2(), shortcut, "next_2 of {at}");
        }
    }
}

/// head -> c -> b -> a -> head
fn ring_of_four() -> Sim {
    let mut sim = Sim::new();
    sim.join("a", 7001);
    sim.join("b", 7002);
    sim.join("c", 7003);
    sim
}

#[test]
fn joiners_are_spliced_in_after_head() {
    let sim = ring_of_four();
    assert_eq!(
        sim.ring_order(),
        vec![addr(HEAD), addr(7003), addr(7002), addr(7001)]
    );
    sim.assert_consistent();
    assert!(sim.errors.is_empty(), "{:?}", sim.errors);
    assert_eq!(sim.rendezvous.members().len(), 3);
}

#[test]
fn taken_name_is_refused() {
    let mut sim = ring_of_four();
    let mut dup = RingCore::member("a", addr(7009), addr(RENDEZVOUS), config());
    let result = dup.connect();
    sim.nodes.insert(addr(7009), dup);
    sim.absorb(addr(7009), result);
    sim.deliver();
    assert!(!sim.node(7009).is_joined());
    assert_eq!(sim.errors.len(), 1);
    assert_eq!(sim.errors[0].0, addr(7009));
    assert!(sim.errors[0].1.contains(&RejectReason::UnUnique.to_string()));
}

#[test]
fn broadcast_is_displayed_once_everywhere() {
    let mut sim = ring_of_four();
    sim.send_global(7002, "hello ring");
    sim.deliver();
    for port in [HEAD, 7001, 7002, 7003] {
        assert_eq!(sim.texts(port), vec!["hello ring".to_string()], "at {port}");
        assert!(sim.node(port).pending().is_empty(), "at {port}");
    }
}

#[test]
fn broadcasts_from_one_sender_keep_their_order() {
    let mut sim = ring_of_four();
    sim.send_global(7001, "first");
    sim.send_global(7001, "second");
    sim.send_global(7001, "third");
    sim.deliver();
    for port in [HEAD, 7001, 7002, 7003] {
        assert_eq!(sim.texts(port), vec!["first", "second", "third"], "at {port}");
    }
}

#[test]
fn concurrent_senders_are_each_displayed_once() {
    let mut sim = ring_of_four();
    sim.send_global(7002, "x");
    sim.send_global(7001, "y");
    sim.send_global(HEAD, "z");
    sim.deliver();
    for port in [HEAD, 7001, 7002, 7003] {
        let mut texts = sim.texts(port);
        texts.sort();
        assert_eq!(texts, vec!["x", "y", "z"], "at {port}");
    }
    assert!(sim.errors.is_empty(), "{:?}", sim.errors);
}

#[test]
fn direct_message_reaches_only_its_target() {
    let mut sim = ring_of_four();
    sim.send_direct(7002, "head", "just for you");
    sim.deliver();
    assert_eq!(sim.texts(HEAD), vec!["just for you".to_string()]);
    assert!(sim.shown[&addr(HEAD)][0].direct);
    for port in [7001, 7002, 7003] {
        assert!(sim.texts(port).is_empty(), "at {port}");
    }
    assert!(sim
        .notices(7002)
        .contains(&Notice::DirectDelivered("head".into())));
    assert!(sim.node(7002).pending().is_empty());
}

#[test]
fn direct_message_to_nobody_comes_back() {
    let mut sim = ring_of_four();
    sim.send_direct(7002, "zed", "anyone?");
    sim.deliver();
    assert!(sim
        .notices(7002)
        .contains(&Notice::TargetMissing("zed".into())));
    for port in [HEAD, 7001, 7002, 7003] {
        assert!(sim.texts(port).is_empty(), "at {port}");
        assert!(sim.node(port).pending().is_empty(), "at {port}");
    }
}

#[test]
fn graceful_leave_heals_the_ring() {
    let mut sim = ring_of_four();
    sim.leave(7002);
    assert!(sim.notices(7002).contains(&Notice::Left));
    assert_eq!(sim.ring_order(), vec![addr(HEAD), addr(7003), addr(7001)]);
    sim.assert_consistent();
    for port in [HEAD, 7001, 7003] {
        assert!(!sim.node(port).neighbors().references(addr(7002)), "at {port}");
    }
    assert!(sim.rendezvous.members().get("b").is_none());

    sim.send_global(7001, "after");
    sim.deliver();
    for port in [HEAD, 7001, 7003] {
        assert_eq!(sim.texts(port), vec!["after".to_string()]);
    }
    assert!(sim.texts(7002).is_empty());
}

#[test]
fn last_member_leaving_leaves_head_alone() {
    let mut sim = Sim::new();
    sim.join("a", 7001);
    sim.leave(7001);
    let head = sim.node(HEAD);
    assert!(head.neighbors().is_alone(addr(HEAD)));
    assert!(sim.notices(HEAD).contains(&Notice::Alone));
}

#[test]
fn crashed_member_is_bypassed_and_stuck_message_delivered() {
    let mut sim = ring_of_four();
    sim.crashed.insert(addr(7002));
    // c's successor is the dead b: the message stalls until a sweep finds it.
    sim.send_global(7003, "through the gap");
    sim.deliver();
    assert_eq!(sim.node(7003).pending().len(), 1);

    sim.tick(40);

    assert_eq!(sim.ring_order(), vec![addr(HEAD), addr(7003), addr(7001)]);
    sim.assert_consistent();
    for port in [HEAD, 7001, 7003] {
        assert!(!sim.node(port).neighbors().references(addr(7002)), "at {port}");
        assert_eq!(
            sim.texts(port),
            vec!["through the gap".to_string()],
            "at {port}"
        );
        assert!(sim.node(port).pending().is_empty(), "at {port}");
    }
    assert!(sim.rendezvous.members().get("b").is_none());
}

#[test]
fn registration_during_repair_is_refused_then_succeeds() {
    let mut sim = ring_of_four();
    sim.crashed.insert(addr(7002));
    let mut late = RingCore::member("d", addr(7004), addr(RENDEZVOUS), config());
    let result = late.connect();
    sim.nodes.insert(addr(7004), late);
    sim.absorb(addr(7004), result);
    sim.deliver();
    sim.tick(2);
    assert!(sim
        .errors
        .iter()
        .any(|(at, e)| *at == addr(7004) && e.contains(&RejectReason::ServerDown.to_string())));
    assert_eq!(sim.ring_order(), vec![addr(HEAD), addr(7003), addr(7001)]);

    sim.nodes.remove(&addr(7004));
    sim.join("d", 7004);
    assert_eq!(sim.ring_order()[1], addr(7004));
    sim.assert_consistent();
}

#[test]
fn stale_member_is_kicked_out_and_rejoins() {
    let mut sim = Sim::new();
    sim.join("a", 7001);
    sim.join("b", 7002);
    // head -> b -> a -> head. A false alarm makes the ring bypass a, which keeps running.
    sim.inject(
        addr(RENDEZVOUS),
        addr(HEAD),
        Envelope::Crash {
            username: "a".into(),
            info: addr(7001),
            handled: false,
        },
    );
    assert_eq!(sim.ring_order(), vec![addr(HEAD), addr(7002)]);
    assert!(sim.node(7001).is_joined());

    sim.send_global(7001, "am I still here?");
    sim.deliver();

    assert!(sim.notices(7001).contains(&Notice::Rejoining));
    assert!(sim.node(7001).is_joined());
    assert_eq!(
        sim.ring_order(),
        vec![addr(HEAD), addr(7001), addr(7002)]
    );
    sim.assert_consistent();
    for port in [HEAD, 7001, 7002] {
        assert!(sim.texts(port).is_empty(), "at {port}");
    }
}

#[test]
fn join_is_abandoned_when_successor_never_answers() {
    let mut sim = Sim::new();
    sim.join("a", 7001);
    sim.crashed.insert(addr(7001));
    // Bypass the rendezvous so no sweep intervenes.
    sim.inject(
        addr(7005),
        addr(HEAD),
        Envelope::Connect {
            username: "e".into(),
            addr: addr(7005),
        },
    );
    sim.tick(30);
    assert!(sim.lost.contains(&(
        addr(7005),
        Envelope::Rejected {
            error: RejectReason::JoinFailed
        }
    )));
    let head = sim.node(HEAD);
    assert_eq!(head.neighbors().next_1(), Some(addr(7001)));
    assert_eq!(head.neighbors().prev(), Some(addr(7001)));
}

#[test]
fn crash_of_only_member_leaves_head_alone() {
    let mut sim = Sim::new();
    sim.join("a", 7001);
    sim.crashed.insert(addr(7001));
    // The stalled broadcast makes the head ask for a sweep.
    sim.send_global(HEAD, "anyone?");
    sim.deliver();
    sim.tick(25);

    assert!(sim.node(HEAD).neighbors().is_alone(addr(HEAD)));
    assert!(!sim.node(HEAD).neighbors().references(addr(7001)));
    assert!(sim.notices(HEAD).contains(&Notice::Alone));
    assert!(sim.rendezvous.members().get("a").is_none());

    sim.join("b", 7002);
    assert_eq!(sim.ring_order(), vec![addr(HEAD), addr(7002)]);
    sim.assert_consistent();
}

#[test]
fn queued_joiner_past_its_wait_is_refused_not_spliced() {
    let mut sim = Sim::new();
    sim.join("a", 7001);
    sim.join("b", 7002);
    // head -> b -> a -> head; the tail never hears update_last_node for a while.
    sim.dropped.push((addr(7001), Purpose::UpdateLastNode));
    sim.start_join("e", 7005);
    sim.start_join("f", 7006);
    sim.start_join("g", 7007);
    sim.tick(37);
    sim.dropped.clear();
    sim.tick(15);

    assert_eq!(sim.ring_order(), vec![addr(HEAD), addr(7002), addr(7001)]);
    sim.assert_consistent();
    let join_failed = RejectReason::JoinFailed.to_string();
    for port in [7005, 7006, 7007] {
        assert!(!sim.node(port).is_joined(), "at {port}");
        for member in [HEAD, 7001, 7002] {
            assert!(
                !sim.node(member).neighbors().references(addr(port)),
                "{member} still points at {port}"
            );
        }
        assert!(
            sim.errors
                .iter()
                .any(|(at, e)| *at == addr(port) && e.contains(&join_failed)),
            "{port}: {:?}",
            sim.errors
        );
    }
    // Refused before its own wait ran out.
    assert_eq!(
        sim.errors.iter().filter(|(at, _)| *at == addr(7007)).count(),
        1
    );

    sim.nodes.remove(&addr(7007));
    sim.join("g", 7007);
    assert_eq!(
        sim.ring_order(),
        vec![addr(HEAD), addr(7007), addr(7002), addr(7001)]
    );
    sim.assert_consistent();
}
