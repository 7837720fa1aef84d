//! Ring wire protocol: peer addresses, chat payloads and the envelope union.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Reachable (host, port) of a peer. Assigned once at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Authored chat content. Forwarded unchanged hop to hop, so its fingerprint is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Username of the author.
    pub origin: String,
    /// Author's address (direct-message responses go straight back here).
    pub addr: PeerAddress,
    pub text: String,
    /// Per-author sequence number; keeps two identical texts distinct.
    pub seq: u64,
}

/// Partial neighbor update. `Same` leaves the slot untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerUpdate {
    Same,
    Set(Option<PeerAddress>),
}

impl PointerUpdate {
    pub fn to(addr: PeerAddress) -> Self {
        PointerUpdate::Set(Some(addr))
    }

    pub fn is_set(&self) -> bool {
        matches!(self, PointerUpdate::Set(_))
    }
}

/// Why a rewiring `disconnect` envelope was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    Disconnect,
    Crash,
    /// Head undoing a partially applied join.
    Rollback,
}

/// Reason carried by a `rejected` reply (rendezvous or head).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Username or address already registered.
    UnUnique,
    /// A liveness sweep found a crashed member; the ring is under repair.
    #[serde(rename = "server_down")]
    ServerDown,
    /// The head could not complete the join handshake.
    #[serde(rename = "join_failed")]
    JoinFailed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnUnique => f.write_str("username already in use"),
            RejectReason::ServerDown => f.write_str("ring is under repair"),
            RejectReason::JoinFailed => f.write_str("head could not complete the join"),
        }
    }
}

/// All wire envelopes. Encoded as JSON records discriminated by `purpose`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "purpose", rename_all = "snake_case")]
pub enum Envelope {
    /// Register with the rendezvous, or ask the head to be spliced in.
    Connect { username: String, addr: PeerAddress },
    /// Rendezvous: registration accepted; join through this head.
    Leader { leader: PeerAddress },
    /// Rendezvous or head refused the join.
    Rejected { error: RejectReason },
    /// Head to joiner: the pointers to adopt (prev is the head itself).
    Welcome {
        next_1: PeerAddress,
        next_2: Option<PeerAddress>,
    },
    /// Head to its successor: the joiner becomes your predecessor.
    UpdatePointers { prev: PeerAddress },
    /// Head to the tail: the joiner becomes your second-hop successor.
    UpdateLastNode { next_2: PeerAddress },
    /// Acknowledges `update_pointers` / `update_last_node`.
    PointersUpdated { curr_next: Option<PeerAddress> },
    Global { message: ChatMessage },
    GlobalResponse {
        username: String,
        /// Author of the acknowledged broadcast.
        origin: String,
        message_id: Fingerprint,
    },
    Direct { message: ChatMessage, target: String },
    DmResponse {
        username: String,
        message_id: Fingerprint,
    },
    /// Neighbor rewiring, also the rendezvous deregistration (only `username` is read there).
    Disconnect {
        username: String,
        prev: PointerUpdate,
        next_1: PointerUpdate,
        next_2: PointerUpdate,
        cause: Cause,
    },
    /// Crash alert: `info` is the crashed peer's address.
    Crash {
        username: String,
        info: PeerAddress,
        #[serde(default)]
        handled: bool,
    },
    Checkup,
    CheckupRes { username: String },
    /// Your view of the ring is stale; rejoin.
    KickedOut { username: String, addr: PeerAddress },
}

impl Envelope {
    pub fn purpose(&self) -> Purpose {
        match self {
            Envelope::Connect { .. } => Purpose::Connect,
            Envelope::Leader { .. } => Purpose::Leader,
            Envelope::Rejected { .. } => Purpose::Rejected,
            Envelope::Welcome { .. } => Purpose::Welcome,
            Envelope::UpdatePointers { .. } => Purpose::UpdatePointers,
            Envelope::UpdateLastNode { .. } => Purpose::UpdateLastNode,
            Envelope::PointersUpdated { .. } => Purpose::PointersUpdated,
            Envelope::Global { .. } => Purpose::Global,
            Envelope::GlobalResponse { .. } => Purpose::GlobalResponse,
            Envelope::Direct { .. } => Purpose::Direct,
            Envelope::DmResponse { .. } => Purpose::DmResponse,
            Envelope::Disconnect { .. } => Purpose::Disconnect,
            Envelope::Crash { .. } => Purpose::Crash,
            Envelope::Checkup => Purpose::Checkup,
            Envelope::CheckupRes { .. } => Purpose::CheckupRes,
            Envelope::KickedOut { .. } => Purpose::KickedOut,
        }
    }

    /// Rewiring envelope touching only the given slots.
    pub fn rewire(
        username: &str,
        prev: PointerUpdate,
        next_1: PointerUpdate,
        next_2: PointerUpdate,
        cause: Cause,
    ) -> Self {
        Envelope::Disconnect {
            username: username.to_string(),
            prev,
            next_1,
            next_2,
            cause,
        }
    }
}

/// Envelope discriminant, as it appears in the `purpose` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Connect,
    Leader,
    Rejected,
    Welcome,
    UpdatePointers,
    UpdateLastNode,
    PointersUpdated,
    Global,
    GlobalResponse,
    Direct,
    DmResponse,
    Disconnect,
    Crash,
    Checkup,
    CheckupRes,
    KickedOut,
}

impl Purpose {
    pub const ALL: [Purpose; 16] = [
        Purpose::Connect,
        Purpose::Leader,
        Purpose::Rejected,
        Purpose::Welcome,
        Purpose::UpdatePointers,
        Purpose::UpdateLastNode,
        Purpose::PointersUpdated,
        Purpose::Global,
        Purpose::GlobalResponse,
        Purpose::Direct,
        Purpose::DmResponse,
        Purpose::Disconnect,
        Purpose::Crash,
        Purpose::Checkup,
        Purpose::CheckupRes,
        Purpose::KickedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Connect => "connect",
            Purpose::Leader => "leader",
            Purpose::Rejected => "rejected",
            Purpose::Welcome => "welcome",
            Purpose::UpdatePointers => "update_pointers",
            Purpose::UpdateLastNode => "update_last_node",
            Purpose::PointersUpdated => "pointers_updated",
            Purpose::Global => "global",
            Purpose::GlobalResponse => "global_response",
            Purpose::Direct => "direct",
            Purpose::DmResponse => "dm_response",
            Purpose::Disconnect => "disconnect",
            Purpose::Crash => "crash",
            Purpose::Checkup => "checkup",
            Purpose::CheckupRes => "checkup_res",
            Purpose::KickedOut => "kicked_out",
        }
    }

    pub fn parse(name: &str) -> Option<Purpose> {
        Purpose::ALL.iter().copied().find(|p| p.as_str() == name)
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
