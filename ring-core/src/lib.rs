//! Ring chat protocol reference implementation.
//! Host-driven: no I/O; host passes datagrams and ticks and receives actions.

pub mod config;
pub mod core;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod membership;
pub mod neighbors;
pub mod protocol;
pub mod rendezvous;
pub mod wire;

pub use crate::core::{Notice, OutboundAction, RingCore, Role};
pub use config::RingConfig;
pub use error::{Disposition, ErrorKind, RingError};
pub use fingerprint::Fingerprint;
pub use ledger::ChatLine;
pub use neighbors::NeighborTable;
pub use protocol::{Envelope, PeerAddress, Purpose, RejectReason};
pub use rendezvous::Rendezvous;
pub use wire::{decode_datagram, encode_datagram, DecodeError, EncodeError, MAX_DATAGRAM_LEN};
