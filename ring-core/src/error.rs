//! Protocol errors and how a host should react to each kind.

use crate::protocol::{PeerAddress, Purpose, RejectReason};
use crate::wire::{DecodeError, EncodeError};

/// Errors returned by ring handlers and host-facing operations.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("join rejected: {0}")]
    Rejected(RejectReason),
    #[error("rendezvous did not answer after {0} attempts")]
    RendezvousUnreachable(u32),
    #[error("head did not complete the join in time")]
    JoinTimedOut,
    #[error("kicked out of the ring by {0}; rejoin required")]
    KickedOut(PeerAddress),
    #[error("not joined to a ring")]
    NotJoined,
    #[error("no {0} neighbor to send to")]
    NoNeighbor(&'static str),
    #[error("{0} of my own messages are still in flight")]
    PendingOwned(usize),
    #[error("the head cannot leave the ring")]
    HeadCannotLeave,
    #[error("invalid direct message target {0:?}")]
    InvalidTarget(String),
    #[error("unexpected {purpose} from {from}")]
    UnexpectedEnvelope { purpose: Purpose, from: PeerAddress },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("fingerprint encoding failed: {0}")]
    Fingerprint(#[from] bincode::Error),
}

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Name taken or ring under repair; surfaced immediately.
    Bootstrap,
    /// Stale predecessor detected.
    Desync,
    /// Unacknowledged requests after the retry cap.
    TransportLoss,
    /// A neighbor vanished mid-operation.
    PeerFailure,
    /// Undecodable or out-of-place envelope.
    Malformed,
    /// Local operation refused in the current state.
    Usage,
}

/// What the event loop should do with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Log and keep running.
    Continue,
    /// Abandon local state and re-run the join protocol.
    Rejoin,
    /// Report to the user and stop.
    Exit,
}

impl RingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RingError::Rejected(RejectReason::JoinFailed) => ErrorKind::TransportLoss,
            RingError::Rejected(_) => ErrorKind::Bootstrap,
            RingError::RendezvousUnreachable(_) | RingError::JoinTimedOut => {
                ErrorKind::TransportLoss
            }
            RingError::KickedOut(_) => ErrorKind::Desync,
            RingError::NoNeighbor(_) => ErrorKind::PeerFailure,
            RingError::UnexpectedEnvelope { .. } | RingError::Decode(_) => ErrorKind::Malformed,
            RingError::NotJoined
            | RingError::PendingOwned(_)
            | RingError::HeadCannotLeave
            | RingError::InvalidTarget(_)
            | RingError::Encode(_)
            | RingError::Fingerprint(_) => ErrorKind::Usage,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self.kind() {
            ErrorKind::Bootstrap | ErrorKind::TransportLoss => Disposition::Exit,
            ErrorKind::Desync => Disposition::Rejoin,
            ErrorKind::PeerFailure | ErrorKind::Malformed | ErrorKind::Usage => {
                Disposition::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions_follow_taxonomy() {
        let addr = PeerAddress::from(std::net::SocketAddr::from(([127, 0, 0, 1], 9001)));
        assert_eq!(
            RingError::Rejected(RejectReason::UnUnique).disposition(),
            Disposition::Exit
        );
        assert_eq!(
            RingError::Rejected(RejectReason::JoinFailed).kind(),
            ErrorKind::TransportLoss
        );
        assert_eq!(RingError::KickedOut(addr).disposition(), Disposition::Rejoin);
        assert_eq!(
            RingError::Decode(DecodeError::MissingPurpose).disposition(),
            Disposition::Continue
        );
        assert_eq!(
            RingError::NoNeighbor("prev").kind(),
            ErrorKind::PeerFailure
        );
        assert_eq!(RingError::PendingOwned(2).disposition(), Disposition::Continue);
    }
}
