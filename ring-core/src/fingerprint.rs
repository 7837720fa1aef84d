//! Message fingerprints: deterministic hash of a message's canonical encoding.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::protocol::{ChatMessage, Purpose};

/// Ledger and history key (16 bytes of SHA-256 over the canonical bincode encoding).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 16]);

struct DigestWriter(Sha256);

impl io::Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Fingerprint(bytes)
    }

    /// Fingerprint of a broadcast.
    pub fn of_global(message: &ChatMessage) -> Result<Self, bincode::Error> {
        Self::digest(Purpose::Global, message, None)
    }

    /// Fingerprint of a direct message; the target is part of the identity.
    pub fn of_direct(message: &ChatMessage, target: &str) -> Result<Self, bincode::Error> {
        Self::digest(Purpose::Direct, message, Some(target))
    }

    fn digest(
        purpose: Purpose,
        message: &ChatMessage,
        target: Option<&str>,
    ) -> Result<Self, bincode::Error> {
        let mut writer = DigestWriter(Sha256::new());
        bincode::serialize_into(&mut writer, &(purpose.as_str(), message, target))?;
        let digest = writer.0.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Ok(Fingerprint(id))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerAddress;

    fn message(text: &str, seq: u64) -> ChatMessage {
        ChatMessage {
            origin: "alice".into(),
            addr: PeerAddress::from(std::net::SocketAddr::from(([127, 0, 0, 1], 9001))),
            text: text.into(),
            seq,
        }
    }

    #[test]
    fn forwarded_copy_keeps_fingerprint() {
        let m = message("hi", 1);
        let forwarded = m.clone();
        assert_eq!(
            Fingerprint::of_global(&m).unwrap(),
            Fingerprint::of_global(&forwarded).unwrap()
        );
    }

    #[test]
    fn same_text_different_sequence_differs() {
        assert_ne!(
            Fingerprint::of_global(&message("hi", 1)).unwrap(),
            Fingerprint::of_global(&message("hi", 2)).unwrap()
        );
    }

    #[test]
    fn direct_and_global_never_collide() {
        let m = message("hi", 1);
        let global = Fingerprint::of_global(&m).unwrap();
        assert_ne!(global, Fingerprint::of_direct(&m, "bob").unwrap());
        assert_ne!(
            Fingerprint::of_direct(&m, "bob").unwrap(),
            Fingerprint::of_direct(&m, "carol").unwrap()
        );
    }

    #[test]
    fn display_is_hex() {
        let id = Fingerprint::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }
}
