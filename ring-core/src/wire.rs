//! Datagram codec: one JSON envelope per datagram.

use serde::Deserialize;

use crate::protocol::{Envelope, Purpose};

/// Largest datagram a peer will send or accept.
pub const MAX_DATAGRAM_LEN: usize = 8 * 1024;

/// Encode an envelope into a single datagram.
pub fn encode_datagram(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(EncodeError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Error encoding an envelope (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("datagram too large ({0} bytes)")]
    TooLarge(usize),
}

#[derive(Deserialize)]
struct PurposeProbe {
    purpose: Option<String>,
}

/// Decode one datagram. Unknown purposes are reported separately from garbage so the host
/// can log them by name.
pub fn decode_datagram(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(DecodeError::TooLarge(bytes.len()));
    }
    match serde_json::from_slice::<Envelope>(bytes) {
        Ok(envelope) => Ok(envelope),
        Err(err) => match serde_json::from_slice::<PurposeProbe>(bytes) {
            Ok(PurposeProbe { purpose: None }) => Err(DecodeError::MissingPurpose),
            Ok(PurposeProbe {
                purpose: Some(name),
            }) if Purpose::parse(&name).is_none() => Err(DecodeError::UnknownPurpose(name)),
            _ => Err(DecodeError::Malformed(err)),
        },
    }
}

/// Error decoding a datagram.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram too large ({0} bytes)")]
    TooLarge(usize),
    #[error("envelope has no purpose")]
    MissingPurpose,
    #[error("unrecognized purpose {0:?}")]
    UnknownPurpose(String),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}
