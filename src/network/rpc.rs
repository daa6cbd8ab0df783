//! Wire framing for consensus envelopes.
//!
//! A frame is `[u32 length][u16 abi version][bincode body]` with big-endian integers.
//! The version sits outside the body so a frame from an unknown release is rejected
//! with a precise error instead of a deserialization failure.

use serde::{Deserialize, Serialize};

use crate::access::{AbiVersion, AbiVersionError, MemberName};
use crate::error::{NetworkError, Result};
use crate::messages::RaftRpc;

/// One consensus message in flight between two members.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The sending member.
    pub from: MemberName,

    /// The sender's reachable address, so a member contacted for the first time can
    /// reply.
    pub from_address: Option<String>,

    /// The wire version the sender used.
    pub version: AbiVersion,

    /// The message.
    pub rpc: RaftRpc,
}

#[derive(Serialize, Deserialize)]
struct EnvelopeBody {
    from: MemberName,
    from_address: Option<String>,
    rpc: RaftRpc,
}

/// Encode an envelope into a length-prefixed frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = bincode::serialize(&EnvelopeBody {
        from: envelope.from.clone(),
        from_address: envelope.from_address.clone(),
        rpc: envelope.rpc.clone(),
    })?;

    let mut frame = Vec::with_capacity(6 + body.len());
    frame.extend_from_slice(&((body.len() + 2) as u32).to_be_bytes());
    frame.extend_from_slice(&envelope.version.value().to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame payload (everything after the length prefix).
pub fn decode_frame(payload: &[u8], peer: &str) -> Result<Envelope> {
    if payload.len() < 2 {
        return Err(NetworkError::Deserialization("frame too short".into()).into());
    }
    let raw_version = u16::from_be_bytes(payload[..2].try_into().unwrap());
    let version = AbiVersion::for_value(raw_version).map_err(|e| match e {
        AbiVersionError::Past(_) => NetworkError::PastVersion {
            peer: peer.to_string(),
            version: raw_version,
        },
        AbiVersionError::Future(_) => NetworkError::FutureVersion {
            peer: peer.to_string(),
            version: raw_version,
        },
    })?;

    let body: EnvelopeBody = bincode::deserialize(&payload[2..])
        .map_err(|e| NetworkError::Deserialization(e.to_string()))?;
    Ok(Envelope {
        from: body.from,
        from_address: body.from_address,
        version,
        rpc: body.rpc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::messages::{RequestVote, RaftRpc};

    fn envelope() -> Envelope {
        Envelope {
            from: MemberName::new("n1"),
            from_address: Some("127.0.0.1:4000".into()),
            version: AbiVersion::CURRENT,
            rpc: RaftRpc::RequestVote(RequestVote {
                term: 4,
                candidate: MemberName::new("n1"),
                last_log_index: 9,
                last_log_term: 3,
            }),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let original = envelope();
        let frame = encode_frame(&original).unwrap();

        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);

        let decoded = decode_frame(&frame[4..], "peer").unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_future_version_rejected() {
        let mut frame = encode_frame(&envelope()).unwrap();
        // Stamp a version from a future release.
        frame[4..6].copy_from_slice(&999u16.to_be_bytes());

        match decode_frame(&frame[4..], "peer") {
            Err(Error::Network(NetworkError::FutureVersion { version, .. })) => {
                assert_eq!(version, 999);
            }
            other => panic!("expected future version error, got {:?}", other),
        }
    }

    #[test]
    fn test_past_version_rejected() {
        let mut frame = encode_frame(&envelope()).unwrap();
        frame[4..6].copy_from_slice(&0u16.to_be_bytes());

        assert!(matches!(
            decode_frame(&frame[4..], "peer"),
            Err(Error::Network(NetworkError::PastVersion { version: 0, .. }))
        ));
    }
}
