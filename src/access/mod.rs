//! Wire-compatibility negotiation and cluster-wide identifier types.
//!
//! Every frame exchanged between members carries an [`AbiVersion`]. A member replies to
//! a peer using the lower of its own version and the peer's, so a mixed-version cluster
//! keeps talking during rolling upgrades. Versions that have been retired produce a
//! [`PastVersionError`]; versions from a newer release produce a [`FutureVersionError`].

mod ids;

pub use ids::{
    FrontendIdentifier, MemberName, ShardIdentifier, TransactionChainIdentifier,
    TransactionIdentifier,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A negotiated wire-format version.
///
/// Versions are totally ordered. The numeric values are part of the wire format and must
/// never be reused once retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum AbiVersion {
    /// Initial wire format.
    V1 = 1,

    /// Adds the voting configuration on the final snapshot chunk and the
    /// replicated-to-all hint on AppendEntries.
    V2 = 2,
}

/// The peer spoke a version this build has retired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("wire version {version} is retired, oldest supported is {oldest}")]
pub struct PastVersionError {
    /// The version the peer used.
    pub version: u16,
    /// The oldest version this build still speaks.
    pub oldest: u16,
}

/// The peer spoke a version this build does not know yet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("wire version {version} is from a future release, newest supported is {newest}")]
pub struct FutureVersionError {
    /// The version the peer used.
    pub version: u16,
    /// The newest version this build speaks.
    pub newest: u16,
}

/// Failure to map a raw version value onto a supported [`AbiVersion`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiVersionError {
    /// Retired version.
    #[error(transparent)]
    Past(#[from] PastVersionError),

    /// Not-yet-known version.
    #[error(transparent)]
    Future(#[from] FutureVersionError),
}

impl AbiVersion {
    /// The version this build emits by default.
    pub const CURRENT: AbiVersion = AbiVersion::V2;

    /// The oldest version this build still accepts.
    pub const OLDEST: AbiVersion = AbiVersion::V1;

    /// Raw wire value.
    pub const fn value(self) -> u16 {
        self as u16
    }

    /// Map a raw wire value onto a supported version.
    pub fn for_value(value: u16) -> Result<Self, AbiVersionError> {
        match value {
            1 => Ok(AbiVersion::V1),
            2 => Ok(AbiVersion::V2),
            v if v < Self::OLDEST.value() => Err(PastVersionError {
                version: v,
                oldest: Self::OLDEST.value(),
            }
            .into()),
            v => Err(FutureVersionError {
                version: v,
                newest: Self::CURRENT.value(),
            }
            .into()),
        }
    }

    /// The version to use when talking to a peer that advertised `peer`.
    pub fn negotiate(self, peer: AbiVersion) -> AbiVersion {
        self.min(peer)
    }
}

impl std::fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_value_roundtrip() {
        for version in [AbiVersion::V1, AbiVersion::V2] {
            assert_eq!(AbiVersion::for_value(version.value()).unwrap(), version);
        }
    }

    #[test]
    fn test_past_version() {
        match AbiVersion::for_value(0) {
            Err(AbiVersionError::Past(e)) => {
                assert_eq!(e.version, 0);
                assert_eq!(e.oldest, 1);
            }
            other => panic!("expected past version error, got {:?}", other),
        }
    }

    #[test]
    fn test_future_version() {
        match AbiVersion::for_value(57) {
            Err(AbiVersionError::Future(e)) => {
                assert_eq!(e.version, 57);
                assert_eq!(e.newest, AbiVersion::CURRENT.value());
            }
            other => panic!("expected future version error, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiate_picks_lower() {
        assert_eq!(AbiVersion::V2.negotiate(AbiVersion::V1), AbiVersion::V1);
        assert_eq!(AbiVersion::V1.negotiate(AbiVersion::V2), AbiVersion::V1);
        assert_eq!(AbiVersion::V2.negotiate(AbiVersion::V2), AbiVersion::V2);
    }
}
