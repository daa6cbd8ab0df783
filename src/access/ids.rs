//! Structured, serializable cluster-wide identifiers.
//!
//! Identifiers are cheap to clone and usable as map keys. `ShardIdentifier` round-trips
//! through its canonical string form (`member-<name>-shard-<shard>-<datastore>`), which
//! is what appears in peer tables and logs.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The name of a cluster member.
///
/// Member names are interned strings; equality and hashing are by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberName(SmolStr);

impl MemberName {
    /// Create a member name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(SmolStr::new(name.as_ref()))
    }

    /// String form of this name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of one shard replica hosted by one member.
///
/// Canonical string form: `member-<member>-shard-<shard>-<datastore>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardIdentifier {
    member: MemberName,
    shard_name: SmolStr,
    data_store_type: SmolStr,
}

impl ShardIdentifier {
    /// Create a shard identifier.
    pub fn new(
        member: MemberName,
        shard_name: impl AsRef<str>,
        data_store_type: impl AsRef<str>,
    ) -> Self {
        Self {
            member,
            shard_name: SmolStr::new(shard_name.as_ref()),
            data_store_type: SmolStr::new(data_store_type.as_ref()),
        }
    }

    /// The member hosting this replica.
    pub fn member(&self) -> &MemberName {
        &self.member
    }

    /// The shard name.
    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    /// The data store type, e.g. `config` or `operational`.
    pub fn data_store_type(&self) -> &str {
        &self.data_store_type
    }
}

impl fmt::Display for ShardIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "member-{}-shard-{}-{}",
            self.member, self.shard_name, self.data_store_type
        )
    }
}

/// Error parsing a [`ShardIdentifier`] from its string form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid shard identifier: {0}")]
pub struct InvalidShardIdentifier(String);

impl FromStr for ShardIdentifier {
    type Err = InvalidShardIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("member-")
            .ok_or_else(|| InvalidShardIdentifier(s.to_string()))?;
        let (member, rest) = rest
            .split_once("-shard-")
            .ok_or_else(|| InvalidShardIdentifier(s.to_string()))?;
        // The datastore type is the final dash-separated token; shard names may
        // themselves contain dashes.
        let (shard_name, data_store_type) = rest
            .rsplit_once('-')
            .ok_or_else(|| InvalidShardIdentifier(s.to_string()))?;
        if member.is_empty() || shard_name.is_empty() || data_store_type.is_empty() {
            return Err(InvalidShardIdentifier(s.to_string()));
        }
        Ok(ShardIdentifier::new(
            MemberName::new(member),
            shard_name,
            data_store_type,
        ))
    }
}

/// Identifier of a frontend (client process) attached to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrontendIdentifier {
    member: MemberName,
    client_id: Uuid,
}

impl FrontendIdentifier {
    /// Create a frontend identifier with a fresh client id.
    pub fn create(member: MemberName) -> Self {
        Self {
            member,
            client_id: Uuid::new_v4(),
        }
    }

    /// The member the frontend is attached to.
    pub fn member(&self) -> &MemberName {
        &self.member
    }

    /// The client instance id.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }
}

impl fmt::Display for FrontendIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}-frontend-{}", self.member, self.client_id)
    }
}

/// Identifier of a chain of causally ordered transactions issued by one frontend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionChainIdentifier {
    frontend: FrontendIdentifier,
    history_id: u64,
}

impl TransactionChainIdentifier {
    /// Create a chain identifier.
    pub fn new(frontend: FrontendIdentifier, history_id: u64) -> Self {
        Self {
            frontend,
            history_id,
        }
    }

    /// The issuing frontend.
    pub fn frontend(&self) -> &FrontendIdentifier {
        &self.frontend
    }

    /// The history counter within the frontend.
    pub fn history_id(&self) -> u64 {
        self.history_id
    }

    /// Derive the identifier for transaction `tx_id` on this chain.
    pub fn transaction(&self, tx_id: u64) -> TransactionIdentifier {
        TransactionIdentifier {
            chain: self.clone(),
            tx_id,
        }
    }
}

impl fmt::Display for TransactionChainIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-chn-{}", self.frontend, self.history_id)
    }
}

/// Identifier of a single transaction within a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionIdentifier {
    chain: TransactionChainIdentifier,
    tx_id: u64,
}

impl TransactionIdentifier {
    /// The chain this transaction belongs to.
    pub fn chain(&self) -> &TransactionChainIdentifier {
        &self.chain
    }

    /// The transaction counter within the chain.
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }
}

impl fmt::Display for TransactionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-txn-{}", self.chain, self.tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_identifier_roundtrip() {
        let id = ShardIdentifier::new(MemberName::new("member-1"), "default", "config");
        let s = id.to_string();
        assert_eq!(s, "member-member-1-shard-default-config");
        assert_eq!(s.parse::<ShardIdentifier>().unwrap(), id);
    }

    #[test]
    fn test_shard_identifier_dashes_in_shard_name() {
        let id = ShardIdentifier::new(MemberName::new("n2"), "inventory-topology", "operational");
        let parsed: ShardIdentifier = id.to_string().parse().unwrap();
        assert_eq!(parsed.shard_name(), "inventory-topology");
        assert_eq!(parsed.data_store_type(), "operational");
    }

    #[test]
    fn test_shard_identifier_rejects_garbage() {
        assert!("not-a-shard-id".parse::<ShardIdentifier>().is_err());
        assert!("member--shard--config".parse::<ShardIdentifier>().is_err());
    }

    #[test]
    fn test_transaction_identifiers() {
        let frontend = FrontendIdentifier::create(MemberName::new("n1"));
        let chain = TransactionChainIdentifier::new(frontend, 3);
        let tx = chain.transaction(42);

        assert_eq!(tx.tx_id(), 42);
        assert_eq!(tx.chain().history_id(), 3);
        assert!(tx.to_string().ends_with("-chn-3-txn-42"));
    }

    #[test]
    fn test_member_name_serde() {
        let name = MemberName::new("member-7");
        let bytes = bincode::serialize(&name).unwrap();
        let decoded: MemberName = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, name);
    }
}
