//! Log entries and their payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{LogIndex, ServerConfig, Term};

/// The payload carried by one replicated log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Opaque state-machine command.
    Data(Bytes),

    /// A cluster configuration change. Applied to the peer table on append.
    VotingConfig(ServerConfig),

    /// Empty entry appended by a fresh leader to commit its term.
    Noop,
}

impl Payload {
    /// Approximate serialized size, used for batch and snapshot accounting.
    pub fn data_size(&self) -> usize {
        match self {
            Payload::Data(data) => data.len(),
            Payload::VotingConfig(config) => config.servers.len() * 32,
            Payload::Noop => 0,
        }
    }

    /// Whether this payload changes the cluster configuration.
    pub fn is_voting_config(&self) -> bool {
        matches!(self, Payload::VotingConfig(_))
    }
}

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log. Entries start at index 1.
    pub index: LogIndex,

    /// Term under which the entry was created.
    pub term: Term,

    /// The payload.
    pub payload: Payload,
}

impl LogEntry {
    /// Create an entry.
    pub fn new(index: LogIndex, term: Term, payload: Payload) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }

    /// Create a data entry.
    pub fn data(index: LogIndex, term: Term, data: impl Into<Bytes>) -> Self {
        Self::new(index, term, Payload::Data(data.into()))
    }

    /// Approximate payload size in bytes.
    pub fn data_size(&self) -> usize {
        self.payload.data_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MemberName;
    use crate::types::ServerInfo;

    #[test]
    fn test_entry_serialization() {
        let entry = LogEntry::data(3, 2, Bytes::from_static(b"hello"));
        let bytes = bincode::serialize(&entry).unwrap();
        let decoded: LogEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_payload_sizes() {
        assert_eq!(Payload::Noop.data_size(), 0);
        assert_eq!(Payload::Data(Bytes::from_static(b"abcd")).data_size(), 4);

        let config = ServerConfig::new(vec![ServerInfo::new(MemberName::new("n1"), true)]);
        assert!(Payload::VotingConfig(config).data_size() > 0);
    }
}
