//! In-process transport for tests and single-process clusters.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::trace;

use crate::access::MemberName;
use crate::network::{Envelope, Transport};

/// A registry of in-process members and the links between them.
///
/// Links can be severed and healed to simulate partitions.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    inboxes: DashMap<MemberName, mpsc::UnboundedSender<Envelope>>,
    severed: DashSet<(MemberName, MemberName)>,
}

impl LocalNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `member` and return its transport plus the inbound envelope stream.
    pub fn join(
        self: &Arc<Self>,
        member: MemberName,
    ) -> (LocalTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(member.clone(), tx);
        (
            LocalTransport {
                network: Arc::clone(self),
                local: member,
            },
            rx,
        )
    }

    /// Sever both directions between `a` and `b`.
    pub fn sever(&self, a: &MemberName, b: &MemberName) {
        self.severed.insert((a.clone(), b.clone()));
        self.severed.insert((b.clone(), a.clone()));
    }

    /// Isolate `member` from every other registered member.
    pub fn isolate(&self, member: &MemberName) {
        for entry in self.inboxes.iter() {
            if entry.key() != member {
                self.sever(member, entry.key());
            }
        }
    }

    /// Heal all severed links.
    pub fn heal(&self) {
        self.severed.clear();
    }

    fn deliver(&self, from: &MemberName, to: &MemberName, envelope: Envelope) {
        if self.severed.contains(&(from.clone(), to.clone())) {
            trace!(%from, %to, "dropping envelope on severed link");
            return;
        }
        if let Some(inbox) = self.inboxes.get(to) {
            // A closed inbox means the member shut down; the protocol tolerates loss.
            let _ = inbox.send(envelope);
        }
    }
}

/// The [`Transport`] endpoint of one member on a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    local: MemberName,
}

impl Transport for LocalTransport {
    fn send(&self, to: &MemberName, envelope: Envelope) {
        self.network.deliver(&self.local, to, envelope);
    }

    fn set_peer_address(&self, _peer: MemberName, _address: String) {
        // Addresses are meaningless in-process.
    }

    fn remove_peer(&self, _peer: &MemberName) {}

    fn local_address(&self) -> Option<String> {
        Some(format!("local://{}", self.local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AbiVersion;
    use crate::messages::{RaftRpc, RequestVoteReply};

    fn envelope(from: &MemberName) -> Envelope {
        Envelope {
            from: from.clone(),
            from_address: None,
            version: AbiVersion::CURRENT,
            rpc: RaftRpc::RequestVoteReply(RequestVoteReply {
                term: 1,
                vote_granted: true,
            }),
        }
    }

    #[tokio::test]
    async fn test_delivery() {
        let network = LocalNetwork::new();
        let n1 = MemberName::new("n1");
        let n2 = MemberName::new("n2");
        let (t1, _rx1) = network.join(n1.clone());
        let (_t2, mut rx2) = network.join(n2.clone());

        t1.send(&n2, envelope(&n1));
        let received = rx2.recv().await.unwrap();
        assert_eq!(received.from, n1);
    }

    #[tokio::test]
    async fn test_severed_link_drops() {
        let network = LocalNetwork::new();
        let n1 = MemberName::new("n1");
        let n2 = MemberName::new("n2");
        let (t1, _rx1) = network.join(n1.clone());
        let (_t2, mut rx2) = network.join(n2.clone());

        network.sever(&n1, &n2);
        t1.send(&n2, envelope(&n1));
        assert!(rx2.try_recv().is_err());

        network.heal();
        t1.send(&n2, envelope(&n1));
        assert!(rx2.recv().await.is_some());
    }
}
