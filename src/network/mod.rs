//! Member-to-member transport.

mod local;
mod rpc;
mod server;

pub use local::{LocalNetwork, LocalTransport};
pub use rpc::{decode_frame, encode_frame, Envelope};
pub use server::TcpTransport;

use crate::access::MemberName;

/// Outbound side of the member-to-member transport.
///
/// Sends are fire-and-forget: delivery failures surface as peer inactivity, which the
/// protocol already tolerates. Implementations queue internally so `send` never blocks
/// the consensus loop.
pub trait Transport: Send + Sync + 'static {
    /// Queue an envelope for `to`.
    fn send(&self, to: &MemberName, envelope: Envelope);

    /// Record or update a peer's network address.
    fn set_peer_address(&self, peer: MemberName, address: String);

    /// Forget a peer and tear down its connection.
    fn remove_peer(&self, peer: &MemberName);

    /// The address other members can reach this one at, if any.
    fn local_address(&self) -> Option<String>;
}
