//! TCP transport: length-prefixed frames over per-peer connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::access::MemberName;
use crate::error::Result;
use crate::network::rpc::{decode_frame, encode_frame};
use crate::network::{Envelope, Transport};

/// Frames larger than this are treated as protocol corruption.
const MAX_FRAME_SIZE: u32 = 512 * 1024 * 1024;

const RECONNECT_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct PeerLink {
    address: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// TCP-based [`Transport`].
///
/// Each peer gets a dedicated writer task holding one outbound connection, reconnecting
/// with a short delay when it drops. Inbound connections are accepted from anyone; the
/// envelope identifies the sender.
#[derive(Debug)]
pub struct TcpTransport {
    local: MemberName,
    local_address: String,
    peers: DashMap<MemberName, PeerLink>,
}

impl TcpTransport {
    /// Bind `bind_addr` and start accepting inbound connections. Returns the transport
    /// and the stream of inbound envelopes.
    pub async fn bind(
        local: MemberName,
        bind_addr: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Envelope>)> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_address = listener.local_addr()?.to_string();
        info!(member = %local, address = %local_address, "transport listening");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            local,
            local_address,
            peers: DashMap::new(),
        });

        tokio::spawn(accept_loop(listener, inbound_tx));
        Ok((transport, inbound_rx))
    }
}

async fn accept_loop(listener: TcpListener, inbound: mpsc::UnboundedSender<Envelope>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let inbound = inbound.clone();
        tokio::spawn(async move {
            if let Err(e) = read_loop(stream, remote, inbound).await {
                debug!(remote = %remote, error = %e, "inbound connection closed");
            }
        });
    }
}

async fn read_loop(
    mut stream: TcpStream,
    remote: SocketAddr,
    inbound: mpsc::UnboundedSender<Envelope>,
) -> Result<()> {
    let peer_label = remote.to_string();
    loop {
        let len = stream.read_u32().await?;
        if len == 0 || len > MAX_FRAME_SIZE {
            warn!(remote = %peer_label, len, "dropping connection with bad frame length");
            return Ok(());
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await?;

        match decode_frame(&payload, &peer_label) {
            Ok(envelope) => {
                if inbound.send(envelope).is_err() {
                    // Node shut down.
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(remote = %peer_label, error = %e, "discarding undecodable frame");
            }
        }
    }
}

async fn write_loop(address: String, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    let mut stream: Option<TcpStream> = None;
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_frame(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode envelope");
                continue;
            }
        };

        for attempt in 0..2 {
            if stream.is_none() {
                match TcpStream::connect(&address).await {
                    Ok(s) => stream = Some(s),
                    Err(e) => {
                        debug!(address = %address, error = %e, "connect failed");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                }
            }
            match stream.as_mut().unwrap().write_all(&frame).await {
                Ok(()) => break,
                Err(e) => {
                    debug!(address = %address, attempt, error = %e, "write failed");
                    stream = None;
                }
            }
        }
        // An undeliverable envelope is dropped; the protocol recovers via retries.
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: &MemberName, envelope: Envelope) {
        if let Some(link) = self.peers.get(to) {
            let _ = link.tx.send(envelope);
        } else {
            debug!(member = %self.local, peer = %to, "no address for peer, dropping envelope");
        }
    }

    fn set_peer_address(&self, peer: MemberName, address: String) {
        let stale = self
            .peers
            .get(&peer)
            .map(|link| link.address != address)
            .unwrap_or(true);
        if !stale {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(address.clone(), rx));
        self.peers.insert(peer, PeerLink { address, tx });
    }

    fn remove_peer(&self, peer: &MemberName) {
        self.peers.remove(peer);
    }

    fn local_address(&self) -> Option<String> {
        Some(self.local_address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AbiVersion;
    use crate::messages::{RaftRpc, RequestVote};

    fn envelope(from: &MemberName) -> Envelope {
        Envelope {
            from: from.clone(),
            from_address: None,
            version: AbiVersion::CURRENT,
            rpc: RaftRpc::RequestVote(RequestVote {
                term: 2,
                candidate: from.clone(),
                last_log_index: 0,
                last_log_term: 0,
            }),
        }
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let n1 = MemberName::new("n1");
        let n2 = MemberName::new("n2");
        let (t1, _rx1) = TcpTransport::bind(n1.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (t2, mut rx2) = TcpTransport::bind(n2.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        t1.set_peer_address(n2.clone(), t2.local_address().unwrap());
        t1.send(&n2, envelope(&n1));

        let received = tokio::time::timeout(Duration::from_secs(5), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.from, n1);
        assert_eq!(received.version, AbiVersion::CURRENT);
    }

    #[tokio::test]
    async fn test_send_without_address_drops() {
        let n1 = MemberName::new("n1");
        let (t1, _rx) = TcpTransport::bind(n1.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        // No address registered for n2; must not panic.
        t1.send(&MemberName::new("n2"), envelope(&n1));
    }
}
