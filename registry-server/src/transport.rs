//! TCP peer transport for the consensus engine: one connection per RPC,
//! length-prefixed JSON frames. Peer addresses are registered out of band
//! (via `register_peer`, called whenever this node learns of a peer through
//! `/join` or its own startup join flow) rather than being resolved through
//! the consensus engine's `voters` map, since that map is keyed by id and
//! this transport needs a `SocketAddr` to dial.

use async_trait::async_trait;
use dashmap::DashMap;
use registry_core::consensus::{NodeId, Rpc, Transport};
use registry_core::{Error, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct TcpTransport {
    peers: DashMap<NodeId, SocketAddr>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { peers: DashMap::new() }
    }

    pub fn register_peer(&self, id: NodeId, addr: SocketAddr) {
        self.peers.insert(id, addr);
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, target: &NodeId, rpc: Rpc) -> Result<Rpc> {
        let addr = *self
            .peers
            .get(target)
            .ok_or_else(|| Error::Other(anyhow::anyhow!("no known address for peer {target}")))?;

        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &rpc).await?;
        read_frame(&mut stream).await
    }
}

/// Accept loop: reads one RPC per connection, hands it to `handle`, writes
/// back the reply, then closes the connection. Runs until the listener
/// errors or the task is cancelled.
pub async fn serve_consensus(listener: TcpListener, handle: std::sync::Arc<registry_core::consensus::ConsensusHandle>) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "consensus listener accept failed");
                continue;
            }
        };
        let handle = handle.clone();
        tokio::spawn(async move {
            let rpc: Rpc = match read_frame(&mut stream).await {
                Ok(rpc) => rpc,
                Err(e) => {
                    tracing::debug!(error = %e, peer = %peer, "failed to read consensus frame");
                    return;
                }
            };
            let reply = handle.process_inbound(rpc);
            if let Err(e) = write_frame(&mut stream, &reply).await {
                tracing::debug!(error = %e, peer = %peer, "failed to write consensus reply");
            }
        });
    }
}

async fn write_frame(stream: &mut TcpStream, rpc: &Rpc) -> Result<()> {
    let bytes = serde_json::to_vec(rpc)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Rpc> {
    let len = stream.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(Error::from)
}
