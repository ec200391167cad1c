//! Traits for the external collaborators the chain composes with.
//!
//! These are contracts only — the gRPC transport, ledger, and block cutter
//! implementations are out of scope; callers supply them.

use crate::error::{OrdererError, Result};
use crate::types::{Block, Envelope, SubmitRequest};

/// Host-provided access to ledger height, block retrieval, and batching.
pub trait ConsenterSupport: Send + Sync {
    fn chain_id(&self) -> &str;
    fn height(&self) -> u64;
    fn block(&self, number: u64) -> Option<Block>;
    fn sequence(&self) -> u64;
    fn batch_timeout(&self) -> std::time::Duration;

    /// Feed the cutter an ordered envelope; returns any complete batches
    /// and whether envelopes remain pending.
    fn ordered(&self, envelope: Envelope) -> (Vec<Vec<Envelope>>, bool);
    /// Force-cut the cutter, returning whatever batch (if any) was pending.
    fn cut(&self) -> Vec<Envelope>;

    fn write_block(&self, block: Block, encoded_metadata: Vec<u8>);
    fn write_config_block(&self, block: Block, encoded_metadata: Vec<u8>);

    fn process_normal_msg(&self, envelope: &Envelope) -> Result<u64>;
    fn process_config_msg(&self, envelope: &Envelope) -> Result<(Envelope, u64)>;
}

/// Reconfigures the communication layer after a membership change is
/// applied.
pub trait Configurator: Send + Sync {
    fn configure(&self, channel: &str, remote_nodes: &[RemoteNode]) -> Result<()>;
}

/// Raft message transport between consenters.
pub trait RPC: Send + Sync {
    fn step(&self, dest: u64, payload: Vec<u8>) -> Result<()>;
    fn send_submit(&self, dest: u64, req: SubmitRequest) -> Result<()>;
}

/// Pulls blocks from the rest of the cluster during snapshot catch-up.
pub trait BlockPuller: Send {
    /// Returns `None` if the block is currently unavailable.
    fn pull_block(&mut self, seq: u64) -> Option<Block>;
    fn close(&mut self);
}

/// A remote consenter's network/identity descriptor, with TLS certs already
/// decoded from PEM to DER.
#[derive(Debug, Clone)]
pub struct RemoteNode {
    pub id: u64,
    pub endpoint: String,
    pub server_tls_cert_der: Vec<u8>,
    pub client_tls_cert_der: Vec<u8>,
}

impl RemoteNode {
    pub fn from_pem(
        id: u64,
        endpoint: String,
        server_tls_cert_pem: &[u8],
        client_tls_cert_pem: &[u8],
    ) -> Result<Self> {
        Ok(RemoteNode {
            id,
            endpoint,
            server_tls_cert_der: decode_pem_to_der(server_tls_cert_pem)?,
            client_tls_cert_der: decode_pem_to_der(client_tls_cert_pem)?,
        })
    }
}

/// Decode a single PEM block into DER bytes, rejecting invalid PEM.
pub fn decode_pem_to_der(pem_bytes: &[u8]) -> Result<Vec<u8>> {
    let parsed = pem::parse(pem_bytes)
        .map_err(|e| OrdererError::Validation(format!("invalid PEM certificate: {e}")))?;
    Ok(parsed.into_contents())
}
