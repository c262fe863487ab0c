//! Content-addressed blocks and the block exchange protocol

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use circuitcraft_network::{Connection, Host, InboundStream, MessageStream, Result as NetworkResult, StreamProtocol};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{NodeError, Result};

pub const BLOCK_PROTOCOL: StreamProtocol = StreamProtocol::new("/circuitcraft/block/1.0.0");

/// Largest block accepted by the store and the exchange
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

const MAX_REQUEST_SIZE: usize = 256;
const MAX_RESPONSE_SIZE: usize = MAX_BLOCK_SIZE + 64;

/// SHA-256 of a block's bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId([u8; 32]);

impl ContentId {
    pub fn of(data: &[u8]) -> Self {
        let mut id = [0u8; 32];
        id.copy_from_slice(&Sha256::digest(data));
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether `data` hashes to this id
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", &hex::encode(self.0)[..16])
    }
}

impl FromStr for ContentId {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| NodeError::InvalidContentId(format!("{}: {}", s, e)))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NodeError::InvalidContentId(format!("{}: expected 32 bytes", s)))?;
        Ok(Self(array))
    }
}

/// In-memory block store. Cheap to clone; clones share blocks.
#[derive(Clone, Default)]
pub struct BlockStore {
    blocks: Arc<RwLock<HashMap<ContentId, Bytes>>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, data: impl Into<Bytes>) -> Result<ContentId> {
        let data = data.into();
        if data.len() > MAX_BLOCK_SIZE {
            return Err(NodeError::BlockTooLarge(data.len()));
        }
        let cid = ContentId::of(&data);
        self.blocks.write().entry(cid).or_insert(data);
        Ok(cid)
    }

    pub fn get(&self, cid: &ContentId) -> Option<Bytes> {
        self.blocks.read().get(cid).cloned()
    }

    pub fn contains(&self, cid: &ContentId) -> bool {
        self.blocks.read().contains_key(cid)
    }

    pub fn remove(&self, cid: &ContentId) -> Option<Bytes> {
        self.blocks.write().remove(cid)
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub cid: ContentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlockResponse {
    Found(Vec<u8>),
    NotFound,
}

/// Answer block requests from `store` until the host shuts down
pub fn serve_blocks(host: &Host, store: BlockStore) -> NetworkResult<()> {
    let mut incoming = host.accept(BLOCK_PROTOCOL)?;
    let token = host.shutdown_token();

    tokio::spawn(async move {
        loop {
            let inbound = tokio::select! {
                _ = token.cancelled() => break,
                inbound = incoming.next() => inbound,
            };
            let Some(inbound) = inbound else { break };
            tokio::spawn(handle_request(store.clone(), inbound));
        }
    });
    Ok(())
}

async fn handle_request(store: BlockStore, inbound: InboundStream) {
    let InboundStream { peer, stream } = inbound;
    let mut stream = MessageStream::new(stream, MAX_REQUEST_SIZE);

    let request: BlockRequest = match stream.recv().await {
        Ok(request) => request,
        Err(e) => {
            debug!("Bad block request from {}: {}", peer, e);
            return;
        }
    };

    let response = match store.get(&request.cid) {
        Some(data) => {
            debug!("Serving block {} ({} bytes) to {}", request.cid, data.len(), peer);
            BlockResponse::Found(data.to_vec())
        }
        None => BlockResponse::NotFound,
    };

    stream.set_max_size(MAX_RESPONSE_SIZE);
    if let Err(e) = stream.send(&response).await {
        debug!("Failed to answer block request from {}: {}", peer, e);
    }
}

/// Ask the peer behind `connection` for `cid`. `Ok(None)` if it does not
/// have the block.
pub async fn fetch_block(connection: &Connection, cid: ContentId) -> Result<Option<Bytes>> {
    let stream = connection.open_stream(BLOCK_PROTOCOL).await?;
    let mut stream = MessageStream::new(stream, MAX_REQUEST_SIZE);
    stream.send(&BlockRequest { cid }).await?;

    stream.set_max_size(MAX_RESPONSE_SIZE);
    match stream.recv().await? {
        BlockResponse::Found(data) => {
            if !cid.verify(&data) {
                warn!("Peer {} sent corrupt data for {}", connection.remote_peer(), cid);
                return Err(NodeError::Integrity(cid));
            }
            Ok(Some(Bytes::from(data)))
        }
        BlockResponse::NotFound => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_hex_parse() {
        let cid = ContentId::of(b"hello");
        assert_eq!(
            cid.to_string(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let parsed: ContentId = cid.to_string().parse().unwrap();
        assert_eq!(parsed, cid);
        assert!(cid.verify(b"hello"));
        assert!(!cid.verify(b"hello!"));
    }

    #[test]
    fn test_content_id_rejects_bad_input() {
        assert!(matches!("zz".parse::<ContentId>(), Err(NodeError::InvalidContentId(_))));
        assert!(matches!("abcd".parse::<ContentId>(), Err(NodeError::InvalidContentId(_))));
    }

    #[test]
    fn test_store_dedups_and_limits() {
        let store = BlockStore::new();
        assert!(store.is_empty());

        let a = store.put(&b"block"[..]).unwrap();
        let b = store.put(Bytes::from_static(b"block")).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).unwrap(), Bytes::from_static(b"block"));

        let big = vec![0u8; MAX_BLOCK_SIZE + 1];
        assert!(matches!(store.put(big), Err(NodeError::BlockTooLarge(_))));

        assert!(store.remove(&a).is_some());
        assert!(!store.contains(&a));
    }
}
