//! Append-only simulated hash-chain for provenance anchoring
//!
//! No external node, no gas fees: `tx_hash` is a deterministic SHA-256 over
//! the previous block's `tx_hash`, the anchored data hash, issuer id, and
//! timestamp. The chain lives entirely behind the [`ChainStore`] trait so a
//! real append-only backend can replace [`InMemoryChainStore`] without
//! touching callers.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::WatermarkError;

/// `prev_hash` of the first block ever anchored.
pub const GENESIS_PREV_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One anchored block.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChainBlock {
    pub block_num: u64,
    pub prev_hash: String,
    pub tx_hash: String,
    pub data_hash: String,
    pub issuer_id: u32,
    pub signature_hex: String,
    pub payload_json: String,
    pub timestamp: DateTime<Utc>,
}

/// Receipt returned to the caller after a successful anchor.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ChainReceipt {
    pub tx_hash: String,
    pub block_num: u64,
    pub data_hash: String,
    pub issuer_id: u32,
    pub timestamp: DateTime<Utc>,
}

/// The explicit store handle the chain operates through — an append-only
/// ledger, not a general key/value store: `anchor` is the only mutator.
#[async_trait]
pub trait ChainStore: Send + Sync {
    async fn anchor(&self, data_hash: &str, issuer_id: u32, signature_hex: &str, payload_json: &str) -> ChainReceipt;
    async fn lookup(&self, data_hash: &str) -> Option<ChainBlock>;
    async fn lookup_tx(&self, tx_hash: &str) -> Option<ChainBlock>;
    async fn lookup_block_num(&self, block_num: u64) -> Option<ChainBlock>;
    async fn latest(&self) -> Option<ChainBlock>;
    async fn all_ordered(&self) -> Vec<ChainBlock>;
}

#[derive(Default)]
struct ChainState {
    blocks: Vec<ChainBlock>,
    by_data_hash: HashMap<String, usize>,
    by_tx_hash: HashMap<String, usize>,
}

/// Default [`ChainStore`]: one write lock guards the whole
/// read-latest/compute-hash/append sequence so two concurrent `anchor`
/// calls can never observe the same `prev_hash`.
#[derive(Default)]
pub struct InMemoryChainStore {
    state: RwLock<ChainState>,
}

#[async_trait]
impl ChainStore for InMemoryChainStore {
    async fn anchor(&self, data_hash: &str, issuer_id: u32, signature_hex: &str, payload_json: &str) -> ChainReceipt {
        let mut state = self.state.write().expect("chain store lock poisoned");

        let prev_hash = state.blocks.last().map(|b| b.tx_hash.clone()).unwrap_or_else(|| GENESIS_PREV_HASH.to_string());
        let timestamp = Utc::now();
        let preimage = format!("{prev_hash}{data_hash}{issuer_id}{}", timestamp.to_rfc3339());
        let tx_hash = hex::encode(Sha256::digest(preimage.as_bytes()));
        let block_num = state.blocks.len() as u64 + 1;

        let block = ChainBlock {
            block_num,
            prev_hash,
            tx_hash: tx_hash.clone(),
            data_hash: data_hash.to_string(),
            issuer_id,
            signature_hex: signature_hex.to_string(),
            payload_json: payload_json.to_string(),
            timestamp,
        };

        let idx = state.blocks.len();
        state.by_data_hash.insert(data_hash.to_string(), idx);
        state.by_tx_hash.insert(tx_hash.clone(), idx);
        state.blocks.push(block);

        ChainReceipt { tx_hash, block_num, data_hash: data_hash.to_string(), issuer_id, timestamp }
    }

    async fn lookup(&self, data_hash: &str) -> Option<ChainBlock> {
        let state = self.state.read().expect("chain store lock poisoned");
        state.by_data_hash.get(data_hash).map(|&idx| state.blocks[idx].clone())
    }

    async fn lookup_tx(&self, tx_hash: &str) -> Option<ChainBlock> {
        let state = self.state.read().expect("chain store lock poisoned");
        state.by_tx_hash.get(tx_hash).map(|&idx| state.blocks[idx].clone())
    }

    async fn lookup_block_num(&self, block_num: u64) -> Option<ChainBlock> {
        let idx = block_num.checked_sub(1)? as usize;
        self.state.read().expect("chain store lock poisoned").blocks.get(idx).cloned()
    }

    async fn latest(&self) -> Option<ChainBlock> {
        self.state.read().expect("chain store lock poisoned").blocks.last().cloned()
    }

    async fn all_ordered(&self) -> Vec<ChainBlock> {
        self.state.read().expect("chain store lock poisoned").blocks.clone()
    }
}

/// Confirm `data_hash` is anchored under exactly `tx_hash`.
pub async fn verify(store: &dyn ChainStore, data_hash: &str, tx_hash: &str) -> bool {
    matches!(store.lookup(data_hash).await, Some(block) if block.tx_hash == tx_hash)
}

/// Walk the whole chain checking genesis and linkage invariants.
///
/// Returns `(true, "valid chain with N blocks")` (or `"empty chain"`) on
/// success, `(false, reason)` at the first defect found.
pub async fn validate_chain(store: &dyn ChainStore) -> (bool, String) {
    let blocks = store.all_ordered().await;

    if blocks.is_empty() {
        return (true, "empty chain".to_string());
    }

    if blocks[0].prev_hash != GENESIS_PREV_HASH {
        return (false, format!("block {}: invalid genesis prev_hash", blocks[0].block_num));
    }

    for i in 1..blocks.len() {
        if blocks[i].prev_hash != blocks[i - 1].tx_hash {
            return (
                false,
                format!(
                    "block {}: prev_hash mismatch (expected {}, got {})",
                    blocks[i].block_num,
                    blocks[i - 1].tx_hash,
                    blocks[i].prev_hash
                ),
            );
        }
    }

    (true, format!("valid chain with {} blocks", blocks.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_block_points_to_genesis() {
        let store = InMemoryChainStore::default();
        let receipt = store.anchor("hash-1", 100, "sig", "{}").await;
        let block = store.lookup("hash-1").await.unwrap();
        assert_eq!(block.prev_hash, GENESIS_PREV_HASH);
        assert_eq!(block.tx_hash, receipt.tx_hash);
        assert_eq!(block.block_num, 1);
        assert_eq!(receipt.block_num, 1);
    }

    #[tokio::test]
    async fn chain_links_sequentially() {
        let store = InMemoryChainStore::default();
        let r1 = store.anchor("hash-1", 100, "sig1", "{}").await;
        let r2 = store.anchor("hash-2", 100, "sig2", "{}").await;

        assert_eq!(r1.block_num, 1);
        assert_eq!(r2.block_num, 2);

        let block2 = store.lookup("hash-2").await.unwrap();
        assert_eq!(block2.prev_hash, r1.tx_hash);
        assert_ne!(r1.tx_hash, r2.tx_hash);

        let (valid, message) = validate_chain(&store).await;
        assert!(valid);
        assert_eq!(message, "valid chain with 2 blocks");
    }

    #[tokio::test]
    async fn lookup_block_num_is_one_indexed() {
        let store = InMemoryChainStore::default();
        let r1 = store.anchor("hash-1", 100, "sig1", "{}").await;
        let r2 = store.anchor("hash-2", 100, "sig2", "{}").await;

        assert!(store.lookup_block_num(0).await.is_none());
        assert_eq!(store.lookup_block_num(1).await.unwrap().tx_hash, r1.tx_hash);
        assert_eq!(store.lookup_block_num(2).await.unwrap().tx_hash, r2.tx_hash);
        assert!(store.lookup_block_num(3).await.is_none());
    }

    #[tokio::test]
    async fn empty_chain_validates() {
        let store = InMemoryChainStore::default();
        let (valid, message) = validate_chain(&store).await;
        assert!(valid);
        assert_eq!(message, "empty chain");
    }

    #[tokio::test]
    async fn verify_checks_exact_tx_hash_match() {
        let store = InMemoryChainStore::default();
        let receipt = store.anchor("hash-1", 100, "sig", "{}").await;
        assert!(verify(&store, "hash-1", &receipt.tx_hash).await);
        assert!(!verify(&store, "hash-1", "wrong-tx-hash").await);
        assert!(!verify(&store, "missing", &receipt.tx_hash).await);
    }

    #[tokio::test]
    async fn lookup_tx_resolves_by_tx_hash() {
        let store = InMemoryChainStore::default();
        let receipt = store.anchor("hash-1", 100, "sig", "{}").await;
        let block = store.lookup_tx(&receipt.tx_hash).await.unwrap();
        assert_eq!(block.data_hash, "hash-1");
    }
}
