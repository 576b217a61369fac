//! Raw/watermarked response archive
//!
//! Mirrors `responses`: every generated response a company submits for
//! anchoring is kept alongside its pre-watermark text, indexed by the same
//! content hash the chain anchors.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One archived response.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StoredResponse {
    pub sha256_hash: String,
    pub issuer_id: u32,
    pub signature_hex: String,
    pub raw_text: String,
    pub watermarked_text: String,
    pub metadata_json: String,
    pub created_at: DateTime<Utc>,
}

/// In-memory stand-in for the SQL-backed `responses` table.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn insert(&self, response: StoredResponse);
    async fn get_by_hash(&self, sha256_hash: &str) -> Option<StoredResponse>;
}

/// Default [`ResponseStore`], keyed by content hash.
#[derive(Default)]
pub struct InMemoryResponseStore {
    by_hash: RwLock<HashMap<String, StoredResponse>>,
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    async fn insert(&self, response: StoredResponse) {
        self.by_hash.write().expect("response store lock poisoned").insert(response.sha256_hash.clone(), response);
    }

    async fn get_by_hash(&self, sha256_hash: &str) -> Option<StoredResponse> {
        self.by_hash.read().expect("response store lock poisoned").get(sha256_hash).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_get_roundtrips() {
        let store = InMemoryResponseStore::default();
        let response = StoredResponse {
            sha256_hash: "abc".to_string(),
            issuer_id: 100,
            signature_hex: "sig".to_string(),
            raw_text: "raw".to_string(),
            watermarked_text: "watermarked".to_string(),
            metadata_json: "{}".to_string(),
            created_at: Utc::now(),
        };
        store.insert(response.clone()).await;
        let fetched = store.get_by_hash("abc").await.unwrap();
        assert_eq!(fetched.watermarked_text, "watermarked");
    }

    #[tokio::test]
    async fn missing_hash_returns_none() {
        let store = InMemoryResponseStore::default();
        assert!(store.get_by_hash("nope").await.is_none());
    }
}
