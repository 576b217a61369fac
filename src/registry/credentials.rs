//! Company credential issuance and storage
//!
//! Each registered issuer gets a secp256k1 keypair and an Ethereum-style
//! checksummed address. The private key is returned exactly once, at
//! creation time, and never persisted by this crate.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use secp256k1::{Secp256k1, SecretKey};
use sha3::{Digest, Keccak256};

use crate::error::WatermarkError;

/// Lowest issuer id ever assigned to a registered company; 1-99 are reserved.
const FIRST_ISSUER_ID: u32 = 100;

/// Public record of a registered company.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Credential {
    pub issuer_id: u32,
    pub name: String,
    pub eth_address: String,
    pub public_key_hex: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// The private key half, surfaced only from [`create_company`]. Never stored.
#[derive(Clone, Debug)]
pub struct CredentialSecret {
    pub private_key_hex: String,
}

/// Keccak-256 + EIP-55 checksum over an uncompressed secp256k1 public key.
fn eth_address_from_pubkey(pubkey: &secp256k1::PublicKey) -> String {
    let uncompressed = pubkey.serialize_uncompressed(); // [0x04, x(32), y(32)]
    let hash = Keccak256::digest(&uncompressed[1..]);
    let address_bytes = &hash[12..]; // low 20 bytes
    to_checksum_address(address_bytes)
}

fn to_checksum_address(address_bytes: &[u8]) -> String {
    let lower_hex = hex::encode(address_bytes);
    let hash_hex = hex::encode(Keccak256::digest(lower_hex.as_bytes()));

    let mut checksummed = String::with_capacity(42);
    checksummed.push_str("0x");
    for (ch, hash_ch) in lower_hex.chars().zip(hash_hex.chars()) {
        if ch.is_ascii_alphabetic() && hash_ch.to_digit(16).unwrap_or(0) >= 8 {
            checksummed.push(ch.to_ascii_uppercase());
        } else {
            checksummed.push(ch);
        }
    }
    checksummed
}

/// In-memory stand-in for the SQL-backed `companies` table.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert(&self, credential: Credential) -> Result<(), WatermarkError>;
    async fn get_by_issuer(&self, issuer_id: u32) -> Option<Credential>;
    async fn get_by_address(&self, eth_address: &str) -> Option<Credential>;
    async fn list(&self) -> Vec<Credential>;
    async fn deactivate(&self, issuer_id: u32) -> Result<(), WatermarkError>;
    async fn max_issuer_id(&self) -> Option<u32>;
}

/// Default `CredentialStore`, backed by a lock-guarded map.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    by_issuer: RwLock<BTreeMap<u32, Credential>>,
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn insert(&self, credential: Credential) -> Result<(), WatermarkError> {
        let mut guard = self.by_issuer.write().expect("credential store lock poisoned");
        if guard.contains_key(&credential.issuer_id) {
            return Err(WatermarkError::TransientConflict(format!(
                "issuer_id {} already registered",
                credential.issuer_id
            )));
        }
        if guard.values().any(|c| c.eth_address.eq_ignore_ascii_case(&credential.eth_address)) {
            return Err(WatermarkError::TransientConflict(format!(
                "address {} already registered",
                credential.eth_address
            )));
        }
        guard.insert(credential.issuer_id, credential);
        Ok(())
    }

    async fn get_by_issuer(&self, issuer_id: u32) -> Option<Credential> {
        self.by_issuer.read().expect("credential store lock poisoned").get(&issuer_id).cloned()
    }

    async fn get_by_address(&self, eth_address: &str) -> Option<Credential> {
        self.by_issuer
            .read()
            .expect("credential store lock poisoned")
            .values()
            .find(|c| c.eth_address.eq_ignore_ascii_case(eth_address))
            .cloned()
    }

    async fn list(&self) -> Vec<Credential> {
        self.by_issuer.read().expect("credential store lock poisoned").values().cloned().collect()
    }

    async fn deactivate(&self, issuer_id: u32) -> Result<(), WatermarkError> {
        let mut guard = self.by_issuer.write().expect("credential store lock poisoned");
        match guard.get_mut(&issuer_id) {
            Some(credential) => {
                credential.active = false;
                Ok(())
            }
            None => Err(WatermarkError::NotFound(format!("issuer_id {issuer_id} not registered"))),
        }
    }

    async fn max_issuer_id(&self) -> Option<u32> {
        self.by_issuer.read().expect("credential store lock poisoned").keys().next_back().copied()
    }
}

/// Register a new company: generate a keypair, derive its checksummed
/// address, assign the next issuer id, and persist the public record.
///
/// Returns the public [`Credential`] plus the [`CredentialSecret`] — the
/// only time the private key is ever available.
pub async fn create_company(name: &str, store: &dyn CredentialStore) -> Result<(Credential, CredentialSecret), WatermarkError> {
    let secp = Secp256k1::new();
    let secret_key = SecretKey::new(&mut OsRng);
    let public_key = secp256k1::PublicKey::from_secret_key(&secp, &secret_key);

    let eth_address = eth_address_from_pubkey(&public_key);
    let issuer_id = store.max_issuer_id().await.map(|m| m.max(FIRST_ISSUER_ID - 1) + 1).unwrap_or(FIRST_ISSUER_ID);

    let credential = Credential {
        issuer_id,
        name: name.to_string(),
        eth_address,
        public_key_hex: format!("0x{}", hex::encode(public_key.serialize_uncompressed())),
        active: true,
        created_at: Utc::now(),
    };

    store.insert(credential.clone()).await?;

    let secret = CredentialSecret { private_key_hex: format!("0x{}", hex::encode(secret_key.secret_bytes())) };
    Ok((credential, secret))
}

/// List every registered company (public fields only).
pub async fn list_companies(store: &dyn CredentialStore) -> Vec<Credential> {
    store.list().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_company_assigns_ids_from_100() {
        let store = InMemoryCredentialStore::default();
        let (first, secret) = create_company("Acme", &store).await.unwrap();
        assert_eq!(first.issuer_id, 100);
        assert!(secret.private_key_hex.starts_with("0x"));
        assert_eq!(secret.private_key_hex.len(), 66);

        let (second, _) = create_company("Globex", &store).await.unwrap();
        assert_eq!(second.issuer_id, 101);
    }

    #[tokio::test]
    async fn eth_address_is_checksummed_and_unique() {
        let store = InMemoryCredentialStore::default();
        let (a, _) = create_company("A", &store).await.unwrap();
        let (b, _) = create_company("B", &store).await.unwrap();
        assert_ne!(a.eth_address, b.eth_address);
        assert!(a.eth_address.starts_with("0x"));
        assert_eq!(a.eth_address.len(), 42);
        // checksummed addresses mix case; an all-lowercase match would mean we
        // never applied EIP-55 casing
        assert!(a.eth_address.chars().any(|c| c.is_ascii_uppercase()) || a.eth_address.chars().all(|c| !c.is_ascii_alphabetic()));
    }

    #[tokio::test]
    async fn deactivate_unknown_issuer_errors() {
        let store = InMemoryCredentialStore::default();
        let result = store.deactivate(999).await;
        assert!(matches!(result, Err(WatermarkError::NotFound(_))));
    }
}
