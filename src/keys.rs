//! Key schedule & derivation
//!
//! Master-key lookup, per-(model, date, key-id) HKDF derivation, and per-context
//! seeding. Pure functions over the master key map — no mutable state once the
//! map is loaded at startup.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// Deterministic fallback key used only when no real key is configured.
pub const DEV_MASTER_KEY: &[u8] = b"dev-only-master-key-change-me";

/// A validated `{key_id -> secret bytes}` map, read once at startup.
///
/// `BTreeMap` keeps iteration in ascending key-id order, which is what
/// `get_master_key` needs when substituting the smallest known id.
#[derive(Clone, Debug)]
pub struct MasterKeySet {
    keys: BTreeMap<u32, Vec<u8>>,
}

impl MasterKeySet {
    /// Build a key set directly from a map. At least one entry is required;
    /// callers at the config boundary are responsible for falling back to
    /// [`DEV_MASTER_KEY`] when no real keys were configured.
    pub fn new(keys: BTreeMap<u32, Vec<u8>>) -> Self {
        let keys = if keys.is_empty() {
            BTreeMap::from([(1u32, DEV_MASTER_KEY.to_vec())])
        } else {
            keys
        };
        Self { keys }
    }

    /// Resolve a requested key id to `(resolved_id, bytes)`. Falls back to the
    /// smallest known id if the request is absent or unknown.
    pub fn get_master_key(&self, key_id: Option<u32>) -> (u32, &[u8]) {
        if let Some(id) = key_id {
            if let Some(bytes) = self.keys.get(&id) {
                return (id, bytes);
            }
        }
        // BTreeMap iterates in ascending key order, so `.next()` is the smallest id.
        let (id, bytes) = self.keys.iter().next().expect("non-empty key set");
        (*id, bytes)
    }
}

/// HKDF-SHA256 extract-then-expand (RFC 5869), single output block.
///
/// `length` must be <= 32 (one SHA-256 block); this crate only ever asks for
/// exactly 32 bytes, so a multi-block expand loop would be dead code.
fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    assert!(length <= 32, "single-block HKDF-SHA256 expand supports up to 32 bytes");

    let mut extract = HmacSha256::new_from_slice(salt).expect("HMAC accepts any key length");
    extract.update(ikm);
    let prk = extract.finalize().into_bytes();

    let mut expand = HmacSha256::new_from_slice(&prk).expect("HMAC accepts any key length");
    expand.update(info);
    expand.update(&[1u8]);
    let t = expand.finalize().into_bytes();

    t[..length].to_vec()
}

/// Derive the 32-byte step key for one `(model_id, date, key_id)` triple.
///
/// `date` is `YYYYMMDD`; pass `None` to default to today (UTC). The salt is
/// the all-zero 32-byte SHA-256 block per RFC 5869 when absent.
pub fn derive_step_key(master_key: &[u8], model_id: u32, date: Option<&str>, key_id: u32) -> [u8; 32] {
    let date_owned;
    let date_str = match date {
        Some(d) => d,
        None => {
            date_owned = today_utc_yyyymmdd();
            &date_owned
        }
    };
    let info = format!("{model_id}|{date_str}|{key_id}");
    let zero_salt = [0u8; 32];
    let okm = hkdf_sha256(master_key, &zero_salt, info.as_bytes(), 32);
    let mut out = [0u8; 32];
    out.copy_from_slice(&okm);
    out
}

/// Derive a 64-bit context seed from the derived step key and recent token ids.
///
/// `context_tokens` is pipe-joined as decimal ASCII before HMAC-SHA256'ing
/// under the derived key; the seed is the high 8 bytes of the digest.
pub fn derive_context_seed(derived_key: &[u8], context_tokens: &[u64]) -> u64 {
    let joined = context_tokens
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join("|");

    let mut mac = HmacSha256::new_from_slice(derived_key).expect("HMAC accepts any key length");
    mac.update(joined.as_bytes());
    let digest = mac.finalize().into_bytes();

    u64::from_be_bytes(digest[..8].try_into().expect("sha256 digest has >= 8 bytes"))
}

/// Today's date in UTC, formatted `YYYYMMDD`.
pub fn today_utc_yyyymmdd() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_set_falls_back_to_smallest_id() {
        let mut map = BTreeMap::new();
        map.insert(5, b"five".to_vec());
        map.insert(2, b"two".to_vec());
        let set = MasterKeySet::new(map);
        let (id, bytes) = set.get_master_key(Some(99));
        assert_eq!(id, 2);
        assert_eq!(bytes, b"two");
    }

    #[test]
    fn master_key_set_resolves_known_id() {
        let mut map = BTreeMap::new();
        map.insert(1, b"one".to_vec());
        map.insert(2, b"two".to_vec());
        let set = MasterKeySet::new(map);
        let (id, bytes) = set.get_master_key(Some(2));
        assert_eq!(id, 2);
        assert_eq!(bytes, b"two");
    }

    #[test]
    fn empty_key_set_uses_dev_key() {
        let set = MasterKeySet::new(BTreeMap::new());
        let (id, bytes) = set.get_master_key(None);
        assert_eq!(id, 1);
        assert_eq!(bytes, DEV_MASTER_KEY);
    }

    #[test]
    fn derive_step_key_is_pure_and_deterministic() {
        let a = derive_step_key(DEV_MASTER_KEY, 3, Some("20260225"), 1);
        let b = derive_step_key(DEV_MASTER_KEY, 3, Some("20260225"), 1);
        assert_eq!(a, b);

        let c = derive_step_key(DEV_MASTER_KEY, 3, Some("20260226"), 1);
        assert_ne!(a, c);
    }

    #[test]
    fn derive_context_seed_is_deterministic() {
        let dk = derive_step_key(DEV_MASTER_KEY, 1, Some("20260225"), 1);
        let a = derive_context_seed(&dk, &[11, 12]);
        let b = derive_context_seed(&dk, &[11, 12]);
        assert_eq!(a, b);

        let c = derive_context_seed(&dk, &[11, 13]);
        assert_ne!(a, c);
    }
}
