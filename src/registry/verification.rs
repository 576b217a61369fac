//! Combined registry verification: chain anchoring joined with credential identity
//!
//! Wraps the statistical/tag [`WatermarkDetector`] with the provenance
//! question a registry consumer actually cares about: was this text
//! anchored, and if so, by which registered company?

use crate::detector::{VerifyResult, WatermarkDetector};
use crate::registry::chain::ChainStore;
use crate::registry::credentials::{Credential, CredentialStore};
use crate::registry::signature::hash_text;

/// Outcome of a registry-level verification.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum RegistryVerificationResult {
    /// The text's content hash has never been anchored.
    NotAnchored { detector: VerifyResult },
    /// The text's content hash was anchored; the anchoring company is joined in.
    Anchored {
        detector: VerifyResult,
        tx_hash: String,
        block_num: u64,
        issuer: Credential,
    },
    /// The text's content hash was anchored, but the recorded issuer no
    /// longer resolves to a known credential (deactivated/removed).
    AnchoredUnknownIssuer { detector: VerifyResult, tx_hash: String, block_num: u64 },
}

/// Verify `text` against both the watermark detector and the chain: run
/// statistical/tag detection, hash the text, look it up in the chain store,
/// and join the anchoring credential if found.
pub async fn verify(
    text: &str,
    chain_store: &dyn ChainStore,
    credential_store: &dyn CredentialStore,
    detector: &WatermarkDetector<'_>,
) -> RegistryVerificationResult {
    let detector_result = detector.verify(text, None, None, None, None, 7);
    let data_hash = hash_text(text);

    match chain_store.lookup(&data_hash).await {
        None => RegistryVerificationResult::NotAnchored { detector: detector_result },
        Some(block) => match credential_store.get_by_issuer(block.issuer_id).await {
            Some(issuer) => RegistryVerificationResult::Anchored {
                detector: detector_result,
                tx_hash: block.tx_hash,
                block_num: block.block_num,
                issuer,
            },
            None => RegistryVerificationResult::AnchoredUnknownIssuer {
                detector: detector_result,
                tx_hash: block.tx_hash,
                block_num: block.block_num,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatermarkConfig;
    use crate::registry::chain::InMemoryChainStore;
    use crate::registry::credentials::{create_company, InMemoryCredentialStore};

    #[tokio::test]
    async fn unanchored_text_reports_not_anchored() {
        let chain = InMemoryChainStore::default();
        let credentials = InMemoryCredentialStore::default();
        let cfg = WatermarkConfig::from_env();
        let detector = WatermarkDetector::new(&cfg);

        let result = verify("never anchored text", &chain, &credentials, &detector).await;
        assert!(matches!(result, RegistryVerificationResult::NotAnchored { .. }));
    }

    #[tokio::test]
    async fn anchored_text_joins_issuer_credential() {
        let chain = InMemoryChainStore::default();
        let credentials = InMemoryCredentialStore::default();
        let cfg = WatermarkConfig::from_env();
        let detector = WatermarkDetector::new(&cfg);

        let (credential, _) = create_company("Acme", &credentials).await.unwrap();
        let data_hash = hash_text("some watermarked output");
        chain.anchor(&data_hash, credential.issuer_id, "sig", "{}").await;

        let result = verify("some watermarked output", &chain, &credentials, &detector).await;
        match result {
            RegistryVerificationResult::Anchored { issuer, .. } => assert_eq!(issuer.issuer_id, credential.issuer_id),
            other => panic!("expected Anchored, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn anchored_text_with_missing_issuer_is_flagged() {
        let chain = InMemoryChainStore::default();
        let credentials = InMemoryCredentialStore::default();
        let cfg = WatermarkConfig::from_env();
        let detector = WatermarkDetector::new(&cfg);

        let data_hash = hash_text("orphaned anchor");
        chain.anchor(&data_hash, 9999, "sig", "{}").await;

        let result = verify("orphaned anchor", &chain, &credentials, &detector).await;
        assert!(matches!(result, RegistryVerificationResult::AnchoredUnknownIssuer { .. }));
    }
}
