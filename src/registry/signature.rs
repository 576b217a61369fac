//! Ethereum-style "personal_sign" hashing, recovery, and verification
//!
//! Companies sign the hex-encoded SHA-256 hash of watermarked text with
//! their private key, exactly the way a wallet signs an arbitrary message:
//! the EIP-191 prefix is applied over the hex *string* itself, not its raw
//! decoded bytes.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1};
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest as Sha3Digest, Keccak256};

use crate::error::WatermarkError;
use crate::registry::credentials::{Credential, CredentialStore};

/// `hex(SHA256(utf8(text)))`.
pub fn hash_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn personal_sign_digest(message: &str) -> [u8; 32] {
    let prefixed = format!("\x19Ethereum Signed Message:\n{}{}", message.len(), message);
    Keccak256::digest(prefixed.as_bytes()).into()
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

/// Recover the checksummed Ethereum address that produced `signature_hex`
/// over `data_hash_hex`, under the personal_sign convention.
pub fn recover_signer(data_hash_hex: &str, signature_hex: &str) -> Result<String, WatermarkError> {
    let sig_hex = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    let sig_bytes = hex::decode(sig_hex).map_err(|e| WatermarkError::InvalidArgument(format!("bad signature hex: {e}")))?;
    if sig_bytes.len() != 65 {
        return Err(WatermarkError::InvalidArgument(format!(
            "expected a 65-byte recoverable signature, got {} bytes",
            sig_bytes.len()
        )));
    }

    let recovery_byte = sig_bytes[64];
    let recovery_id = match recovery_byte {
        0 | 1 => recovery_byte,
        27 | 28 => recovery_byte - 27,
        other => {
            return Err(WatermarkError::InvalidArgument(format!("unrecognized recovery byte {other}")));
        }
    };

    let recid = RecoveryId::from_i32(recovery_id as i32)
        .map_err(|e| WatermarkError::InvalidArgument(format!("bad recovery id: {e}")))?;
    let recoverable = RecoverableSignature::from_compact(&sig_bytes[..64], recid)
        .map_err(|e| WatermarkError::InvalidArgument(format!("bad signature bytes: {e}")))?;

    let digest = personal_sign_digest(data_hash_hex);
    let message = Message::from_digest(digest);

    let secp = Secp256k1::new();
    let pubkey = secp
        .recover_ecdsa(&message, &recoverable)
        .map_err(|e| WatermarkError::InvalidArgument(format!("signature recovery failed: {e}")))?;

    let uncompressed = pubkey.serialize_uncompressed();
    let hash = Keccak256::digest(&uncompressed[1..]);
    Ok(to_checksum_address(&hash[12..]))
}

/// Verify a signature against a specific registered issuer. Any recovery
/// error is swallowed to `None` rather than propagated, since a bad
/// signature is evidence of "not this company", not an operational fault.
pub async fn verify_signature(
    data_hash_hex: &str,
    signature_hex: &str,
    issuer_id: u32,
    store: &dyn CredentialStore,
) -> Option<Credential> {
    let recovered = recover_signer(data_hash_hex, signature_hex).ok()?;
    let credential = store.get_by_issuer(issuer_id).await?;
    if !credential.active || !recovered.eq_ignore_ascii_case(&credential.eth_address) {
        return None;
    }
    Some(credential)
}

/// Verify a signature and resolve the signing company purely from the
/// recovered address, without requiring the caller to know the issuer id.
pub async fn verify_signature_by_address(
    data_hash_hex: &str,
    signature_hex: &str,
    store: &dyn CredentialStore,
) -> Option<Credential> {
    let recovered = recover_signer(data_hash_hex, signature_hex).ok()?;
    let credential = store.get_by_address(&recovered).await?;
    if !credential.active {
        return None;
    }
    Some(credential)
}
