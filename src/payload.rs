//! Payload codec — 64-bit metadata pack/unpack with CRC-8
//!
//! Field layout, most-significant first:
//! `schema_version(4) | issuer_id(16) | model_id(16) | model_version_id(12) | key_id(8) | crc8(8)`

use crate::error::WatermarkError;

const SCHEMA_VERSION_BITS: u32 = 4;
const ISSUER_ID_BITS: u32 = 16;
const MODEL_ID_BITS: u32 = 16;
const MODEL_VERSION_ID_BITS: u32 = 12;
const KEY_ID_BITS: u32 = 8;
const CRC_BITS: u32 = 8;

const SCHEMA_VERSION_MAX: u64 = (1 << SCHEMA_VERSION_BITS) - 1;
const ISSUER_ID_MAX: u64 = (1 << ISSUER_ID_BITS) - 1;
const MODEL_ID_MAX: u64 = (1 << MODEL_ID_BITS) - 1;
const MODEL_VERSION_ID_MAX: u64 = (1 << MODEL_VERSION_ID_BITS) - 1;
const KEY_ID_MAX: u64 = (1 << KEY_ID_BITS) - 1;

/// The 56 data bits' worth of fields embedded in every tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PackedMetadata {
    pub schema_version: u8,
    pub issuer_id: u16,
    pub model_id: u16,
    pub model_version_id: u16,
    pub key_id: u8,
}

impl PackedMetadata {
    pub fn new(schema_version: u8, issuer_id: u16, model_id: u16, model_version_id: u16, key_id: u8) -> Self {
        Self { schema_version, issuer_id, model_id, model_version_id, key_id }
    }

    fn fields_in_range(&self) -> bool {
        (self.schema_version as u64) <= SCHEMA_VERSION_MAX
            && (self.issuer_id as u64) <= ISSUER_ID_MAX
            && (self.model_id as u64) <= MODEL_ID_MAX
            && (self.model_version_id as u64) <= MODEL_VERSION_ID_MAX
            && (self.key_id as u64) <= KEY_ID_MAX
    }
}

/// CRC-8-CCITT, polynomial 0x07, init 0x00, MSB-first over the given bytes.
fn crc8_ccitt(bytes: &[u8]) -> u8 {
    let mut crc: u8 = 0x00;
    for &byte in bytes {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Pack a [`PackedMetadata`] into a CRC-protected 64-bit word.
///
/// Fields are validated against their bit widths first; out-of-range values
/// raise [`WatermarkError::InvalidArgument`].
pub fn pack_payload(meta: &PackedMetadata) -> Result<u64, WatermarkError> {
    if !meta.fields_in_range() {
        return Err(WatermarkError::InvalidArgument(format!(
            "packed metadata field out of range: {meta:?}"
        )));
    }

    let data56: u64 = ((meta.schema_version as u64) << (ISSUER_ID_BITS + MODEL_ID_BITS + MODEL_VERSION_ID_BITS + KEY_ID_BITS))
        | ((meta.issuer_id as u64) << (MODEL_ID_BITS + MODEL_VERSION_ID_BITS + KEY_ID_BITS))
        | ((meta.model_id as u64) << (MODEL_VERSION_ID_BITS + KEY_ID_BITS))
        | ((meta.model_version_id as u64) << KEY_ID_BITS)
        | (meta.key_id as u64);

    let data_bytes = (data56 << CRC_BITS).to_be_bytes();
    let crc = crc8_ccitt(&data_bytes[1..7]);

    Ok((data56 << CRC_BITS) | (crc as u64))
}

/// Unpack a 64-bit word into its [`PackedMetadata`] and whether the CRC check passed.
///
/// Infallible: out-of-range decoded values or a CRC mismatch are both reported
/// via `crc_ok = false` rather than an error.
pub fn unpack_payload(word: u64) -> (PackedMetadata, bool) {
    let crc_byte = (word & 0xff) as u8;
    let data56 = word >> CRC_BITS;

    let key_id = (data56 & KEY_ID_MAX) as u8;
    let model_version_id = ((data56 >> KEY_ID_BITS) & MODEL_VERSION_ID_MAX) as u16;
    let model_id = ((data56 >> (KEY_ID_BITS + MODEL_VERSION_ID_BITS)) & MODEL_ID_MAX) as u16;
    let issuer_id = ((data56 >> (KEY_ID_BITS + MODEL_VERSION_ID_BITS + MODEL_ID_BITS)) & ISSUER_ID_MAX) as u16;
    let schema_version = ((data56 >> (KEY_ID_BITS + MODEL_VERSION_ID_BITS + MODEL_ID_BITS + ISSUER_ID_BITS)) & SCHEMA_VERSION_MAX) as u8;

    let meta = PackedMetadata { schema_version, issuer_id, model_id, model_version_id, key_id };

    let data_bytes = (data56 << CRC_BITS).to_be_bytes();
    let expected_crc = crc8_ccitt(&data_bytes[1..7]);
    let crc_ok = expected_crc == crc_byte && meta.fields_in_range();

    (meta, crc_ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_s1_scenario() {
        let meta = PackedMetadata::new(1, 123, 4567, 89, 7);
        let raw = pack_payload(&meta).unwrap();
        let (back, valid) = unpack_payload(raw);
        assert!(valid);
        assert_eq!(back, meta);
    }

    #[test]
    fn out_of_range_field_rejected() {
        let meta = PackedMetadata::new(16, 0, 0, 0, 0); // 4 bits max is 15
        assert!(matches!(pack_payload(&meta), Err(WatermarkError::InvalidArgument(_))));
    }

    #[test]
    fn bit_flip_invalidates_crc_with_high_probability() {
        let meta = PackedMetadata::new(9, 5000, 6000, 1000, 42);
        let raw = pack_payload(&meta).unwrap();

        let mut flips_detected = 0;
        for bit in 8..64 {
            let flipped = raw ^ (1u64 << bit);
            let (_, valid) = unpack_payload(flipped);
            if !valid {
                flips_detected += 1;
            }
        }
        // All 56 data-bit flips must be caught (CRC-8 misses at most 1/256 of
        // random errors, but single flips within the protected 56 bits are
        // always caught since 0x07 has no single-bit blind spot).
        assert_eq!(flips_detected, 56);
    }

    #[test]
    fn random_fields_roundtrip() {
        for seed in 0u64..200 {
            let schema = (seed % 16) as u8;
            let issuer = ((seed * 37) % 65536) as u16;
            let model = ((seed * 91) % 65536) as u16;
            let ver = ((seed * 13) % 4096) as u16;
            let key = ((seed * 7) % 256) as u8;
            let meta = PackedMetadata::new(schema, issuer, model, ver, key);
            let raw = pack_payload(&meta).unwrap();
            let (back, valid) = unpack_payload(raw);
            assert!(valid);
            assert_eq!(back, meta);
        }
    }
}
