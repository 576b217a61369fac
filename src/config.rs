//! Runtime configuration
//!
//! Loaded once at process startup from environment variables, in the same
//! `var().ok().and_then(parse).unwrap_or(default)` style the gateway binary
//! uses for its own tunables.

use std::collections::BTreeMap;

use base64::Engine as _;

use crate::keys::MasterKeySet;
use crate::zero_width::{END_CHAR, ONE_CHAR, START_CHAR, ZERO_CHAR};

/// Which watermark channels a request should apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkMode {
    Hybrid,
    StatisticalOnly,
    TagOnly,
}

impl Default for WatermarkMode {
    fn default() -> Self {
        WatermarkMode::Hybrid
    }
}

/// Tunables for the logit-bias statistical watermark.
#[derive(Clone, Copy, Debug)]
pub struct StatisticalConfig {
    pub context_width: usize,
    pub greenlist_ratio: f64,
    pub bias_delta: f64,
    pub max_bias_tokens: u64,
    pub z_threshold_verified: f64,
    pub z_threshold_likely: f64,
}

impl Default for StatisticalConfig {
    fn default() -> Self {
        Self {
            context_width: 2,
            greenlist_ratio: 0.25,
            bias_delta: 1.0,
            max_bias_tokens: 2048,
            z_threshold_verified: 4.0,
            z_threshold_likely: 2.5,
        }
    }
}

/// The zero-width alphabet and injection cadence.
#[derive(Clone, Copy, Debug)]
pub struct TagConfig {
    pub repeat_interval_tokens: u32,
    pub zero_char: char,
    pub one_char: char,
    pub start_char: char,
    pub end_char: char,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            repeat_interval_tokens: 160,
            zero_char: ZERO_CHAR,
            one_char: ONE_CHAR,
            start_char: START_CHAR,
            end_char: END_CHAR,
        }
    }
}

/// Process-wide watermark configuration, assembled once at startup.
#[derive(Clone, Debug)]
pub struct WatermarkConfig {
    pub schema_version: u8,
    pub issuer_id: u16,
    pub active_key_id: u32,
    pub model_id_map: BTreeMap<String, u16>,
    pub model_version_map: BTreeMap<String, u16>,
    pub statistical: StatisticalConfig,
    pub tag: TagConfig,
    pub master_keys: MasterKeySet,
}

impl WatermarkConfig {
    pub fn model_id_for(&self, model_name: Option<&str>) -> u16 {
        model_name.and_then(|n| self.model_id_map.get(n).copied()).unwrap_or(0)
    }

    pub fn model_version_id_for(&self, model_name: Option<&str>) -> u16 {
        model_name.and_then(|n| self.model_version_map.get(n).copied()).unwrap_or(0)
    }

    /// Build configuration from environment variables, falling back to
    /// defaults and the dev master key when unset.
    pub fn from_env() -> Self {
        let schema_version = std::env::var("WATERMARK_SCHEMA_VERSION").ok().and_then(|s| s.parse().ok()).unwrap_or(1u8);
        let issuer_id = std::env::var("WATERMARK_ISSUER_ID").ok().and_then(|s| s.parse().ok()).unwrap_or(1u16);
        let active_key_id = std::env::var("WATERMARK_ACTIVE_KEY_ID").ok().and_then(|s| s.parse().ok()).unwrap_or(1u32);

        let model_id_map = parse_name_id_map(std::env::var("WATERMARK_MODEL_ID_MAP").ok().as_deref());
        let model_version_map = parse_name_id_map(std::env::var("WATERMARK_MODEL_VERSION_MAP").ok().as_deref());

        let statistical = StatisticalConfig {
            context_width: std::env::var("WATERMARK_CONTEXT_WIDTH").ok().and_then(|s| s.parse().ok()).unwrap_or(2),
            greenlist_ratio: std::env::var("WATERMARK_GREENLIST_RATIO").ok().and_then(|s| s.parse().ok()).unwrap_or(0.25),
            bias_delta: std::env::var("WATERMARK_BIAS_DELTA").ok().and_then(|s| s.parse().ok()).unwrap_or(1.0),
            max_bias_tokens: std::env::var("WATERMARK_MAX_BIAS_TOKENS").ok().and_then(|s| s.parse().ok()).unwrap_or(2048),
            z_threshold_verified: std::env::var("WATERMARK_Z_VERIFIED").ok().and_then(|s| s.parse().ok()).unwrap_or(4.0),
            z_threshold_likely: std::env::var("WATERMARK_Z_LIKELY").ok().and_then(|s| s.parse().ok()).unwrap_or(2.5),
        };

        let tag = TagConfig {
            repeat_interval_tokens: std::env::var("WATERMARK_REPEAT_INTERVAL_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(160),
            ..TagConfig::default()
        };

        let master_keys = MasterKeySet::new(load_master_key_map_from_env());

        Self { schema_version, issuer_id, active_key_id, model_id_map, model_version_map, statistical, tag, master_keys }
    }
}

/// Parse `"name1=1,name2=2"` into a lookup map. Malformed entries are skipped.
fn parse_name_id_map(raw: Option<&str>) -> BTreeMap<String, u16> {
    let mut map = BTreeMap::new();
    let Some(raw) = raw else { return map };
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((name, id)) = entry.split_once('=') {
            if let Ok(id) = id.trim().parse::<u16>() {
                map.insert(name.trim().to_string(), id);
            }
        }
    }
    map
}

/// Parse `WATERMARK_MASTER_KEYS='{"1": "base64...", "2": "base64..."}'` into a
/// key-id map, falling back to the singular `WATERMARK_MASTER_KEY` (one
/// base64 key, assigned to key id 1) when the map form is unset.
fn load_master_key_map_from_env() -> BTreeMap<u32, Vec<u8>> {
    parse_master_key_config(std::env::var("WATERMARK_MASTER_KEYS").ok().as_deref(), std::env::var("WATERMARK_MASTER_KEY").ok().as_deref())
}

fn parse_master_key_config(keys_json: Option<&str>, single_key_b64: Option<&str>) -> BTreeMap<u32, Vec<u8>> {
    if let Some(raw) = keys_json {
        let mut map = BTreeMap::new();
        if let Ok(serde_json::Value::Object(entries)) = serde_json::from_str::<serde_json::Value>(raw) {
            for (id, value) in entries {
                let (Ok(id), Some(b64)) = (id.parse::<u32>(), value.as_str()) else { continue };
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(b64) {
                    map.insert(id, bytes);
                }
            }
        }
        return map;
    }

    if let Some(raw) = single_key_b64 {
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(raw.trim()) {
            return BTreeMap::from([(1, bytes)]);
        }
    }

    BTreeMap::new()
}

/// The caller-supplied watermark request, after validating free-form JSON input.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EffectiveWatermarkRequest {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: WatermarkMode,
    pub key_id: Option<u32>,
    pub opt_out_token: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for EffectiveWatermarkRequest {
    fn default() -> Self {
        Self { enabled: true, mode: WatermarkMode::default(), key_id: None, opt_out_token: None }
    }
}

/// Parse an optional raw JSON body into an [`EffectiveWatermarkRequest`],
/// defaulting every absent or malformed field rather than rejecting the call.
pub fn parse_effective_request(payload: Option<&serde_json::Value>) -> EffectiveWatermarkRequest {
    let Some(payload) = payload else { return EffectiveWatermarkRequest::default() };

    let mode = match payload.get("mode").and_then(|v| v.as_str()) {
        Some("statistical_only") => WatermarkMode::StatisticalOnly,
        Some("tag_only") => WatermarkMode::TagOnly,
        _ => WatermarkMode::Hybrid,
    };

    let key_id = payload.get("key_id").and_then(|v| v.as_u64()).map(|v| v as u32);

    let enabled = match payload.get("enabled") {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(serde_json::Value::String(s)) => matches!(s.to_lowercase().trim(), "1" | "true" | "yes" | "on"),
        _ => true,
    };

    let opt_out_token = payload.get("opt_out_token").and_then(|v| v.as_str()).map(|s| s.to_string());

    EffectiveWatermarkRequest { enabled, mode, key_id, opt_out_token }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_for_unknown_name_is_zero() {
        let cfg = WatermarkConfig::from_env();
        assert_eq!(cfg.model_id_for(Some("does-not-exist")), 0);
        assert_eq!(cfg.model_id_for(None), 0);
    }

    #[test]
    fn parse_effective_request_defaults_on_missing_payload() {
        let req = parse_effective_request(None);
        assert_eq!(req, EffectiveWatermarkRequest::default());
    }

    #[test]
    fn parse_effective_request_rejects_bad_mode() {
        let payload = serde_json::json!({ "mode": "bogus" });
        let req = parse_effective_request(Some(&payload));
        assert_eq!(req.mode, WatermarkMode::Hybrid);
    }

    #[test]
    fn parse_effective_request_reads_string_enabled_flag() {
        let payload = serde_json::json!({ "enabled": "no" });
        let req = parse_effective_request(Some(&payload));
        assert!(!req.enabled);
    }

    #[test]
    fn parse_name_id_map_skips_malformed_entries() {
        let map = parse_name_id_map(Some("alpha=1, beta=not-a-number, gamma=3"));
        assert_eq!(map.get("alpha"), Some(&1));
        assert_eq!(map.get("gamma"), Some(&3));
        assert!(!map.contains_key("beta"));
    }

    #[test]
    fn parse_master_key_config_reads_json_map() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let raw = format!(r#"{{"1": "{b64}", "2": "{b64}"}}"#);
        let map = parse_master_key_config(Some(&raw), None);
        assert_eq!(map.get(&1).unwrap(), &vec![7u8; 32]);
        assert_eq!(map.get(&2).unwrap(), &vec![7u8; 32]);
    }

    #[test]
    fn parse_master_key_config_falls_back_to_singular_key_as_id_one() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        let map = parse_master_key_config(None, Some(&b64));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&1).unwrap(), &vec![9u8; 32]);
    }

    #[test]
    fn parse_master_key_config_empty_when_both_unset() {
        let map = parse_master_key_config(None, None);
        assert!(map.is_empty());
    }
}
