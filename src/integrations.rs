//! Inference-backend integration helpers
//!
//! Backend-agnostic pieces that a logits-processor or text-postprocessor
//! hook can call into without this crate knowing anything about the
//! specific inference runtime in use.

use std::collections::BTreeMap;

use crate::config::WatermarkConfig;
use crate::keys::{derive_context_seed, derive_step_key, today_utc_yyyymmdd};
use crate::payload::{pack_payload, PackedMetadata};
use crate::statistical::select_sparse_green_ids;
use crate::zero_width::{encode_payload_to_tag, TagInjector};

/// Per-request sparse greenlist, keyed to one model/date/key-id triple.
///
/// Constructed once per generation request; `bias_map`/`apply_bias` are then
/// called once per decoding step with that step's trailing context.
pub struct KeyedSparseGreenlist<'a> {
    cfg: &'a WatermarkConfig,
    key_id: u32,
    derived_key: [u8; 32],
}

impl<'a> KeyedSparseGreenlist<'a> {
    pub fn new(cfg: &'a WatermarkConfig, model_name: &str, key_id: Option<u32>, date_str: Option<&str>) -> Self {
        let (selected_key_id, master_key) = cfg.master_keys.get_master_key(key_id.or(Some(cfg.active_key_id)));
        let date_owned;
        let date_str = match date_str {
            Some(d) => d,
            None => {
                date_owned = today_utc_yyyymmdd();
                &date_owned
            }
        };
        let model_id = cfg.model_id_for(Some(model_name));
        let derived_key = derive_step_key(master_key, model_id as u32, Some(date_str), selected_key_id);
        Self { cfg, key_id: selected_key_id, derived_key }
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    fn green_ids(&self, context_tokens: &[u64], vocab_size: u64) -> Vec<u64> {
        let width = self.cfg.statistical.context_width;
        if context_tokens.len() < width {
            return Vec::new();
        }
        let seed = derive_context_seed(&self.derived_key, &context_tokens[context_tokens.len() - width..]);
        select_sparse_green_ids(vocab_size, seed, self.cfg.statistical.greenlist_ratio, self.cfg.statistical.max_bias_tokens)
    }

    /// Additive logit-bias map (OpenAI `logit_bias`-style) for this decoding step.
    pub fn bias_map(&self, context_tokens: &[u64], vocab_size: u64) -> BTreeMap<u64, f64> {
        let delta = self.cfg.statistical.bias_delta;
        self.green_ids(context_tokens, vocab_size).into_iter().map(|tid| (tid, delta)).collect()
    }

    /// Apply the bias in place to a dense logits buffer indexed by token id.
    pub fn apply_bias(&self, logits: &mut [f32], context_tokens: &[u64], vocab_size: u64) {
        let delta = self.cfg.statistical.bias_delta as f32;
        for tid in self.green_ids(context_tokens, vocab_size) {
            if let Some(slot) = logits.get_mut(tid as usize) {
                *slot += delta;
            }
        }
    }
}

/// Streaming zero-width tag injector bound to one generation request's payload.
pub struct TagTextPostProcessor {
    injector: TagInjector,
}

impl TagTextPostProcessor {
    pub fn new(cfg: &WatermarkConfig, model_name: &str, key_id: Option<u32>) -> Self {
        let resolved_key_id = key_id.unwrap_or(cfg.active_key_id);
        let meta = PackedMetadata::new(
            cfg.schema_version,
            cfg.issuer_id,
            cfg.model_id_for(Some(model_name)),
            cfg.model_version_id_for(Some(model_name)),
            resolved_key_id as u8,
        );
        let payload = pack_payload(&meta).expect("config-derived metadata always fits its bit widths");
        let tag = encode_payload_to_tag(payload);
        Self { injector: TagInjector::new(tag, cfg.tag.repeat_interval_tokens) }
    }

    /// Feed one newly generated piece of text, returning it with the tag
    /// spliced in wherever the injector's codepoint cadence calls for it.
    pub fn inject(&mut self, piece: &str, finalize: bool) -> String {
        self.injector.inject_delta(piece, finalize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEV_MASTER_KEY;

    fn test_cfg() -> WatermarkConfig {
        let mut cfg = WatermarkConfig::from_env();
        cfg.master_keys = crate::keys::MasterKeySet::new(std::collections::BTreeMap::from([(1, DEV_MASTER_KEY.to_vec())]));
        cfg
    }

    #[test]
    fn bias_map_empty_below_context_width() {
        let cfg = test_cfg();
        let greenlist = KeyedSparseGreenlist::new(&cfg, "demo-model", None, Some("20260225"));
        let bias = greenlist.bias_map(&[1], 1000);
        assert!(bias.is_empty());
    }

    #[test]
    fn bias_map_nonempty_past_context_width() {
        let cfg = test_cfg();
        let greenlist = KeyedSparseGreenlist::new(&cfg, "demo-model", None, Some("20260225"));
        let bias = greenlist.bias_map(&[1, 2, 3], 1000);
        assert!(!bias.is_empty());
        for delta in bias.values() {
            assert_eq!(*delta, cfg.statistical.bias_delta);
        }
    }

    #[test]
    fn apply_bias_mutates_only_green_slots() {
        let cfg = test_cfg();
        let greenlist = KeyedSparseGreenlist::new(&cfg, "demo-model", None, Some("20260225"));
        let mut logits = vec![0.0f32; 1000];
        greenlist.apply_bias(&mut logits, &[1, 2, 3], 1000);
        let nonzero = logits.iter().filter(|&&v| v != 0.0).count();
        assert!(nonzero > 0);
    }

    #[test]
    fn tag_postprocessor_emits_on_interval() {
        let mut cfg = test_cfg();
        cfg.tag.repeat_interval_tokens = 3;
        let mut proc = TagTextPostProcessor::new(&cfg, "demo-model", None);
        assert_eq!(proc.inject("a", false), "a");
        assert_eq!(proc.inject("b", false), "b");
        assert_ne!(proc.inject("c", false), "c"); // third codepoint is due
    }

    #[test]
    fn tag_postprocessor_finalizes_pending_tag() {
        let mut cfg = test_cfg();
        cfg.tag.repeat_interval_tokens = 1000;
        let mut proc = TagTextPostProcessor::new(&cfg, "demo-model", None);
        assert_eq!(proc.inject("a", false), "a");
        assert_ne!(proc.inject("b", true), "b");
    }
}
