//! Combined verification: zero-width tag recovery + statistical fallback
//!
//! Tag recovery is tried first since a valid CRC is conclusive. When no tag
//! is present (or its CRC fails), detection falls back to sweeping the
//! statistical score over a window of recent calendar dates, since the
//! verifier doesn't know which day's step key produced the text.

use chrono::{Duration, Utc};

use crate::config::WatermarkConfig;
use crate::keys::derive_step_key;
use crate::payload::unpack_payload;
use crate::statistical::{score_sparse_watermark, StatisticalScore, StatisticalWatermarkDetector};
use crate::zero_width::decode_tags_from_text;

/// Minimal tokenizer seam so the detector doesn't depend on any one
/// tokenization backend; callers may instead pass `token_ids` directly.
pub trait Tokenize {
    fn encode(&self, text: &str) -> Result<Vec<u64>, String>;
}

/// Verification outcome and the evidence behind it.
#[derive(Clone, Debug, serde::Serialize)]
pub struct VerifyResult {
    pub status: VerifyStatus,
    pub statistical_score: Option<StatisticalScore>,
    pub payload: Option<crate::payload::PackedMetadata>,
    pub key_id: Option<u32>,
    pub explanations: Vec<String>,
}

/// Confidence bucket a verification landed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    None,
    Likely,
    Verified,
}

/// Stateless verifier over a loaded [`WatermarkConfig`].
pub struct WatermarkDetector<'a> {
    cfg: &'a WatermarkConfig,
}

impl<'a> WatermarkDetector<'a> {
    pub fn new(cfg: &'a WatermarkConfig) -> Self {
        Self { cfg }
    }

    /// Calendar dates (`YYYYMMDD`, today first) to sweep when the step key's
    /// derivation date is unknown — covers clock skew and multi-day buffering.
    fn candidate_dates(days_back: i64) -> Vec<String> {
        let now = Utc::now().date_naive();
        (0..=days_back).map(|i| (now - Duration::days(i)).format("%Y%m%d").to_string()).collect()
    }

    fn score_statistical(
        &self,
        token_ids: &[u64],
        model_id: u16,
        key_id: Option<u32>,
        days_back: i64,
        vocab_size: Option<u64>,
    ) -> Option<StatisticalScore> {
        if token_ids.is_empty() {
            return None;
        }

        let (master_id, master_key) = self.cfg.master_keys.get_master_key(key_id);
        let stat_cfg = &self.cfg.statistical;
        let detector = StatisticalWatermarkDetector::new(stat_cfg.context_width, stat_cfg.greenlist_ratio);

        let mut best: Option<StatisticalScore> = None;
        for date_str in Self::candidate_dates(days_back) {
            let dkey = derive_step_key(master_key, model_id as u32, Some(&date_str), master_id);
            let score = match vocab_size {
                None => detector.score(token_ids, &dkey),
                Some(vocab) => score_sparse_watermark(
                    token_ids,
                    &dkey,
                    vocab,
                    stat_cfg.context_width,
                    stat_cfg.greenlist_ratio,
                    stat_cfg.max_bias_tokens,
                ),
            };
            if best.as_ref().map(|b| score.z_score > b.z_score).unwrap_or(true) {
                best = Some(score);
            }
        }
        best
    }

    /// Verify `text`, optionally supplying pre-tokenized ids (skipping the
    /// tokenizer seam) and a vocabulary size (selecting the sparse scorer).
    pub fn verify(
        &self,
        text: &str,
        model_hint: Option<&str>,
        token_ids: Option<Vec<u64>>,
        tokenizer: Option<&dyn Tokenize>,
        vocab_size: Option<u64>,
        days_back: i64,
    ) -> VerifyResult {
        let mut explanations = Vec::new();

        let decoded = decode_tags_from_text(text);
        if !decoded.is_empty() {
            explanations.push(format!("found {} zero-width tag candidate(s)", decoded.len()));
        }

        let mut payload = None;
        let mut payload_key_id = None;
        for candidate in &decoded {
            let (meta, valid) = unpack_payload(candidate.payload);
            if valid {
                payload_key_id = Some(meta.key_id as u32);
                payload = Some(meta);
                explanations.push("valid CRC metadata payload recovered".to_string());
                break;
            }
        }
        if payload.is_none() && !decoded.is_empty() {
            explanations.push("zero-width tags found but CRC invalid".to_string());
        }

        let token_ids = match (token_ids, tokenizer) {
            (Some(ids), _) => Some(ids),
            (None, Some(tok)) => match tok.encode(text) {
                Ok(ids) => Some(ids),
                Err(e) => {
                    explanations.push(format!("tokenization failed for statistical scoring: {e}"));
                    None
                }
            },
            (None, None) => None,
        };

        let model_id = self.cfg.model_id_for(model_hint);
        let stat_key_id = payload_key_id.or(Some(self.cfg.active_key_id));

        let stat_score = token_ids
            .as_ref()
            .filter(|ids| !ids.is_empty())
            .and_then(|ids| self.score_statistical(ids, model_id, stat_key_id, days_back, vocab_size));

        if let Some(score) = &stat_score {
            explanations.push(format!(
                "statistical z-score={:.3} over {} tokens",
                score.z_score, score.total_scored
            ));
        }

        let status = if payload.is_some() {
            VerifyStatus::Verified
        } else if let Some(score) = &stat_score {
            if score.z_score >= self.cfg.statistical.z_threshold_verified {
                VerifyStatus::Verified
            } else if score.z_score >= self.cfg.statistical.z_threshold_likely {
                VerifyStatus::Likely
            } else {
                VerifyStatus::None
            }
        } else {
            VerifyStatus::None
        };

        VerifyResult {
            status,
            statistical_score: stat_score,
            payload,
            key_id: payload_key_id.or(stat_key_id),
            explanations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEV_MASTER_KEY;
    use crate::payload::{pack_payload, PackedMetadata};
    use crate::zero_width::encode_payload_to_tag;

    fn test_cfg() -> WatermarkConfig {
        let mut cfg = WatermarkConfig::from_env();
        cfg.master_keys = crate::keys::MasterKeySet::new(std::collections::BTreeMap::from([(1, DEV_MASTER_KEY.to_vec())]));
        cfg
    }

    #[test]
    fn tag_with_valid_crc_is_verified() {
        let cfg = test_cfg();
        let detector = WatermarkDetector::new(&cfg);
        let meta = PackedMetadata::new(1, cfg.issuer_id, 7, 1, 1);
        let payload = pack_payload(&meta).unwrap();
        let text = format!("hello {}world", encode_payload_to_tag(payload));

        let result = detector.verify(&text, Some("test-model"), None, None, None, 7);
        assert_eq!(result.status, VerifyStatus::Verified);
        assert_eq!(result.payload.unwrap(), meta);
    }

    #[test]
    fn plain_text_with_no_signal_is_none() {
        let cfg = test_cfg();
        let detector = WatermarkDetector::new(&cfg);
        let result = detector.verify("just some ordinary text", None, Some(vec![1, 2, 3]), None, None, 7);
        assert_eq!(result.status, VerifyStatus::None);
    }

    #[test]
    fn candidate_dates_includes_today_first() {
        let dates = WatermarkDetector::candidate_dates(3);
        assert_eq!(dates.len(), 4);
        assert_eq!(dates[0], Utc::now().date_naive().format("%Y%m%d").to_string());
    }
}
