//! OpenAI-compatible generation gateway, sitting in front of an upstream
//! llama.cpp-style completion server
//!
//! The per-token loop asks upstream for exactly one token at a time so the
//! sparse green-id bias can be recomputed from the freshly extended context
//! before each step — the same reason the original implementation disables
//! the upstream's own multi-token sampling in watermarked modes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::WatermarkConfig;
use crate::error::WatermarkError;
use crate::keys::today_utc_yyyymmdd;
use crate::payload::{pack_payload, PackedMetadata};
use crate::statistical::select_sparse_green_ids;
use crate::zero_width::{encode_payload_to_tag, TagInjector};

/// How upstream reported its generation stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopType {
    Eos,
    Word,
    Limit,
    Other,
}

/// One step of upstream completion output.
#[derive(Clone, Debug)]
pub struct CompletionStep {
    pub text: String,
    pub token_ids: Vec<u64>,
    pub stop_type: StopType,
}

/// Model metadata the gateway needs to size its bias maps.
#[derive(Clone, Debug)]
pub struct ModelMeta {
    pub model_id: String,
    pub vocab_size: u64,
}

/// Everything the gateway needs from the upstream inference server, behind
/// a trait so tests can substitute a stub without a real llama.cpp process.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<u64>, WatermarkError>;
    async fn apply_template(&self, messages: &[Value], model: Option<&str>) -> Result<String, WatermarkError>;
    async fn completion(&self, request: &Value) -> Result<CompletionStep, WatermarkError>;
    async fn model_meta(&self, model: Option<&str>) -> Result<ModelMeta, WatermarkError>;
    async fn passthrough(&self, path: &str, body: &Value) -> Result<Value, WatermarkError>;
}

/// The request-scoped plan resolved from the caller's `watermark` stanza
/// plus process configuration — computed once per request, before any
/// upstream call is made.
pub struct GenerationPlan {
    pub enabled: bool,
    pub mode: crate::config::WatermarkMode,
    pub key_id: u32,
    pub model_name: String,
    pub static_tag: Option<String>,
}

/// Resolve a [`GenerationPlan`] from the parsed request body and config.
/// Builds the static zero-width tag once up front for `hybrid`/`tag_only`
/// modes, since its bits don't change across the generation.
pub fn plan_request(cfg: &WatermarkConfig, req: &crate::config::EffectiveWatermarkRequest, model_name: &str) -> GenerationPlan {
    let key_id = req.key_id.unwrap_or(cfg.active_key_id);
    let static_tag = if req.enabled
        && matches!(req.mode, crate::config::WatermarkMode::Hybrid | crate::config::WatermarkMode::TagOnly)
    {
        let meta = PackedMetadata::new(
            cfg.schema_version,
            cfg.issuer_id,
            cfg.model_id_for(Some(model_name)),
            cfg.model_version_id_for(Some(model_name)),
            key_id as u8,
        );
        pack_payload(&meta).ok().map(encode_payload_to_tag)
    } else {
        None
    };

    GenerationPlan { enabled: req.enabled, mode: req.mode, key_id, model_name: model_name.to_string(), static_tag }
}

fn parse_oai_logit_bias(value: Option<&Value>) -> BTreeMap<u64, f64> {
    let mut out = BTreeMap::new();
    let Some(value) = value else { return out };
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if let (Ok(tid), Some(bias)) = (k.parse::<u64>(), v.as_f64()) {
                    out.insert(tid, bias);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                if let Value::Array(pair) = item {
                    if pair.len() == 2 {
                        if let (Some(tid), Some(bias)) = (pair[0].as_u64(), pair[1].as_f64()) {
                            out.insert(tid, bias);
                        }
                    }
                }
            }
        }
        _ => {}
    }
    out
}

fn merge_logit_bias(maps: &[&BTreeMap<u64, f64>]) -> BTreeMap<u64, f64> {
    let mut merged = BTreeMap::new();
    for map in maps {
        for (&tid, &bias) in map.iter() {
            *merged.entry(tid).or_insert(0.0) += bias;
        }
    }
    merged
}

fn build_sparse_wm_logit_bias(
    cfg: &WatermarkConfig,
    context_tokens: &[u64],
    model_id_num: u16,
    key_id: u32,
    date_str: &str,
    n_vocab: u64,
) -> BTreeMap<u64, f64> {
    if context_tokens.len() < cfg.statistical.context_width {
        return BTreeMap::new();
    }
    let (resolved_id, master_key) = cfg.master_keys.get_master_key(Some(key_id));
    let derived = crate::keys::derive_step_key(master_key, model_id_num as u32, Some(date_str), resolved_id);
    let seed = crate::keys::derive_context_seed(&derived, &context_tokens[context_tokens.len() - cfg.statistical.context_width..]);
    let green_ids = select_sparse_green_ids(n_vocab, seed, cfg.statistical.greenlist_ratio, cfg.statistical.max_bias_tokens);
    let delta = cfg.statistical.bias_delta;
    green_ids.into_iter().map(|tid| (tid, delta)).collect()
}

fn to_llama_completion_request(body: &Map<String, Value>, prompt: &str, n_predict: u32, logit_bias: &BTreeMap<u64, f64>) -> Value {
    let mut req = serde_json::json!({
        "prompt": prompt,
        "n_predict": n_predict,
        "temperature": body.get("temperature").cloned().unwrap_or(Value::from(0.8)),
        "top_p": body.get("top_p").cloned().unwrap_or(Value::from(0.95)),
        "stop": body.get("stop").cloned().unwrap_or_else(|| Value::Array(vec![])),
        "stream": false,
        "cache_prompt": true,
        "return_tokens": true,
    });

    let obj = req.as_object_mut().expect("literal object");
    for key in ["top_k", "min_p", "seed", "presence_penalty", "frequency_penalty"] {
        if let Some(v) = body.get(key) {
            obj.insert(key.to_string(), v.clone());
        }
    }
    if let Some(v) = body.get("repetition_penalty") {
        obj.insert("repeat_penalty".to_string(), v.clone());
    }
    if !logit_bias.is_empty() {
        let bias_obj: Map<String, Value> = logit_bias.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect();
        obj.insert("logit_bias".to_string(), Value::Object(bias_obj));
    }
    req
}

/// Result of the per-token generation loop: generated text, generated token
/// ids, and the prompt's own token count (for OAI usage accounting).
pub struct GeneratedOutput {
    pub text: String,
    pub token_ids: Vec<u64>,
    pub prompt_tokens: usize,
}

/// Run the watermarked per-token generation loop against `upstream`.
pub async fn watermarked_generate(
    upstream: &dyn UpstreamClient,
    cfg: &WatermarkConfig,
    body: &Map<String, Value>,
    prompt: &str,
    plan: &GenerationPlan,
) -> Result<GeneratedOutput, WatermarkError> {
    let model_meta = upstream.model_meta(body.get("model").and_then(Value::as_str)).await?;
    let prompt_tokens = upstream.tokenize(prompt, true).await?;

    let mut generated_text = String::new();
    let mut generated_tokens: Vec<u64> = Vec::new();

    let max_tokens = body.get("max_tokens").and_then(Value::as_u64).unwrap_or(16).max(1) as u32;
    let user_bias = parse_oai_logit_bias(body.get("logit_bias"));
    let date_str = today_utc_yyyymmdd();
    let model_id_num = cfg.model_id_for(Some(&plan.model_name));

    let mut tag_injector = plan.static_tag.clone().map(|tag| TagInjector::new(tag, cfg.tag.repeat_interval_tokens));

    for step_idx in 0..max_tokens {
        let wm_bias = if plan.enabled
            && matches!(plan.mode, crate::config::WatermarkMode::Hybrid | crate::config::WatermarkMode::StatisticalOnly)
        {
            let mut ctx = prompt_tokens.clone();
            ctx.extend_from_slice(&generated_tokens);
            build_sparse_wm_logit_bias(cfg, &ctx, model_id_num, plan.key_id, &date_str, model_meta.vocab_size)
        } else {
            BTreeMap::new()
        };

        let merged_bias = merge_logit_bias(&[&user_bias, &wm_bias]);
        let full_prompt = format!("{prompt}{generated_text}");
        let request = to_llama_completion_request(body, &full_prompt, 1, &merged_bias);

        let step = upstream.completion(&request).await?;
        let stopped = matches!(step.stop_type, StopType::Eos | StopType::Word);
        let is_last_step = stopped || step_idx + 1 == max_tokens;

        let rendered = match tag_injector.as_mut() {
            Some(injector) => injector.inject_delta(&step.text, is_last_step),
            None => step.text.clone(),
        };
        generated_text.push_str(&rendered);
        generated_tokens.extend(step.token_ids);

        if stopped {
            break;
        }
    }

    Ok(GeneratedOutput { text: generated_text, token_ids: generated_tokens, prompt_tokens: prompt_tokens.len() })
}

/// Build an OpenAI `text_completion` response body.
pub fn oai_completion_response(model: &str, text: &str, prompt_tokens: usize, completion_tokens: usize, created_unix: i64) -> Value {
    serde_json::json!({
        "id": format!("cmpl-wm-{created_unix}"),
        "object": "text_completion",
        "created": created_unix,
        "model": model,
        "choices": [{ "index": 0, "text": text, "logprobs": null, "finish_reason": "stop" }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}

/// Build an OpenAI `chat.completion` response body.
pub fn oai_chat_response(model: &str, text: &str, prompt_tokens: usize, completion_tokens: usize, created_unix: i64) -> Value {
    serde_json::json!({
        "id": format!("chatcmpl-wm-{created_unix}"),
        "object": "chat.completion",
        "created": created_unix,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}

/// Inject the plan's static tag into every text-bearing field of a
/// non-streaming OAI-shaped response, in place.
///
/// Each field is its own complete, already-generated piece of text, so each
/// gets a fresh injector run once to completion (`finalize = true`) — this
/// is exactly one call to the same streaming algorithm the per-token
/// generation loop uses, just over the whole string at once.
pub fn inject_tag_into_response(resp: &mut Value, tag: &str, repeat_interval_tokens: u32) -> Result<(), WatermarkError> {
    let Some(choices) = resp.get_mut("choices").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    for choice in choices {
        if let Some(text) = choice.get("text").and_then(Value::as_str) {
            let injected = TagInjector::new(tag.to_string(), repeat_interval_tokens).inject_delta(text, true);
            choice["text"] = Value::from(injected);
        }
        if let Some(content) = choice.pointer("/message/content").and_then(Value::as_str) {
            let injected = TagInjector::new(tag.to_string(), repeat_interval_tokens).inject_delta(content, true);
            choice["message"]["content"] = Value::from(injected);
        }
    }
    Ok(())
}
