//! watermark-gateway: OpenAI-compatible completion proxy that applies
//! statistical and/or zero-width watermarking in front of an upstream
//! llama.cpp-style inference server.
//!
//! Endpoints:
//! - GET  /v1/health
//! - POST /v1/completions
//! - POST /v1/chat/completions
//! - POST /internal/watermark/verify

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use watermark_provenance::config::{parse_effective_request, WatermarkConfig, WatermarkMode};
use watermark_provenance::detector::WatermarkDetector;
use watermark_provenance::error::WatermarkError;
use watermark_provenance::gateway::{
    self, oai_chat_response, oai_completion_response, CompletionStep, GenerationPlan, ModelMeta, StopType, UpstreamClient,
};
use watermark_provenance::policy::{get_opt_out_secret, verify_opt_out_token};

struct LlamaCppClient {
    base_url: String,
    client: reqwest::Client,
}

impl LlamaCppClient {
    fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(180))
            .build()
            .expect("reqwest client builds with static config");
        Self { base_url, client }
    }

    fn unimplemented_if_missing_endpoint(data: &Value, context: &str) -> Result<(), WatermarkError> {
        if let Some(err) = data.get("error").and_then(Value::as_str) {
            if err.contains("Unexpected endpoint or method") {
                return Err(WatermarkError::Unimplemented(format!(
                    "upstream does not expose {context}; statistical watermark mode requires llama-server native endpoints"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl UpstreamClient for LlamaCppClient {
    async fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<u64>, WatermarkError> {
        let resp = self
            .client
            .post(format!("{}/tokenize", self.base_url))
            .json(&serde_json::json!({ "content": text, "add_special": add_special, "parse_special": true }))
            .send()
            .await
            .map_err(|e| WatermarkError::Upstream { status: 502, message: e.to_string() })?;
        let data: Value = resp.json().await.map_err(|e| WatermarkError::Upstream { status: 502, message: e.to_string() })?;

        let tokens = data.get("tokens").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(tokens
            .into_iter()
            .filter_map(|t| t.as_u64().or_else(|| t.get("id").and_then(Value::as_u64)))
            .collect())
    }

    async fn apply_template(&self, messages: &[Value], model: Option<&str>) -> Result<String, WatermarkError> {
        let mut payload = serde_json::json!({ "messages": messages });
        if let Some(model) = model {
            payload["model"] = Value::from(model);
        }
        let resp = self
            .client
            .post(format!("{}/apply-template", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| WatermarkError::Upstream { status: 502, message: e.to_string() })?;
        let data: Value = resp.json().await.map_err(|e| WatermarkError::Upstream { status: 502, message: e.to_string() })?;
        Self::unimplemented_if_missing_endpoint(&data, "/apply-template")?;

        data.get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| WatermarkError::Upstream { status: 502, message: "/apply-template did not return prompt".to_string() })
    }

    async fn completion(&self, request: &Value) -> Result<CompletionStep, WatermarkError> {
        let resp = self
            .client
            .post(format!("{}/completion", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| WatermarkError::Upstream { status: 502, message: e.to_string() })?;
        let data: Value = resp.json().await.map_err(|e| WatermarkError::Upstream { status: 502, message: e.to_string() })?;
        Self::unimplemented_if_missing_endpoint(&data, "/completion")?;

        let text = data.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
        let token_ids: Vec<u64> = data
            .get("tokens")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();

        let stop_type = match data.get("stop_type").and_then(Value::as_str) {
            Some("eos") => StopType::Eos,
            Some("word") => StopType::Word,
            Some("limit") => StopType::Limit,
            _ => StopType::Other,
        };

        Ok(CompletionStep { text, token_ids, stop_type })
    }

    async fn model_meta(&self, model: Option<&str>) -> Result<ModelMeta, WatermarkError> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await
            .map_err(|e| WatermarkError::Upstream { status: 502, message: e.to_string() })?;
        let data: Value = resp.json().await.map_err(|e| WatermarkError::Upstream { status: 502, message: e.to_string() })?;

        let items = data.get("data").and_then(Value::as_array).cloned().unwrap_or_default();
        let Some(first) = items.first().cloned() else {
            return Ok(ModelMeta { model_id: model.unwrap_or("llama.cpp").to_string(), vocab_size: 32000 });
        };

        let chosen = model
            .and_then(|m| items.iter().find(|it| it.get("id").and_then(Value::as_str) == Some(m)))
            .cloned()
            .unwrap_or(first);

        let model_id = chosen.get("id").and_then(Value::as_str).unwrap_or("llama.cpp").to_string();
        let vocab_size = chosen.pointer("/meta/n_vocab").and_then(Value::as_u64).unwrap_or(32000);
        Ok(ModelMeta { model_id, vocab_size })
    }

    async fn passthrough(&self, path: &str, body: &Value) -> Result<Value, WatermarkError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| WatermarkError::Upstream { status: 502, message: e.to_string() })?;
        let status = resp.status();
        let data: Value = resp.json().await.map_err(|e| WatermarkError::Upstream { status: 502, message: e.to_string() })?;
        if status.as_u16() >= 400 {
            return Err(WatermarkError::Upstream { status: status.as_u16(), message: data.to_string() });
        }
        Ok(data)
    }
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<WatermarkConfig>,
    upstream: Arc<dyn UpstreamClient>,
    opt_out_secret: Arc<Vec<u8>>,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(Health { status: "ok" })
}

async fn verify_endpoint(State(state): State<AppState>, Json(payload): Json<Value>) -> Result<impl IntoResponse, WatermarkError> {
    let text = payload
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| WatermarkError::InvalidArgument("text is required".to_string()))?;
    let model_hint = payload.get("model_hint").and_then(Value::as_str);
    let token_ids: Option<Vec<u64>> =
        payload.get("token_ids").and_then(Value::as_array).map(|arr| arr.iter().filter_map(Value::as_u64).collect());

    let model_meta = state.upstream.model_meta(model_hint).await?;
    let token_ids = match token_ids {
        Some(ids) => ids,
        None => state.upstream.tokenize(text, true).await?,
    };

    let detector = WatermarkDetector::new(&state.cfg);
    let result = detector.verify(text, Some(&model_meta.model_id), Some(token_ids), None, Some(model_meta.vocab_size), 7);

    Ok(Json(result))
}

async fn handle_common(state: &AppState, mut body: Map<String, Value>, as_chat: bool) -> Result<Value, WatermarkError> {
    let wm_raw = body.remove("watermark");
    let req_wm = parse_effective_request(wm_raw.as_ref());

    if !req_wm.enabled {
        let (ok, reason) = verify_opt_out_token(req_wm.opt_out_token.as_deref(), &state.opt_out_secret, chrono::Utc::now().timestamp());
        if !ok {
            return Err(WatermarkError::PermissionDenied(format!("watermark opt-out denied: {reason}")));
        }
    }

    let model_name = body.get("model").and_then(Value::as_str).unwrap_or("llama.cpp").to_string();
    let plan: GenerationPlan = gateway::plan_request(&state.cfg, &req_wm, &model_name);

    if plan.enabled && matches!(plan.mode, WatermarkMode::Hybrid | WatermarkMode::StatisticalOnly) {
        let prompt = if as_chat {
            let messages = body
                .get("messages")
                .and_then(Value::as_array)
                .ok_or_else(|| WatermarkError::InvalidArgument("messages is required for chat completions".to_string()))?;
            state.upstream.apply_template(messages, body.get("model").and_then(Value::as_str)).await?
        } else {
            body.get("prompt")
                .and_then(Value::as_str)
                .ok_or_else(|| WatermarkError::InvalidArgument("this gateway currently supports string prompt only".to_string()))?
                .to_string()
        };

        let output = gateway::watermarked_generate(state.upstream.as_ref(), &state.cfg, &body, &prompt, &plan).await?;
        let created = chrono::Utc::now().timestamp();
        // The static tag, if any, was already spliced in token-by-token inside
        // watermarked_generate; the response text needs no further injection.
        let resp = if as_chat {
            oai_chat_response(&model_name, &output.text, output.prompt_tokens, output.token_ids.len(), created)
        } else {
            oai_completion_response(&model_name, &output.text, output.prompt_tokens, output.token_ids.len(), created)
        };
        return Ok(resp);
    }

    let path = if as_chat { "/v1/chat/completions" } else { "/v1/completions" };
    let mut data = state.upstream.passthrough(path, &Value::Object(body)).await?;
    if let Some(tag) = &plan.static_tag {
        gateway::inject_tag_into_response(&mut data, tag, state.cfg.tag.repeat_interval_tokens)?;
    }
    Ok(data)
}

async fn completions(State(state): State<AppState>, Json(body): Json<Map<String, Value>>) -> Result<impl IntoResponse, WatermarkError> {
    Ok(Json(handle_common(&state, body, false).await?))
}

async fn chat_completions(State(state): State<AppState>, Json(body): Json<Map<String, Value>>) -> Result<impl IntoResponse, WatermarkError> {
    Ok(Json(handle_common(&state, body, true).await?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "gateway=info,tower_http=info".into()))
        .with_target(false)
        .compact()
        .init();

    info!("starting watermark gateway");

    let addr: SocketAddr = std::env::var("GATEWAY_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9002)));

    let upstream_url = std::env::var("UPSTREAM_LLAMACPP_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

    let state = AppState {
        cfg: Arc::new(WatermarkConfig::from_env()),
        upstream: Arc::new(LlamaCppClient::new(upstream_url)),
        opt_out_secret: Arc::new(get_opt_out_secret()),
    };

    let cors = CorsLayer::new().allow_origin(tower_http::cors::Any).allow_methods([Method::GET, Method::POST]);

    let app = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/internal/watermark/verify", post(verify_endpoint))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!("watermark gateway listening on http://{addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
