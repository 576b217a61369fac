//! watermark-registry: provenance registry HTTP surface — company
//! credential issuance, hash-chain anchoring, and signature-joined
//! verification.
//!
//! Endpoints:
//! - GET  /v1/health
//! - POST /v1/companies              { name, admin_secret }
//! - GET  /v1/companies
//! - POST /v1/anchor                 { text, issuer_id, signature_hex }
//! - POST /v1/verify                 { text }
//! - GET  /v1/chain/status
//! - GET  /v1/chain/blocks
//! - GET  /v1/chain/block/:block_num (1-indexed)

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use watermark_provenance::config::WatermarkConfig;
use watermark_provenance::detector::WatermarkDetector;
use watermark_provenance::error::WatermarkError;
use watermark_provenance::registry::chain::{self, ChainStore, InMemoryChainStore};
use watermark_provenance::registry::credentials::{self, CredentialStore, InMemoryCredentialStore};
use watermark_provenance::registry::responses::{InMemoryResponseStore, ResponseStore, StoredResponse};
use watermark_provenance::registry::signature::{hash_text, verify_signature};
use watermark_provenance::registry::verification::{self, RegistryVerificationResult};

#[derive(Clone)]
struct AppState {
    cfg: Arc<WatermarkConfig>,
    chain: Arc<dyn ChainStore>,
    credentials: Arc<dyn CredentialStore>,
    responses: Arc<dyn ResponseStore>,
    admin_secret: Arc<String>,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(Health { status: "ok" })
}

#[derive(Deserialize)]
struct CreateCompanyRequest {
    name: String,
    admin_secret: String,
}

#[derive(Serialize)]
struct CreateCompanyResponse {
    issuer_id: u32,
    name: String,
    eth_address: String,
    private_key: String,
    warning: &'static str,
}

const PRIVATE_KEY_WARNING: &str = "store this private key securely; it will not be shown again";

fn check_admin_secret(provided: &str, expected: &str) -> Result<(), WatermarkError> {
    if provided != expected {
        return Err(WatermarkError::PermissionDenied("invalid admin_secret".to_string()));
    }
    Ok(())
}

async fn create_company_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateCompanyRequest>,
) -> Result<impl IntoResponse, WatermarkError> {
    check_admin_secret(&req.admin_secret, &state.admin_secret)?;
    let (credential, secret) = credentials::create_company(&req.name, state.credentials.as_ref()).await?;
    Ok(Json(CreateCompanyResponse {
        issuer_id: credential.issuer_id,
        name: credential.name,
        eth_address: credential.eth_address,
        private_key: secret.private_key_hex,
        warning: PRIVATE_KEY_WARNING,
    }))
}

async fn list_companies_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(credentials::list_companies(state.credentials.as_ref()).await)
}

#[derive(Deserialize)]
struct AnchorRequest {
    text: String,
    issuer_id: u32,
    signature_hex: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Serialize)]
struct AnchorResponse {
    verified_signer: String,
    eth_address: String,
    sha256_hash: String,
    chain_receipt: chain::ChainReceipt,
}

async fn anchor_handler(State(state): State<AppState>, Json(req): Json<AnchorRequest>) -> Result<impl IntoResponse, WatermarkError> {
    let data_hash = hash_text(&req.text);

    let verified = verify_signature(&data_hash, &req.signature_hex, req.issuer_id, state.credentials.as_ref()).await;
    let Some(credential) = verified else {
        return Err(WatermarkError::PermissionDenied("signature does not match a registered, active issuer".to_string()));
    };

    let payload_json = req.metadata.to_string();
    let receipt = state.chain.anchor(&data_hash, credential.issuer_id, &req.signature_hex, &payload_json).await;

    state
        .responses
        .insert(StoredResponse {
            sha256_hash: data_hash.clone(),
            issuer_id: credential.issuer_id,
            signature_hex: req.signature_hex,
            raw_text: req.text.clone(),
            watermarked_text: req.text,
            metadata_json: payload_json,
            created_at: receipt.timestamp,
        })
        .await;

    Ok(Json(AnchorResponse {
        verified_signer: credential.name,
        eth_address: credential.eth_address,
        sha256_hash: data_hash,
        chain_receipt: receipt,
    }))
}

#[derive(Deserialize)]
struct VerifyRequest {
    text: String,
}

async fn verify_handler(State(state): State<AppState>, Json(req): Json<VerifyRequest>) -> Result<impl IntoResponse, WatermarkError> {
    let detector = WatermarkDetector::new(&state.cfg);
    let result: RegistryVerificationResult =
        verification::verify(&req.text, state.chain.as_ref(), state.credentials.as_ref(), &detector).await;
    Ok(Json(result))
}

async fn chain_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (valid, message) = chain::validate_chain(state.chain.as_ref()).await;
    Json(serde_json::json!({ "valid": valid, "message": message }))
}

async fn chain_blocks_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.chain.all_ordered().await)
}

async fn chain_block_handler(State(state): State<AppState>, Path(block_num): Path<u64>) -> Result<impl IntoResponse, WatermarkError> {
    state
        .chain
        .lookup_block_num(block_num)
        .await
        .map(Json)
        .ok_or_else(|| WatermarkError::NotFound(format!("no block numbered {block_num}")))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "registry=info,tower_http=info".into()))
        .with_target(false)
        .compact()
        .init();

    info!("starting provenance registry");

    let addr: SocketAddr = std::env::var("REGISTRY_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9003)));

    let admin_secret = std::env::var("REGISTRY_ADMIN_SECRET").unwrap_or_else(|_| "changeme-admin".to_string());

    let state = AppState {
        cfg: Arc::new(WatermarkConfig::from_env()),
        chain: Arc::new(InMemoryChainStore::default()),
        credentials: Arc::new(InMemoryCredentialStore::default()),
        responses: Arc::new(InMemoryResponseStore::default()),
        admin_secret: Arc::new(admin_secret),
    };

    let cors = CorsLayer::new().allow_origin(tower_http::cors::Any).allow_methods([Method::GET, Method::POST]);

    let app = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/companies", post(create_company_handler).get(list_companies_handler))
        .route("/v1/anchor", post(anchor_handler))
        .route("/v1/verify", post(verify_handler))
        .route("/v1/chain/status", get(chain_status_handler))
        .route("/v1/chain/blocks", get(chain_blocks_handler))
        .route("/v1/chain/block/:block_num", get(chain_block_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!("provenance registry listening on http://{addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
