//! Internal HTTP API: liveness, signer status and contract-call execution
//! for the command router

use crate::chain::{ContractHandle, HttpRpcClient};
use crate::config::ApiConfig;
use crate::error::{EngineError, EngineResult};
use crate::tx::{EthersSubmitter, ExecuteOptions, Executor};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::Token;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Executor wired to the real JSON-RPC client and ethers submitter
pub type RelayExecutor = Executor<HttpRpcClient, EthersSubmitter>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<RelayExecutor>,
    pub contract: ContractHandle,
    pub abort_unless_unconfirmed_rpc_error: bool,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> EngineResult<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/signers", get(get_signers))
        .route("/execute", post(execute))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Config(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| EngineError::Config(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Pending reservations per signer
async fn get_signers(State(state): State<AppState>) -> Response {
    match state.executor.pending_by_signer() {
        Ok(signers) => Json(SignersResponse {
            signers: signers
                .into_iter()
                .map(|(address, pending)| SignerStatus { address, pending })
                .collect(),
        })
        .into_response(),
        Err(e) => error_response(status_for(&e), e.to_string()),
    }
}

/// Execute a method on the relayer's contract
async fn execute(State(state): State<AppState>, Json(request): Json<ExecuteRequest>) -> Response {
    let params = match tokenize_params(&state.contract, &request.method, &request.params) {
        Ok(params) => params,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    let options = ExecuteOptions::strict(
        request
            .abort_unless_unconfirmed_rpc_error
            .unwrap_or(state.abort_unless_unconfirmed_rpc_error),
    );

    match state.executor.execute(&request.method, params, options).await {
        Ok(handle) => (StatusCode::OK, Json(handle)).into_response(),
        Err(e) => error_response(status_for(&e), e.to_string()),
    }
}

/// Convert JSON arguments to ABI tokens using the method's input types
pub fn tokenize_params(
    contract: &ContractHandle,
    method: &str,
    params: &[Value],
) -> Result<Vec<Token>, String> {
    let function = contract
        .abi
        .function(method)
        .map_err(|e| format!("unknown method {}: {}", method, e))?;

    if function.inputs.len() != params.len() {
        return Err(format!(
            "{} takes {} arguments, got {}",
            method,
            function.inputs.len(),
            params.len()
        ));
    }

    function
        .inputs
        .iter()
        .zip(params)
        .map(|(input, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            LenientTokenizer::tokenize(&input.kind, &text)
                .map_err(|e| format!("invalid {} for {}: {}", input.kind, input.name, e))
        })
        .collect()
}

/// HTTP status for a terminal engine error
pub fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Abort { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::PreBroadcast { .. } => StatusCode::BAD_GATEWAY,
        EngineError::NonceFetch { .. } | EngineError::ExhaustedRetries { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::Config(_) | EngineError::AlreadyInitialized | EngineError::Wallet(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

// Request and response types

#[derive(Deserialize)]
struct ExecuteRequest {
    method: String,
    #[serde(default)]
    params: Vec<Value>,
    abort_unless_unconfirmed_rpc_error: Option<bool>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct SignersResponse {
    signers: Vec<SignerStatus>,
}

#[derive(Serialize)]
struct SignerStatus {
    address: Address,
    pending: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
