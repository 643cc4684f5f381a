//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Pending reservations per signer
//! - Submission attempts by outcome
//! - Executions by terminal outcome

use crate::error::{EngineError, EngineResult};

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::Address;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref SIGNER_PENDING: GaugeVec = register_gauge_vec!(
        "relayer_signer_pending",
        "Reserved but unreleased nonces per signer",
        &["signer"]
    ).unwrap();

    pub static ref SUBMIT_ATTEMPTS: CounterVec = register_counter_vec!(
        "relayer_submit_attempts_total",
        "Submission attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref EXECUTIONS: CounterVec = register_counter_vec!(
        "relayer_executions_total",
        "Executions by terminal outcome",
        &["outcome"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EngineResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| EngineError::Config(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| EngineError::Config(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Encode the default registry in text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

// Helper functions to record metrics

pub fn record_pending(signer: Address, pending: u64) {
    SIGNER_PENDING
        .with_label_values(&[&format!("{:?}", signer)])
        .set(pending as f64);
}

pub fn record_attempt(outcome: &str) {
    SUBMIT_ATTEMPTS.with_label_values(&[outcome]).inc();
}

pub fn record_execution(outcome: &str) {
    EXECUTIONS.with_label_values(&[outcome]).inc();
}
