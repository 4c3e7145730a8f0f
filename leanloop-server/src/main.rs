//! leanloop HTTP server.
//!
//! Exposes `leanloop-core`'s proof verifier over HTTP.
//!
//! Run:
//! ```bash
//! cargo run --quiet -p leanloop-server
//! ```
//!
//! Then:
//! - `curl http://127.0.0.1:5000/health`
//! - example call:
//! ```bash
//! curl -X POST http://127.0.0.1:5000/verify-lean-proof \
//!   -H 'Content-Type: application/json' \
//!   -d '{"proof":"example : 1 + 1 = 2 := rfl"}'
//! ```
//!
//! Configuration: the `LEANLOOP_*` variables read by `leanloop_core::Config`, in particular
//! - `LEANLOOP_ADDR` (default: `0.0.0.0:5000`)
//! - `LEANLOOP_CHECKER` / `LEANLOOP_CHECKER_ARGS` / `LEANLOOP_CHECKER_TIMEOUT_S`

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use leanloop_core as llc;
use serde_json::{json, Value};
use std::sync::Arc;

const BAD_BODY_MESSAGE: &str = "Request body must be JSON with a string `proof`";

fn app(verifier: Arc<llc::Verifier>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/verify-lean-proof", post(verify_lean_proof))
        .with_state(verifier)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// If the client goes away the handler future is dropped, which kills the checker and
// removes the proof artifact.
async fn verify_lean_proof(
    State(verifier): State<Arc<llc::Verifier>>,
    body: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    // Never echo axum's rejection text to the client.
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => {
            tracing::info!(error = %rejection, "rejecting malformed request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "error",
                    "message": BAD_BODY_MESSAGE,
                })),
            );
        }
    };
    let proof = body.get("proof").unwrap_or(&Value::Null);
    let outcome =
        match llc::ProofSubmission::from_value(proof, verifier.config().max_proof_chars) {
            Ok(submission) => verifier.verify(&submission).await,
            Err(rejected) => rejected,
        };
    tracing::info!(status = ?outcome.status(), "verify-lean-proof");
    let code =
        StatusCode::from_u16(outcome.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(outcome.response_body()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout stays clean.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let arg1 = std::env::args().nth(1);
    if matches!(arg1.as_deref(), Some("-h" | "--help" | "help")) {
        println!("leanloop-server");
        println!();
        println!("Usage:");
        println!("  leanloop-server    # HTTP server");
        println!();
        println!("Env:");
        println!("  LEANLOOP_ADDR=0.0.0.0:5000");
        println!("  LEANLOOP_CHECKER=lean");
        println!("  LEANLOOP_CHECKER_TIMEOUT_S=30");
        println!("  LEANLOOP_MAX_PROOF_CHARS=10000");
        return Ok(());
    }
    if matches!(arg1.as_deref(), Some("-V" | "--version" | "version")) {
        println!("leanloop-server {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cfg = llc::Config::from_env()?;
    let addr = cfg.addr.clone();
    let verifier = Arc::new(llc::Verifier::new(cfg.verifier));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "leanloop server listening");
    axum::serve(listener, app(verifier))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run().await
}
