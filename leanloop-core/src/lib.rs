//! `leanloop-core`: verify Lean proofs and let an LLM iterate on them.
//!
//! Scope:
//! - run an external checker (`lean <file>`, or `lake env lean <file>`) against proof text held
//!   in a scoped temp file, with a wall-clock limit and path-sanitized output
//! - drive an OpenAI-compatible chat model through a single `verify_lean_proof` tool until it
//!   produces a final answer or the retry budget runs out
//!
//! Output discipline:
//! - keep outputs JSON-friendly (`serde` types)
//! - never return the server-side path of a proof artifact
//!
//! Entrypoints:
//! - the CLI binary lives in `leanloop-core/src/bin/leanloop.rs`
//! - the HTTP wrapper lives in `leanloop-server`
//!
//! Environment:
//! - settings are `LEANLOOP_*` (see [`config`]); a `.env` in the working directory is merged
//!   first and never overrides variables that are already set.
//! - LLM routing can use:
//!   - `LEANLOOP_BASE_URL` + `LLM_API_KEY` (explicit endpoint)
//!   - `OPENAI_API_KEY` (+ optional `OPENAI_BASE_URL`, `OPENAI_MODEL`)
//!   - `OPENROUTER_API_KEY` (+ optional `OPENROUTER_BASE_URL`, `OPENROUTER_MODEL`)
//!   - `GROQ_API_KEY` (+ optional `GROQ_MODEL`)
//!   - `OLLAMA_MODEL` (+ optional `OLLAMA_HOST`)
//!
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod verifier;

pub use config::Config;
pub use conversation::{Conversation, Message, ToolInvocationRequest};
pub use error::LoopError;
pub use llm::{AssistantTurn, ChatService, LlmConfig, OpenAiChat};
pub use orchestrator::{LoopConfig, LoopState, Orchestrator, Session, Transcript};
pub use verifier::{
    ProofSubmission, VerificationOutcome, VerificationStatus, Verifier, VerifierConfig,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticLoc {
    pub path: String,
    pub line: usize,
    pub col: usize,
    pub kind: String,
}

/// Parse the first Lean error location from `stdout`/`stderr` (best-effort).
///
/// Typical Lean format:
/// - `/abs/path/File.lean:276:8: error: ...`
/// - `<proof-file>:1:22: error: ...` (after artifact paths are sanitized)
///
/// We only return the first `error:` line; warnings are ignored.
pub fn parse_first_error_loc(stdout: &str, stderr: &str) -> Option<DiagnosticLoc> {
    // Anchor at start-of-line to avoid matching inside multi-line diagnostics.
    let pat = Regex::new(r"(?m)^([^:\n]+):(\d+):(\d+):\s+error:").ok()?;
    let joined = format!("{stdout}\n{stderr}");
    let cap = pat.captures(&joined)?;
    let path = cap.get(1)?.as_str().to_string();
    let line = cap.get(2)?.as_str().parse::<usize>().ok()?;
    let col = cap.get(3)?.as_str().parse::<usize>().ok()?;
    Some(DiagnosticLoc {
        path,
        line,
        col,
        kind: "error".to_string(),
    })
}
