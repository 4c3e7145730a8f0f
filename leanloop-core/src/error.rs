use thiserror::Error;

/// Session-level failures.
///
/// A proof that fails to check is not one of these: the verifier reports it as a
/// [`crate::VerificationOutcome`] and the orchestrator feeds it back to the model.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The chat service was unreachable or answered with an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The model produced a tool call we cannot act on.
    #[error("tool protocol error: {0}")]
    ToolProtocol(String),

    #[error("retry budget exhausted after {tries} tool calls without a final answer")]
    RetryBudgetExhausted { tries: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
