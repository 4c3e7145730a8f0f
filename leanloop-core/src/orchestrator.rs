//! Bounded tool-calling loop: model drafts a proof, we check it, the model reads the verdict.
//!
//! States: `Awaiting -> (ToolCalled -> Awaiting)* -> Stopped | Exhausted`.
//! The retry ceiling is checked before every model call, so a session never makes more than
//! `max_tries` tool rounds and never calls the model again once the budget is spent.

use crate::conversation::{Conversation, Message, ToolInvocationRequest};
use crate::error::LoopError;
use crate::llm::{AssistantTurn, ChatService};
use crate::verifier::Verifier;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

pub const VERIFY_TOOL_NAME: &str = "verify_lean_proof";
pub const DEFAULT_MAX_TRIES: u32 = 5;

/// Tool declaration sent with every model call.
///
/// `maxLength` mirrors the verifier's limit; the verifier is still the one that enforces it.
pub fn tool_schema(max_proof_chars: usize) -> Value {
    json!([{
        "type": "function",
        "function": {
            "name": VERIFY_TOOL_NAME,
            "description": "Verify the correctness of a Lean proof",
            "parameters": {
                "type": "object",
                "properties": {
                    "proof": {
                        "type": "string",
                        "description": "The content of the Lean proof to verify",
                        "maxLength": max_proof_chars
                    }
                },
                "required": ["proof"]
            }
        }
    }])
}

pub fn system_prompt() -> String {
    [
        "You will be provided with a proof request. Your task is to:",
        "1. write Lean 4 code for that proof,",
        "2. submit the code by calling the `verify_lean_proof` tool,",
        "3. read the verification result and iterate until the proof is accepted.",
        "",
        "Example tool call:",
        r#"  verify_lean_proof({"proof": "example : 1 + 1 = 2 := rfl"})"#,
        "",
        "The result is JSON with `status` (success, invalid, too_large, timeout, internal_error), \
`stdout`, `stderr` and, for invalid proofs, `first_error` (line/col). The file is shown as \
`<proof-file>` in diagnostics.",
        "When the proof is accepted, reply with the final proof and a one-line explanation, \
without calling the tool again. You are dedicated and will keep trying until you succeed.",
    ]
    .join("\n")
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Tool rounds allowed before the session is declared exhausted.
    pub max_tries: u32,
    pub system_prompt: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            system_prompt: system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Awaiting,
    ToolCalled,
    Stopped,
    Exhausted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Exhausted)
    }
}

/// What a finished session hands back.
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub state: LoopState,
    /// Retry counter at the end (0 after a final answer).
    pub tries: u32,
    pub tool_rounds: usize,
    pub llm_calls: u32,
    pub messages: Vec<Message>,
}

impl Transcript {
    /// The model's final answer, if the session stopped normally.
    pub fn final_answer(&self) -> Option<&str> {
        if self.state != LoopState::Stopped {
            return None;
        }
        match self.messages.last() {
            Some(Message::Assistant {
                content,
                tool_call: None,
            }) => Some(content.as_str()),
            _ => None,
        }
    }

    /// Exhaustion becomes [`LoopError::RetryBudgetExhausted`].
    pub fn into_result(self) -> Result<Transcript, LoopError> {
        match self.state {
            LoopState::Exhausted => Err(LoopError::RetryBudgetExhausted { tries: self.tries }),
            _ => Ok(self),
        }
    }
}

pub struct Orchestrator<C> {
    chat: C,
    verifier: Verifier,
    cfg: LoopConfig,
    tools: Value,
}

impl<C: ChatService> Orchestrator<C> {
    pub fn new(chat: C, verifier: Verifier, cfg: LoopConfig) -> Self {
        let tools = tool_schema(verifier.config().max_proof_chars);
        Self {
            chat,
            verifier,
            cfg,
            tools,
        }
    }

    pub fn chat(&self) -> &C {
        &self.chat
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn config(&self) -> &LoopConfig {
        &self.cfg
    }

    pub fn tools(&self) -> &Value {
        &self.tools
    }

    /// A fresh session seeded with the system prompt and `prompt`.
    pub fn session(&self, prompt: &str) -> Session<'_, C> {
        Session {
            orch: self,
            conversation: Conversation::seeded(self.cfg.system_prompt.clone(), prompt),
            tries: 0,
            llm_calls: 0,
            state: LoopState::Awaiting,
            pending: None,
        }
    }

    /// Run a session to a terminal state. Exhaustion is reported in the transcript.
    pub async fn run(&self, prompt: &str) -> Result<Transcript, LoopError> {
        self.session(prompt).run_to_end().await
    }
}

/// One conversation. Strictly sequential: one model call or one verification at a time.
pub struct Session<'a, C> {
    orch: &'a Orchestrator<C>,
    conversation: Conversation,
    tries: u32,
    llm_calls: u32,
    state: LoopState,
    pending: Option<(ToolInvocationRequest, String)>,
}

impl<'a, C: ChatService> Session<'a, C> {
    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn llm_calls(&self) -> u32 {
        self.llm_calls
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Advance by one transition. Terminal states are left unchanged.
    pub async fn step(&mut self) -> Result<LoopState, LoopError> {
        match self.state {
            LoopState::Awaiting => self.await_model().await?,
            LoopState::ToolCalled => self.run_tool().await?,
            LoopState::Stopped | LoopState::Exhausted => {}
        }
        Ok(self.state)
    }

    pub async fn run_to_end(mut self) -> Result<Transcript, LoopError> {
        while !self.state.is_terminal() {
            self.step().await?;
        }
        Ok(self.into_transcript())
    }

    pub fn into_transcript(self) -> Transcript {
        let tool_rounds = self.conversation.tool_rounds();
        Transcript {
            state: self.state,
            tries: self.tries,
            tool_rounds,
            llm_calls: self.llm_calls,
            messages: self.conversation.into_messages(),
        }
    }

    async fn await_model(&mut self) -> Result<(), LoopError> {
        let max_tries = self.orch.cfg.max_tries;
        if self.tries >= max_tries {
            error!(
                tries = self.tries,
                "could not get a verified proof after {} tries; stopping", self.tries
            );
            self.state = LoopState::Exhausted;
            return Ok(());
        }

        let turn = self
            .orch
            .chat
            .complete(&self.conversation, &self.orch.tools)
            .await?;
        self.llm_calls += 1;

        match turn {
            AssistantTurn::Answer(text) => {
                info!(chars = text.len(), "model returned a final answer");
                self.conversation.push_answer(text);
                self.tries = 0;
                self.state = LoopState::Stopped;
            }
            AssistantTurn::ToolRequest { request, content } => {
                info!(
                    id = %request.correlation_id,
                    tool = %request.tool_name,
                    "model requested a tool call"
                );
                self.pending = Some((request, content));
                self.state = LoopState::ToolCalled;
            }
        }
        Ok(())
    }

    async fn run_tool(&mut self) -> Result<(), LoopError> {
        let Some((request, content)) = self.pending.take() else {
            return Err(LoopError::ToolProtocol(
                "no pending tool request to run".to_string(),
            ));
        };
        if request.tool_name != VERIFY_TOOL_NAME {
            return Err(LoopError::ToolProtocol(format!(
                "model called unknown tool {:?} (only {VERIFY_TOOL_NAME} is available)",
                request.tool_name
            )));
        }
        let proof = request.proof_argument()?;

        let verifier = &self.orch.verifier;
        let outcome = verifier.verify(&verifier.submission(proof)).await;
        if outcome.is_success() {
            info!(id = %request.correlation_id, "proof verified");
        } else {
            warn!(
                id = %request.correlation_id,
                status = ?outcome.status(),
                "proof rejected; returning result to the model"
            );
        }
        let result = serde_json::to_string(&outcome)?;

        self.conversation.push_tool_round(request, content, result);
        self.tries += 1;
        self.state = LoopState::Awaiting;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_one_tool_with_required_proof() {
        let s = tool_schema(10_000);
        let tools = s.as_array().unwrap();
        assert_eq!(tools.len(), 1);
        let f = &tools[0]["function"];
        assert_eq!(f["name"], "verify_lean_proof");
        assert_eq!(f["parameters"]["required"], json!(["proof"]));
        assert_eq!(f["parameters"]["properties"]["proof"]["type"], "string");
        assert_eq!(f["parameters"]["properties"]["proof"]["maxLength"], 10_000);
    }

    #[test]
    fn system_prompt_shows_the_tool_call_shape() {
        let p = system_prompt();
        assert!(p.contains("verify_lean_proof"));
        assert!(p.contains("rfl"));
    }

    #[test]
    fn exhausted_transcript_becomes_an_error() {
        let t = Transcript {
            state: LoopState::Exhausted,
            tries: 5,
            tool_rounds: 5,
            llm_calls: 5,
            messages: vec![],
        };
        assert!(t.final_answer().is_none());
        assert!(matches!(
            t.into_result(),
            Err(LoopError::RetryBudgetExhausted { tries: 5 })
        ));
    }

    #[test]
    fn final_answer_reads_last_assistant_message() {
        let t = Transcript {
            state: LoopState::Stopped,
            tries: 0,
            tool_rounds: 0,
            llm_calls: 1,
            messages: vec![Message::Assistant {
                content: "QED".into(),
                tool_call: None,
            }],
        };
        assert_eq!(t.final_answer(), Some("QED"));
    }
}
