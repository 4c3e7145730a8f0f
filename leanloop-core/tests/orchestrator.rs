#![cfg(unix)]

mod common;

use async_trait::async_trait;
use common::{entries, sh_checker, RFL_STUB};
use leanloop_core::{
    AssistantTurn, ChatService, Conversation, LoopConfig, LoopError, LoopState, Message,
    Orchestrator, ToolInvocationRequest, Verifier,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Replays canned turns and records what it was sent.
struct ScriptedChat {
    turns: Mutex<VecDeque<AssistantTurn>>,
    /// Conversation length at each call.
    seen: Mutex<Vec<usize>>,
    /// Whether any call arrived while a tool request had no result yet.
    saw_dangling_request: Mutex<bool>,
}

impl ScriptedChat {
    fn new(turns: Vec<AssistantTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            seen: Mutex::new(Vec::new()),
            saw_dangling_request: Mutex::new(false),
        }
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatService for ScriptedChat {
    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &Value,
    ) -> Result<AssistantTurn, LoopError> {
        assert_eq!(tools[0]["function"]["name"], "verify_lean_proof");
        self.seen.lock().unwrap().push(conversation.len());
        if conversation.last().and_then(Message::tool_call).is_some() {
            *self.saw_dangling_request.lock().unwrap() = true;
        }
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LoopError::Transport("script exhausted".to_string()))
    }
}

fn tool_turn(id: &str, proof: &str) -> AssistantTurn {
    AssistantTurn::ToolRequest {
        request: ToolInvocationRequest {
            correlation_id: id.to_string(),
            tool_name: "verify_lean_proof".to_string(),
            arguments: json!({ "proof": proof }),
        },
        content: String::new(),
    }
}

fn orchestrator(
    turns: Vec<AssistantTurn>,
    work: &std::path::Path,
    max_tries: u32,
) -> Orchestrator<ScriptedChat> {
    Orchestrator::new(
        ScriptedChat::new(turns),
        Verifier::new(sh_checker(RFL_STUB, work, Duration::from_secs(10))),
        LoopConfig {
            max_tries,
            ..LoopConfig::default()
        },
    )
}

fn tool_status(m: &Message) -> String {
    match m {
        Message::Tool { content, .. } => {
            let v: Value = serde_json::from_str(content).expect("tool result is JSON");
            v["status"].as_str().unwrap_or("").to_string()
        }
        other => panic!("expected tool message, got {other:?}"),
    }
}

#[tokio::test]
async fn endless_tool_calls_exhaust_the_budget() {
    let td = tempfile::tempdir().unwrap();
    let turns = (1..=6)
        .map(|i| tool_turn(&format!("call_{i}"), "example : 1 + 1 = 3 := by simp"))
        .collect();
    let orch = orchestrator(turns, td.path(), 5);

    let t = orch.run("prove 1 + 1 = 3").await.unwrap();
    assert_eq!(t.state, LoopState::Exhausted);
    assert_eq!(t.tool_rounds, 5);
    assert_eq!(t.llm_calls, 5);
    assert_eq!(t.tries, 5);
    assert_eq!(orch.chat().calls(), 5, "no sixth model call");
    assert_eq!(t.messages.len(), 2 + 2 * 5);
    assert!(t.final_answer().is_none());
    assert!(entries(td.path()).is_empty());
    assert!(matches!(
        t.into_result(),
        Err(LoopError::RetryBudgetExhausted { tries: 5 })
    ));
}

#[tokio::test]
async fn invalid_then_valid_then_stop() {
    let td = tempfile::tempdir().unwrap();
    let orch = orchestrator(
        vec![
            tool_turn("call_1", "example : 1 + 1 = 2 := by simp"),
            tool_turn("call_2", "example : 1 + 1 = 2 := rfl"),
            AssistantTurn::Answer("example : 1 + 1 = 2 := rfl".to_string()),
        ],
        td.path(),
        5,
    );

    let t = orch.run("prove 1 + 1 = 2").await.unwrap();
    assert_eq!(t.state, LoopState::Stopped);
    assert_eq!(t.tries, 0);
    assert_eq!(t.tool_rounds, 2);
    assert_eq!(t.llm_calls, 3);
    assert_eq!(t.final_answer(), Some("example : 1 + 1 = 2 := rfl"));

    let roles: Vec<&str> = t.messages.iter().map(Message::role).collect();
    assert_eq!(
        roles,
        vec!["system", "user", "assistant", "tool", "assistant", "tool", "assistant"]
    );
    for (req_idx, id) in [(2usize, "call_1"), (4, "call_2")] {
        assert_eq!(t.messages[req_idx].tool_call().unwrap().correlation_id, id);
        match &t.messages[req_idx + 1] {
            Message::Tool { correlation_id, .. } => assert_eq!(correlation_id, id),
            other => panic!("expected tool result, got {other:?}"),
        }
    }
    assert_eq!(tool_status(&t.messages[3]), "invalid");
    assert_eq!(tool_status(&t.messages[5]), "success");

    let dir = td.path().display().to_string();
    for m in &t.messages {
        assert!(!m.content().contains(&dir));
    }
    assert!(!*orch.chat().saw_dangling_request.lock().unwrap());
    assert_eq!(*orch.chat().seen.lock().unwrap(), vec![2, 4, 6]);
    assert!(entries(td.path()).is_empty());
}

#[tokio::test]
async fn step_walks_the_state_machine() {
    let td = tempfile::tempdir().unwrap();
    let orch = orchestrator(
        vec![
            tool_turn("call_1", "example : 1 + 1 = 2 := rfl"),
            AssistantTurn::Answer("done".to_string()),
        ],
        td.path(),
        5,
    );

    let mut s = orch.session("prove it");
    assert_eq!(s.state(), LoopState::Awaiting);
    assert_eq!(s.conversation().len(), 2);

    assert_eq!(s.step().await.unwrap(), LoopState::ToolCalled);
    assert_eq!(s.tries(), 0);
    assert_eq!(s.conversation().len(), 2, "request is appended with its result");

    assert_eq!(s.step().await.unwrap(), LoopState::Awaiting);
    assert_eq!(s.tries(), 1);
    assert_eq!(s.conversation().len(), 4);

    assert_eq!(s.step().await.unwrap(), LoopState::Stopped);
    assert_eq!(s.tries(), 0);

    // Terminal states are sticky and make no further calls.
    assert_eq!(s.step().await.unwrap(), LoopState::Stopped);
    assert_eq!(s.llm_calls(), 2);
    assert_eq!(orch.chat().calls(), 2);
}

#[tokio::test]
async fn zero_budget_never_calls_the_model() {
    let td = tempfile::tempdir().unwrap();
    let orch = orchestrator(vec![AssistantTurn::Answer("hi".into())], td.path(), 0);
    let t = orch.run("prove it").await.unwrap();
    assert_eq!(t.state, LoopState::Exhausted);
    assert_eq!(orch.chat().calls(), 0);
}

#[tokio::test]
async fn oversize_proof_is_fed_back_not_fatal() {
    let td = tempfile::tempdir().unwrap();
    let huge = format!("example : True := by{}trivial", " ".repeat(10_001));
    let orch = orchestrator(
        vec![
            tool_turn("call_1", &huge),
            AssistantTurn::Answer("gave up".to_string()),
        ],
        td.path(),
        5,
    );

    let t = orch.run("prove True").await.unwrap();
    assert_eq!(t.state, LoopState::Stopped);
    assert_eq!(tool_status(&t.messages[3]), "too_large");
}

#[tokio::test]
async fn unknown_tool_is_a_protocol_error() {
    let td = tempfile::tempdir().unwrap();
    let turn = AssistantTurn::ToolRequest {
        request: ToolInvocationRequest {
            correlation_id: "call_x".to_string(),
            tool_name: "run_shell".to_string(),
            arguments: json!({ "proof": "rfl" }),
        },
        content: String::new(),
    };
    let orch = orchestrator(vec![turn], td.path(), 5);
    let err = orch.run("prove it").await.unwrap_err();
    assert!(matches!(err, LoopError::ToolProtocol(ref m) if m.contains("run_shell")));
}

#[tokio::test]
async fn missing_proof_argument_is_a_protocol_error() {
    let td = tempfile::tempdir().unwrap();
    let turn = AssistantTurn::ToolRequest {
        request: ToolInvocationRequest {
            correlation_id: "call_y".to_string(),
            tool_name: "verify_lean_proof".to_string(),
            arguments: json!({ "code": "rfl" }),
        },
        content: String::new(),
    };
    let orch = orchestrator(vec![turn], td.path(), 5);
    assert!(matches!(
        orch.run("prove it").await,
        Err(LoopError::ToolProtocol(_))
    ));
}

#[tokio::test]
async fn transport_errors_end_the_session() {
    let td = tempfile::tempdir().unwrap();
    let orch = orchestrator(vec![], td.path(), 5);
    assert!(matches!(
        orch.run("prove it").await,
        Err(LoopError::Transport(_))
    ));
}
