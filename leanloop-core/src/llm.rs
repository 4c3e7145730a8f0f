use crate::config::{lookup_nonempty, parse_var, secs};
use crate::conversation::{Conversation, ToolInvocationRequest};
use crate::error::LoopError;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_SEED: i64 = 42;

/// One assistant turn, reduced to what the tool loop branches on.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantTurn {
    /// `finish_reason == "stop"`.
    Answer(String),
    /// `finish_reason == "tool_calls"`. Only the first call of the turn is kept.
    ToolRequest {
        request: ToolInvocationRequest,
        content: String,
    },
}

/// The chat model, seen from the tool loop.
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &Value,
    ) -> Result<AssistantTurn, LoopError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub provider: String,
    /// Without the trailing `/chat/completions`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub seed: Option<i64>,
    /// `None` keeps reqwest's default (no overall timeout).
    pub timeout: Option<Duration>,
    pub extra_headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct Provider {
    name: &'static str,
    base_url: String,
    api_key_env: Option<&'static str>,
    model_env: &'static str,
    default_model: Option<&'static str>,
}

fn providers<F>(lookup: &F) -> Vec<Provider>
where
    F: Fn(&str) -> Option<String>,
{
    let base = |key: &str, default: &str| {
        lookup_nonempty(lookup, key)
            .unwrap_or_else(|| default.to_string())
            .trim_end_matches('/')
            .to_string()
    };
    vec![
        Provider {
            name: "openai",
            base_url: base("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            api_key_env: Some("OPENAI_API_KEY"),
            model_env: "OPENAI_MODEL",
            default_model: Some("gpt-4-1106-preview"),
        },
        Provider {
            name: "openrouter",
            base_url: base("OPENROUTER_BASE_URL", "https://openrouter.ai/api/v1"),
            api_key_env: Some("OPENROUTER_API_KEY"),
            model_env: "OPENROUTER_MODEL",
            default_model: Some("openai/gpt-4-1106-preview"),
        },
        Provider {
            name: "groq",
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: Some("GROQ_API_KEY"),
            model_env: "GROQ_MODEL",
            default_model: Some("llama-3.1-8b-instant"),
        },
        // No default model for Ollama; local installs vary.
        Provider {
            name: "ollama",
            base_url: format!("{}/v1", base("OLLAMA_HOST", "http://localhost:11434")),
            api_key_env: None,
            model_env: "OLLAMA_MODEL",
            default_model: None,
        },
    ]
}

fn provider_order<F>(lookup: &F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup_nonempty(lookup, "LEANLOOP_PROVIDER_ORDER") {
        return v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    vec![
        "openai".into(),
        "openrouter".into(),
        "groq".into(),
        "ollama".into(),
    ]
}

impl LlmConfig {
    pub fn from_env() -> Result<Self, LoopError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Resolve endpoint, credential and sampling settings.
    ///
    /// `LEANLOOP_BASE_URL` (with `LLM_API_KEY`) wins; otherwise the first provider in
    /// `LEANLOOP_PROVIDER_ORDER` that has a key (or, for Ollama, a model) is used.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LoopError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let model_override = lookup_nonempty(&lookup, "LEANLOOP_MODEL");
        let temperature = parse_var(&lookup, "LEANLOOP_TEMPERATURE", DEFAULT_TEMPERATURE)?;
        let seed = parse_var(&lookup, "LEANLOOP_SEED", DEFAULT_SEED)?;
        let timeout = match lookup_nonempty(&lookup, "LEANLOOP_LLM_TIMEOUT_S") {
            None => None,
            Some(_) => Some(secs(
                "LEANLOOP_LLM_TIMEOUT_S",
                parse_var(&lookup, "LEANLOOP_LLM_TIMEOUT_S", 0.0f64)?,
            )?),
        };

        if let Some(base_url) = lookup_nonempty(&lookup, "LEANLOOP_BASE_URL") {
            return Ok(Self {
                provider: "custom".to_string(),
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: lookup_nonempty(&lookup, "LLM_API_KEY"),
                model: model_override.unwrap_or_else(|| "gpt-4-1106-preview".to_string()),
                temperature,
                seed: Some(seed),
                timeout,
                extra_headers: Vec::new(),
            });
        }

        let provs = providers(&lookup);
        for name in provider_order(&lookup) {
            let Some(p) = provs.iter().find(|pp| pp.name == name) else {
                continue;
            };
            let api_key = match p.api_key_env {
                Some(k) => {
                    let key = lookup_nonempty(&lookup, k).or_else(|| {
                        // `LLM_API_KEY` is the generic credential; it targets OpenAI by default.
                        (p.name == "openai")
                            .then(|| lookup_nonempty(&lookup, "LLM_API_KEY"))
                            .flatten()
                    });
                    match key {
                        Some(v) => Some(v),
                        None => continue,
                    }
                }
                None => None,
            };
            let model = model_override
                .clone()
                .or_else(|| lookup_nonempty(&lookup, p.model_env))
                .or_else(|| p.default_model.map(str::to_string));
            let Some(model) = model else {
                continue;
            };

            let mut extra_headers = Vec::new();
            if p.name == "openrouter" {
                if let Some(site) = lookup_nonempty(&lookup, "OPENROUTER_SITE_URL") {
                    extra_headers.push(("HTTP-Referer".to_string(), site));
                }
                if let Some(app) = lookup_nonempty(&lookup, "OPENROUTER_APP_NAME") {
                    extra_headers.push(("X-Title".to_string(), app));
                }
            }

            return Ok(Self {
                provider: p.name.to_string(),
                base_url: p.base_url.clone(),
                api_key,
                model,
                temperature,
                seed: Some(seed),
                timeout,
                extra_headers,
            });
        }

        Err(LoopError::Config(
            "No usable provider found. Set one of:\n\
- LEANLOOP_BASE_URL (+ LLM_API_KEY)\n\
- OPENAI_API_KEY or LLM_API_KEY (+ optional OPENAI_MODEL)\n\
- OPENROUTER_API_KEY (+ optional OPENROUTER_MODEL)\n\
- GROQ_API_KEY (+ optional GROQ_MODEL)\n\
- OLLAMA_MODEL (+ optional OLLAMA_HOST)\n\
Optionally set LEANLOOP_PROVIDER_ORDER."
                .to_string(),
        ))
    }
}

/// Credential shapes scrubbed from provider errors: `*_API_KEY=...` assignments, bearer
/// headers, and `sk-` tokens.
fn secret_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"\b([A-Z][A-Z0-9_]*_API_KEY)\s*[=:]\s*\S+", "$1=[REDACTED]"),
            (r"(?i)\b(authorization:\s*bearer)\s+\S+", "$1 [REDACTED]"),
            (r"\bsk-[A-Za-z0-9_\-]{16,}", "[REDACTED_TOKEN]"),
        ]
        .into_iter()
        .filter_map(|(pat, rep)| Regex::new(pat).ok().map(|re| (re, rep)))
        .collect()
    })
}

/// Best-effort redaction of anything that looks like a credential.
pub fn redact_secrets(s: &str) -> String {
    secret_patterns()
        .iter()
        .fold(s.to_string(), |acc, (re, rep)| {
            re.replace_all(&acc, *rep).into_owned()
        })
}

/// OpenAI-compatible `POST <base_url>/chat/completions` body.
pub fn request_payload(cfg: &LlmConfig, conversation: &Conversation, tools: &Value) -> Value {
    let mut payload = serde_json::json!({
        "model": cfg.model,
        "messages": conversation.to_wire(),
        "temperature": cfg.temperature,
    });
    if let Some(seed) = cfg.seed {
        payload["seed"] = serde_json::json!(seed);
    }
    if tools.as_array().map(|a| !a.is_empty()).unwrap_or(false) {
        payload["tools"] = tools.clone();
        payload["tool_choice"] = serde_json::json!("auto");
    }
    payload
}

/// Turn a chat-completions response into an [`AssistantTurn`].
pub fn parse_chat_response(raw: &Value) -> Result<AssistantTurn, LoopError> {
    let protocol = |m: String| LoopError::ToolProtocol(m);
    let choice = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| protocol("missing choices[0]".to_string()))?;
    let finish = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let msg = choice
        .get("message")
        .and_then(|m| m.as_object())
        .ok_or_else(|| protocol("missing choices[0].message".to_string()))?;
    let content = msg
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    match finish {
        "stop" => Ok(AssistantTurn::Answer(content)),
        "tool_calls" => {
            let call = msg
                .get("tool_calls")
                .and_then(|v| v.get(0))
                .ok_or_else(|| protocol("finish_reason is tool_calls but no tool_calls".into()))?;
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| protocol("tool call without an id".to_string()))?;
            let function = call
                .get("function")
                .ok_or_else(|| protocol(format!("tool call {id} has no function")))?;
            let name = function
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| protocol(format!("tool call {id} has no function name")))?;
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => serde_json::from_str::<Value>(s).map_err(|e| {
                    protocol(format!("tool call {id}: arguments are not valid JSON: {e}"))
                })?,
                Some(v @ Value::Object(_)) => v.clone(),
                _ => return Err(protocol(format!("tool call {id} has no arguments"))),
            };
            Ok(AssistantTurn::ToolRequest {
                request: ToolInvocationRequest {
                    correlation_id: id.to_string(),
                    tool_name: name.to_string(),
                    arguments,
                },
                content,
            })
        }
        other => Err(protocol(format!("unexpected finish_reason {other:?}"))),
    }
}

/// OpenAI-compatible chat client.
///
/// Invariants (should not change lightly):
/// - request path is `POST <base_url>/chat/completions`
/// - uses `Authorization: Bearer <key>` when a key is configured
/// - OpenRouter adds `HTTP-Referer` and `X-Title` when configured
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    cfg: LlmConfig,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(cfg: LlmConfig) -> Result<Self, LoopError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        if let Some(key) = &cfg.api_key {
            let hv = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", key.trim()))
                .map_err(|_| LoopError::Config("invalid Authorization header".to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, hv);
        }
        for (k, v) in &cfg.extra_headers {
            let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| LoopError::Config(format!("invalid header name {k}: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(v)
                .map_err(|e| LoopError::Config(format!("invalid header value for {k}: {e}")))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(t) = cfg.timeout {
            builder = builder.timeout(t);
        }
        let client = builder
            .build()
            .map_err(|e| LoopError::Config(format!("http client build: {e}")))?;
        Ok(Self { cfg, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    /// Pattern redaction plus the configured key verbatim, whatever its shape.
    fn scrub(&self, msg: &str) -> String {
        let out = redact_secrets(msg);
        match self.cfg.api_key.as_deref().map(str::trim) {
            Some(key) if key.len() >= 4 => out.replace(key, "[REDACTED]"),
            _ => out,
        }
    }
}

#[async_trait]
impl ChatService for OpenAiChat {
    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &Value,
    ) -> Result<AssistantTurn, LoopError> {
        let payload = request_payload(&self.cfg, conversation, tools);
        let url = format!("{}/chat/completions", self.cfg.base_url);
        debug!(provider = %self.cfg.provider, model = %self.cfg.model, messages = conversation.len(), "chat request");

        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LoopError::Transport(self.scrub(&format!("http request failed: {e}"))))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LoopError::Transport(self.scrub(&format!("http body read: {e}"))))?;
        if !status.is_success() {
            return Err(LoopError::Transport(self.scrub(&format!(
                "provider {} returned {}: {}",
                self.cfg.provider,
                status.as_u16(),
                text.trim()
            ))));
        }
        let raw: Value = serde_json::from_str(&text).map_err(|e| {
            LoopError::Transport(format!("provider {} sent invalid JSON: {e}", self.cfg.provider))
        })?;
        parse_chat_response(&raw)
    }
}
