//! Settings from the environment (plus an optional `.env`).
//!
//! Every knob is read through a lookup function so tests can feed a map instead of
//! mutating process env.

use crate::error::LoopError;
use crate::orchestrator::{system_prompt, LoopConfig, DEFAULT_MAX_TRIES};
use crate::verifier::{VerifierConfig, DEFAULT_CHECKER_TIMEOUT, DEFAULT_MAX_PROOF_CHARS};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "0.0.0.0:5000";

#[derive(Debug, Clone)]
pub struct Config {
    pub verifier: VerifierConfig,
    pub session: LoopConfig,
    /// Bind address for `leanloop-server`.
    pub addr: String,
}

impl Config {
    /// Merge `./.env` (never overriding) and read `LEANLOOP_*`.
    pub fn from_env() -> Result<Self, LoopError> {
        if let Ok(cwd) = std::env::current_dir() {
            load_dotenv_if_present(&cwd);
        }
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, LoopError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let checker = lookup_nonempty(&lookup, "LEANLOOP_CHECKER")
            .or_else(|| lookup_nonempty(&lookup, "LEAN_BIN"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("lean"));
        let checker_args = lookup_nonempty(&lookup, "LEANLOOP_CHECKER_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let checker_timeout_s: f64 = parse_var(
            &lookup,
            "LEANLOOP_CHECKER_TIMEOUT_S",
            DEFAULT_CHECKER_TIMEOUT.as_secs_f64(),
        )?;
        let max_proof_chars = parse_var(&lookup, "LEANLOOP_MAX_PROOF_CHARS", DEFAULT_MAX_PROOF_CHARS)?;
        if max_proof_chars == 0 {
            return Err(LoopError::Config(
                "LEANLOOP_MAX_PROOF_CHARS must be positive".to_string(),
            ));
        }

        let verifier = VerifierConfig {
            checker,
            checker_args,
            checker_cwd: lookup_nonempty(&lookup, "LEANLOOP_CHECKER_CWD").map(PathBuf::from),
            work_dir: lookup_nonempty(&lookup, "LEANLOOP_WORK_DIR").map(PathBuf::from),
            timeout: secs("LEANLOOP_CHECKER_TIMEOUT_S", checker_timeout_s)?,
            max_proof_chars,
        };

        let session = LoopConfig {
            max_tries: parse_var(&lookup, "LEANLOOP_MAX_TRIES", DEFAULT_MAX_TRIES)?,
            system_prompt: lookup_nonempty(&lookup, "LEANLOOP_SYSTEM_PROMPT")
                .unwrap_or_else(system_prompt),
        };

        let addr = lookup_nonempty(&lookup, "LEANLOOP_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());

        Ok(Self {
            verifier,
            session,
            addr,
        })
    }
}

pub(crate) fn lookup_nonempty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse `key` when set; fall back to `default` only when it is unset or blank.
pub(crate) fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, LoopError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup_nonempty(lookup, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| LoopError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

pub(crate) fn secs(key: &str, v: f64) -> Result<Duration, LoopError> {
    if !v.is_finite() || v <= 0.0 {
        return Err(LoopError::Config(format!("{key} must be a positive number of seconds")));
    }
    Ok(Duration::from_secs_f64(v))
}

/// One `.env` line as `(key, value)`. Accepts `export K=V` and strips one layer of matching
/// quotes; comments, blanks and lines without `=` yield `None`.
fn dotenv_entry(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q))
        .unwrap_or(value);
    Some((key, unquoted))
}

/// Entries of the `.env` file at `path`; a missing or unreadable file is empty.
pub fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    std::fs::read_to_string(path)
        .map(|text| {
            text.lines()
                .filter_map(dotenv_entry)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Merge `<dir>/.env` into the process env without overriding anything already set.
/// Returns the keys that were applied.
pub fn load_dotenv_if_present(dir: &Path) -> Vec<String> {
    let mut applied = Vec::new();
    for (k, v) in parse_dotenv(&dir.join(".env")) {
        if lookup_nonempty(&|key: &str| std::env::var(key).ok(), &k).is_none() {
            std::env::set_var(&k, v);
            applied.push(k);
        }
    }
    if !applied.is_empty() {
        tracing::debug!(count = applied.len(), "loaded .env");
    }
    applied
}
