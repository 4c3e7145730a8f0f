//! Run an external Lean checker against proof text.
//!
//! Each call owns exactly one temp artifact and at most one child process:
//! - the artifact is a `NamedTempFile`, so it is removed when the call returns *or* when the
//!   future is dropped mid-flight
//! - the child is spawned with `kill_on_drop`, and killed + reaped explicitly on timeout
//! - on unix the child leads its own process group, and the whole group is killed when the call
//!   ends, so wrappers like `lake env lean` cannot leave the real checker running
//!
//! Nothing the checker prints leaves this module with the artifact path still in it.

use crate::{parse_first_error_loc, DiagnosticLoc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_PROOF_CHARS: usize = 10_000;
pub const DEFAULT_CHECKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Stands in for the artifact path in anything we return.
pub const ARTIFACT_PLACEHOLDER: &str = "<proof-file>";

const ARTIFACT_PREFIX: &str = "leanloop-";
const ARTIFACT_SUFFIX: &str = ".lean";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofSubmission {
    text: String,
    max_chars: usize,
}

impl ProofSubmission {
    pub fn new(text: impl Into<String>, max_chars: usize) -> Self {
        Self {
            text: text.into(),
            max_chars,
        }
    }

    /// Accept a raw JSON `proof` value. Anything but a string is rejected up front.
    pub fn from_value(v: &Value, max_chars: usize) -> Result<Self, VerificationOutcome> {
        match v.as_str() {
            Some(s) => Ok(Self::new(s, max_chars)),
            None => Err(VerificationOutcome::rejected("Proof must be a string")),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Length in characters (not bytes).
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn exceeds_limit(&self) -> bool {
        self.char_len() > self.max_chars
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Success,
    Invalid,
    TooLarge,
    Timeout,
    InternalError,
}

impl VerificationStatus {
    pub fn http_status(self) -> u16 {
        match self {
            VerificationStatus::Success => 200,
            VerificationStatus::Invalid
            | VerificationStatus::TooLarge
            | VerificationStatus::Timeout => 400,
            VerificationStatus::InternalError => 500,
        }
    }
}

/// Result of one verification attempt. Fields are read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    status: VerificationStatus,
    message: String,
    stdout: String,
    stderr: String,
    http_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first_error: Option<DiagnosticLoc>,
}

impl VerificationOutcome {
    fn build(
        status: VerificationStatus,
        message: impl Into<String>,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
    ) -> Self {
        let first_error = match status {
            VerificationStatus::Invalid => parse_first_error_loc(&stdout, &stderr),
            _ => None,
        };
        Self {
            status,
            message: message.into(),
            stdout,
            stderr,
            http_status: status.http_status(),
            exit_code,
            first_error,
        }
    }

    pub fn success(stdout: String) -> Self {
        Self::build(
            VerificationStatus::Success,
            "Proof is valid",
            stdout,
            String::new(),
            Some(0),
        )
    }

    pub fn invalid(stdout: String, stderr: String, exit_code: Option<i32>) -> Self {
        Self::build(
            VerificationStatus::Invalid,
            "Proof is invalid",
            stdout,
            stderr,
            exit_code,
        )
    }

    pub fn too_large() -> Self {
        Self::rejected("Proof is too large")
    }

    /// Input rejected before any IO (oversize or not text).
    pub fn rejected(message: &str) -> Self {
        Self::build(
            VerificationStatus::TooLarge,
            message,
            String::new(),
            String::new(),
            None,
        )
    }

    pub fn timeout() -> Self {
        Self::build(
            VerificationStatus::Timeout,
            "Verification timed out",
            String::new(),
            String::new(),
            None,
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::build(
            VerificationStatus::InternalError,
            message,
            String::new(),
            String::new(),
            None,
        )
    }

    pub fn status(&self) -> VerificationStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == VerificationStatus::Success
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn first_error(&self) -> Option<&DiagnosticLoc> {
        self.first_error.as_ref()
    }

    /// Body for the HTTP `verify-lean-proof` endpoint.
    pub fn response_body(&self) -> Value {
        match self.status {
            VerificationStatus::Success => json!({
                "status": "success",
                "message": self.message,
                "output": self.stdout,
            }),
            VerificationStatus::Invalid => json!({
                "status": "error",
                "message": self.message,
                "output": self.stdout,
                "error": self.stderr,
            }),
            VerificationStatus::TooLarge
            | VerificationStatus::Timeout
            | VerificationStatus::InternalError => json!({
                "status": "error",
                "message": self.message,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Checker executable, e.g. `lean` or `lake`.
    pub checker: PathBuf,
    /// Arguments placed before the artifact path (`["env", "lean"]` for `lake`).
    pub checker_args: Vec<String>,
    pub checker_cwd: Option<PathBuf>,
    /// Where artifacts are created; the system temp dir when unset.
    pub work_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub max_proof_chars: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            checker: PathBuf::from("lean"),
            checker_args: Vec::new(),
            checker_cwd: None,
            work_dir: None,
            timeout: DEFAULT_CHECKER_TIMEOUT,
            max_proof_chars: DEFAULT_MAX_PROOF_CHARS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Verifier {
    cfg: VerifierConfig,
}

impl Verifier {
    pub fn new(cfg: VerifierConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.cfg
    }

    /// Wrap `text` with this verifier's size limit.
    pub fn submission(&self, text: impl Into<String>) -> ProofSubmission {
        ProofSubmission::new(text, self.cfg.max_proof_chars)
    }

    pub async fn verify_text(&self, text: &str) -> VerificationOutcome {
        self.verify(&self.submission(text)).await
    }

    pub async fn verify(&self, submission: &ProofSubmission) -> VerificationOutcome {
        if submission.exceeds_limit() {
            info!(
                chars = submission.char_len(),
                limit = submission.max_chars(),
                "rejecting oversize proof"
            );
            return VerificationOutcome::too_large();
        }

        let artifact = match self.stage(submission.text()) {
            Ok(f) => f,
            // The io error can carry the path tempfile tried to create; report the kind only.
            Err(e) => {
                return VerificationOutcome::internal_error(format!(
                    "failed to stage proof: {}",
                    e.kind()
                ))
            }
        };
        let needles = artifact_needles(artifact.path());
        let outcome = self.run_checker(artifact.path(), &needles).await;

        if let Err(e) = artifact.close() {
            warn!(error = %e.kind(), "failed to remove proof artifact");
        }
        debug!(status = ?outcome.status(), "verification finished");
        outcome
    }

    fn stage(&self, text: &str) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(ARTIFACT_PREFIX).suffix(ARTIFACT_SUFFIX);
        let mut file = match &self.cfg.work_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    async fn run_checker(&self, artifact: &Path, needles: &[String]) -> VerificationOutcome {
        let mut cmd = Command::new(&self.cfg.checker);
        cmd.args(&self.cfg.checker_args)
            .arg(artifact)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(cwd) = &self.cfg.checker_cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return VerificationOutcome::internal_error(sanitize(
                    &format!("failed to execute {}: {}", self.cfg.checker.display(), e),
                    needles,
                ))
            }
        };
        let group = ProcessGroup::of(&child);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let waited = tokio::time::timeout(self.cfg.timeout, async {
            tokio::try_join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
        })
        .await;

        match waited {
            Err(_) => {
                // `kill` also waits, so the process is gone when we return.
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill timed-out checker");
                }
                info!(timeout_s = self.cfg.timeout.as_secs_f64(), "checker timed out");
                VerificationOutcome::timeout()
            }
            Ok(Err(e)) => {
                group.kill();
                if let Err(kill_err) = child.kill().await {
                    warn!(error = %kill_err, "failed to kill checker after pipe error");
                }
                VerificationOutcome::internal_error(sanitize(
                    &format!("failed to collect checker output: {e}"),
                    needles,
                ))
            }
            Ok(Ok((status, out, err))) => {
                let stdout = sanitize(&String::from_utf8_lossy(&out), needles);
                let stderr = sanitize(&String::from_utf8_lossy(&err), needles);
                if status.success() {
                    VerificationOutcome::success(stdout)
                } else {
                    VerificationOutcome::invalid(stdout, stderr, status.code())
                }
            }
        }
    }
}

/// The checker's process group; killed on drop, which covers cancellation too.
#[cfg(unix)]
struct ProcessGroup(Option<nix::unistd::Pid>);

#[cfg(unix)]
impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self(child.id().map(|pid| nix::unistd::Pid::from_raw(pid as i32)))
    }

    fn kill(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        let Some(pgid) = self.0 else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            // ESRCH: every member already exited.
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(error = %e, "failed to kill checker process group"),
        }
    }
}

#[cfg(unix)]
impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(not(unix))]
struct ProcessGroup;

#[cfg(not(unix))]
impl ProcessGroup {
    fn of(_child: &tokio::process::Child) -> Self {
        Self
    }

    fn kill(&self) {}
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut p) = pipe {
        p.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Every spelling of the artifact path a checker is likely to echo, longest first.
fn artifact_needles(path: &Path) -> Vec<String> {
    let mut out = vec![path.display().to_string()];
    // macOS temp dirs live behind a symlink; Lean may print the resolved form.
    if let Ok(real) = path.canonicalize() {
        out.push(real.display().to_string());
    }
    if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
        out.push(name.to_string());
    }
    out.retain(|s| !s.is_empty());
    out.sort_by_key(|s| std::cmp::Reverse(s.len()));
    out.dedup();
    out
}

/// Replace each needle in `text` with [`ARTIFACT_PLACEHOLDER`].
pub fn sanitize(text: &str, needles: &[String]) -> String {
    let mut out = text.to_string();
    for n in needles {
        if !n.is_empty() && out.contains(n.as_str()) {
            out = out.replace(n.as_str(), ARTIFACT_PLACEHOLDER);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_full_path_before_file_name() {
        let needles = artifact_needles(Path::new("/tmp/work/leanloop-x1.lean"));
        let s = "/tmp/work/leanloop-x1.lean:1:2: error: bad\nsee leanloop-x1.lean";
        let out = sanitize(s, &needles);
        assert_eq!(out, "<proof-file>:1:2: error: bad\nsee <proof-file>");
    }

    #[test]
    fn sanitize_leaves_unrelated_text_alone() {
        let needles = vec!["/tmp/a.lean".to_string()];
        assert_eq!(sanitize("nothing here", &needles), "nothing here");
    }

    #[test]
    fn submission_counts_chars_not_bytes() {
        let s = ProofSubmission::new("αβγ", 3);
        assert_eq!(s.char_len(), 3);
        assert!(!s.exceeds_limit());
        assert!(ProofSubmission::new("αβγδ", 3).exceeds_limit());
    }

    #[test]
    fn from_value_rejects_non_strings() {
        let err = ProofSubmission::from_value(&json!(42), 10).unwrap_err();
        assert_eq!(err.status(), VerificationStatus::TooLarge);
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.message(), "Proof must be a string");
        assert!(ProofSubmission::from_value(&json!("rfl"), 10).is_ok());
    }

    #[test]
    fn response_bodies_match_endpoint_contract() {
        let ok = VerificationOutcome::success("out".into());
        assert_eq!(ok.http_status(), 200);
        assert_eq!(
            ok.response_body(),
            json!({"status": "success", "message": "Proof is valid", "output": "out"})
        );

        let bad = VerificationOutcome::invalid("o".into(), "e".into(), Some(1));
        assert_eq!(bad.http_status(), 400);
        assert_eq!(
            bad.response_body(),
            json!({"status": "error", "message": "Proof is invalid", "output": "o", "error": "e"})
        );

        assert_eq!(
            VerificationOutcome::too_large().response_body(),
            json!({"status": "error", "message": "Proof is too large"})
        );
        assert_eq!(
            VerificationOutcome::timeout().response_body(),
            json!({"status": "error", "message": "Verification timed out"})
        );
        let internal = VerificationOutcome::internal_error("boom");
        assert_eq!(internal.http_status(), 500);
        assert_eq!(
            internal.response_body(),
            json!({"status": "error", "message": "boom"})
        );
    }

    #[test]
    fn invalid_outcome_carries_first_error() {
        let o = VerificationOutcome::invalid(
            String::new(),
            "<proof-file>:1:5: error: unknown identifier".into(),
            Some(1),
        );
        let loc = o.first_error().expect("loc");
        assert_eq!((loc.line, loc.col), (1, 5));
    }

    #[test]
    fn outcome_serializes_with_snake_case_status() {
        let v = serde_json::to_value(VerificationOutcome::timeout()).unwrap();
        assert_eq!(v["status"], "timeout");
        assert_eq!(v["http_status"], 400);
        assert!(v.get("first_error").is_none());
    }
}
