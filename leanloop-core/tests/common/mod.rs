#![allow(dead_code)]

use leanloop_core::VerifierConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Accepts any proof containing `rfl`; otherwise prints a Lean-style error naming the file.
pub const RFL_STUB: &str = r#"
if grep -q rfl "$1"; then
  echo "checked $1"
  exit 0
fi
echo "checked $1"
echo "$1:1:0: error: proof failed" >&2
exit 1
"#;

/// A checker run as `/bin/sh -c <script> stub <artifact>`, so `$1` is the artifact path.
pub fn sh_checker(script: &str, work_dir: &Path, timeout: Duration) -> VerifierConfig {
    VerifierConfig {
        checker: PathBuf::from("/bin/sh"),
        checker_args: vec!["-c".to_string(), script.to_string(), "stub".to_string()],
        checker_cwd: None,
        work_dir: Some(work_dir.to_path_buf()),
        timeout,
        max_proof_chars: 10_000,
    }
}

pub fn entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .expect("read_dir")
        .flatten()
        .map(|e| e.path())
        .collect()
}

/// Running (not a zombie, not reaped).
pub fn process_alive(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // `pid (comm) S ...`; comm may contain spaces, so split after the last ')'.
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .unwrap_or("");
    state != "Z" && state != "X"
}

pub async fn wait_for_file(p: &Path, limit: Duration) -> String {
    let start = std::time::Instant::now();
    loop {
        if let Ok(s) = std::fs::read_to_string(p) {
            if !s.trim().is_empty() {
                return s.trim().to_string();
            }
        }
        assert!(start.elapsed() < limit, "timed out waiting for {}", p.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
