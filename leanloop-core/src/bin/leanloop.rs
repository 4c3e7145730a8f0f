use leanloop_core as llc;
use std::io::Read;
use std::path::PathBuf;
use std::{fs, io};

fn arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn arg_u32(args: &[String], key: &str) -> Result<Option<u32>, String> {
    match arg_value(args, key) {
        None => Ok(None),
        Some(s) => s
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|e| format!("{key} {s:?}: {e}")),
    }
}

fn write_json(path: &std::path::Path, value: &serde_json::Value) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create dir {}: {}", parent.display(), e))?;
        }
    }
    let s = serde_json::to_string_pretty(value).map_err(|e| format!("json encode: {e}"))?;
    fs::write(path, s.as_bytes()).map_err(|e| format!("failed to write {}: {}", path.display(), e))
}

fn print_json(value: &serde_json::Value) -> Result<(), String> {
    let s = serde_json::to_string_pretty(value).map_err(|e| format!("json encode: {e}"))?;
    println!("{s}");
    Ok(())
}

fn usage() -> String {
    [
        "leanloop: verify Lean proofs, or let an LLM iterate on one.",
        "",
        "Commands:",
        "  verify (--file <path> | --proof <text>)",
        "  loop   [--prompt <text>] [--max-tries N] [--output-json <path>]",
        "",
        "Notes:",
        "- Output is JSON to stdout; logs go to stderr (RUST_LOG controls verbosity).",
        "- `verify` exits 1 unless the proof is valid; `loop` exits 1 when the retry budget runs out.",
        "- `loop` reads the prompt from stdin when --prompt is omitted.",
        "- Settings come from LEANLOOP_* env vars and ./.env (see leanloop_core::config).",
    ]
    .join("\n")
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Runtime::new().map_err(|e| format!("failed to build tokio runtime: {e}"))
}

fn cmd_verify(rest: &[String], cfg: llc::Config) -> Result<bool, String> {
    let text = match (arg_value(rest, "--file"), arg_value(rest, "--proof")) {
        (Some(path), None) => fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {path}: {e}"))?,
        (None, Some(proof)) => proof,
        _ => return Err("verify needs exactly one of --file or --proof".to_string()),
    };
    let verifier = llc::Verifier::new(cfg.verifier);
    let outcome = runtime()?.block_on(verifier.verify_text(&text));
    let v = serde_json::to_value(&outcome).map_err(|e| format!("serialize outcome: {e}"))?;
    print_json(&v)?;
    Ok(outcome.is_success())
}

fn cmd_loop(rest: &[String], mut cfg: llc::Config) -> Result<bool, String> {
    if let Some(n) = arg_u32(rest, "--max-tries")? {
        cfg.session.max_tries = n;
    }
    let prompt = match arg_value(rest, "--prompt") {
        Some(p) => p,
        None => {
            eprintln!("Enter a prompt (end with EOF):");
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("failed to read prompt from stdin: {e}"))?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        return Err("empty prompt".to_string());
    }

    let llm_cfg = llc::LlmConfig::from_env().map_err(|e| e.to_string())?;
    tracing::info!(provider = %llm_cfg.provider, model = %llm_cfg.model, "chat client ready");
    let chat = llc::OpenAiChat::new(llm_cfg).map_err(|e| e.to_string())?;
    let orch = llc::Orchestrator::new(chat, llc::Verifier::new(cfg.verifier), cfg.session);

    let transcript = runtime()?
        .block_on(orch.run(prompt.trim()))
        .map_err(|e| e.to_string())?;
    let v = serde_json::to_value(&transcript).map_err(|e| format!("serialize transcript: {e}"))?;
    if let Some(p) = arg_value(rest, "--output-json").map(PathBuf::from) {
        write_json(&p, &v)?;
    }
    print_json(&v)?;

    let stopped = transcript.state == llc::LoopState::Stopped;
    if let Err(e) = transcript.into_result() {
        eprintln!("{e}");
    }
    Ok(stopped)
}

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("");
    let rest: &[String] = args.get(2..).unwrap_or(&[]);

    if cmd.is_empty() || cmd == "--help" || cmd == "-h" || cmd == "help" {
        println!("{}", usage());
        return Ok(());
    }
    if matches!(cmd, "-V" | "--version" | "version") {
        println!("leanloop {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_tracing();
    let cfg = llc::Config::from_env().map_err(|e| e.to_string())?;

    let ok = match cmd {
        "verify" => cmd_verify(rest, cfg)?,
        "loop" => cmd_loop(rest, cfg)?,
        other => return Err(format!("unknown command {other:?}\n\n{}", usage())),
    };
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
