#![forbid(unsafe_code)]

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const TOOL_SCRIPT: &str = r#"#!/bin/sh
cat >/dev/null
case "$1" in
  analyze) printf '%s' '{"origin":"https://shop.example","pages":[{"url":"https://shop.example/","title":"Shop"}]}' ;;
  plan) printf '%s' '{}' ;;
  generate-shared) printf '%s' '[]' ;;
  generate-page) printf '%s' '{"unit_type":"HomePage","content":"export default function HomePage() { return <main>Shop</main>; }"}' ;;
  repair) printf '%s' '{"unit_type":"Stub","content":"export default function Stub() { return null; }"}' ;;
  check-unit|check-project) printf '%s' '[]' ;;
  build) printf '%s' '{"success":true}' ;;
  probe) printf '%s' '{"size":null}' ;;
  fetch) printf 'bytes' ;;
  deploy) printf '%s' '{"url":"https://preview.example/x"}' ;;
  *) echo "unknown op $1" >&2; exit 2 ;;
esac
"#;

fn sm_runner(storage_dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_sm_runner"));
    cmd.arg("--storage-dir")
        .arg(storage_dir)
        .env_remove("SM_CONFIG")
        .env_remove("SM_TOOLS")
        .env_remove("SM_WORKER_ID")
        .env("SM_LOG", "warn");
    cmd
}

fn run(cmd: &mut Command) -> Output {
    cmd.output().expect("run sm_runner")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not json ({e}): {} / stderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn write_tools(dir: &Path) -> PathBuf {
    let script = dir.join("tool.sh");
    std::fs::write(&script, TOOL_SCRIPT).expect("write script");
    let tools = dir.join("tools.yaml");
    let entry = format!("{{ program: sh, args: [\"{}\"], timeout_ms: 20000 }}", script.display());
    let yaml = ["analyzer", "generator", "checker", "builder", "fetcher", "deployer"]
        .iter()
        .map(|name| format!("{name}: {entry}\n"))
        .collect::<String>();
    std::fs::write(&tools, yaml).expect("write tools");
    tools
}

#[test]
fn help_exits_zero_without_touching_storage() {
    let dir = tempfile::tempdir().expect("temp dir");
    let storage = dir.path().join("store");
    let output = run(sm_runner(&storage).arg("--help"));
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["submit", "status", "cancel", "invalidate", "work"] {
        assert!(stdout.contains(command), "help must list {command}");
    }
    assert!(!storage.exists());
}

#[cfg(unix)]
#[test]
fn submitted_job_is_driven_to_done_by_a_worker() {
    let dir = tempfile::tempdir().expect("temp dir");
    let storage = dir.path().join("store");
    let tools = write_tools(dir.path());

    let submitted = run(sm_runner(&storage).args(["submit", "https://shop.example"]));
    assert!(submitted.status.success());
    let job = stdout_json(&submitted);
    assert_eq!(job["phase"], "ANALYZE");
    let job_id = job["job_id"].as_str().expect("job id").to_string();

    let worked = run(sm_runner(&storage)
        .args(["work", "--once", "--poll-ms", "10", "--worker-id", "cli-worker", "--tools"])
        .arg(&tools));
    assert!(
        worked.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&worked.stderr)
    );
    let stats = stdout_json(&worked);
    assert_eq!(stats["worker_id"], "cli-worker");
    assert_eq!(stats["completed"], 1);

    let status = stdout_json(&run(sm_runner(&storage).args(["status", &job_id])));
    assert_eq!(status["job"]["phase"], "DONE");
    assert!(status["job"]["completed_at"].is_string());
    assert_eq!(status["gate_results"].as_array().map(Vec::len), Some(4));
    assert!(
        status["manifest"]
            .as_array()
            .is_some_and(|units| !units.is_empty())
    );
    let events = status["events"].as_array().expect("events");
    assert_eq!(events[0]["kind"], "job_submitted");

    let rewind = run(sm_runner(&storage).args(["invalidate", &job_id, "--from-phase", "plan"]));
    assert!(!rewind.status.success());
    assert_eq!(stdout_json(&rewind)["error"]["code"], "JOB_TERMINAL");
}

#[test]
fn bad_arguments_exit_non_zero() {
    let dir = tempfile::tempdir().expect("temp dir");
    let storage = dir.path().join("store");

    let rejected = run(sm_runner(&storage).args(["submit", "ftp://shop.example"]));
    assert!(!rejected.status.success());
    assert_eq!(stdout_json(&rejected)["error"]["code"], "INVALID_INPUT");

    let unknown = run(sm_runner(&storage).args(["cancel", "MIG-0999"]));
    assert!(!unknown.status.success());
    assert_eq!(stdout_json(&unknown)["error"]["code"], "UNKNOWN_ID");

    let submitted = stdout_json(&run(sm_runner(&storage).args(["submit", "https://shop.example"])));
    let job_id = submitted["job_id"].as_str().expect("job id").to_string();
    let bad_phase = run(sm_runner(&storage).args(["invalidate", &job_id, "--from-phase", "ship"]));
    assert!(!bad_phase.status.success());
    assert_eq!(stdout_json(&bad_phase)["error"]["code"], "INVALID_INPUT");

    let cancelled = stdout_json(&run(sm_runner(&storage).args(["cancel", &job_id])));
    assert_eq!(cancelled["phase"], "CANCELLED");
}
