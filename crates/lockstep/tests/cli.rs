use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use lockstep_contracts::{LOCKSTEP_RUN_CONFIG_SCHEMA_VERSION, LOCKSTEP_RUN_REPORT_SCHEMA_VERSION};
use serde_json::json;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_dir(prefix: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = base.join(format!("{prefix}_{pid}_{n}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Answers `r` with a fixed register dump; the `EXIT_AFTER`+1-th `g` reports
/// that the debuggee is gone.
const FAKE_CDB: &str = r#"
printf 'Microsoft (R) Windows Debugger (fake)\n0:000> '
n=0
while IFS= read -r line; do
  case "$line" in
    q) exit 0 ;;
    g) n=$((n+1)); if [ "$n" -gt "$EXIT_AFTER" ]; then echo "^ No runnable debuggees error in 'g'"; fi ;;
    r)
      echo "eax=00000007 ebx=00268000 ecx=00000001 edx=00000002 esi=00000000 edi=00000000"
      echo "eip=00401000 esp=0019ff74 ebp=0019ff80 iopl=0         nv up ei pl zr na pe nc"
      ;;
  esac
  printf '0:000> '
done
"#;

/// Same shape as gdb; `ESI` sets the reported esi.
const FAKE_GDB: &str = r#"
printf 'GNU gdb (fake)\n(gdb) '
n=0
while IFS= read -r line; do
  case "$line" in
    quit) exit 0 ;;
    c) n=$((n+1)); if [ "$n" -gt "$EXIT_AFTER" ]; then echo "[Inferior 1 (process 42) exited normally]"; fi ;;
    "info registers")
      printf 'eax            0x7                 7\n'
      printf 'ecx            0x1                 1\n'
      printf 'edx            0x2                 2\n'
      printf 'ebx            0x268000            2523136\n'
      printf 'esp            0x19ff74            0x19ff74\n'
      printf 'ebp            0x19ff80            0x19ff80\n'
      printf 'esi            %s                 0\n' "$ESI"
      printf 'edi            0x0                 0\n'
      printf 'eip            0x401000            0x401000 <start>\n'
      ;;
    "b "*) echo "Breakpoint 1 at ${line#b \*}" ;;
    "info symbol "*) echo "No symbol matches ${line#info symbol }." ;;
  esac
  printf '(gdb) '
done
"#;

fn config(exit_after: u32, candidate_esi: &str) -> serde_json::Value {
    let side = |script: &str, esi: &str| {
        json!({
            "debugger": "sh",
            "debugger_args": ["-c", script, "fake"],
            "argv": ["app.exe"],
            "env": { "EXIT_AFTER": exit_after.to_string(), "ESI": esi },
            "start_address": "0x401000",
            "command_timeout_ms": 5000
        })
    };
    json!({
        "schema_version": LOCKSTEP_RUN_CONFIG_SCHEMA_VERSION,
        "reference": side(FAKE_CDB, "0x0"),
        "candidate": side(FAKE_GDB, candidate_esi),
        "bridge": { "bind": "127.0.0.1:0", "recv_timeout_ms": 2000 }
    })
}

fn run_lockstep(cfg: &serde_json::Value, prefix: &str) -> (std::process::Output, PathBuf) {
    let dir = temp_dir(prefix);
    let cfg_path = dir.join("run.json");
    std::fs::write(&cfg_path, serde_json::to_vec_pretty(cfg).unwrap()).expect("write config");

    let bin = env!("CARGO_BIN_EXE_lockstep");
    let out = Command::new(bin)
        .arg("--config")
        .arg(&cfg_path)
        .arg("--log-filter")
        .arg("lockstep=debug")
        .output()
        .expect("run lockstep");
    (out, dir)
}

#[cfg(unix)]
#[test]
fn matching_runs_complete_with_exit_zero() {
    let (out, dir) = run_lockstep(&config(1, "0x0"), "lockstep_cli_complete");
    assert!(
        out.status.success(),
        "status={}\nstderr={}",
        out.status,
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse report json");
    assert_eq!(v["schema_version"], LOCKSTEP_RUN_REPORT_SCHEMA_VERSION);
    assert_eq!(v["outcome"], "completed");
    assert_eq!(v["iterations"], 1);
    assert_eq!(v["final_mode"], "syscall");
    assert!(v.get("divergence").is_none());

    let _ = std::fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[test]
fn register_divergence_exits_one_with_report() {
    let (out, dir) = run_lockstep(&config(100, "0x99"), "lockstep_cli_diverge");
    assert_eq!(
        out.status.code(),
        Some(1),
        "stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse report json");
    assert_eq!(v["outcome"], "divergence");
    let rows = v["divergence"]["comparison"].as_array().expect("rows");
    let esi = rows.iter().find(|r| r["register"] == "esi").expect("esi row");
    assert_eq!(esi["reference"], "0x00000000");
    assert_eq!(esi["candidate"], "0x00000099");
    assert_eq!(esi["matches"], false);
    assert_eq!(rows.iter().filter(|r| r["matches"] == false).count(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn invalid_config_exits_two() {
    let mut cfg = config(1, "0x0");
    cfg["schema_version"] = "lockstep.run-config@0.0.0".into();
    let (out, dir) = run_lockstep(&cfg, "lockstep_cli_bad_config");
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("schema_version"), "stderr={stderr}");
    assert!(out.stdout.is_empty());

    let _ = std::fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[test]
fn report_out_writes_the_report_file() {
    let cfg = config(1, "0x0");
    let dir = temp_dir("lockstep_cli_report_out");
    let cfg_path = dir.join("run.json");
    let report_path = dir.join("report.json");
    std::fs::write(&cfg_path, serde_json::to_vec(&cfg).unwrap()).expect("write config");

    let out = Command::new(env!("CARGO_BIN_EXE_lockstep"))
        .arg("--config")
        .arg(&cfg_path)
        .arg("--mode")
        .arg("cycle")
        .arg("--max-iterations")
        .arg("3")
        .arg("--report-out")
        .arg(&report_path)
        .output()
        .expect("run lockstep");
    assert!(out.stdout.is_empty());

    let v: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&report_path).expect("report written"))
            .expect("parse report json");
    assert!(out.status.success());
    assert_eq!(v["final_mode"], "cycle");
    assert_eq!(v["outcome"], "iteration_limit");
    assert_eq!(v["iterations"], 3);

    let _ = std::fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[test]
fn leftover_artifacts_are_not_compared() {
    let dir = temp_dir("lockstep_cli_stale_artifacts");
    let reference = dir.join("win.obj");
    let candidate = dir.join("wibo.obj");
    std::fs::write(&reference, b"stale").expect("write stale reference");
    std::fs::write(&candidate, b"stale").expect("write stale candidate");

    let mut cfg = config(1, "0x0");
    cfg["artifacts"] = json!({ "reference": reference, "candidate": candidate });
    let (out, cfg_dir) = run_lockstep(&cfg, "lockstep_cli_stale_config");
    assert!(
        out.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse report json");
    assert!(v.get("artifacts").is_none());
    assert!(!reference.exists());
    assert!(!candidate.exists());

    let _ = std::fs::remove_dir_all(&dir);
    let _ = std::fs::remove_dir_all(&cfg_dir);
}
