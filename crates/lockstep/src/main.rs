use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use lockstep_core::report::hex32;
use lockstep_core::{
    BridgeServer, Engine, EngineConfig, ExecutionController, MergePolicy, RunReport,
};
use lockstep_drivers::{CdbController, GdbController};
use lockstep_modes::SyncMode;
use tracing_subscriber::EnvFilter;

mod artifacts;
mod config;

const DEFAULT_LOG_FILTER: &str = "lockstep=info";

#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(
    about = "Run a reference process and a compatibility-layer candidate in lockstep and report the first divergence.",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Run configuration (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Starting synchronization mode; overrides the config.
    #[arg(long, value_enum)]
    mode: Option<SyncMode>,

    /// Syscall whose interception switches the run to cycle-accurate mode.
    #[arg(long)]
    trigger: Option<String>,

    #[arg(long)]
    max_iterations: Option<u64>,

    /// Write the JSON report here instead of stdout.
    #[arg(long)]
    report_out: Option<PathBuf>,

    /// tracing-subscriber filter directives; defaults to RUST_LOG, then `lockstep=info`.
    #[arg(long)]
    log_filter: Option<String>,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_filter.as_deref())?;

    let mut cfg = config::load(&cli.config)?;
    if let Some(mode) = cli.mode {
        cfg.mode = mode;
    }
    if let Some(trigger) = cli.trigger {
        cfg.mode_switch_trigger = Some(trigger);
    }
    if let Some(max) = cli.max_iterations {
        cfg.max_iterations = Some(max);
    }
    cfg.validate_basic()
        .map_err(|e| anyhow::anyhow!("invalid config after CLI overrides: {e}"))?;

    let report = run(&cfg)?;
    write_report(&report, cli.report_out.as_deref())?;

    Ok(if report.error.is_some() {
        ExitCode::from(2)
    } else if report.is_divergence() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn init_tracing(directives: Option<&str>) -> Result<()> {
    let filter = match directives {
        Some(d) => EnvFilter::try_new(d).with_context(|| format!("invalid --log-filter {d:?}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn run(cfg: &config::RunConfig) -> Result<RunReport> {
    if let Some(paths) = &cfg.artifacts {
        artifacts::remove_stale(paths)?;
    }

    let ref_spec = cfg.reference.session_spec("cdb");
    let mut reference = CdbController::spawn(&ref_spec)
        .with_context(|| format!("start reference under {}", ref_spec.debugger))?;

    let mut cand_spec = cfg.candidate.session_spec("gdb");
    if let Some(var) = &cfg.forward_reference_ebx_env {
        let ebx = reference
            .fetch_state()
            .context("read reference initial state")?
            .ebx;
        tracing::info!(%var, ebx = %hex32(ebx), "forwarding reference ebx to candidate");
        cand_spec.env.insert(var.clone(), ebx.to_string());
    }
    let mut candidate = GdbController::spawn(&cand_spec)
        .with_context(|| format!("start candidate under {}", cand_spec.debugger))?;

    for bp in cfg.breakpoints() {
        reference
            .set_breakpoint(&bp)
            .with_context(|| format!("arm reference breakpoint {bp}"))?;
        candidate
            .set_breakpoint(&bp)
            .with_context(|| format!("arm candidate breakpoint {bp}"))?;
    }

    let bridge = cfg
        .bridge
        .to_bridge_config()
        .map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
    let server = BridgeServer::bind(&bridge)
        .with_context(|| format!("bind bridge socket {}", bridge.bind))?;
    tracing::info!(addr = %server.local_addr()?, mode = %cfg.mode, "bridge listening");

    let engine_cfg = EngineConfig {
        mode: cfg.mode,
        mode_switch_trigger: cfg.mode_switch_trigger.clone(),
        merge: MergePolicy::new(cfg.void_syscalls.iter().cloned()),
        marshal: cfg.marshal.clone(),
        max_iterations: cfg.max_iterations,
    };
    let mut engine = Engine::new(reference, candidate, server, engine_cfg);
    let summary = engine.run();
    drop(engine);

    let mut report = RunReport::from_summary(&summary);
    if let Some(d) = &report.divergence {
        for row in d.comparison.iter().filter(|r| !r.matches) {
            tracing::warn!(
                register = %row.register,
                reference = %row.reference,
                candidate = %row.candidate,
                "register mismatch"
            );
        }
    }

    if let Some(paths) = &cfg.artifacts {
        match artifacts::compare(paths) {
            Ok(cmp) => {
                if cmp.sizes_match {
                    tracing::info!(size = cmp.reference.size_bytes, digests_match = cmp.digests_match, "output sizes match");
                } else {
                    tracing::warn!(
                        reference = cmp.reference.size_bytes,
                        candidate = cmp.candidate.size_bytes,
                        delta = cmp.size_delta,
                        "output size mismatch"
                    );
                }
                report.artifacts = Some(cmp);
            }
            Err(err) => tracing::warn!("artifact comparison skipped: {err:#}"),
        }
    }

    Ok(report)
}

fn write_report(report: &RunReport, out: Option<&Path>) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(report).context("serialize run report")?;
    bytes.push(b'\n');
    match out {
        Some(path) => std::fs::write(path, &bytes)
            .with_context(|| format!("write report: {}", path.display()))?,
        None => std::io::stdout()
            .write_all(&bytes)
            .context("write report to stdout")?,
    }
    Ok(())
}
