use lockstep_contracts::LOCKSTEP_RUN_REPORT_SCHEMA_VERSION;
use lockstep_modes::SyncMode;
use serde::Serialize;

use crate::engine::{Divergence, RunOutcome, RunSummary};
use crate::error::EngineError;
use crate::regs::{Register, RegisterState};

pub fn hex32(v: u32) -> String {
    format!("0x{v:08x}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldComparison {
    pub register: Register,
    pub reference: String,
    pub candidate: String,
    pub matches: bool,
}

/// One row per register in canonical order.
pub fn compare(reference: &RegisterState, candidate: &RegisterState) -> Vec<FieldComparison> {
    Register::ALL
        .into_iter()
        .map(|r| FieldComparison {
            register: r,
            reference: hex32(reference.get(r)),
            candidate: hex32(candidate.get(r)),
            matches: reference.get(r) == candidate.get(r),
        })
        .collect()
}

#[derive(Clone, Debug, Serialize)]
pub struct SyscallRecord {
    pub iteration: u64,
    pub name: String,
    pub return_address: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct DivergenceReport {
    pub iteration: u64,
    pub mode: SyncMode,
    pub comparison: Vec<FieldComparison>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_states: Option<Vec<FieldComparison>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ArtifactSide {
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ArtifactComparison {
    pub reference: ArtifactSide,
    pub candidate: ArtifactSide,
    pub sizes_match: bool,
    pub digests_match: bool,
    /// Candidate size minus reference size.
    pub size_delta: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub schema_version: &'static str,
    pub outcome: &'static str,
    pub iterations: u64,
    pub final_mode: SyncMode,
    pub benign_differences: u64,
    pub syscalls: Vec<SyscallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divergence: Option<DivergenceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactComparison>,
}

impl RunReport {
    pub fn from_summary(summary: &RunSummary) -> Self {
        let (outcome, divergence, error) = match &summary.outcome {
            Ok(RunOutcome::Completed) => ("completed", None, None),
            Ok(RunOutcome::IterationLimit) => ("iteration_limit", None, None),
            Ok(RunOutcome::Divergence(d)) => ("divergence", Some(divergence_report(d)), None),
            Err(err) => ("error", None, Some(error_report(err))),
        };
        RunReport {
            schema_version: LOCKSTEP_RUN_REPORT_SCHEMA_VERSION,
            outcome,
            iterations: summary.iterations,
            final_mode: summary.final_mode,
            benign_differences: summary.benign_differences,
            syscalls: summary.syscalls.clone(),
            divergence,
            error,
            artifacts: None,
        }
    }

    pub fn is_divergence(&self) -> bool {
        self.divergence.is_some()
    }
}

fn divergence_report(d: &Divergence) -> DivergenceReport {
    DivergenceReport {
        iteration: d.iteration,
        mode: d.mode,
        comparison: compare(&d.reference, &d.candidate),
    }
}

fn error_report(err: &EngineError) -> ErrorReport {
    let last_states = match err {
        EngineError::ControllerExited {
            reference: Some(r),
            candidate: Some(c),
            ..
        } => Some(compare(r, c)),
        _ => None,
    };
    ErrorReport {
        kind: err.kind(),
        message: err.to_string(),
        last_states,
    }
}
