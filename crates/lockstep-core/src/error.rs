use thiserror::Error;

use crate::controller::{ControllerError, Side};
use crate::protocol::ProtocolError;
use crate::regs::RegisterState;

/// Fatal conditions that end a run. A register divergence is not one of these;
/// it is reported through [`crate::engine::RunOutcome`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bridge protocol corruption: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no {side} symbol covers {address:#010x}; cannot identify the call")]
    UnresolvedSymbol { side: Side, address: u32 },

    #[error("compatibility layer gap: candidate has no symbol {symbol:?} (reference thunk {address:#010x})")]
    MissingCandidateSymbol { symbol: String, address: u32 },

    #[error("compatibility layer gap: {side} never returned to {return_address:#010x} from {syscall}{}", detail_suffix(.detail))]
    MissedReturn {
        side: Side,
        syscall: String,
        return_address: u32,
        detail: Option<String>,
    },

    #[error("unmapped {side} memory at {address:#010x} while reading {what}")]
    UnmappedMemory {
        side: Side,
        address: u32,
        what: &'static str,
    },

    #[error("{side} process exited unexpectedly{}", detail_suffix(.detail))]
    ControllerExited {
        side: Side,
        detail: Option<String>,
        reference: Option<RegisterState>,
        candidate: Option<RegisterState>,
    },

    #[error("{endpoint} did not respond within {timeout_ms} ms")]
    NoResponse { endpoint: String, timeout_ms: u64 },

    #[error("{side} controller failed: {source}")]
    Controller {
        side: Side,
        #[source]
        source: ControllerError,
    },

    #[error("bridge socket: {0}")]
    Io(#[from] std::io::Error),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(" ({d})"),
        None => String::new(),
    }
}

impl EngineError {
    /// Routes controller failures into the engine taxonomy.
    pub fn controller(side: Side, err: ControllerError) -> Self {
        match err {
            ControllerError::Exited { detail } => EngineError::ControllerExited {
                side,
                detail,
                reference: None,
                candidate: None,
            },
            ControllerError::NoResponse {
                command,
                timeout_ms,
            } => EngineError::NoResponse {
                endpoint: format!("{side} debugger ({command})"),
                timeout_ms,
            },
            other => EngineError::Controller {
                side,
                source: other,
            },
        }
    }

    /// Stable identifier used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Protocol(_) => "protocol_corruption",
            EngineError::UnresolvedSymbol { .. } => "unresolved_symbol",
            EngineError::MissingCandidateSymbol { .. } | EngineError::MissedReturn { .. } => {
                "compat_gap"
            }
            EngineError::UnmappedMemory { .. } => "unmapped_memory",
            EngineError::ControllerExited { .. } => "controller_exited",
            EngineError::NoResponse { .. } => "no_response",
            EngineError::Controller { .. } => "controller",
            EngineError::Io(_) => "io",
        }
    }

    pub fn is_exit_of(&self, which: Side) -> bool {
        matches!(self, EngineError::ControllerExited { side, .. } if *side == which)
    }

    /// Attaches the last known states to a controller-exit error.
    pub fn with_states(self, last_reference: RegisterState, last_candidate: RegisterState) -> Self {
        match self {
            EngineError::ControllerExited {
                side,
                detail,
                reference,
                candidate,
            } => EngineError::ControllerExited {
                side,
                detail,
                reference: reference.or(Some(last_reference)),
                candidate: candidate.or(Some(last_candidate)),
            },
            other => other,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
