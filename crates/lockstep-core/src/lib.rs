//! Lockstep differential execution between a reference process and a candidate
//! running under a compatibility layer.
//!
//! The [`engine::Engine`] advances both sides through [`ExecutionController`]s,
//! bridges intercepted calls over the UDP request protocol in [`protocol`], and
//! reconciles calling-convention scratch registers with [`merge::MergePolicy`].

pub mod bridge;
pub mod controller;
pub mod engine;
pub mod error;
pub mod marshal;
pub mod merge;
pub mod protocol;
pub mod regs;
pub mod report;

pub use bridge::{BridgeConfig, BridgeServer, BridgeSession};
pub use controller::{
    Breakpoint, ControllerError, ControllerResult, ExecutionController, Side,
};
pub use engine::{Divergence, Engine, EngineConfig, RunOutcome, RunSummary};
pub use error::{EngineError, EngineResult};
pub use lockstep_modes::SyncMode;
pub use marshal::{MarshalRegistry, MarshalStrategy};
pub use merge::MergePolicy;
pub use regs::{Register, RegisterPatch, RegisterState};
pub use report::RunReport;
