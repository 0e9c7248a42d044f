//! [`lockstep_core::ExecutionController`]s backed by interactive debuggers.
//!
//! Transcript parsers are plain functions over debugger output so they can be
//! tested and fuzzed without a debugger.

pub mod cdb;
pub mod gdb;
pub mod session;

pub use cdb::CdbController;
pub use gdb::GdbController;
pub use session::{ReplSession, SessionSpec};
