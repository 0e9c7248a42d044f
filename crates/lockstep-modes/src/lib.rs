//! Synchronization mode registry.
//!
//! Shared by the engine (which switches modes at runtime) and the CLI/config
//! layer (which selects the starting mode), so both agree on names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Breakpoints at every imported entry point; one breakpoint hit per iteration.
    #[default]
    Syscall,
    /// One native instruction per iteration.
    Cycle,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Syscall => "syscall",
            SyncMode::Cycle => "cycle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "syscall" | "syscall-level" => Some(SyncMode::Syscall),
            "cycle" | "cycle-accurate" | "step" => Some(SyncMode::Cycle),
            _ => None,
        }
    }

    /// True once the run compares state after every instruction.
    pub fn is_cycle_accurate(self) -> bool {
        matches!(self, SyncMode::Cycle)
    }

    /// Mode switches are one-way: cycle-accurate never returns to syscall-level.
    pub fn switched(self) -> Self {
        SyncMode::Cycle
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SyncModeParseError {
    value: String,
}

impl fmt::Display for SyncModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid sync mode {:?} (expected one of: syscall, cycle)",
            self.value
        )
    }
}

impl std::error::Error for SyncModeParseError {}

impl FromStr for SyncMode {
    type Err = SyncModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncMode::parse(s).ok_or_else(|| SyncModeParseError {
            value: s.trim().to_string(),
        })
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for SyncMode {
    fn value_variants<'a>() -> &'a [Self] {
        const ALL: [SyncMode; 2] = [SyncMode::Syscall, SyncMode::Cycle];
        &ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            SyncMode::Syscall => {
                Some(clap::builder::PossibleValue::new("syscall").alias("syscall-level"))
            }
            SyncMode::Cycle => Some(
                clap::builder::PossibleValue::new("cycle")
                    .alias("cycle-accurate")
                    .alias("step"),
            ),
        }
    }
}
