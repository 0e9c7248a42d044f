//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema/version strings and
//! wire constants that appear in machine-readable I/O or that the candidate-side
//! bridge client must agree on.

pub const LOCKSTEP_RUN_CONFIG_SCHEMA_VERSION: &str = "lockstep.run-config@0.1.0";
pub const LOCKSTEP_RUN_REPORT_SCHEMA_VERSION: &str = "lockstep.run.report@0.1.0";

/// Default UDP endpoint the bridge server binds for the candidate client.
pub const BRIDGE_DEFAULT_BIND: &str = "0.0.0.0:8088";

/// Largest payload a single UDP datagram can carry over IPv4.
pub const BRIDGE_MAX_DATAGRAM_BYTES: usize = 65_507;
