use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lockstep_contracts::{BRIDGE_DEFAULT_BIND, LOCKSTEP_RUN_CONFIG_SCHEMA_VERSION};
use lockstep_core::{BridgeConfig, Breakpoint, MarshalRegistry, SyncMode};
use lockstep_drivers::SessionSpec;
use serde::Deserialize;

const MAX_TIMEOUT_MS: u64 = 600_000;

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_recv_timeout_ms() -> u64 {
    30_000
}

fn default_bind() -> String {
    BRIDGE_DEFAULT_BIND.to_string()
}

/// Accepts `4198400` or `"0x401000"`.
pub fn parse_address(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    s.parse().ok()
}

/// Breakpoints given as hex strings become addresses; anything else is a symbol.
pub fn normalize_breakpoint(bp: &Breakpoint) -> Breakpoint {
    match bp {
        Breakpoint::Symbol(s) => match parse_address(s) {
            Some(a) => Breakpoint::Address(a),
            None => Breakpoint::Symbol(s.trim().to_string()),
        },
        addr => addr.clone(),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SideConfig {
    #[serde(default)]
    pub debugger: Option<String>,
    #[serde(default)]
    pub debugger_args: Vec<String>,
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub start_address: Breakpoint,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl SideConfig {
    fn validate_basic(&self, label: &str) -> Result<(), String> {
        if self.argv.is_empty() || self.argv[0].trim().is_empty() {
            return Err(format!("{label}.argv must name a program"));
        }
        if self.debugger.as_deref().is_some_and(|d| d.trim().is_empty()) {
            return Err(format!("{label}.debugger must be non-empty when set"));
        }
        if self.start_address().is_none() {
            return Err(format!(
                "{label}.start_address must be an address (got {})",
                self.start_address
            ));
        }
        if self.command_timeout_ms > MAX_TIMEOUT_MS {
            return Err(format!(
                "{label}.command_timeout_ms must be 0..{MAX_TIMEOUT_MS} (got {})",
                self.command_timeout_ms
            ));
        }
        Ok(())
    }

    pub fn start_address(&self) -> Option<u32> {
        match normalize_breakpoint(&self.start_address) {
            Breakpoint::Address(a) => Some(a),
            Breakpoint::Symbol(_) => None,
        }
    }

    pub fn session_spec(&self, default_debugger: &str) -> SessionSpec {
        SessionSpec {
            debugger: self
                .debugger
                .clone()
                .unwrap_or_else(|| default_debugger.to_string()),
            debugger_args: self.debugger_args.clone(),
            argv: self.argv.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            start_address: self.start_address().unwrap_or_default(),
            command_timeout_ms: self.command_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub expected_peer: Option<String>,
    #[serde(default)]
    pub push_addr: Option<String>,
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            expected_peer: None,
            push_addr: None,
            recv_timeout_ms: default_recv_timeout_ms(),
        }
    }
}

impl BridgeSection {
    pub fn to_bridge_config(&self) -> Result<BridgeConfig, String> {
        let parse = |field: &str, v: &str| -> Result<SocketAddr, String> {
            v.trim()
                .parse()
                .map_err(|_| format!("bridge.{field} is not a socket address: {v:?}"))
        };
        Ok(BridgeConfig {
            bind: parse("bind", &self.bind)?,
            expected_peer: self
                .expected_peer
                .as_deref()
                .map(|v| parse("expected_peer", v))
                .transpose()?,
            push_addr: self
                .push_addr
                .as_deref()
                .map(|v| parse("push_addr", v))
                .transpose()?,
            recv_timeout_ms: self.recv_timeout_ms,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactPaths {
    pub reference: PathBuf,
    pub candidate: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub schema_version: String,
    pub reference: SideConfig,
    pub candidate: SideConfig,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default)]
    pub mode_switch_trigger: Option<String>,
    #[serde(default)]
    pub breakpoints: Vec<Breakpoint>,
    #[serde(default)]
    pub void_syscalls: Vec<String>,
    #[serde(default)]
    pub marshal: MarshalRegistry,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub artifacts: Option<ArtifactPaths>,
    #[serde(default)]
    pub forward_reference_ebx_env: Option<String>,
}

impl RunConfig {
    pub fn validate_basic(&self) -> Result<(), String> {
        if self.schema_version.trim() != LOCKSTEP_RUN_CONFIG_SCHEMA_VERSION {
            return Err(format!(
                "config.schema_version mismatch: expected {} got {:?}",
                LOCKSTEP_RUN_CONFIG_SCHEMA_VERSION, self.schema_version
            ));
        }
        self.reference.validate_basic("reference")?;
        self.candidate.validate_basic("candidate")?;
        if self
            .mode_switch_trigger
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            return Err("mode_switch_trigger must be non-empty when set".to_string());
        }
        if let Some(bp) = self
            .breakpoints
            .iter()
            .find(|bp| matches!(bp, Breakpoint::Symbol(s) if s.trim().is_empty()))
        {
            return Err(format!("breakpoints contains an empty entry: {bp:?}"));
        }
        if self.void_syscalls.iter().any(|s| s.trim().is_empty()) {
            return Err("void_syscalls entries must be non-empty".to_string());
        }
        if self.bridge.recv_timeout_ms > MAX_TIMEOUT_MS {
            return Err(format!(
                "bridge.recv_timeout_ms must be 0..{MAX_TIMEOUT_MS} (got {})",
                self.bridge.recv_timeout_ms
            ));
        }
        let bridge = self.bridge.to_bridge_config()?;
        if self.marshal.needs_push() && bridge.push_addr.is_none() && bridge.expected_peer.is_none()
        {
            return Err(
                "marshal entries need bridge.push_addr or bridge.expected_peer to push to".to_string(),
            );
        }
        if self.max_iterations == Some(0) {
            return Err("max_iterations must be at least 1 when set".to_string());
        }
        if let Some(name) = &self.forward_reference_ebx_env {
            if name.trim().is_empty() || name.contains('=') || name.contains('\0') {
                return Err(format!(
                    "forward_reference_ebx_env is not a valid variable name: {name:?}"
                ));
            }
        }
        Ok(())
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.iter().map(normalize_breakpoint).collect()
    }
}

pub fn load(path: &Path) -> Result<RunConfig> {
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: RunConfig = serde_json::from_str(&txt)
        .with_context(|| format!("parse config JSON: {}", path.display()))?;
    cfg.validate_basic()
        .map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::MarshalStrategy;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "schema_version": LOCKSTEP_RUN_CONFIG_SCHEMA_VERSION,
            "reference": { "argv": ["psyq.exe", "main.c"], "start_address": "0x401000" },
            "candidate": {
                "debugger": "wsl",
                "debugger_args": ["--cd", "/src/wibo", "gdb"],
                "argv": ["./build/wibo", "psyq.exe", "main.c"],
                "start_address": 4198400
            }
        })
    }

    fn parse(v: serde_json::Value) -> RunConfig {
        serde_json::from_value(v).expect("parse config")
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = parse(minimal());
        cfg.validate_basic().unwrap();
        assert_eq!(cfg.mode, SyncMode::Syscall);
        assert_eq!(cfg.reference.start_address(), Some(0x0040_1000));
        assert_eq!(cfg.candidate.start_address(), Some(0x0040_1000));
        assert_eq!(cfg.bridge.bind, BRIDGE_DEFAULT_BIND);
        assert!(cfg.marshal.is_empty());

        let spec = cfg.reference.session_spec("cdb");
        assert_eq!(spec.debugger, "cdb");
        assert_eq!(spec.command_timeout_ms, 30_000);
        let spec = cfg.candidate.session_spec("gdb");
        assert_eq!(spec.debugger, "wsl");
        assert_eq!(spec.debugger_args.len(), 3);
    }

    #[test]
    fn full_config_round_trips_into_engine_types() {
        let mut v = minimal();
        v["mode"] = "cycle".into();
        v["mode_switch_trigger"] = "KERNEL32!GetVersion".into();
        v["breakpoints"] = serde_json::json!(["0x412006", 4268040, "KERNEL32!ExitProcess"]);
        v["void_syscalls"] = serde_json::json!(["KERNEL32!SetLastError"]);
        v["marshal"] = serde_json::json!({
            "KERNEL32!GetTickCount": {"kind": "fixed_width_echo", "width": "u32"}
        });
        v["bridge"] = serde_json::json!({"bind": "127.0.0.1:9000", "push_addr": "127.0.0.1:9001"});
        v["max_iterations"] = 1000.into();
        v["artifacts"] = serde_json::json!({"reference": "out/win.obj", "candidate": "out/wibo.obj"});
        v["forward_reference_ebx_env"] = "WIBO_EBX_OVERRIDE".into();

        let cfg = parse(v);
        cfg.validate_basic().unwrap();
        assert_eq!(cfg.mode, SyncMode::Cycle);
        assert_eq!(
            cfg.breakpoints(),
            vec![
                Breakpoint::Address(0x0041_2006),
                Breakpoint::Address(0x0041_2008),
                Breakpoint::Symbol("KERNEL32!ExitProcess".to_string()),
            ]
        );
        assert!(matches!(
            cfg.marshal.lookup("KERNEL32!GetTickCount"),
            MarshalStrategy::FixedWidthEcho { .. }
        ));
        let bridge = cfg.bridge.to_bridge_config().unwrap();
        assert_eq!(bridge.bind.port(), 9000);
        assert_eq!(bridge.push_addr.map(|a| a.port()), Some(9001));
        assert_eq!(bridge.expected_peer, None);
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let mut v = minimal();
        v["schema_version"] = "lockstep.run-config@9".into();
        assert!(parse(v).validate_basic().unwrap_err().contains("schema_version"));

        let mut v = minimal();
        v["reference"]["start_address"] = "mainCRTStartup".into();
        assert!(parse(v).validate_basic().unwrap_err().contains("reference.start_address"));

        let mut v = minimal();
        v["candidate"]["argv"] = serde_json::json!([]);
        assert!(parse(v).validate_basic().unwrap_err().contains("candidate.argv"));

        let mut v = minimal();
        v["bridge"] = serde_json::json!({"bind": "localhost"});
        assert!(parse(v).validate_basic().unwrap_err().contains("bridge.bind"));

        let mut v = minimal();
        v["marshal"] = serde_json::json!({
            "KERNEL32!GetCommandLineA": {"kind": "length_prefixed_buffer", "source": {"from": "returned_pointer"}}
        });
        assert!(parse(v).validate_basic().unwrap_err().contains("push_addr"));

        let mut v = minimal();
        v["max_iterations"] = 0.into();
        assert!(parse(v).validate_basic().is_err());

        let mut v = minimal();
        v["forward_reference_ebx_env"] = "A=B".into();
        assert!(parse(v).validate_basic().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut v = minimal();
        v["modes"] = "cycle".into();
        assert!(serde_json::from_value::<RunConfig>(v).is_err());
    }

    #[test]
    fn addresses_accept_hex_and_decimal_forms() {
        assert_eq!(parse_address("0x401000"), Some(0x0040_1000));
        assert_eq!(parse_address(" 0X401000 "), Some(0x0040_1000));
        assert_eq!(parse_address("4198400"), Some(0x0040_1000));
        assert_eq!(parse_address("KERNEL32!Sleep"), None);
    }
}
