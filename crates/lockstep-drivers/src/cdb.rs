//! Reference-side controller driving the Windows console debugger.

use std::collections::BTreeSet;

use lockstep_core::{
    Breakpoint, ControllerError, ControllerResult, ExecutionController, RegisterPatch,
    RegisterState,
};

use crate::session::{ReplSession, SessionSpec};

const STRING_CHUNK: u32 = 64;

const EXIT_MARKERS: [&str; 2] = ["No runnable debuggees", "Process exited"];

/// `0:000>`, `1:004>` and the like.
pub fn is_cdb_prompt(line: &str) -> bool {
    let Some(body) = line.trim_end().strip_suffix('>') else {
        return false;
    };
    let mut parts = body.split(':');
    let proc_ok = parts
        .next()
        .is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    let thread_ok = parts
        .next()
        .is_some_and(|t| !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()));
    proc_ok && thread_ok && parts.next().is_none()
}

pub fn cdb_exit_detail(out: &str) -> Option<String> {
    out.lines()
        .find(|l| EXIT_MARKERS.iter().any(|m| l.contains(m)))
        .map(|l| l.trim().to_string())
}

/// Syntax and evaluation errors are echoed as lines starting with `^`.
pub fn cdb_error(out: &str) -> Option<String> {
    out.lines()
        .map(str::trim_start)
        .find(|l| l.starts_with('^'))
        .map(|l| l.to_string())
}

/// Register dump from `r`, `t` or a breakpoint stop: `eax=0019ff70 ebx=...`.
pub fn parse_cdb_registers(out: &str) -> Result<RegisterState, String> {
    let pairs = out
        .split_whitespace()
        .filter_map(|tok| tok.split_once('='))
        .filter_map(|(name, hex)| u32::from_str_radix(hex, 16).ok().map(|v| (name, v)));
    RegisterState::from_named(pairs).map_err(|missing| format!("register dump lacks {missing}"))
}

/// Values from a `db`/`dw`/`dd` dump, `digits` hex characters each. `None`
/// marks an unmapped unit (`??`, `????`, ...).
pub fn parse_cdb_units(out: &str, count: usize, digits: usize) -> Result<Vec<Option<u32>>, String> {
    let mut units = Vec::with_capacity(count);
    for line in out.lines() {
        if units.len() == count {
            break;
        }
        let mut tokens = line
            .split_whitespace()
            .flat_map(|t| t.split('-'))
            .filter(|t| !t.is_empty());
        let Some(addr) = tokens.next() else {
            continue;
        };
        if !is_hex_address(addr) {
            continue;
        }
        let per_line = (16 / (digits / 2)).min(count - units.len());
        for tok in tokens.take(per_line) {
            if tok.len() != digits {
                return Err(format!("unexpected memory token {tok:?}"));
            }
            if tok.bytes().all(|b| b == b'?') {
                units.push(None);
            } else {
                let v = u32::from_str_radix(tok, 16)
                    .map_err(|_| format!("unexpected memory token {tok:?}"))?;
                units.push(Some(v));
            }
        }
    }
    if units.len() != count {
        return Err(format!("expected {count} values, found {}", units.len()));
    }
    Ok(units)
}

fn is_hex_address(tok: &str) -> bool {
    let tok = tok.replace('`', "");
    tok.len() >= 8 && tok.bytes().all(|b| b.is_ascii_hexdigit())
}

/// First symbol from `ln`: `(76f2a2b0)   KERNEL32!GetTickCount+0x6   |  (...)`.
pub fn parse_cdb_ln(out: &str) -> Option<String> {
    out.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix('(')?;
        let (_, after) = rest.split_once(')')?;
        let name = after.split('|').next()?.trim();
        (!name.is_empty()).then(|| name.to_string())
    })
}

/// Address of `name` in `x` output: `76f2a2b0          KERNEL32!GetTickCount (<no parameter info>)`.
pub fn parse_cdb_x(out: &str, name: &str) -> Option<u32> {
    let wanted = name.rsplit('!').next().unwrap_or(name);
    let module = name.split_once('!').map(|(m, _)| m);
    out.lines().find_map(|line| {
        let mut toks = line.split_whitespace();
        let addr = toks.next()?;
        let sym = toks.next()?;
        let (sym_module, sym_name) = sym.split_once('!')?;
        if !sym_name.eq_ignore_ascii_case(wanted) {
            return None;
        }
        if module.is_some_and(|m| m != "*" && !m.eq_ignore_ascii_case(sym_module)) {
            return None;
        }
        u32::from_str_radix(&addr.replace('`', ""), 16).ok()
    })
}

pub struct CdbController {
    session: ReplSession,
    armed: BTreeSet<Breakpoint>,
}

impl CdbController {
    /// Launches the debuggee under cdb and runs it to `start_address`.
    pub fn spawn(spec: &SessionSpec) -> ControllerResult<Self> {
        let mut args = spec.debugger_args.clone();
        args.extend(spec.argv.iter().cloned());
        let session = ReplSession::spawn("cdb", &args, spec, is_cdb_prompt, "q")?;
        let mut ctl = Self {
            session,
            armed: BTreeSet::new(),
        };
        ctl.session.read_until_prompt("<banner>")?;
        ctl.set_breakpoint(&Breakpoint::Address(spec.start_address))?;
        ctl.resume("g")?;
        Ok(ctl)
    }

    fn resume(&mut self, cmd: &str) -> ControllerResult<()> {
        let out = self.session.run_command(cmd)?;
        if let Some(detail) = cdb_exit_detail(&out) {
            return Err(ControllerError::Exited {
                detail: Some(detail),
            });
        }
        if let Some(err) = cdb_error(&out) {
            return Err(ControllerError::transcript(cmd, err));
        }
        Ok(())
    }

    fn checked(&mut self, cmd: &str) -> ControllerResult<String> {
        let out = self.session.run_command(cmd)?;
        if let Some(detail) = cdb_exit_detail(&out) {
            return Err(ControllerError::Exited {
                detail: Some(detail),
            });
        }
        Ok(out)
    }

    fn units(&mut self, cmd: &str, address: u32, count: u32, digits: usize) -> ControllerResult<Vec<Option<u32>>> {
        let line = format!("{cmd} 0x{address:08x} L0x{count:x}");
        let out = self.checked(&line)?;
        if let Some(err) = cdb_error(&out) {
            tracing::debug!(%line, %err, "cdb rejected memory read");
            return Ok(vec![None; count as usize]);
        }
        parse_cdb_units(&out, count as usize, digits).map_err(|e| ControllerError::transcript(line, e))
    }
}

impl ExecutionController for CdbController {
    fn step(&mut self) -> ControllerResult<RegisterState> {
        self.resume("t")?;
        self.fetch_state()
    }

    fn continue_to_breakpoint(&mut self) -> ControllerResult<RegisterState> {
        self.resume("g")?;
        self.fetch_state()
    }

    fn fetch_state(&mut self) -> ControllerResult<RegisterState> {
        let out = self.checked("r")?;
        parse_cdb_registers(&out).map_err(|e| ControllerError::transcript("r", e))
    }

    fn set_state(&mut self, patch: &RegisterPatch) -> ControllerResult<()> {
        for (reg, value) in patch.entries() {
            let line = format!("r {reg}=0x{value:08x}");
            let out = self.checked(&line)?;
            if let Some(err) = cdb_error(&out) {
                return Err(ControllerError::transcript(line, err));
            }
        }
        Ok(())
    }

    fn read_byte(&mut self, address: u32) -> ControllerResult<Option<u8>> {
        Ok(self.units("db", address, 1, 2)?[0].map(|v| v as u8))
    }

    fn read_half_word(&mut self, address: u32) -> ControllerResult<Option<u16>> {
        Ok(self.units("dw", address, 1, 4)?[0].map(|v| v as u16))
    }

    fn read_word(&mut self, address: u32) -> ControllerResult<Option<u32>> {
        Ok(self.units("dd", address, 1, 8)?[0])
    }

    fn read_bytes(&mut self, address: u32, len: u32) -> ControllerResult<Option<Vec<u8>>> {
        if len == 0 {
            return Ok(Some(Vec::new()));
        }
        Ok(self
            .units("db", address, len, 2)?
            .into_iter()
            .map(|u| u.map(|v| v as u8))
            .collect())
    }

    fn read_nul_terminated_string(&mut self, address: u32) -> ControllerResult<Option<Vec<u8>>> {
        let mut out = Vec::new();
        let mut cursor = address;
        loop {
            for unit in self.units("db", cursor, STRING_CHUNK, 2)? {
                match unit {
                    Some(0) => return Ok(Some(out)),
                    Some(b) => out.push(b as u8),
                    None => return Ok(None),
                }
            }
            cursor = cursor.wrapping_add(STRING_CHUNK);
        }
    }

    fn resolve_symbol(&mut self, address: u32) -> ControllerResult<Option<String>> {
        let out = self.checked(&format!("ln 0x{address:08x}"))?;
        Ok(parse_cdb_ln(&out))
    }

    fn symbol_address(&mut self, name: &str) -> ControllerResult<Option<u32>> {
        let pattern = if name.contains('!') {
            name.to_string()
        } else {
            format!("*!{name}")
        };
        let out = self.checked(&format!("x {pattern}"))?;
        Ok(parse_cdb_x(&out, &pattern))
    }

    fn set_breakpoint(&mut self, bp: &Breakpoint) -> ControllerResult<()> {
        if self.armed.contains(bp) {
            return Ok(());
        }
        let line = match bp {
            Breakpoint::Address(a) => format!("bu 0x{a:08x}"),
            Breakpoint::Symbol(s) => format!("bu {s}"),
        };
        let out = self.checked(&line)?;
        if let Some(err) = cdb_error(&out) {
            return Err(ControllerError::transcript(line, err));
        }
        self.armed.insert(bp.clone());
        Ok(())
    }
}
