//! Candidate-side controller driving gdb around the compatibility layer.

use std::collections::BTreeSet;

use lockstep_core::{
    Breakpoint, ControllerError, ControllerResult, ExecutionController, RegisterPatch,
    RegisterState,
};

use crate::session::{ReplSession, SessionSpec};

const STRING_CHUNK: u32 = 64;

const EXIT_MARKERS: [&str; 4] = [
    "exited normally",
    "exited with code",
    "The program is not being run.",
    "The program has no registers now.",
];

const UNMAPPED_MARKER: &str = "Cannot access memory";

pub fn is_gdb_prompt(line: &str) -> bool {
    line.trim_end() == "(gdb)"
}

pub fn gdb_exit_detail(out: &str) -> Option<String> {
    out.lines()
        .find(|l| EXIT_MARKERS.iter().any(|m| l.contains(m)))
        .map(|l| l.trim().to_string())
}

/// `info registers` rows: `eax            0x2a                42`.
pub fn parse_gdb_registers(out: &str) -> Result<RegisterState, String> {
    let pairs = out.lines().filter_map(|line| {
        let mut toks = line.split_whitespace();
        let name = toks.next()?;
        let hex = toks.next()?.strip_prefix("0x")?;
        u32::from_str_radix(hex, 16).ok().map(|v| (name, v))
    });
    RegisterState::from_named(pairs).map_err(|missing| format!("register listing lacks {missing}"))
}

/// Bytes from `x/Nxb`. `Ok(None)` when gdb could not read the whole range.
pub fn parse_gdb_bytes(out: &str, count: usize) -> Result<Option<Vec<u8>>, String> {
    if out.contains(UNMAPPED_MARKER) {
        return Ok(None);
    }
    let mut bytes = Vec::with_capacity(count);
    for line in out.lines() {
        let Some(values) = after_location(line) else {
            continue;
        };
        for tok in values.split_whitespace() {
            let hex = tok
                .strip_prefix("0x")
                .ok_or_else(|| format!("unexpected memory token {tok:?}"))?;
            let b = u8::from_str_radix(hex, 16).map_err(|_| format!("unexpected memory token {tok:?}"))?;
            bytes.push(b);
        }
    }
    if bytes.len() != count {
        return Err(format!("expected {count} bytes, found {}", bytes.len()));
    }
    Ok(Some(bytes))
}

/// Text after `0x401000 <start+4>:`. C++ names contain `::`, so the separator
/// is a colon followed by whitespace.
fn after_location(line: &str) -> Option<&str> {
    if !line.trim_start().starts_with("0x") {
        return None;
    }
    let bytes = line.as_bytes();
    let at = (0..bytes.len().saturating_sub(1))
        .find(|&i| bytes[i] == b':' && bytes[i + 1].is_ascii_whitespace())?;
    Some(&line[at + 1..])
}

/// `info symbol`: `GetTickCount + 6 in section .text of /x/wibo` becomes
/// `GetTickCount+0x6`.
pub fn parse_gdb_info_symbol(out: &str) -> Option<String> {
    let line = out.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.starts_with("No symbol matches") {
        return None;
    }
    let (name, _) = line.split_once(" in section ")?;
    Some(match name.split_once(" + ") {
        Some((base, off)) => match off.trim().parse::<u32>() {
            Ok(off) => format!("{}+0x{off:x}", base.trim()),
            Err(_) => name.trim().to_string(),
        },
        None => name.trim().to_string(),
    })
}

/// `info address`: `Symbol "GetTickCount" is at 0x6f10a000 in a file compiled without debugging.`
pub fn parse_gdb_info_address(out: &str) -> Option<u32> {
    let line = out.lines().map(str::trim).find(|l| l.starts_with("Symbol "))?;
    let tok = line.split_whitespace().find(|t| t.starts_with("0x"))?;
    let hex = tok.trim_start_matches("0x").trim_end_matches(['.', ',']);
    u32::from_str_radix(hex, 16).ok()
}

pub struct GdbController {
    session: ReplSession,
    armed: BTreeSet<Breakpoint>,
}

impl GdbController {
    /// Launches the compatibility layer under gdb. The layer is expected to trap
    /// once right before jumping into guest code; from there the controller
    /// single-steps into the guest and runs to `start_address`.
    pub fn spawn(spec: &SessionSpec) -> ControllerResult<Self> {
        let mut args = spec.debugger_args.clone();
        args.push("--args".to_string());
        args.extend(spec.argv.iter().cloned());
        let session = ReplSession::spawn("gdb", &args, spec, is_gdb_prompt, "quit")?;
        let mut ctl = Self {
            session,
            armed: BTreeSet::new(),
        };
        ctl.session.read_until_prompt("<banner>")?;
        ctl.session.run_command("set pagination off")?;
        ctl.session.run_command("set confirm off")?;
        ctl.resume("run")?;
        ctl.resume("si")?;
        ctl.set_breakpoint(&Breakpoint::Address(spec.start_address))?;
        ctl.resume("c")?;
        Ok(ctl)
    }

    fn checked(&mut self, cmd: &str) -> ControllerResult<String> {
        let out = self.session.run_command(cmd)?;
        if let Some(detail) = gdb_exit_detail(&out) {
            return Err(ControllerError::Exited {
                detail: Some(detail),
            });
        }
        Ok(out)
    }

    fn resume(&mut self, cmd: &str) -> ControllerResult<()> {
        self.checked(cmd).map(drop)
    }
}

impl ExecutionController for GdbController {
    fn step(&mut self) -> ControllerResult<RegisterState> {
        self.resume("si")?;
        self.fetch_state()
    }

    fn continue_to_breakpoint(&mut self) -> ControllerResult<RegisterState> {
        self.resume("c")?;
        self.fetch_state()
    }

    fn fetch_state(&mut self) -> ControllerResult<RegisterState> {
        let out = self.checked("info registers")?;
        parse_gdb_registers(&out).map_err(|e| ControllerError::transcript("info registers", e))
    }

    fn set_state(&mut self, patch: &RegisterPatch) -> ControllerResult<()> {
        for (reg, value) in patch.entries() {
            let line = format!("set ${reg}=0x{value:x}");
            let out = self.checked(&line)?;
            if !out.trim().is_empty() {
                return Err(ControllerError::transcript(line, out.trim()));
            }
        }
        Ok(())
    }

    fn read_byte(&mut self, address: u32) -> ControllerResult<Option<u8>> {
        Ok(self.read_bytes(address, 1)?.map(|b| b[0]))
    }

    fn read_half_word(&mut self, address: u32) -> ControllerResult<Option<u16>> {
        Ok(self
            .read_bytes(address, 2)?
            .map(|b| u16::from_le_bytes([b[0], b[1]])))
    }

    fn read_word(&mut self, address: u32) -> ControllerResult<Option<u32>> {
        Ok(self
            .read_bytes(address, 4)?
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
    }

    fn read_bytes(&mut self, address: u32, len: u32) -> ControllerResult<Option<Vec<u8>>> {
        if len == 0 {
            return Ok(Some(Vec::new()));
        }
        let line = format!("x/{len}xb 0x{address:x}");
        let out = self.checked(&line)?;
        parse_gdb_bytes(&out, len as usize).map_err(|e| ControllerError::transcript(line, e))
    }

    fn read_nul_terminated_string(&mut self, address: u32) -> ControllerResult<Option<Vec<u8>>> {
        let mut out = Vec::new();
        let mut cursor = address;
        loop {
            let chunk = match self.read_bytes(cursor, STRING_CHUNK)? {
                Some(chunk) => chunk,
                // The string may end before the unmapped part of the chunk.
                None => {
                    for i in 0..STRING_CHUNK {
                        match self.read_bytes(cursor.wrapping_add(i), 1)? {
                            Some(b) if b[0] == 0 => return Ok(Some(out)),
                            Some(b) => out.push(b[0]),
                            None => return Ok(None),
                        }
                    }
                    cursor = cursor.wrapping_add(STRING_CHUNK);
                    continue;
                }
            };
            for b in chunk {
                if b == 0 {
                    return Ok(Some(out));
                }
                out.push(b);
            }
            cursor = cursor.wrapping_add(STRING_CHUNK);
        }
    }

    fn resolve_symbol(&mut self, address: u32) -> ControllerResult<Option<String>> {
        let out = self.checked(&format!("info symbol 0x{address:x}"))?;
        Ok(parse_gdb_info_symbol(&out))
    }

    /// Module prefixes (`KERNEL32!`) are dropped; the layer exports plain names.
    fn symbol_address(&mut self, name: &str) -> ControllerResult<Option<u32>> {
        let bare = name.rsplit('!').next().unwrap_or(name);
        let out = self.checked(&format!("info address {bare}"))?;
        Ok(parse_gdb_info_address(&out))
    }

    fn set_breakpoint(&mut self, bp: &Breakpoint) -> ControllerResult<()> {
        if self.armed.contains(bp) {
            return Ok(());
        }
        let line = match bp {
            Breakpoint::Address(a) => format!("b *0x{a:x}"),
            Breakpoint::Symbol(s) => format!("b {}", s.rsplit('!').next().unwrap_or(s)),
        };
        let out = self.checked(&line)?;
        if !out.contains("Breakpoint") {
            return Err(ControllerError::transcript(line, out.trim()));
        }
        self.armed.insert(bp.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_REGISTERS: &str = "eax            0x2a                42\n\
ecx            0x4022a0            4203168\n\
edx            0x0                 0\n\
ebx            0x268000            2523136\n\
esp            0x19ff74            0x19ff74\n\
ebp            0x19ff80            0x19ff80\n\
esi            0x0                 0\n\
edi            0x0                 0\n\
eip            0x401000            0x401000 <start>\n\
eflags         0x246               [ PF ZF IF ]\n\
cs             0x23                35\n";

    #[test]
    fn register_listing_parses_all_nine() {
        let s = parse_gdb_registers(INFO_REGISTERS).unwrap();
        assert_eq!(s.eax, 42);
        assert_eq!(s.ecx, 0x0040_22a0);
        assert_eq!(s.eip, 0x0040_1000);
        assert_eq!(s.ebp, 0x0019_ff80);
    }

    #[test]
    fn exit_messages_are_recognised() {
        assert!(gdb_exit_detail("[Inferior 1 (process 4242) exited normally]\n").is_some());
        assert!(gdb_exit_detail("[Inferior 1 (process 4242) exited with code 01]\n").is_some());
        assert!(gdb_exit_detail("The program has no registers now.\n").is_some());
        assert!(gdb_exit_detail(INFO_REGISTERS).is_none());
    }

    #[test]
    fn byte_dumps_cover_multiple_lines_and_cxx_names() {
        let out = "0x401000 <ns::start>:\t0x55\t0x89\t0xe5\t0x83\t0xec\t0x08\t0x00\t0x00\n\
0x401008 <ns::start+8>:\t0x61\t0x00\n";
        let bytes = parse_gdb_bytes(out, 10).unwrap().unwrap();
        assert_eq!(bytes[0], 0x55);
        assert_eq!(bytes[8], 0x61);
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn partially_unmapped_dump_is_unmapped() {
        let out = "0x7ffff000:\t0x01\t0x02\nCannot access memory at address 0x80000000\n";
        assert_eq!(parse_gdb_bytes(out, 4).unwrap(), None);
        assert!(parse_gdb_bytes("0x10:\t0x01\n", 2).is_err());
    }

    #[test]
    fn info_symbol_normalises_offsets() {
        assert_eq!(
            parse_gdb_info_symbol("GetTickCount + 6 in section .text of /opt/wibo\n").as_deref(),
            Some("GetTickCount+0x6")
        );
        assert_eq!(
            parse_gdb_info_symbol("start in section .text\n").as_deref(),
            Some("start")
        );
        assert_eq!(parse_gdb_info_symbol("No symbol matches 0x2a.\n"), None);
    }

    #[test]
    fn info_address_extracts_the_location() {
        assert_eq!(
            parse_gdb_info_address(
                "Symbol \"GetTickCount\" is at 0x6f10a000 in a file compiled without debugging.\n"
            ),
            Some(0x6f10_a000)
        );
        assert_eq!(
            parse_gdb_info_address("Symbol \"main\" is a function at address 0x401126.\n"),
            Some(0x0040_1126)
        );
        assert_eq!(parse_gdb_info_address("No symbol \"Nope\" in current context.\n"), None);
    }

    #[test]
    fn prompt_is_exact() {
        assert!(is_gdb_prompt("(gdb) "));
        assert!(!is_gdb_prompt("0:000>"));
    }
}
