use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::regs::{RegisterPatch, RegisterState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Reference,
    Candidate,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Reference => "reference",
            Side::Candidate => "candidate",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Breakpoint {
    Address(u32),
    Symbol(String),
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breakpoint::Address(a) => write!(f, "{a:#010x}"),
            Breakpoint::Symbol(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("debuggee exited{}", exit_suffix(.detail))]
    Exited { detail: Option<String> },

    #[error("{op} is not supported by this controller")]
    Unsupported { op: &'static str },

    #[error("debugger did not respond to {command:?} within {timeout_ms} ms")]
    NoResponse { command: String, timeout_ms: u64 },

    #[error("unexpected debugger output for {command:?}: {detail}")]
    Transcript { command: String, detail: String },

    #[error("debugger session i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    pub fn transcript(command: impl Into<String>, detail: impl Into<String>) -> Self {
        ControllerError::Transcript {
            command: command.into(),
            detail: detail.into(),
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, ControllerError::Exited { .. })
    }
}

/// Splits `module!symbol+0x1c` into the base name and its byte offset.
pub fn split_symbol_offset(name: &str) -> (&str, u32) {
    if let Some((base, off)) = name.rsplit_once('+') {
        let off = off.trim();
        let parsed = match off.strip_prefix("0x").or_else(|| off.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => off.parse::<u32>().ok(),
        };
        if let Some(off) = parsed {
            return (base.trim_end(), off);
        }
    }
    (name, 0)
}

fn exit_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {d}"),
        None => String::new(),
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// One debugger-driven process, seen through the primitives the engine needs.
///
/// Memory reads return `Ok(None)` for unmapped addresses; an `Err` always means
/// the controller itself failed.
pub trait ExecutionController {
    /// Advances exactly one instruction.
    fn step(&mut self) -> ControllerResult<RegisterState>;

    /// Resumes until the next breakpoint fires or the process exits.
    fn continue_to_breakpoint(&mut self) -> ControllerResult<RegisterState>;

    fn fetch_state(&mut self) -> ControllerResult<RegisterState>;

    /// May fail with [`ControllerError::Unsupported`] on read-only sides.
    fn set_state(&mut self, patch: &RegisterPatch) -> ControllerResult<()>;

    fn read_byte(&mut self, address: u32) -> ControllerResult<Option<u8>>;

    fn read_half_word(&mut self, address: u32) -> ControllerResult<Option<u16>> {
        let mut out = [0u8; 2];
        for (i, slot) in out.iter_mut().enumerate() {
            match self.read_byte(address.wrapping_add(i as u32))? {
                Some(b) => *slot = b,
                None => return Ok(None),
            }
        }
        Ok(Some(u16::from_le_bytes(out)))
    }

    fn read_word(&mut self, address: u32) -> ControllerResult<Option<u32>> {
        let mut out = [0u8; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            match self.read_byte(address.wrapping_add(i as u32))? {
                Some(b) => *slot = b,
                None => return Ok(None),
            }
        }
        Ok(Some(u32::from_le_bytes(out)))
    }

    /// `Some` only when every byte of `[address, address + len)` is mapped.
    fn read_bytes(&mut self, address: u32, len: u32) -> ControllerResult<Option<Vec<u8>>> {
        let mut out = Vec::with_capacity(len as usize);
        for i in 0..len {
            match self.read_byte(address.wrapping_add(i))? {
                Some(b) => out.push(b),
                None => return Ok(None),
            }
        }
        Ok(Some(out))
    }

    /// Bytes up to, not including, the first NUL.
    fn read_nul_terminated_string(&mut self, address: u32) -> ControllerResult<Option<Vec<u8>>> {
        let mut out = Vec::new();
        let mut cur = address;
        loop {
            match self.read_byte(cur)? {
                Some(0) => return Ok(Some(out)),
                Some(b) => out.push(b),
                None => return Ok(None),
            }
            cur = cur.wrapping_add(1);
        }
    }

    fn resolve_symbol(&mut self, address: u32) -> ControllerResult<Option<String>>;

    fn current_symbol(&mut self) -> ControllerResult<Option<String>> {
        let state = self.fetch_state()?;
        self.resolve_symbol(state.eip)
    }

    /// Address of a named symbol in this process.
    fn symbol_address(&mut self, name: &str) -> ControllerResult<Option<u32>>;

    /// Idempotent: re-arming an existing breakpoint is a no-op.
    fn set_breakpoint(&mut self, bp: &Breakpoint) -> ControllerResult<()>;
}

impl<T: ExecutionController + ?Sized> ExecutionController for Box<T> {
    fn step(&mut self) -> ControllerResult<RegisterState> {
        (**self).step()
    }

    fn continue_to_breakpoint(&mut self) -> ControllerResult<RegisterState> {
        (**self).continue_to_breakpoint()
    }

    fn fetch_state(&mut self) -> ControllerResult<RegisterState> {
        (**self).fetch_state()
    }

    fn set_state(&mut self, patch: &RegisterPatch) -> ControllerResult<()> {
        (**self).set_state(patch)
    }

    fn read_byte(&mut self, address: u32) -> ControllerResult<Option<u8>> {
        (**self).read_byte(address)
    }

    fn read_half_word(&mut self, address: u32) -> ControllerResult<Option<u16>> {
        (**self).read_half_word(address)
    }

    fn read_word(&mut self, address: u32) -> ControllerResult<Option<u32>> {
        (**self).read_word(address)
    }

    fn read_bytes(&mut self, address: u32, len: u32) -> ControllerResult<Option<Vec<u8>>> {
        (**self).read_bytes(address, len)
    }

    fn read_nul_terminated_string(&mut self, address: u32) -> ControllerResult<Option<Vec<u8>>> {
        (**self).read_nul_terminated_string(address)
    }

    fn resolve_symbol(&mut self, address: u32) -> ControllerResult<Option<String>> {
        (**self).resolve_symbol(address)
    }

    fn current_symbol(&mut self) -> ControllerResult<Option<String>> {
        (**self).current_symbol()
    }

    fn symbol_address(&mut self, name: &str) -> ControllerResult<Option<u32>> {
        (**self).symbol_address(name)
    }

    fn set_breakpoint(&mut self, bp: &Breakpoint) -> ControllerResult<()> {
        (**self).set_breakpoint(bp)
    }
}
