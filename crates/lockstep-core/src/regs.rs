use std::fmt;

use serde::{Deserialize, Serialize};

/// General-purpose registers in canonical field order.
///
/// The order is part of the bridge wire contract: opcode 1 addresses registers
/// by their index in [`Register::ALL`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Register {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Eip,
    Esp,
    Ebp,
}

impl Register {
    pub const ALL: [Register; 9] = [
        Register::Eax,
        Register::Ebx,
        Register::Ecx,
        Register::Edx,
        Register::Esi,
        Register::Edi,
        Register::Eip,
        Register::Esp,
        Register::Ebp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Register::Eax => "eax",
            Register::Ebx => "ebx",
            Register::Ecx => "ecx",
            Register::Edx => "edx",
            Register::Esi => "esi",
            Register::Edi => "edi",
            Register::Eip => "eip",
            Register::Esp => "esp",
            Register::Ebp => "ebp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Register::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Register::ALL.get(usize::from(index)).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the general-purpose register set at one instruction boundary.
///
/// Equality is exact and field-wise. Snapshots are never edited in place; use
/// [`RegisterState::patched`] to derive a new one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterState {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub eip: u32,
    pub esp: u32,
    pub ebp: u32,
}

impl RegisterState {
    pub fn get(&self, reg: Register) -> u32 {
        match reg {
            Register::Eax => self.eax,
            Register::Ebx => self.ebx,
            Register::Ecx => self.ecx,
            Register::Edx => self.edx,
            Register::Esi => self.esi,
            Register::Edi => self.edi,
            Register::Eip => self.eip,
            Register::Esp => self.esp,
            Register::Ebp => self.ebp,
        }
    }

    pub fn patched(&self, patch: &RegisterPatch) -> RegisterState {
        let mut out = *self;
        for &(reg, value) in patch.entries() {
            let slot = match reg {
                Register::Eax => &mut out.eax,
                Register::Ebx => &mut out.ebx,
                Register::Ecx => &mut out.ecx,
                Register::Edx => &mut out.edx,
                Register::Esi => &mut out.esi,
                Register::Edi => &mut out.edi,
                Register::Eip => &mut out.eip,
                Register::Esp => &mut out.esp,
                Register::Ebp => &mut out.ebp,
            };
            *slot = value;
        }
        out
    }

    /// Registers whose values differ, in canonical order.
    pub fn differing(&self, other: &RegisterState) -> Vec<Register> {
        Register::ALL
            .into_iter()
            .filter(|&r| self.get(r) != other.get(r))
            .collect()
    }

    /// Builds a state from `(name, value)` pairs; every register must appear.
    pub fn from_named<'a, I>(pairs: I) -> Result<RegisterState, Register>
    where
        I: IntoIterator<Item = (&'a str, u32)>,
    {
        let mut seen = [None::<u32>; 9];
        for (name, value) in pairs {
            if let Some(reg) = Register::parse(name) {
                seen[usize::from(reg.index())] = Some(value);
            }
        }
        let mut patch = RegisterPatch::default();
        for reg in Register::ALL {
            match seen[usize::from(reg.index())] {
                Some(v) => patch.set(reg, v),
                None => return Err(reg),
            }
        }
        Ok(RegisterState::default().patched(&patch))
    }
}

/// "Replace fields X, Y, Z, keep the rest."
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterPatch {
    entries: Vec<(Register, u32)>,
}

impl RegisterPatch {
    pub fn full(state: &RegisterState) -> Self {
        Self {
            entries: Register::ALL.into_iter().map(|r| (r, state.get(r))).collect(),
        }
    }

    /// Copies `regs` from `source`.
    pub fn copy_from(source: &RegisterState, regs: &[Register]) -> Self {
        let mut out = Self::default();
        for &r in regs {
            out.set(r, source.get(r));
        }
        out
    }

    pub fn set(&mut self, reg: Register, value: u32) {
        match self.entries.iter_mut().find(|(r, _)| *r == reg) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((reg, value)),
        }
    }

    pub fn entries(&self) -> &[(Register, u32)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
