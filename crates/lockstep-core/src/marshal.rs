//! Push-style marshaling for candidate shims that expect the reference result to
//! be sent to them rather than pulled through the request protocol.
//!
//! Each syscall name maps to one [`MarshalStrategy`]; unknown names are no-ops.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::controller::{ExecutionController, Side};
use crate::error::{EngineError, EngineResult};
use crate::regs::RegisterState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoWidth {
    U16,
    U32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum BufferSource {
    /// NUL-terminated string whose address is the call's return value.
    ReturnedPointer,
    /// NUL-terminated string stored at `esp + offset`.
    Stack { offset: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomMarshal {
    /// Double-NUL terminated block of NUL-separated strings at `eax`.
    EnvironmentBlock,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarshalStrategy {
    #[default]
    NoOp,
    FixedWidthEcho {
        width: EchoWidth,
    },
    LengthPrefixedBuffer {
        source: BufferSource,
    },
    Custom {
        handler: CustomMarshal,
    },
}

impl MarshalStrategy {
    pub fn is_noop(&self) -> bool {
        matches!(self, MarshalStrategy::NoOp)
    }

    /// Datagrams to push, in order, given the reference state after the call
    /// returned.
    pub fn encode<C>(&self, after: &RegisterState, reference: &mut C) -> EngineResult<Vec<Vec<u8>>>
    where
        C: ExecutionController + ?Sized,
    {
        match *self {
            MarshalStrategy::NoOp => Ok(Vec::new()),
            MarshalStrategy::FixedWidthEcho { width } => Ok(vec![match width {
                EchoWidth::U16 => (after.eax as u16).to_le_bytes().to_vec(),
                EchoWidth::U32 => after.eax.to_le_bytes().to_vec(),
            }]),
            MarshalStrategy::LengthPrefixedBuffer { source } => {
                let (address, what) = match source {
                    BufferSource::ReturnedPointer => (after.eax, "returned string"),
                    BufferSource::Stack { offset } => {
                        (after.esp.wrapping_add(offset), "stack string")
                    }
                };
                let mut text = read_reference_string(reference, address, what)?;
                text.push(0);

                let mut out = Vec::with_capacity(3);
                if source == BufferSource::ReturnedPointer {
                    out.push(after.eax.to_le_bytes().to_vec());
                }
                out.push((text.len() as u32).to_le_bytes().to_vec());
                out.push(text);
                Ok(out)
            }
            MarshalStrategy::Custom {
                handler: CustomMarshal::EnvironmentBlock,
            } => {
                let mut entries: Vec<Vec<u8>> = Vec::new();
                let mut cursor = after.eax;
                loop {
                    let entry = read_reference_string(reference, cursor, "environment block")?;
                    if entry.is_empty() {
                        break;
                    }
                    cursor = cursor.wrapping_add(entry.len() as u32 + 1);
                    entries.push(entry);
                }
                let mut block = entries.join(&0u8);
                block.extend_from_slice(&[0, 0]);

                Ok(vec![
                    after.eax.to_le_bytes().to_vec(),
                    (block.len() as u32).to_le_bytes().to_vec(),
                    block,
                ])
            }
        }
    }
}

fn read_reference_string<C>(reference: &mut C, address: u32, what: &'static str) -> EngineResult<Vec<u8>>
where
    C: ExecutionController + ?Sized,
{
    reference
        .read_nul_terminated_string(address)
        .map_err(|e| EngineError::controller(Side::Reference, e))?
        .ok_or(EngineError::UnmappedMemory {
            side: Side::Reference,
            address,
            what,
        })
}

/// Syscall name → strategy, looked up once per bridge entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarshalRegistry {
    by_name: BTreeMap<String, MarshalStrategy>,
}

impl MarshalRegistry {
    pub fn insert(&mut self, syscall: impl Into<String>, strategy: MarshalStrategy) {
        self.by_name.insert(syscall.into(), strategy);
    }

    pub fn lookup(&self, syscall: &str) -> MarshalStrategy {
        self.by_name.get(syscall).copied().unwrap_or_default()
    }

    /// True when any entry needs a push destination.
    pub fn needs_push(&self) -> bool {
        self.by_name.values().any(|s| !s.is_noop())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl FromIterator<(String, MarshalStrategy)> for MarshalRegistry {
    fn from_iter<T: IntoIterator<Item = (String, MarshalStrategy)>>(iter: T) -> Self {
        Self {
            by_name: iter.into_iter().collect(),
        }
    }
}
