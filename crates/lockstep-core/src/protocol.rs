//! Bridge request framing.
//!
//! Layout: `[total_len, opcode, args...]`, arguments little-endian. The length
//! byte covers the whole datagram and is checked before the opcode is looked at.

use std::fmt;

use lockstep_contracts::BRIDGE_MAX_DATAGRAM_BYTES;
use thiserror::Error;

use crate::controller::Side;
use crate::regs::Register;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    StepOut = 0,
    ReadRegister = 1,
    HandBack = 2,
    ReadMemory = 3,
    NarrowStringLength = 4,
    WideStringLength = 5,
    ProbeMapped = 6,
    TranslateThunk = 7,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Opcode::StepOut,
            1 => Opcode::ReadRegister,
            2 => Opcode::HandBack,
            3 => Opcode::ReadMemory,
            4 => Opcode::NarrowStringLength,
            5 => Opcode::WideStringLength,
            6 => Opcode::ProbeMapped,
            7 => Opcode::TranslateThunk,
            _ => return None,
        })
    }

    fn arg_len(self) -> usize {
        match self {
            Opcode::StepOut | Opcode::HandBack => 0,
            Opcode::ReadRegister => 1,
            Opcode::NarrowStringLength | Opcode::WideStringLength | Opcode::TranslateThunk => 4,
            Opcode::ReadMemory | Opcode::ProbeMapped => 8,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty datagram")]
    Empty,

    #[error("declared length {declared} does not match datagram length {actual}")]
    LengthMismatch { declared: u8, actual: usize },

    #[error("datagram carries no opcode")]
    MissingOpcode,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("opcode {opcode} expects {expected} argument bytes, got {actual}")]
    BadArguments {
        opcode: Opcode,
        expected: usize,
        actual: usize,
    },

    #[error("register index {0} is outside the canonical register set")]
    BadRegisterIndex(u8),

    #[error("side selector {0} is neither 0 (reference) nor 1 (candidate)")]
    BadSide(u32),

    #[error("response of {len} bytes does not fit in one datagram")]
    ResponseTooLarge { len: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    StepOut,
    ReadRegister { register: Register },
    HandBack,
    ReadMemory { address: u32, len: u32 },
    NarrowStringLength { address: u32 },
    WideStringLength { address: u32 },
    ProbeMapped { address: u32, side: Side },
    TranslateThunk { address: u32 },
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

impl Request {
    pub fn parse(datagram: &[u8]) -> Result<Request, ProtocolError> {
        let Some(&declared) = datagram.first() else {
            return Err(ProtocolError::Empty);
        };
        if usize::from(declared) != datagram.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: datagram.len(),
            });
        }
        let Some(&raw_op) = datagram.get(1) else {
            return Err(ProtocolError::MissingOpcode);
        };
        let opcode = Opcode::from_u8(raw_op).ok_or(ProtocolError::UnknownOpcode(raw_op))?;

        let args = &datagram[2..];
        if args.len() != opcode.arg_len() {
            return Err(ProtocolError::BadArguments {
                opcode,
                expected: opcode.arg_len(),
                actual: args.len(),
            });
        }

        Ok(match opcode {
            Opcode::StepOut => Request::StepOut,
            Opcode::ReadRegister => Request::ReadRegister {
                register: Register::from_index(args[0])
                    .ok_or(ProtocolError::BadRegisterIndex(args[0]))?,
            },
            Opcode::HandBack => Request::HandBack,
            Opcode::ReadMemory => Request::ReadMemory {
                address: le_u32(&args[0..4]),
                len: le_u32(&args[4..8]),
            },
            Opcode::NarrowStringLength => Request::NarrowStringLength {
                address: le_u32(args),
            },
            Opcode::WideStringLength => Request::WideStringLength {
                address: le_u32(args),
            },
            Opcode::ProbeMapped => Request::ProbeMapped {
                address: le_u32(&args[0..4]),
                side: match le_u32(&args[4..8]) {
                    0 => Side::Reference,
                    1 => Side::Candidate,
                    other => return Err(ProtocolError::BadSide(other)),
                },
            },
            Opcode::TranslateThunk => Request::TranslateThunk {
                address: le_u32(args),
            },
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Request::StepOut => Opcode::StepOut,
            Request::ReadRegister { .. } => Opcode::ReadRegister,
            Request::HandBack => Opcode::HandBack,
            Request::ReadMemory { .. } => Opcode::ReadMemory,
            Request::NarrowStringLength { .. } => Opcode::NarrowStringLength,
            Request::WideStringLength { .. } => Opcode::WideStringLength,
            Request::ProbeMapped { .. } => Opcode::ProbeMapped,
            Request::TranslateThunk { .. } => Opcode::TranslateThunk,
        }
    }

    /// The candidate parks after issuing these and must be resumed by the engine.
    pub fn resumes_candidate(&self) -> bool {
        !matches!(self, Request::ReadRegister { .. } | Request::HandBack)
    }

    /// Client-side encoding, used by tests and tooling that speak for the candidate.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8, self.opcode() as u8];
        match self {
            Request::StepOut | Request::HandBack => {}
            Request::ReadRegister { register } => out.push(register.index()),
            Request::ReadMemory { address, len } => {
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
            }
            Request::NarrowStringLength { address }
            | Request::WideStringLength { address }
            | Request::TranslateThunk { address } => out.extend_from_slice(&address.to_le_bytes()),
            Request::ProbeMapped { address, side } => {
                out.extend_from_slice(&address.to_le_bytes());
                let sel: u32 = match side {
                    Side::Reference => 0,
                    Side::Candidate => 1,
                };
                out.extend_from_slice(&sel.to_le_bytes());
            }
        }
        out[0] = out.len() as u8;
        out
    }
}

pub fn check_response_len(payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() > BRIDGE_MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::ResponseTooLarge { len: payload.len() });
    }
    Ok(())
}
