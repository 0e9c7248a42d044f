use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use lockstep_contracts::BRIDGE_MAX_DATAGRAM_BYTES;

use crate::controller::{
    split_symbol_offset, Breakpoint, ControllerError, ExecutionController, Side,
};
use crate::error::{EngineError, EngineResult};
use crate::protocol::{check_response_len, ProtocolError, Request};
use crate::regs::RegisterState;
use crate::report::hex32;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub bind: SocketAddr,
    /// Pins the client address up front instead of trusting the first datagram.
    pub expected_peer: Option<SocketAddr>,
    /// Destination for push-style marshaling; defaults to the pinned peer.
    pub push_addr: Option<SocketAddr>,
    /// 0 blocks forever.
    pub recv_timeout_ms: u64,
}

/// UDP endpoint the candidate's bridge client talks to. Owned by the engine for
/// the whole run.
#[derive(Debug)]
pub struct BridgeServer {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    push_addr: Option<SocketAddr>,
    recv_timeout_ms: u64,
}

impl BridgeServer {
    pub fn bind(cfg: &BridgeConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(cfg.bind)?;
        let timeout = match cfg.recv_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        socket.set_read_timeout(timeout)?;
        Ok(Self {
            socket,
            peer: cfg.expected_peer,
            push_addr: cfg.push_addr,
            recv_timeout_ms: cfg.recv_timeout_ms,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Next datagram from the bridge client. Traffic from any other address is
    /// dropped.
    pub fn recv_datagram(&mut self) -> EngineResult<Vec<u8>> {
        let mut buf = vec![0u8; BRIDGE_MAX_DATAGRAM_BYTES + 1];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(EngineError::NoResponse {
                        endpoint: "bridge client".to_string(),
                        timeout_ms: self.recv_timeout_ms,
                    });
                }
                Err(err) => return Err(err.into()),
            };
            match self.peer {
                Some(peer) if peer != from => {
                    tracing::warn!(%from, %peer, len = n, "dropping datagram from unexpected address");
                    continue;
                }
                Some(_) => {}
                None => {
                    tracing::debug!(%from, "bridge client pinned");
                    self.peer = Some(from);
                }
            }
            return Ok(buf[..n].to_vec());
        }
    }

    pub fn respond(&self, payload: &[u8]) -> EngineResult<()> {
        check_response_len(payload)?;
        let peer = self.peer.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no bridge client to respond to")
        })?;
        self.socket.send_to(payload, peer)?;
        Ok(())
    }

    pub fn push(&self, datagrams: &[Vec<u8>]) -> EngineResult<()> {
        let dest = self.push_addr.or(self.peer).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                "push marshaling needs bridge.push_addr or a pinned client",
            )
        })?;
        for d in datagrams {
            check_response_len(d)?;
            self.socket.send_to(d, dest)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Reply {
    pub payload: Option<Vec<u8>>,
    pub hand_back: bool,
}

impl Reply {
    fn word(v: u32) -> Self {
        Reply {
            payload: Some(v.to_le_bytes().to_vec()),
            hand_back: false,
        }
    }
}

/// State held while the reference sits inside an intercepted call and the
/// candidate runs its own implementation of it.
#[derive(Debug)]
pub struct BridgeSession {
    syscall: String,
    return_address: u32,
    intercepted: RegisterState,
    reference_now: RegisterState,
    reference_returned: bool,
}

impl BridgeSession {
    pub fn open(syscall: String, return_address: u32, intercepted: RegisterState) -> Self {
        Self {
            syscall,
            return_address,
            intercepted,
            reference_now: intercepted,
            reference_returned: false,
        }
    }

    pub fn syscall(&self) -> &str {
        &self.syscall
    }

    pub fn return_address(&self) -> u32 {
        self.return_address
    }

    pub fn intercepted(&self) -> &RegisterState {
        &self.intercepted
    }

    pub fn reference_state(&self) -> &RegisterState {
        &self.reference_now
    }

    /// Runs the reference to the captured return address. Repeated calls are
    /// no-ops once it got there.
    pub fn step_reference_out<R>(&mut self, reference: &mut R) -> EngineResult<RegisterState>
    where
        R: ExecutionController + ?Sized,
    {
        if !self.reference_returned {
            self.reference_now =
                run_to_address(reference, Side::Reference, self.return_address, &self.syscall)?;
            self.reference_returned = true;
        }
        Ok(self.reference_now)
    }

    /// Serves one request. Does not resume the candidate; the caller does that
    /// for requests that park it.
    pub fn handle<R, C>(
        &mut self,
        request: &Request,
        reference: &mut R,
        candidate: &mut C,
    ) -> EngineResult<Reply>
    where
        R: ExecutionController + ?Sized,
        C: ExecutionController + ?Sized,
    {
        let ref_err = |e: ControllerError| EngineError::controller(Side::Reference, e);

        match *request {
            Request::StepOut => {
                self.step_reference_out(reference)?;
                Ok(Reply::default())
            }
            Request::ReadRegister { register } => Ok(Reply::word(self.reference_now.get(register))),
            Request::HandBack => Ok(Reply {
                payload: None,
                hand_back: true,
            }),
            Request::ReadMemory { address, len } => {
                if len as usize > BRIDGE_MAX_DATAGRAM_BYTES {
                    return Err(ProtocolError::ResponseTooLarge { len: len as usize }.into());
                }
                let bytes = reference
                    .read_bytes(address, len)
                    .map_err(ref_err)?
                    .ok_or(EngineError::UnmappedMemory {
                        side: Side::Reference,
                        address,
                        what: "memory range",
                    })?;
                Ok(Reply {
                    payload: Some(bytes),
                    hand_back: false,
                })
            }
            Request::NarrowStringLength { address } => {
                let s = reference
                    .read_nul_terminated_string(address)
                    .map_err(ref_err)?
                    .ok_or(EngineError::UnmappedMemory {
                        side: Side::Reference,
                        address,
                        what: "narrow string",
                    })?;
                Ok(Reply::word(s.len() as u32))
            }
            Request::WideStringLength { address } => {
                let mut units: u32 = 0;
                loop {
                    let at = address.wrapping_add(units.wrapping_mul(2));
                    match reference.read_half_word(at).map_err(ref_err)? {
                        Some(0) => break,
                        Some(_) => units += 1,
                        None => {
                            return Err(EngineError::UnmappedMemory {
                                side: Side::Reference,
                                address: at,
                                what: "wide string",
                            })
                        }
                    }
                }
                Ok(Reply::word(units))
            }
            Request::ProbeMapped { address, side } => {
                let mapped = match side {
                    Side::Reference => reference.read_byte(address).map_err(ref_err)?,
                    Side::Candidate => candidate
                        .read_byte(address)
                        .map_err(|e| EngineError::controller(Side::Candidate, e))?,
                }
                .is_some();
                Ok(Reply::word(u32::from(mapped)))
            }
            Request::TranslateThunk { address } => {
                let symbol = reference
                    .resolve_symbol(address)
                    .map_err(ref_err)?
                    .ok_or(EngineError::UnresolvedSymbol {
                        side: Side::Reference,
                        address,
                    })?;
                let (base, offset) = split_symbol_offset(&symbol);
                let resolved = candidate
                    .symbol_address(base)
                    .map_err(|e| EngineError::controller(Side::Candidate, e))?
                    .ok_or_else(|| EngineError::MissingCandidateSymbol {
                        symbol: symbol.clone(),
                        address,
                    })?;
                tracing::debug!(
                    %symbol,
                    from = %hex32(address),
                    to = %hex32(resolved.wrapping_add(offset)),
                    "translated import thunk"
                );
                Ok(Reply::word(resolved.wrapping_add(offset)))
            }
        }
    }
}

/// Arms a breakpoint at `address` and resumes until the instruction pointer
/// lands on it. Stops elsewhere are skipped; process exit means the side never
/// returned from `syscall`.
pub fn run_to_address<C>(
    ctl: &mut C,
    side: Side,
    address: u32,
    syscall: &str,
) -> EngineResult<RegisterState>
where
    C: ExecutionController + ?Sized,
{
    let missed = |e: ControllerError| {
        if e.is_exit() {
            EngineError::MissedReturn {
                side,
                syscall: syscall.to_string(),
                return_address: address,
                detail: Some(e.to_string()),
            }
        } else {
            EngineError::controller(side, e)
        }
    };

    let now = ctl.fetch_state().map_err(missed)?;
    if now.eip == address {
        return Ok(now);
    }
    ctl.set_breakpoint(&Breakpoint::Address(address))
        .map_err(missed)?;
    loop {
        let state = ctl.continue_to_breakpoint().map_err(missed)?;
        if state.eip == address {
            return Ok(state);
        }
        tracing::debug!(
            %side,
            eip = %hex32(state.eip),
            target = %hex32(address),
            "stray stop before return address"
        );
    }
}
