#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use lockstep_core::{
    Breakpoint, ControllerError, ControllerResult, ExecutionController, RegisterPatch,
    RegisterState,
};

/// What one `step()` / `continue_to_breakpoint()` call does.
#[derive(Clone, Debug)]
pub enum Stop {
    At(RegisterState),
    /// Sends the datagrams from the fake's client socket, then stops.
    SendThenAt(Vec<Vec<u8>>, RegisterState),
    Exit,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub steps: u32,
    pub continues: u32,
    pub set_state: u32,
}

pub struct FakeController {
    pub state: RegisterState,
    pub memory: BTreeMap<u32, u8>,
    pub symbols: BTreeMap<u32, String>,
    pub breakpoints: BTreeSet<Breakpoint>,
    pub patches: Vec<RegisterPatch>,
    pub calls: Calls,
    pub read_only: bool,
    steps: VecDeque<Stop>,
    continues: VecDeque<Stop>,
    client: Option<(UdpSocket, SocketAddr)>,
}

impl FakeController {
    pub fn new(state: RegisterState) -> Self {
        Self {
            state,
            memory: BTreeMap::new(),
            symbols: BTreeMap::new(),
            breakpoints: BTreeSet::new(),
            patches: Vec::new(),
            calls: Calls::default(),
            read_only: false,
            steps: VecDeque::new(),
            continues: VecDeque::new(),
            client: None,
        }
    }

    pub fn on_step(mut self, stop: Stop) -> Self {
        self.steps.push_back(stop);
        self
    }

    pub fn on_continue(mut self, stop: Stop) -> Self {
        self.continues.push_back(stop);
        self
    }

    pub fn with_symbol(mut self, address: u32, name: &str) -> Self {
        self.symbols.insert(address, name.to_string());
        self
    }

    pub fn with_word(mut self, address: u32, value: u32) -> Self {
        self.poke(address, &value.to_le_bytes());
        self
    }

    pub fn with_bytes(mut self, address: u32, bytes: &[u8]) -> Self {
        self.poke(address, bytes);
        self
    }

    pub fn poke(&mut self, address: u32, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(address + i as u32, *b);
        }
    }

    /// Gives the fake a UDP client socket that talks to `server`.
    pub fn connect(mut self, server: SocketAddr) -> Self {
        let sock = UdpSocket::bind("127.0.0.1:0").expect("bind fake client");
        sock.set_read_timeout(Some(Duration::from_secs(2)))
            .expect("client timeout");
        self.client = Some((sock, server));
        self
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(|(s, _)| s.local_addr().expect("local addr"))
    }

    /// Next response the engine sent to this fake's client socket.
    pub fn recv_response(&self) -> Vec<u8> {
        let (sock, _) = self.client.as_ref().expect("fake has no client socket");
        let mut buf = vec![0u8; 70_000];
        let n = sock.recv(&mut buf).expect("response datagram");
        buf.truncate(n);
        buf
    }

    fn play(&mut self, stop: Option<Stop>) -> ControllerResult<RegisterState> {
        match stop {
            Some(Stop::At(s)) => {
                self.state = s;
                Ok(s)
            }
            Some(Stop::SendThenAt(datagrams, s)) => {
                let (sock, server) = self.client.as_ref().expect("fake has no client socket");
                for d in &datagrams {
                    sock.send_to(d, *server).expect("send request");
                }
                self.state = s;
                Ok(s)
            }
            Some(Stop::Exit) | None => Err(ControllerError::Exited { detail: None }),
        }
    }
}

impl ExecutionController for FakeController {
    fn step(&mut self) -> ControllerResult<RegisterState> {
        self.calls.steps += 1;
        let stop = self.steps.pop_front();
        self.play(stop)
    }

    fn continue_to_breakpoint(&mut self) -> ControllerResult<RegisterState> {
        self.calls.continues += 1;
        let stop = self.continues.pop_front();
        self.play(stop)
    }

    fn fetch_state(&mut self) -> ControllerResult<RegisterState> {
        Ok(self.state)
    }

    fn set_state(&mut self, patch: &RegisterPatch) -> ControllerResult<()> {
        self.calls.set_state += 1;
        if self.read_only {
            return Err(ControllerError::Unsupported { op: "set_state" });
        }
        self.state = self.state.patched(patch);
        self.patches.push(patch.clone());
        Ok(())
    }

    fn read_byte(&mut self, address: u32) -> ControllerResult<Option<u8>> {
        Ok(self.memory.get(&address).copied())
    }

    fn resolve_symbol(&mut self, address: u32) -> ControllerResult<Option<String>> {
        Ok(self.symbols.get(&address).cloned())
    }

    fn symbol_address(&mut self, name: &str) -> ControllerResult<Option<u32>> {
        Ok(self
            .symbols
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(a, _)| *a))
    }

    fn set_breakpoint(&mut self, bp: &Breakpoint) -> ControllerResult<()> {
        self.breakpoints.insert(bp.clone());
        Ok(())
    }
}

pub fn regs(eip: u32, esp: u32) -> RegisterState {
    RegisterState {
        eax: 0,
        ebx: 0x0030_0000,
        ecx: 0x11,
        edx: 0x22,
        esi: 0x33,
        edi: 0x44,
        eip,
        esp,
        ebp: esp + 0x40,
    }
}
