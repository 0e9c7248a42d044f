use lockstep_modes::SyncMode;

use crate::bridge::{run_to_address, BridgeServer, BridgeSession};
use crate::controller::{ControllerError, ControllerResult, ExecutionController, Side};
use crate::error::{EngineError, EngineResult};
use crate::marshal::MarshalRegistry;
use crate::merge::MergePolicy;
use crate::protocol::Request;
use crate::regs::{Register, RegisterState};
use crate::report::{hex32, SyscallRecord};

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub mode: SyncMode,
    /// Reaching this call in syscall-level mode switches to cycle-accurate mode.
    pub mode_switch_trigger: Option<String>,
    pub merge: MergePolicy,
    pub marshal: MarshalRegistry,
    pub max_iterations: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Divergence {
    pub iteration: u64,
    pub mode: SyncMode,
    pub reference: RegisterState,
    pub candidate: RegisterState,
}

impl Divergence {
    pub fn differing(&self) -> Vec<Register> {
        self.reference.differing(&self.candidate)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Both processes exited in the same iteration without a discrepancy.
    Completed,
    IterationLimit,
    Divergence(Divergence),
}

#[derive(Debug)]
pub struct RunSummary {
    pub outcome: EngineResult<RunOutcome>,
    pub iterations: u64,
    pub final_mode: SyncMode,
    pub benign_differences: u64,
    pub syscalls: Vec<SyscallRecord>,
}

/// Loop-carried state. The mode lives here, not in a global, and only the bridge
/// procedure changes it.
#[derive(Clone, Copy, Debug)]
struct LoopState {
    mode: SyncMode,
    iteration: u64,
    last: Option<(RegisterState, RegisterState)>,
}

#[derive(Debug, Default)]
struct Tally {
    benign_differences: u64,
    syscalls: Vec<SyscallRecord>,
}

/// Drives the reference and candidate in lockstep and decides whether they
/// diverged.
pub struct Engine<R, C> {
    reference: R,
    candidate: C,
    server: BridgeServer,
    config: EngineConfig,
}

impl<R, C> Engine<R, C>
where
    R: ExecutionController,
    C: ExecutionController,
{
    pub fn new(reference: R, candidate: C, server: BridgeServer, config: EngineConfig) -> Self {
        Self {
            reference,
            candidate,
            server,
            config,
        }
    }

    pub fn server(&self) -> &BridgeServer {
        &self.server
    }

    pub fn into_parts(self) -> (R, C, BridgeServer) {
        (self.reference, self.candidate, self.server)
    }

    pub fn run(&mut self) -> RunSummary {
        let mut state = LoopState {
            mode: self.config.mode,
            iteration: 0,
            last: None,
        };
        let mut tally = Tally::default();

        let outcome = self.run_loop(&mut state, &mut tally).map_err(|err| match state.last {
            Some((r, c)) => err.with_states(r, c),
            None => err,
        });

        match &outcome {
            Ok(RunOutcome::Divergence(d)) => {
                tracing::warn!(iteration = d.iteration, registers = ?d.differing(), "discrepancy detected");
            }
            Ok(o) => tracing::info!(
                outcome = ?o,
                iterations = state.iteration,
                benign = tally.benign_differences,
                "run finished"
            ),
            Err(err) => tracing::error!(kind = err.kind(), "{err}"),
        }

        RunSummary {
            outcome,
            iterations: state.iteration,
            final_mode: state.mode,
            benign_differences: tally.benign_differences,
            syscalls: tally.syscalls,
        }
    }

    fn run_loop(&mut self, state: &mut LoopState, tally: &mut Tally) -> EngineResult<RunOutcome> {
        loop {
            if self
                .config
                .max_iterations
                .is_some_and(|max| state.iteration >= max)
            {
                return Ok(RunOutcome::IterationLimit);
            }
            state.iteration += 1;

            let Some((mut reference, mut candidate)) = self.advance(state.mode)? else {
                return Ok(RunOutcome::Completed);
            };
            state.last = Some((reference, candidate));
            tracing::info!(
                target: "lockstep::trace",
                iteration = state.iteration,
                eip = %hex32(reference.eip),
                "step"
            );

            if reference == candidate {
                continue;
            }

            if reference.eip != candidate.eip {
                let (r, c, mode) = self.bridge(reference, state.mode, state.iteration, tally)?;
                reference = r;
                candidate = c;
                state.mode = mode;
                state.last = Some((reference, candidate));
                if reference == candidate {
                    continue;
                }
            }

            if reference.eip == candidate.eip && self.symbol_valued(&reference, &candidate)? {
                tally.benign_differences += 1;
                continue;
            }

            return Ok(RunOutcome::Divergence(Divergence {
                iteration: state.iteration,
                mode: state.mode,
                reference,
                candidate,
            }));
        }
    }

    /// Reference first, then candidate. `None` when both processes exited.
    fn advance(&mut self, mode: SyncMode) -> EngineResult<Option<(RegisterState, RegisterState)>> {
        match advance_one(&mut self.reference, mode) {
            Ok(reference) => {
                let candidate = advance_one(&mut self.candidate, mode)
                    .map_err(|e| EngineError::controller(Side::Candidate, e))?;
                Ok(Some((reference, candidate)))
            }
            Err(ref_err) if ref_err.is_exit() => match advance_one(&mut self.candidate, mode) {
                Err(cand_err) if cand_err.is_exit() => Ok(None),
                Err(cand_err) => Err(EngineError::controller(Side::Candidate, cand_err)),
                Ok(_) => Err(EngineError::controller(Side::Reference, ref_err)),
            },
            Err(ref_err) => Err(EngineError::controller(Side::Reference, ref_err)),
        }
    }

    /// True when every differing field holds a value that names a symbol on
    /// either side, i.e. the two images keep equivalent stubs at different
    /// addresses. This can hide a real bug whose wrong value happens to land on
    /// a symbol.
    fn symbol_valued(
        &mut self,
        reference: &RegisterState,
        candidate: &RegisterState,
    ) -> EngineResult<bool> {
        for reg in reference.differing(candidate) {
            let cand_val = candidate.get(reg);
            let ref_val = reference.get(reg);

            let symbol = match self
                .candidate
                .resolve_symbol(cand_val)
                .map_err(|e| EngineError::controller(Side::Candidate, e))?
            {
                Some(s) => s,
                None => match self
                    .reference
                    .resolve_symbol(ref_val)
                    .map_err(|e| EngineError::controller(Side::Reference, e))?
                {
                    Some(s) => s,
                    None => return Ok(false),
                },
            };
            tracing::debug!(
                register = %reg,
                reference = %hex32(ref_val),
                candidate = %hex32(cand_val),
                %symbol,
                "function pointer representation difference"
            );
        }
        Ok(true)
    }

    fn bridge(
        &mut self,
        intercepted: RegisterState,
        mode: SyncMode,
        iteration: u64,
        tally: &mut Tally,
    ) -> EngineResult<(RegisterState, RegisterState, SyncMode)> {
        let ref_err = |e: ControllerError| EngineError::controller(Side::Reference, e);
        let cand_err = |e: ControllerError| EngineError::controller(Side::Candidate, e);

        let syscall = self
            .reference
            .resolve_symbol(intercepted.eip)
            .map_err(ref_err)?
            .ok_or(EngineError::UnresolvedSymbol {
                side: Side::Reference,
                address: intercepted.eip,
            })?;
        let return_address = self
            .reference
            .read_word(intercepted.esp)
            .map_err(ref_err)?
            .ok_or(EngineError::UnmappedMemory {
                side: Side::Reference,
                address: intercepted.esp,
                what: "return address",
            })?;

        tracing::info!(%syscall, return_address = %hex32(return_address), "system call detected");
        tally.syscalls.push(SyscallRecord {
            iteration,
            name: syscall.clone(),
            return_address: hex32(return_address),
        });

        let next_mode = match &self.config.mode_switch_trigger {
            Some(trigger) if *trigger == syscall && !mode.is_cycle_accurate() => {
                tracing::info!(%syscall, "switching to cycle-accurate mode after this call");
                mode.switched()
            }
            _ => mode,
        };

        let mut session = BridgeSession::open(syscall, return_address, intercepted);

        // A pushed result stands in for the request protocol: the shim consumes
        // the datagrams and returns on its own without handing back.
        let strategy = self.config.marshal.lookup(session.syscall());
        if strategy.is_noop() {
            self.serve_requests(&mut session)?;
        } else {
            let after = session.step_reference_out(&mut self.reference)?;
            let datagrams = strategy.encode(&after, &mut self.reference)?;
            tracing::debug!(?strategy, count = datagrams.len(), "pushing marshaled result");
            self.server.push(&datagrams)?;
        }

        let reference = session.step_reference_out(&mut self.reference)?;
        let candidate = run_to_address(
            &mut self.candidate,
            Side::Candidate,
            session.return_address(),
            session.syscall(),
        )?;

        let patch = self.config.merge.patch_for(session.syscall(), &reference);
        let merged = candidate.patched(&patch);
        self.candidate.set_state(&patch).map_err(cand_err)?;

        Ok((reference, merged, next_mode))
    }

    /// Resumes the candidate and answers its requests until it hands back.
    fn serve_requests(&mut self, session: &mut BridgeSession) -> EngineResult<()> {
        let cand_err = |e: ControllerError| EngineError::controller(Side::Candidate, e);

        self.candidate.continue_to_breakpoint().map_err(cand_err)?;
        loop {
            let datagram = self.server.recv_datagram()?;
            let request = Request::parse(&datagram)?;
            tracing::debug!(?request, "bridge request");

            let reply = session.handle(&request, &mut self.reference, &mut self.candidate)?;
            if let Some(payload) = &reply.payload {
                self.server.respond(payload)?;
            }
            if reply.hand_back {
                return Ok(());
            }
            if request.resumes_candidate() {
                self.candidate.continue_to_breakpoint().map_err(cand_err)?;
            }
        }
    }
}

fn advance_one<C: ExecutionController>(ctl: &mut C, mode: SyncMode) -> ControllerResult<RegisterState> {
    match mode {
        SyncMode::Cycle => ctl.step(),
        // The breakpoint sits on the import thunk; one more step lands in the
        // side's own implementation, where the two instruction pointers differ.
        SyncMode::Syscall => {
            ctl.continue_to_breakpoint()?;
            ctl.step()
        }
    }
}
