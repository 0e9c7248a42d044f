use std::collections::BTreeSet;

use crate::regs::{Register, RegisterPatch, RegisterState};

/// Callee-clobbered registers under stdcall, excluding the return register.
const SCRATCH: [Register; 2] = [Register::Ecx, Register::Edx];

/// Reconciles calling-convention scratch registers after a bridged call.
///
/// `ecx` and `edx` always come from the reference. `eax` comes from the
/// reference only for calls listed as void-returning; otherwise the candidate's
/// own return value is kept so a wrong result stays visible.
#[derive(Clone, Debug, Default)]
pub struct MergePolicy {
    void_syscalls: BTreeSet<String>,
}

impl MergePolicy {
    pub fn new<I, S>(void_syscalls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            void_syscalls: void_syscalls.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_void(&self, syscall: &str) -> bool {
        self.void_syscalls.contains(syscall)
    }

    /// Registers copied from the reference for `syscall`.
    pub fn copied_registers(&self, syscall: &str) -> Vec<Register> {
        let mut regs = SCRATCH.to_vec();
        if self.is_void(syscall) {
            regs.insert(0, Register::Eax);
        }
        regs
    }

    pub fn patch_for(&self, syscall: &str, reference: &RegisterState) -> RegisterPatch {
        RegisterPatch::copy_from(reference, &self.copied_registers(syscall))
    }

    pub fn merge(
        &self,
        syscall: &str,
        reference: &RegisterState,
        candidate: &RegisterState,
    ) -> RegisterState {
        candidate.patched(&self.patch_for(syscall, reference))
    }
}
