//! Syscall tracker (spec.md §4.8): the primary sequence point. Claiming
//! here only marks the instruction; the actual argument-level taint
//! checking lives in `syscall_checker` (spec.md §4.9), run by the
//! MemCheck driver once both tracees have trapped at the bracketing
//! breakpoints the block translator installed.

use crate::decoder::IClass;
use crate::inst::InstructionBlob;

pub fn claims(insn: &InstructionBlob) -> bool {
    insn.iclass() == IClass::Syscall
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn claims_syscall_only() {
        let syscall = InstructionBlob::from_bytes(0x1000, &[0x0f, 0x05]).unwrap();
        assert!(claims(&syscall));
        let nop = InstructionBlob::from_bytes(0x1000, &[0x90]).unwrap();
        assert!(!claims(&nop));
    }
}
