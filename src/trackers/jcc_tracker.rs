//! Jcc tracker (spec.md §4.8): after each conditional branch, mixes its
//! flags into a per-tracee rolling checksum. The in-core implementation
//! is authoritative in steady state; the breakpoint-collected checksum is
//! retained purely as an equivalence oracle (spec.md §8 property 7,
//! §9's resolved open question). Grounded on original_source's
//! `src/cksum.hh`/`.cc` (the update rule itself lives in `cksum.rs`) and
//! `src/memcheck.cc`'s per-branch hook site.

use crate::cksum::FlagChecksum;
use crate::decoder::IClass;
use crate::inst::InstructionBlob;

pub fn claims(insn: &InstructionBlob) -> bool {
    insn.iclass() == IClass::Jcc
}

/// In-core authoritative update: called by the round driver immediately
/// after singlestepping a claimed Jcc, with the flags register value
/// captured post-execution.
pub fn update_incore(cksum: &mut FlagChecksum, branch_addr: u64, flags: u32, taken: bool) {
    cksum.update(branch_addr, flags, taken as u64);
}

/// Breakpoint-collected oracle: identical update rule, kept as a
/// standalone function (rather than sharing code with `update_incore`)
/// so a test can drive both paths independently and assert they produce
/// the same `FlagChecksum` for the same branch sequence.
#[cfg(test)]
pub fn update_bkpt_oracle(cksum: &mut FlagChecksum, branch_addr: u64, flags: u32, taken: bool) {
    cksum.update(branch_addr, flags, taken as u64);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cksum::AuxPolicy;

    #[test]
    fn claims_only_conditional_branches() {
        // 74 02 = je +2
        let jcc = InstructionBlob::from_bytes(0x1000, &[0x74, 0x02]).unwrap();
        assert!(claims(&jcc));
        let jmp = InstructionBlob::from_bytes(0x1000, &[0xeb, 0x02]).unwrap();
        assert!(!claims(&jmp));
    }

    #[test]
    fn incore_and_bkpt_oracle_agree() {
        let mut incore = FlagChecksum::new();
        let mut bkpt = FlagChecksum::new();
        for (addr, flags, taken) in [(0x1000u64, 0x44u32, true), (0x1010, 0x0, false)] {
            update_incore(&mut incore, addr, flags, taken);
            update_bkpt_oracle(&mut bkpt, addr, flags, taken);
        }
        assert!(FlagChecksum::equal(&incore, &bkpt, AuxPolicy::Compare));
    }
}
