//! Lock/RTM/RDTSC tracker (spec.md §4.8): instructions that turn into a
//! sequence point via pre- and post-breakpoints rather than an in-core
//! splice, since their whole purpose is to force a synchronization point
//! rather than to propagate a taint computation. Grounded on
//! original_source's `src/memcheck.cc` handling of `lock`-prefixed
//! instructions, `xbegin`/`xend`, and `rdtsc`/`rdtscp`.

use iced_x86::Mnemonic;

use crate::inst::InstructionBlob;

pub fn claims(insn: &InstructionBlob) -> bool {
    insn.has_lock_prefix()
        || matches!(
            insn.iform(),
            Mnemonic::Rdtsc
                | Mnemonic::Rdtscp
                | Mnemonic::Xbegin
                | Mnemonic::Xend
                | Mnemonic::Xabort
        )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn claims_rdtsc() {
        let rdtsc = InstructionBlob::from_bytes(0x1000, &[0x0f, 0x31]).unwrap();
        assert!(claims(&rdtsc));
        let nop = InstructionBlob::from_bytes(0x1000, &[0x90]).unwrap();
        assert!(!claims(&nop));
    }
}
