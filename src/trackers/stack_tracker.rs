//! Stack tracker (spec.md §4.8): on each SP-modifying instruction other
//! than PUSH/POP, fills the byte range the stack pointer moved across
//! with the tracee's current fill byte, within a fixed shadow-stack
//! window. Grounded on original_source's `src/memcheck.cc`'s handling of
//! `sub/add rsp` and `src/memcheck-vars.hh` for the scratch `fill_ptr`
//! cell this reads from.

use crate::error::Result;
use crate::inst::InstructionBlob;
use crate::remote_ptr::RemotePtr;
use crate::tracee::Tracee;
use crate::usermem::ScratchLayout;

/// Upper bound on a single SP delta this tracker will fill; larger jumps
/// (e.g. a large `alloca`) are clamped to avoid pathological fill sizes,
/// matching the original's fixed shadow-stack window.
pub const SHADOW_WINDOW: u64 = 4096;

pub fn claims(insn: &InstructionBlob) -> bool {
    insn.touches_rsp() && !insn.is_push_or_pop()
}

/// The in-core authoritative implementation: given the SP before and
/// after the instruction executed, fill the stack-growth region with the
/// current fill byte. Real in-core code performs this via a spliced
/// `REP STOS` sequence reading `fill_ptr` from the scratch page; this is
/// the driver-side equivalent effect, invoked by the round driver
/// immediately after singlestepping a claimed instruction.
pub fn apply(tracee: &mut Tracee, scratch: &ScratchLayout, old_sp: u64, new_sp: u64) -> Result<()> {
    let fill_byte = tracee.read_val_mem(scratch.fill_byte_ptr())?;
    if new_sp >= old_sp {
        // Stack shrank (popped off): nothing to poison.
        return Ok(());
    }
    let delta = (old_sp - new_sp).min(SHADOW_WINDOW);
    let buf = vec![fill_byte; delta as usize];
    tracee.write_bytes(RemotePtr::new(new_sp), &buf)
}

/// Breakpoint-based oracle: same effect, computed without touching the
/// scratch cell directly (mirrors the original's pre/post-breakpoint
/// variant), used only to cross-check the in-core path in tests.
#[cfg(test)]
pub fn bkpt_oracle_delta(old_sp: u64, new_sp: u64) -> u64 {
    if new_sp >= old_sp {
        0
    } else {
        (old_sp - new_sp).min(SHADOW_WINDOW)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn claims_sub_rsp_not_push() {
        // 48 83 ec 08 = sub rsp, 8
        let sub = InstructionBlob::from_bytes(0x1000, &[0x48, 0x83, 0xec, 0x08]).unwrap();
        assert!(claims(&sub));
        // 50 = push rax
        let push = InstructionBlob::from_bytes(0x1000, &[0x50]).unwrap();
        assert!(!claims(&push));
    }

    #[test]
    fn oracle_delta_clamped_to_window() {
        assert_eq!(bkpt_oracle_delta(0x2000, 0x1000), 0x1000);
        let huge_old = SHADOW_WINDOW * 10;
        assert_eq!(bkpt_oracle_delta(huge_old, 0), SHADOW_WINDOW);
        assert_eq!(bkpt_oracle_delta(0x1000, 0x2000), 0);
    }
}
