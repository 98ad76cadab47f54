//! Call/Ret tracker (spec.md §4.8): fills the shadow-stack area opened by
//! a CALL and closed by a RET, leaving the 8-byte return-address slot
//! itself untouched (the return address is architecturally meaningful,
//! never uninitialized data). Grounded on original_source's
//! `src/memcheck.cc` call/ret handling.

use crate::decoder::IClass;
use crate::error::Result;
use crate::inst::InstructionBlob;
use crate::remote_ptr::RemotePtr;
use crate::tracee::Tracee;
use crate::usermem::ScratchLayout;

/// Always false in practice: `DirCall`/`IndCall`/`RetNear` are terminator
/// iclasses in this architecture and never reach the block translator's
/// body-instruction tracker dispatch (they end the block before `claim()`
/// is consulted). Call/ret accounting happens at terminator-resolution
/// time instead (`Patcher::resolve_dircall_miss` and friends), via
/// `on_call`/`on_ret` below. This still names the classes the tracker is
/// conceptually responsible for.
pub fn claims(insn: &InstructionBlob) -> bool {
    matches!(insn.iclass(), IClass::DirCall | IClass::IndCall | IClass::RetNear)
}

/// On a CALL, the pushed return address occupies `[new_sp, new_sp+8)`;
/// fill bytes below that (the newly exposed region between the old and
/// new SP, minus the 8-byte return slot) with the current fill byte.
pub fn on_call(tracee: &mut Tracee, scratch: &ScratchLayout, old_sp: u64, new_sp: u64) -> Result<()> {
    debug_assert!(new_sp < old_sp, "CALL must grow the stack downward");
    let ret_slot_end = new_sp + 8;
    if ret_slot_end >= old_sp {
        return Ok(());
    }
    let fill_byte = tracee.read_val_mem(scratch.fill_byte_ptr())?;
    let len = (old_sp - ret_slot_end) as usize;
    tracee.write_bytes(RemotePtr::new(ret_slot_end), &vec![fill_byte; len])
}

/// On a RET, the popped return-address slot `[old_sp, old_sp+8)` becomes
/// part of the caller's frame again; fill the remainder of the region the
/// stack pointer moved across.
pub fn on_ret(tracee: &mut Tracee, scratch: &ScratchLayout, old_sp: u64, new_sp: u64) -> Result<()> {
    debug_assert!(new_sp > old_sp, "RET must grow the stack upward");
    let consumed_end = old_sp + 8;
    if new_sp <= consumed_end {
        return Ok(());
    }
    let fill_byte = tracee.read_val_mem(scratch.fill_byte_ptr())?;
    let len = (new_sp - consumed_end) as usize;
    tracee.write_bytes(RemotePtr::new(consumed_end), &vec![fill_byte; len])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn claims_call_and_ret_only() {
        let call = InstructionBlob::from_bytes(0x1000, &[0xe8, 0, 0, 0, 0]).unwrap();
        assert!(claims(&call));
        let ret = InstructionBlob::from_bytes(0x1000, &[0xc3]).unwrap();
        assert!(claims(&ret));
        let nop = InstructionBlob::from_bytes(0x1000, &[0x90]).unwrap();
        assert!(!claims(&nop));
    }
}
