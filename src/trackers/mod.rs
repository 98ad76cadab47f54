//! Instruction-class hooks consulted in a fixed order during block
//! emission (spec.md §3, §4.8). Each tracker claims a class of
//! instructions and, if it claims one, the translator emits the
//! tracker's instrumentation instead of the default as-is copy. The
//! in-core variant of each of stack/call-ret/jcc is authoritative
//! (spec.md §9's resolved open question, recorded in DESIGN.md); the
//! breakpoint-based variant of each survives only as a `#[cfg(test)]`
//! oracle used by the checksum-agreement property (spec.md §8
//! property 7).

pub mod call_ret_tracker;
pub mod jcc_tracker;
pub mod lock_rtm_rdtsc_tracker;
pub mod stack_tracker;
pub mod syscall_tracker;

use crate::inst::InstructionBlob;

/// Fixed order trackers are consulted in during block emission (spec.md
/// §4.8: "consulted in a fixed order"). First claim wins.
pub const TRACKER_ORDER: &[&str] = &[
    "syscall",
    "lock_rtm_rdtsc",
    "call_ret",
    "jcc",
    "stack",
];

/// Which tracker, if any, claims `insn` — used by the block translator to
/// decide whether to divert from the default emit-as-is path. Returns the
/// tracker name from `TRACKER_ORDER`, or `None` if no tracker claims it.
pub fn claim(insn: &InstructionBlob) -> Option<&'static str> {
    if syscall_tracker::claims(insn) {
        return Some("syscall");
    }
    if lock_rtm_rdtsc_tracker::claims(insn) {
        return Some("lock_rtm_rdtsc");
    }
    if call_ret_tracker::claims(insn) {
        return Some("call_ret");
    }
    if jcc_tracker::claims(insn) {
        return Some("jcc");
    }
    if stack_tracker::claims(insn) {
        return Some("stack");
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn syscall_claims_before_stack() {
        let syscall = InstructionBlob::from_bytes(0x1000, &[0x0f, 0x05]).unwrap();
        assert_eq!(claim(&syscall), Some("syscall"));
    }
}
