//! The breakpoint map: a table from pool address to the action the
//! `Patcher` takes when the tracee traps there (spec.md §3 "Breakpoint
//! map", §9 "Dynamic dispatch"). Actions are a closed, tagged enum
//! dispatched by the `Patcher`'s run loop rather than boxed closures or
//! trait objects, matching the terminator encoding in `terminator.rs`
//! and the teacher's own preference for match-driven control flow over
//! `Box<dyn Fn>` tables.

use std::collections::HashMap;

use crate::block::BlockHandle;

/// Which arm of a `DirJcc` a miss breakpoint belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JccArm {
    Taken,
    Fallthru,
}

/// The reason a given pool address carries an `int3`, and what the
/// `Patcher` should do once it traps there (spec.md §4.5, §4.9). Each
/// terminator-resolution variant names the owning `BlockHandle` rather
/// than a separate terminator handle: a `Block`'s `Terminator` lives
/// inline inside the `Block` (itself arena-held), so the block handle is
/// the complete address needed to reach and mutate it.
#[derive(Copy, Clone, Debug)]
pub enum BreakpointAction {
    /// A `DirJmp`'s single arm, not yet patched into a direct jump.
    DirJmpMiss { owner: BlockHandle },
    /// A `DirJcc` arm not yet resolved into a direct jump.
    JccMiss { owner: BlockHandle, arm: JccArm },
    /// An `IndJmp`'s cache-miss fallback.
    IndJmpMiss { owner: BlockHandle },
    /// A `Ret`'s RSB-mismatch fallback.
    RetMiss { owner: BlockHandle },
    /// A `DirCall`'s callee arm, not yet patched into a direct jump.
    DirCallMiss { owner: BlockHandle },
    /// An `IndCall`'s callee-side fallback (always traps; no cache).
    IndCallMiss { owner: BlockHandle },
    /// Shared by `DirCall`/`IndCall`: the trap a call's `ret_cell`
    /// initially points at, hit the first time that particular call site
    /// returns. Resolution is a write to the cell, not a code patch,
    /// since the same cell is read by every future execution of the same
    /// call instruction (spec.md §4.5 "DirCall"/"IndCall").
    CallReturnMiss { owner: BlockHandle },
    /// Placed immediately before a syscall instruction left in place
    /// inside a block body (spec.md §4.4, §4.9 "pre-syscall pass").
    PreSyscall { owner: BlockHandle, orig_addr: u64 },
    /// Placed immediately after that same syscall instruction
    /// (spec.md §4.9 "post-syscall pass").
    PostSyscall { owner: BlockHandle, orig_addr: u64 },
    /// Placed immediately before a body instruction claimed by one of the
    /// `syscall`/`lock_rtm_rdtsc`/`stack` in-core trackers (spec.md §4.8):
    /// these turn the instruction into a sequence point the same way a
    /// syscall does, rather than splicing replacement code in-line.
    TrackerPre {
        owner: BlockHandle,
        orig_addr: u64,
        tracker: &'static str,
    },
    /// Placed immediately after that same claimed instruction.
    TrackerPost {
        owner: BlockHandle,
        orig_addr: u64,
        tracker: &'static str,
    },
    /// The bootstrap breakpoint on the process entry point, replaced by
    /// the first real translation (spec.md §4.2).
    EntryPoint,
    /// A breakpoint placed for test/tooling purposes only
    /// (`--dump-singlestep-bkpts`, `--dump-jcc-bkpts`); carries no
    /// control-flow responsibility, just a diagnostic tag.
    Diagnostic { orig_addr: u64, label: &'static str },
}

/// Map from pool address to the action installed there. One `int3` per
/// address; installing a second breakpoint at an address that already
/// has one is a logic error in the translator, not a runtime
/// possibility that needs to be handled gracefully (spec.md §4.5:
/// "breakpoint addresses are allocated within the pool exactly once").
#[derive(Default)]
pub struct BreakpointMap {
    bkpts: HashMap<u64, BreakpointAction>,
}

impl BreakpointMap {
    pub fn new() -> BreakpointMap {
        BreakpointMap::default()
    }

    pub fn install(&mut self, addr: u64, action: BreakpointAction) {
        let prev = self.bkpts.insert(addr, action);
        debug_assert!(prev.is_none(), "breakpoint already installed at {:#x}", addr);
    }

    pub fn lookup(&self, addr: u64) -> Option<&BreakpointAction> {
        self.bkpts.get(&addr)
    }

    /// Removed once a `DirJcc`/`IndJmp`/etc. arm is resolved and the
    /// `int3` byte is overwritten with real code (spec.md §4.5).
    pub fn remove(&mut self, addr: u64) -> Option<BreakpointAction> {
        self.bkpts.remove(&addr)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.bkpts.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.bkpts.len()
    }
    pub fn is_empty(&self) -> bool {
        self.bkpts.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arena::Arena;
    use crate::block::Block;
    use crate::inst::InstructionBlob;
    use crate::terminator::{Arm, DirJmp, Terminator};

    #[test]
    fn install_then_resolve_removes_entry() {
        let mut blocks: Arena<Block> = Arena::new();
        let block = Block::new(
            0x1000,
            0x6000_0000,
            Vec::<InstructionBlob>::new(),
            Terminator::DirJmp(DirJmp {
                orig_dst: 0x2000,
                dst: Arm::Unresolved { bkpt_addr: 0x6000_0000 },
            }),
            Vec::new(),
        );
        let bh = blocks.push(block);

        let mut bkpts = BreakpointMap::new();
        bkpts.install(
            0x6000_0010,
            BreakpointAction::PreSyscall {
                owner: bh,
                orig_addr: 0x1010,
            },
        );
        assert!(bkpts.contains(0x6000_0010));
        assert!(bkpts.remove(0x6000_0010).is_some());
        assert!(!bkpts.contains(0x6000_0010));
    }
}
