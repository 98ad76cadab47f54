//! Translated block (spec.md §3 "Translated block", §4.4). A Block is
//! created once per original address and never mutated afterward; the
//! Terminator it owns may still be mutated as its cache slots fill
//! (spec.md §3 invariant).

use crate::arena::Handle;
use crate::inst::InstructionBlob;
use crate::terminator::Terminator;

pub type BlockHandle = Handle<Block>;

pub struct Block {
    /// Address of this block's first instruction in the *original*
    /// program.
    pub orig_addr: u64,
    /// Address of this block's first instruction in the code pool.
    pub pool_addr: u64,
    /// The rewritten instructions, in original order, excluding the
    /// terminator.
    pub insns: Vec<InstructionBlob>,
    pub terminator: Terminator,
    /// Addresses of any pre-/post-syscall breakpoints bracketing a
    /// syscall instruction inside this block (spec.md §4.4: "Syscall
    /// instructions are not terminators").
    pub syscall_bkpts: Vec<(u64, u64)>,
}

impl Block {
    pub fn new(
        orig_addr: u64,
        pool_addr: u64,
        insns: Vec<InstructionBlob>,
        terminator: Terminator,
        syscall_bkpts: Vec<(u64, u64)>,
    ) -> Block {
        Block {
            orig_addr,
            pool_addr,
            insns,
            terminator,
            syscall_bkpts,
        }
    }

    /// Total size in bytes of the emitted instructions, not including the
    /// terminator.
    pub fn body_len(&self) -> usize {
        self.insns.iter().map(|i| i.len()).sum()
    }
}
