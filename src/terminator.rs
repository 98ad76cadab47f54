//! The six control-transfer terminator state machines (spec.md §3
//! "Terminator", §4.5). Each variant holds exactly the state spec.md §4.5
//! describes. A Terminator lives inline inside its owning `Block` rather
//! than in a separate arena; the orchestration that resolves breakpoints
//! into direct jumps (looking up or translating destination blocks,
//! flushing bytes to the tracee) lives in `Patcher`, which reaches a
//! Terminator by looking up the owning `BlockHandle` in the block arena
//! (spec.md §9 "Cyclic ownership", "Dynamic dispatch").
//!
//! Grounded on original_source's `src/dbi/block-term.hh`/`.cc` (by far
//! the largest single file in the original) for the exact state-machine
//! layouts, and on `src/block-term.hh` for the simpler non-dbi variant
//! this reimplementation follows more closely. The trampoline byte
//! builders below (`build_*`) are the single source of truth for both the
//! real bytes emitted into the pool and the worst-case size the block
//! translator must reserve for them: `worst_case_size` calls the same
//! builder a second time with dummy addresses rather than keeping a
//! hand-maintained count in sync with the encoders by hand.

use crate::encode::{
    add_rsp_imm8, cmp_r64_mem_disp8, jcc_rel32, jmp_r64, jne_rel32, mov_mem_disp8_r64,
    mov_r64_imm64, mov_r64_mem_disp8, push_r64, rel32_for, INT3, POPFQ, PUSHFQ,
};
use crate::usermem::ScratchLayout;

/// Number of cached destinations in an indirect-jump terminator's inline
/// direct-mapped cache (spec.md §3 "IndJmp<N>").
pub const IND_JMP_CACHE_SIZE: usize = 4;

/// The only two GPRs every generated trampoline is allowed to clobber
/// (r10, r11: caller-saved across a SysV `call` and never used to pass a
/// 6th integer argument, unlike r9). An indirect branch whose original
/// target lives in one of these two registers cannot be translated, since
/// the trampoline would stomp its own comparison value before reading it.
pub const SCRATCH_REG_A: u8 = 10;
pub const SCRATCH_REG_B: u8 = 11;

pub fn is_excluded_scratch_reg(reg: u8) -> bool {
    reg == SCRATCH_REG_A || reg == SCRATCH_REG_B
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PredictionMode {
    None,
    IClass,
    IForm,
    Direction,
    LastIclass,
}

impl std::str::FromStr for PredictionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<PredictionMode, String> {
        match s {
            "none" => Ok(PredictionMode::None),
            "iclass" => Ok(PredictionMode::IClass),
            "iform" => Ok(PredictionMode::IForm),
            "dir" | "direction" => Ok(PredictionMode::Direction),
            "last_iclass" => Ok(PredictionMode::LastIclass),
            other => Err(format!("unknown prediction mode: {}", other)),
        }
    }
}

/// Whether a DirJcc's arm (or any other single-destination arm) is still
/// a breakpoint or has been resolved into a direct jump to a known pool
/// address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Arm {
    Unresolved { bkpt_addr: u64 },
    Resolved { pool_dst: u64 },
}

pub struct DirJmp {
    pub orig_dst: u64,
    pub dst: Arm,
}

pub struct DirJcc {
    /// The original condition code nibble from the `7x`/`0f 8x` opcode.
    pub cc: u8,
    pub orig_taken: u64,
    pub orig_fallthru: u64,
    pub taken: Arm,
    pub fallthru: Arm,
    pub prediction_mode: PredictionMode,
    /// Rolling buffer of the last few taken/not-taken decisions, for
    /// tooling (spec.md §4.5).
    pub decision_history: Vec<bool>,
}

impl DirJcc {
    pub fn record_decision(&mut self, taken: bool) {
        const HISTORY_LEN: usize = 16;
        self.decision_history.push(taken);
        if self.decision_history.len() > HISTORY_LEN {
            self.decision_history.remove(0);
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct IndJmpSlot {
    pub orig: u64,
    pub pool: u64,
    pub valid: bool,
}

pub struct IndJmp {
    pub cache: [IndJmpSlot; IND_JMP_CACHE_SIZE],
    pub eviction_index: usize,
    pub miss_bkpt_addr: u64,
    /// Address of the 4-slot `(orig, pool)` data table the trampoline
    /// compares against; cache updates are plain memory writes here, not
    /// code patches (spec.md §4.5).
    pub table_addr: u64,
    /// Raw GPR encoding the original `jmp r64` decoded its target from.
    pub target_reg: u8,
}

impl IndJmp {
    pub fn lookup(&self, orig: u64) -> Option<u64> {
        self.cache
            .iter()
            .find(|s| s.valid && s.orig == orig)
            .map(|s| s.pool)
    }

    /// Install `(orig, pool)` into the round-robin eviction slot,
    /// advancing the index (spec.md §4.5). Returns the slot index so the
    /// caller can mirror the write into the tracee-resident data table.
    pub fn install(&mut self, orig: u64, pool: u64) -> usize {
        let idx = self.eviction_index;
        self.cache[idx] = IndJmpSlot {
            orig,
            pool,
            valid: true,
        };
        self.eviction_index = (self.eviction_index + 1) % IND_JMP_CACHE_SIZE;
        idx
    }

    /// Byte offset of slot `idx` within the data table (16 bytes/slot: an
    /// 8-byte `orig` followed by an 8-byte `pool`).
    pub fn slot_offset(idx: usize) -> u64 {
        (idx * 16) as u64
    }
}

pub struct Ret {
    pub trampoline_addr: u64,
    pub miss_bkpt_addr: u64,
}

pub struct DirCall {
    pub orig_callee: u64,
    pub callee: Arm,
    pub orig_return: u64,
    pub ret: Arm,
    /// Address of the 8-byte cell the trampoline loads the current
    /// return destination from on every call; `CallReturnMiss`
    /// resolution is a plain write to this cell, never a code patch,
    /// since many different calls may share one block's DirCall arm.
    pub ret_cell_addr: u64,
}

pub struct IndCall {
    pub orig_return: u64,
    pub ret: Arm,
    pub ret_cell_addr: u64,
    pub miss_bkpt_addr: u64,
    pub target_reg: u8,
}

pub enum Terminator {
    DirJmp(DirJmp),
    DirJcc(DirJcc),
    IndJmp(IndJmp),
    Ret(Ret),
    DirCall(DirCall),
    IndCall(IndCall),
}

impl Terminator {
    /// Worst-case byte budget the Block translator must reserve in the
    /// pool for this terminator kind. Derived by invoking the same
    /// trampoline builder used for real emission with dummy (zero)
    /// addresses, so this can never drift from what `build_terminator`
    /// actually writes.
    pub fn worst_case_size(kind: &TerminatorKind) -> usize {
        match kind {
            TerminatorKind::DirJmp => build_dirjmp().bytes.len(),
            TerminatorKind::DirJcc => build_dirjcc(0, 0).bytes.len(),
            TerminatorKind::IndJmp => build_indjmp(0, 0).bytes.len(),
            TerminatorKind::Ret => build_ret(0, 0).bytes.len(),
            TerminatorKind::DirCall => build_dircall(0, 0, 0).bytes.len(),
            TerminatorKind::IndCall => build_indcall(0, 0, 0).bytes.len(),
        }
    }

    pub fn kind(&self) -> TerminatorKind {
        match self {
            Terminator::DirJmp(_) => TerminatorKind::DirJmp,
            Terminator::DirJcc(_) => TerminatorKind::DirJcc,
            Terminator::IndJmp(_) => TerminatorKind::IndJmp,
            Terminator::Ret(_) => TerminatorKind::Ret,
            Terminator::DirCall(_) => TerminatorKind::DirCall,
            Terminator::IndCall(_) => TerminatorKind::IndCall,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TerminatorKind {
    DirJmp,
    DirJcc,
    IndJmp,
    Ret,
    DirCall,
    IndCall,
}

// ---- trampoline byte builders -----------------------------------------
//
// Every builder below returns the bytes to write at `term_pool_addr`
// together with the offsets of whatever breakpoint(s)/data cell it
// contains. None of these execute the tracee's original terminator
// instruction; each reconstructs its effect (RSB push/pop, cache
// compare, direct/indirect dispatch) from registers and the fixed
// scratch/table cells, so `Patcher::handle_stop`'s int3-only dispatch
// never needs a second, singlestep-based trap path.

pub struct DirJmpLayout {
    pub bytes: Vec<u8>,
    pub miss_off: u64,
}

/// A DirJmp's only arm starts as a single registered breakpoint over the
/// whole 5-byte `jmp rel32` slot it will be patched into once resolved.
pub fn build_dirjmp() -> DirJmpLayout {
    DirJmpLayout {
        bytes: vec![INT3; 5],
        miss_off: 0,
    }
}

pub struct DirJccLayout {
    pub bytes: Vec<u8>,
    pub taken_off: u64,
    pub fallthru_off: u64,
}

/// `jcc cc, L0; jmp FALLTHRU; L0: jmp TAKEN` (spec.md §4.5). The `jcc`
/// itself is real code reachable from the first byte (comment: a
/// breakpoint must own the first reachable byte, or real code must); the
/// two arms start as breakpoint-sized `jmp rel32` slots.
pub fn build_dirjcc(term_pool_addr: u64, cc: u8) -> DirJccLayout {
    let mut b = Vec::with_capacity(16);
    let l0 = term_pool_addr + 11;
    let rel = rel32_for(term_pool_addr, 6, l0);
    b.extend_from_slice(&jcc_rel32(cc, rel));
    let fallthru_off = b.len() as u64;
    b.extend_from_slice(&[INT3; 5]);
    let taken_off = b.len() as u64;
    b.extend_from_slice(&[INT3; 5]);
    DirJccLayout {
        bytes: b,
        taken_off,
        fallthru_off,
    }
}

pub struct IndJmpLayout {
    pub bytes: Vec<u8>,
    pub miss_off: u64,
    pub table_addr: u64,
}

const IND_JMP_SLOT_SIZE: usize = 20; // cmp(5) + jne(6) + mov(5) + popfq(1) + jmp(3)

/// Save flags, materialize the data-table address, then for each cache
/// slot compare the (untouched) target register against the slot's
/// cached original and jump to its cached pool destination on a hit;
/// falling through all slots traps at `miss_off` with the target
/// register still holding the real original destination (spec.md §4.5
/// "IndJmp").
pub fn build_indjmp(term_pool_addr: u64, target_reg: u8) -> IndJmpLayout {
    let code_len = 1 + 10 + IND_JMP_CACHE_SIZE * IND_JMP_SLOT_SIZE + 1 + 1;
    let table_addr = term_pool_addr + code_len as u64;

    let mut b = Vec::with_capacity(code_len);
    b.push(PUSHFQ);
    b.extend_from_slice(&mov_r64_imm64(SCRATCH_REG_B, table_addr));

    for i in 0..IND_JMP_CACHE_SIZE {
        let slot_disp = IndJmp::slot_offset(i) as i8;
        let slot_start = term_pool_addr + b.len() as u64;
        b.extend_from_slice(&cmp_r64_mem_disp8(target_reg, SCRATCH_REG_B, slot_disp));
        let next_slot_addr = slot_start + IND_JMP_SLOT_SIZE as u64;
        let jne_site = term_pool_addr + b.len() as u64;
        b.extend_from_slice(&jne_rel32(rel32_for(jne_site, 6, next_slot_addr)));
        b.extend_from_slice(&mov_r64_mem_disp8(SCRATCH_REG_A, SCRATCH_REG_B, slot_disp + 8));
        b.push(POPFQ);
        b.extend_from_slice(&jmp_r64(SCRATCH_REG_A));
    }
    b.push(POPFQ);
    let miss_off = b.len() as u64;
    b.push(INT3);
    debug_assert_eq!(b.len(), code_len);

    IndJmpLayout {
        bytes: b,
        miss_off,
        table_addr,
    }
}

pub struct RetLayout {
    pub bytes: Vec<u8>,
    pub miss_off: u64,
}

/// Peek the return address without popping it, compare against the
/// depth-1 software RSB's cached original, and either jump to the cached
/// pool destination (restoring flags and popping the real 8 bytes first)
/// or fall to the miss trap with the real return address left in
/// `SCRATCH_REG_A` and the stack already popped, as if a real `ret` had
/// executed (spec.md §4.5 "Ret"; the depth-1 RSB is a documented scope
/// reduction from a full ring, see DESIGN.md).
pub fn build_ret(term_pool_addr: u64, scratch_addr: u64) -> RetLayout {
    let mut b = Vec::new();
    b.push(PUSHFQ);
    b.extend_from_slice(&mov_r64_mem_disp8(SCRATCH_REG_A, 4, 8)); // r10 = [rsp+8] (past pushfq)
    b.extend_from_slice(&mov_r64_imm64(SCRATCH_REG_B, scratch_addr));
    b.extend_from_slice(&cmp_r64_mem_disp8(
        SCRATCH_REG_A,
        SCRATCH_REG_B,
        ScratchLayout::RSB_ORIG_OFF as i8,
    ));
    let jne_off = b.len();
    b.extend_from_slice(&[0u8; 6]); // patched below once the miss offset is known

    // hit path
    b.extend_from_slice(&mov_r64_mem_disp8(
        SCRATCH_REG_A,
        SCRATCH_REG_B,
        ScratchLayout::RSB_POOL_OFF as i8,
    ));
    b.push(POPFQ);
    b.extend_from_slice(&add_rsp_imm8(8));
    b.extend_from_slice(&jmp_r64(SCRATCH_REG_A));

    // miss path
    let miss_code_off = b.len();
    b.push(POPFQ);
    b.extend_from_slice(&add_rsp_imm8(8));
    let miss_off = b.len() as u64;
    b.push(INT3);

    let jne_site = term_pool_addr + jne_off as u64;
    let miss_dst = term_pool_addr + miss_code_off as u64;
    let rel = rel32_for(jne_site, 6, miss_dst);
    b[jne_off..jne_off + 6].copy_from_slice(&jne_rel32(rel));

    RetLayout { bytes: b, miss_off }
}

pub struct DirCallLayout {
    pub bytes: Vec<u8>,
    pub callee_miss_off: u64,
    pub ret_miss_off: u64,
    pub ret_cell_off: u64,
}

// mov r10,imm64(orig_return); push r10; mov r11,imm64(scratch); mov
// [r11+RSB_ORIG_OFF],r10; mov r11,imm64(ret_cell); mov r10,[r11]; mov
// r11,imm64(scratch); mov [r11+RSB_POOL_OFF],r10
const CALL_RSB_PUSH_LEN: usize = 10 + 2 + 10 + 5 + 10 + 5 + 10 + 5; // 57

/// Really push `orig_return` onto the tracee's stack (so a later real
/// `ret` executed anywhere beneath this call still finds its return
/// address where it expects it), mirror the pair into the depth-1 RSB
/// scratch cells, then jump to the (direct, statically known) callee — a
/// 5-byte breakpoint slot patched once the callee is first translated,
/// same as `DirJmp` (spec.md §4.5 "DirCall").
pub fn build_dircall(term_pool_addr: u64, scratch_addr: u64, orig_return: u64) -> DirCallLayout {
    const CODE_LEN: usize = CALL_RSB_PUSH_LEN + 5 + 1;
    let ret_cell_addr = term_pool_addr + CODE_LEN as u64;

    let mut b = Vec::with_capacity(CODE_LEN + 8);
    b.extend_from_slice(&mov_r64_imm64(SCRATCH_REG_A, orig_return));
    b.extend_from_slice(&push_r64(SCRATCH_REG_A));
    b.extend_from_slice(&mov_r64_imm64(SCRATCH_REG_B, scratch_addr));
    b.extend_from_slice(&mov_mem_disp8_r64(
        SCRATCH_REG_B,
        ScratchLayout::RSB_ORIG_OFF as i8,
        SCRATCH_REG_A,
    ));
    b.extend_from_slice(&mov_r64_imm64(SCRATCH_REG_B, ret_cell_addr));
    b.extend_from_slice(&mov_r64_mem_disp8(SCRATCH_REG_A, SCRATCH_REG_B, 0));
    b.extend_from_slice(&mov_r64_imm64(SCRATCH_REG_B, scratch_addr));
    b.extend_from_slice(&mov_mem_disp8_r64(
        SCRATCH_REG_B,
        ScratchLayout::RSB_POOL_OFF as i8,
        SCRATCH_REG_A,
    ));
    let callee_miss_off = b.len() as u64;
    b.extend_from_slice(&[INT3; 5]);
    let ret_miss_off = b.len() as u64;
    b.push(INT3);
    debug_assert_eq!(b.len(), CODE_LEN);

    let ret_cell_off = b.len() as u64;
    let ret_miss_addr = term_pool_addr + ret_miss_off;
    b.extend_from_slice(&ret_miss_addr.to_le_bytes());

    DirCallLayout {
        bytes: b,
        callee_miss_off,
        ret_miss_off,
        ret_cell_off,
    }
}

pub struct IndCallLayout {
    pub bytes: Vec<u8>,
    pub callee_miss_off: u64,
    pub ret_miss_off: u64,
    pub ret_cell_off: u64,
}

/// Same real stack push and RSB mirroring as `DirCall`, but the callee is
/// a register-operand indirect call: no cache, always traps to
/// `callee_miss_off` so the `Patcher` can read the real target out of the
/// (untouched) target register (spec.md §4.5 "IndCall").
pub fn build_indcall(term_pool_addr: u64, scratch_addr: u64, orig_return: u64) -> IndCallLayout {
    const CODE_LEN: usize = CALL_RSB_PUSH_LEN + 1 + 1;
    let ret_cell_addr = term_pool_addr + CODE_LEN as u64;

    let mut b = Vec::with_capacity(CODE_LEN + 8);
    b.extend_from_slice(&mov_r64_imm64(SCRATCH_REG_A, orig_return));
    b.extend_from_slice(&push_r64(SCRATCH_REG_A));
    b.extend_from_slice(&mov_r64_imm64(SCRATCH_REG_B, scratch_addr));
    b.extend_from_slice(&mov_mem_disp8_r64(
        SCRATCH_REG_B,
        ScratchLayout::RSB_ORIG_OFF as i8,
        SCRATCH_REG_A,
    ));
    b.extend_from_slice(&mov_r64_imm64(SCRATCH_REG_B, ret_cell_addr));
    b.extend_from_slice(&mov_r64_mem_disp8(SCRATCH_REG_A, SCRATCH_REG_B, 0));
    b.extend_from_slice(&mov_r64_imm64(SCRATCH_REG_B, scratch_addr));
    b.extend_from_slice(&mov_mem_disp8_r64(
        SCRATCH_REG_B,
        ScratchLayout::RSB_POOL_OFF as i8,
        SCRATCH_REG_A,
    ));
    let callee_miss_off = b.len() as u64;
    b.push(INT3);
    let ret_miss_off = b.len() as u64;
    b.push(INT3);
    debug_assert_eq!(b.len(), CODE_LEN);

    let ret_cell_off = b.len() as u64;
    let ret_miss_addr = term_pool_addr + ret_miss_off;
    b.extend_from_slice(&ret_miss_addr.to_le_bytes());

    IndCallLayout {
        bytes: b,
        callee_miss_off,
        ret_miss_off,
        ret_cell_off,
    }
}

/// Decide which arms of a fresh `DirJcc` should start pre-resolved,
/// given the configured prediction mode and (when available) measured
/// branch statistics. `none` resolves neither; `direction` resolves both
/// arms for a backward branch and neither for a forward one; `iclass`
/// and `iform` are table-driven elsewhere and fall back to `none` here
/// (that table lives with the Block translator, which has the iclass
/// context) ; `last_iclass` likewise depends on translator-side context.
pub fn should_preresolve(mode: PredictionMode, is_backward: bool) -> (bool, bool) {
    match mode {
        PredictionMode::None => (false, false),
        PredictionMode::Direction => {
            if is_backward {
                (true, true)
            } else {
                (false, false)
            }
        }
        PredictionMode::IClass | PredictionMode::IForm | PredictionMode::LastIclass => {
            (false, false)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ind_jmp_cache_round_robins() {
        let mut ij = IndJmp {
            cache: Default::default(),
            eviction_index: 0,
            miss_bkpt_addr: 0xdead,
            table_addr: 0x9000,
            target_reg: 3,
        };
        for i in 0..(IND_JMP_CACHE_SIZE as u64 + 1) {
            ij.install(0x1000 + i, 0x2000 + i);
        }
        // first slot should have been evicted and replaced
        assert_eq!(ij.lookup(0x1000), None);
        assert_eq!(ij.lookup(0x1000 + IND_JMP_CACHE_SIZE as u64), Some(0x2000 + IND_JMP_CACHE_SIZE as u64));
    }

    #[test]
    fn direction_mode_resolves_backward_branches_only() {
        assert_eq!(should_preresolve(PredictionMode::Direction, true), (true, true));
        assert_eq!(should_preresolve(PredictionMode::Direction, false), (false, false));
        assert_eq!(should_preresolve(PredictionMode::None, true), (false, false));
    }

    #[test]
    fn decision_history_caps_length() {
        let mut jcc = DirJcc {
            cc: 4,
            orig_taken: 0,
            orig_fallthru: 0,
            taken: Arm::Unresolved { bkpt_addr: 1 },
            fallthru: Arm::Unresolved { bkpt_addr: 2 },
            prediction_mode: PredictionMode::None,
            decision_history: Vec::new(),
        };
        for i in 0..32 {
            jcc.record_decision(i % 2 == 0);
        }
        assert_eq!(jcc.decision_history.len(), 16);
    }

    #[test]
    fn dirjmp_trampoline_is_fully_breakpointable() {
        let l = build_dirjmp();
        assert_eq!(l.bytes.len(), 5);
        assert_eq!(l.bytes[0], INT3);
        assert_eq!(l.miss_off, 0);
    }

    #[test]
    fn dirjcc_trampoline_jcc_targets_taken_arm() {
        let term = 0x7000_0000u64;
        let l = build_dirjcc(term, 0x4);
        assert_eq!(l.bytes[0], 0x0f);
        assert_eq!(l.bytes[1], 0x80 | 0x4);
        let rel = i32::from_le_bytes(l.bytes[2..6].try_into().unwrap()) as i64;
        assert_eq!(term as i64 + 6 + rel, term as i64 + l.taken_off as i64);
        assert_eq!(l.fallthru_off, 6);
        assert_eq!(l.taken_off, 11);
    }

    #[test]
    fn indjmp_miss_leaves_target_register_untouched_by_construction() {
        // The builder never emits an instruction writing target_reg, only
        // reading it (`cmp`); this just checks the trap is the final byte.
        let l = build_indjmp(0x8000_0000, 3);
        assert_eq!(l.bytes[l.miss_off as usize], INT3);
        assert_eq!(l.table_addr, 0x8000_0000 + l.miss_off + 1);
    }

    #[test]
    fn ret_trampoline_miss_path_pops_stack_once() {
        let l = build_ret(0x9000_0000, 0xa000_0000);
        assert_eq!(l.bytes[l.miss_off as usize], INT3);
        // worst_case_size must agree with a direct build
        assert_eq!(Terminator::worst_case_size(&TerminatorKind::Ret), l.bytes.len());
    }

    #[test]
    fn dircall_ret_cell_starts_pointing_at_its_own_miss_trap() {
        let term = 0x1000_0000u64;
        let l = build_dircall(term, 0x2000_0000, 0x3000_0000);
        let cell = u64::from_le_bytes(l.bytes[l.ret_cell_off as usize..l.ret_cell_off as usize + 8].try_into().unwrap());
        assert_eq!(cell, term + l.ret_miss_off);
        assert_eq!(l.bytes[l.callee_miss_off as usize], INT3);
    }

    #[test]
    fn indcall_has_no_callee_cache_always_traps() {
        let l = build_indcall(0x1000, 0x2000, 0x3000);
        assert_eq!(l.bytes[l.callee_miss_off as usize], INT3);
        assert_ne!(l.callee_miss_off, l.ret_miss_off);
    }

    #[test]
    fn excludes_scratch_registers_from_indirect_targets() {
        assert!(is_excluded_scratch_reg(SCRATCH_REG_A));
        assert!(is_excluded_scratch_reg(SCRATCH_REG_B));
        assert!(!is_excluded_scratch_reg(0));
    }
}
