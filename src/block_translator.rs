//! Decode → rewrite → emit a basic block, link its terminator, record
//! breakpoints (spec.md §3 "Translated block", §4.4). Grounded on
//! original_source's `src/dbi/block.cc` and `src/block.cc` for emission
//! order: stage bytes in a local buffer, flush once, build the
//! terminator last with full knowledge of the block's final pool range.

use std::collections::HashMap;

use crate::arena::Arena;
use crate::block::{Block, BlockHandle};
use crate::block_pool::BlockPool;
use crate::breakpoint::{BreakpointAction, BreakpointMap, JccArm};
use crate::decoder::IClass;
use crate::encode::INT3;
use crate::error::{Error, Result};
use crate::inst::InstructionBlob;
use crate::kernel_abi::MAX_INSN_LEN;
use crate::remote_ptr::RemotePtr;
use crate::terminator::{
    self, build_dircall, build_dirjcc, build_dirjmp, build_indcall, build_indjmp, build_ret, Arm,
    DirCall, DirJcc, DirJmp, IndCall, IndJmp, IndJmpSlot, PredictionMode, Ret, Terminator,
    TerminatorKind,
};
use crate::trackers;
use crate::tracee::Tracee;

/// An original-program instruction the translator decided to bracket with
/// pre/post breakpoints instead of copying verbatim (spec.md §4.8): a
/// syscall, or any instruction one of the in-core trackers claims.
struct Bracket {
    /// Index into `insns` of the bracketed instruction.
    insn_idx: usize,
    tracker: &'static str,
}

/// A bracketed instruction's resolved pool addresses, once the pool
/// range is known (pass 2 of `translate`).
struct ResolvedBracket {
    orig_addr: u64,
    pre_addr: u64,
    post_addr: u64,
    tracker: &'static str,
}

/// Everything about the terminator instruction the decode loop needs to
/// hand off to terminator construction, captured before its bytes are
/// discarded (losing this was the bug: the original control-transfer
/// instruction must still inform the emitted trampoline).
struct TermInfo {
    kind: TerminatorKind,
    cc: u8,
    /// Direct branch/call target; unused for Ret/IndJmp/IndCall.
    direct_target: u64,
    /// Address immediately following the terminator in the original
    /// program — the callee's return site for DirCall/IndCall, the
    /// not-taken arm for DirJcc.
    fallthrough: u64,
    indirect_target_reg: u8,
}

/// Decodes original bytes and emits the rewritten instruction stream plus
/// terminator for one basic block. Owns a cache of already-read original
/// bytes so re-translating the same address twice (spec.md §8 property 2,
/// "block idempotence") never re-`pread`s them — this folds in
/// original_source's `src/dbi/romcache.hh`, whose sole purpose was
/// exactly that.
pub struct BlockTranslator {
    orig_byte_cache: HashMap<u64, Vec<u8>>,
    pub prediction_mode: PredictionMode,
}

impl BlockTranslator {
    pub fn new(prediction_mode: PredictionMode) -> BlockTranslator {
        BlockTranslator {
            orig_byte_cache: HashMap::new(),
            prediction_mode,
        }
    }

    fn read_orig_window(&mut self, tracee: &mut Tracee, addr: u64) -> Result<Vec<u8>> {
        if let Some(cached) = self.orig_byte_cache.get(&addr) {
            return Ok(cached.clone());
        }
        let bytes = tracee.read_vec(RemotePtr::new(addr), MAX_INSN_LEN)?;
        self.orig_byte_cache.insert(addr, bytes.clone());
        Ok(bytes)
    }

    /// Translate the basic block starting at `orig_addr`, reserving and
    /// writing pool bytes, and return the new `Block` pushed into
    /// `blocks`. `int3`s for unresolved terminator arms and
    /// syscall/tracker brackets are registered into `bkpts`.
    pub fn translate(
        &mut self,
        tracee: &mut Tracee,
        pool: &mut BlockPool,
        blocks: &mut Arena<Block>,
        bkpts: &mut BreakpointMap,
        scratch_addr: u64,
        orig_addr: u64,
    ) -> Result<BlockHandle> {
        let mut insns: Vec<InstructionBlob> = Vec::new();
        let mut brackets: Vec<Bracket> = Vec::new();
        let mut cur = orig_addr;
        let mut term_info: Option<TermInfo> = None;

        loop {
            let window = self.read_orig_window(tracee, cur)?;
            let blob = InstructionBlob::from_bytes(cur, &window).ok_or_else(|| {
                Error::TranslationFailure {
                    addr: cur,
                    reason: "decoder rejected instruction bytes".to_string(),
                }
            })?;
            let len = blob.len() as u64;
            let iclass = blob.iclass();

            if let Some(kind) = terminator_kind_of(iclass) {
                let next_addr = cur + len;
                let reg = blob.indirect_target_reg().unwrap_or(0);
                if matches!(kind, TerminatorKind::IndJmp | TerminatorKind::IndCall)
                    && (blob.indirect_target_reg().is_none() || terminator::is_excluded_scratch_reg(reg))
                {
                    return Err(Error::TranslationFailure {
                        addr: cur,
                        reason: "indirect branch target register is unsupported or reserved for the trampoline".to_string(),
                    });
                }
                term_info = Some(TermInfo {
                    kind,
                    cc: blob.cc().unwrap_or(0),
                    direct_target: blob.branch_target().unwrap_or(next_addr),
                    fallthrough: next_addr,
                    indirect_target_reg: reg,
                });
                break;
            }

            if let Some(tracker) = trackers::claim(&blob) {
                brackets.push(Bracket {
                    insn_idx: insns.len(),
                    tracker,
                });
            }
            insns.push(blob);
            cur += len;
        }
        let term_info = term_info.expect("loop only exits via a terminator iclass");

        // Pass 1: total body length, including a leading and trailing
        // INT3 for every bracketed instruction (spec.md §4.4, §4.8).
        let mut body_len = 0u64;
        for (idx, insn) in insns.iter().enumerate() {
            let bracketed = brackets.iter().any(|b| b.insn_idx == idx);
            if bracketed {
                body_len += 2;
            }
            body_len += insn.len() as u64;
        }

        let term_budget = Terminator::worst_case_size(&term_info.kind) as u64;
        let total = (body_len + term_budget) as usize;
        let pool_addr = pool.reserve(total)?;

        // Pass 2: relocate each instruction to its final pool address and
        // stage bytes, recording the pool address of every bracket INT3
        // so breakpoints can be installed once the owning block exists.
        let mut staged: Vec<u8> = Vec::with_capacity(total);
        let mut resolved_syscall_bkpts = Vec::new();
        let mut resolved_brackets: Vec<ResolvedBracket> = Vec::new();
        for (idx, insn) in insns.iter_mut().enumerate() {
            let orig_pc = insn.pc();
            let bracket = brackets.iter().find(|b| b.insn_idx == idx);
            if bracket.is_some() {
                staged.push(INT3);
            }
            let pre_addr = pool_addr.as_u64() + staged.len() as u64 - 1;
            let insn_pool_addr = pool_addr.as_u64() + staged.len() as u64;
            insn.relocate(insn_pool_addr);
            staged.extend_from_slice(insn.bytes());
            if let Some(b) = bracket {
                let post_addr = pool_addr.as_u64() + staged.len() as u64;
                staged.push(INT3);
                if b.tracker == "syscall" {
                    resolved_syscall_bkpts.push((orig_pc, orig_pc));
                }
                resolved_brackets.push(ResolvedBracket {
                    orig_addr: orig_pc,
                    pre_addr,
                    post_addr,
                    tracker: b.tracker,
                });
            }
        }
        debug_assert_eq!(staged.len() as u64, body_len);

        let term_pool_addr = pool_addr.as_u64() + staged.len() as u64;

        // The block is pushed with a placeholder terminator first so the
        // miss breakpoints installed below can name its real
        // `BlockHandle` (spec.md §4.4); the terminator is filled in
        // immediately after, before control ever returns to the caller,
        // so no other code observes the placeholder.
        let block = Block::new(
            orig_addr,
            pool_addr.as_u64(),
            insns,
            Terminator::DirJmp(DirJmp {
                orig_dst: cur,
                dst: Arm::Unresolved { bkpt_addr: 0 },
            }),
            resolved_syscall_bkpts,
        );
        let handle = blocks.push(block);

        for rb in resolved_brackets {
            if rb.tracker == "syscall" {
                bkpts.install(
                    rb.pre_addr,
                    BreakpointAction::PreSyscall { owner: handle, orig_addr: rb.orig_addr },
                );
                bkpts.install(
                    rb.post_addr,
                    BreakpointAction::PostSyscall { owner: handle, orig_addr: rb.orig_addr },
                );
            } else {
                bkpts.install(
                    rb.pre_addr,
                    BreakpointAction::TrackerPre { owner: handle, orig_addr: rb.orig_addr, tracker: rb.tracker },
                );
                bkpts.install(
                    rb.post_addr,
                    BreakpointAction::TrackerPost { owner: handle, orig_addr: rb.orig_addr, tracker: rb.tracker },
                );
            }
        }

        let (terminator, term_bytes) =
            self.build_terminator(&term_info, term_pool_addr, scratch_addr, handle, bkpts)?;
        staged.extend_from_slice(&term_bytes);
        blocks.get_mut(handle).terminator = terminator;

        debug_assert_eq!(staged.len(), total);
        pool.write(tracee, pool_addr, &staged)?;

        Ok(handle)
    }

    fn build_terminator(
        &self,
        info: &TermInfo,
        term_pool_addr: u64,
        scratch_addr: u64,
        owner: BlockHandle,
        bkpts: &mut BreakpointMap,
    ) -> Result<(Terminator, Vec<u8>)> {
        match info.kind {
            TerminatorKind::DirJmp => {
                let layout = build_dirjmp();
                let miss_bkpt = term_pool_addr + layout.miss_off;
                bkpts.install(miss_bkpt, BreakpointAction::DirJmpMiss { owner });
                Ok((
                    Terminator::DirJmp(DirJmp {
                        orig_dst: info.direct_target,
                        dst: Arm::Unresolved { bkpt_addr: miss_bkpt },
                    }),
                    layout.bytes,
                ))
            }
            TerminatorKind::DirJcc => {
                let layout = build_dirjcc(term_pool_addr, info.cc);
                let taken_bkpt = term_pool_addr + layout.taken_off;
                let fallthru_bkpt = term_pool_addr + layout.fallthru_off;
                bkpts.install(taken_bkpt, BreakpointAction::JccMiss { owner, arm: JccArm::Taken });
                bkpts.install(fallthru_bkpt, BreakpointAction::JccMiss { owner, arm: JccArm::Fallthru });
                Ok((
                    Terminator::DirJcc(DirJcc {
                        cc: info.cc,
                        orig_taken: info.direct_target,
                        orig_fallthru: info.fallthrough,
                        taken: Arm::Unresolved { bkpt_addr: taken_bkpt },
                        fallthru: Arm::Unresolved { bkpt_addr: fallthru_bkpt },
                        prediction_mode: self.prediction_mode,
                        decision_history: Vec::new(),
                    }),
                    layout.bytes,
                ))
            }
            TerminatorKind::IndJmp => {
                let layout = build_indjmp(term_pool_addr, info.indirect_target_reg);
                let miss_bkpt = term_pool_addr + layout.miss_off;
                bkpts.install(miss_bkpt, BreakpointAction::IndJmpMiss { owner });
                Ok((
                    Terminator::IndJmp(IndJmp {
                        cache: [IndJmpSlot::default(); terminator::IND_JMP_CACHE_SIZE],
                        eviction_index: 0,
                        miss_bkpt_addr: miss_bkpt,
                        table_addr: layout.table_addr,
                        target_reg: info.indirect_target_reg,
                    }),
                    layout.bytes,
                ))
            }
            TerminatorKind::Ret => {
                let layout = build_ret(term_pool_addr, scratch_addr);
                let miss_bkpt = term_pool_addr + layout.miss_off;
                bkpts.install(miss_bkpt, BreakpointAction::RetMiss { owner });
                Ok((
                    Terminator::Ret(Ret {
                        trampoline_addr: term_pool_addr,
                        miss_bkpt_addr: miss_bkpt,
                    }),
                    layout.bytes,
                ))
            }
            TerminatorKind::DirCall => {
                let layout = build_dircall(term_pool_addr, scratch_addr, info.fallthrough);
                let callee_bkpt = term_pool_addr + layout.callee_miss_off;
                let ret_bkpt = term_pool_addr + layout.ret_miss_off;
                let ret_cell_addr = term_pool_addr + layout.ret_cell_off;
                bkpts.install(callee_bkpt, BreakpointAction::DirCallMiss { owner });
                bkpts.install(ret_bkpt, BreakpointAction::CallReturnMiss { owner });
                Ok((
                    Terminator::DirCall(DirCall {
                        orig_callee: info.direct_target,
                        callee: Arm::Unresolved { bkpt_addr: callee_bkpt },
                        orig_return: info.fallthrough,
                        ret: Arm::Unresolved { bkpt_addr: ret_bkpt },
                        ret_cell_addr,
                    }),
                    layout.bytes,
                ))
            }
            TerminatorKind::IndCall => {
                let layout = build_indcall(term_pool_addr, scratch_addr, info.fallthrough);
                let callee_bkpt = term_pool_addr + layout.callee_miss_off;
                let ret_bkpt = term_pool_addr + layout.ret_miss_off;
                let ret_cell_addr = term_pool_addr + layout.ret_cell_off;
                bkpts.install(callee_bkpt, BreakpointAction::IndCallMiss { owner });
                bkpts.install(ret_bkpt, BreakpointAction::CallReturnMiss { owner });
                Ok((
                    Terminator::IndCall(IndCall {
                        orig_return: info.fallthrough,
                        ret: Arm::Unresolved { bkpt_addr: ret_bkpt },
                        ret_cell_addr,
                        miss_bkpt_addr: callee_bkpt,
                        target_reg: info.indirect_target_reg,
                    }),
                    layout.bytes,
                ))
            }
        }
    }
}

fn terminator_kind_of(iclass: IClass) -> Option<TerminatorKind> {
    match iclass {
        IClass::Jcc => Some(TerminatorKind::DirJcc),
        IClass::DirJmp => Some(TerminatorKind::DirJmp),
        IClass::IndJmp => Some(TerminatorKind::IndJmp),
        IClass::DirCall => Some(TerminatorKind::DirCall),
        IClass::IndCall => Some(TerminatorKind::IndCall),
        IClass::RetNear => Some(TerminatorKind::Ret),
        IClass::Other | IClass::Syscall => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn translator_caches_original_bytes() {
        let mut t = BlockTranslator::new(PredictionMode::None);
        assert!(t.orig_byte_cache.is_empty());
        t.orig_byte_cache.insert(0x1000, vec![0x90; 4]);
        assert_eq!(t.orig_byte_cache.get(&0x1000).unwrap().len(), 4);
    }

    #[test]
    fn terminator_kind_of_covers_all_branch_classes() {
        assert_eq!(terminator_kind_of(IClass::Jcc), Some(TerminatorKind::DirJcc));
        assert_eq!(terminator_kind_of(IClass::DirJmp), Some(TerminatorKind::DirJmp));
        assert_eq!(terminator_kind_of(IClass::IndJmp), Some(TerminatorKind::IndJmp));
        assert_eq!(terminator_kind_of(IClass::DirCall), Some(TerminatorKind::DirCall));
        assert_eq!(terminator_kind_of(IClass::IndCall), Some(TerminatorKind::IndCall));
        assert_eq!(terminator_kind_of(IClass::RetNear), Some(TerminatorKind::Ret));
        assert_eq!(terminator_kind_of(IClass::Other), None);
        assert_eq!(terminator_kind_of(IClass::Syscall), None);
    }
}
