//! The run-loop dispatcher (spec.md §4.6). Grounded on original_source's
//! `src/dbi/patch.hh`/`.cc` for the resume/wait/dispatch loop and the
//! entry-point bootstrap, and on `isgasho-rd`'s `ThreadGroup` for the
//! live-tracee-set container, adapted to a plain `Vec<Tracee>` since a
//! Patcher here owns at most two tracees (spec.md §5) rather than an
//! open-ended thread group.
//!
//! `Patcher` resolves everything that is purely a DBI-layer concern
//! (terminator misses, fork attachment, the entry-point breakpoint)
//! internally. Tool-level sequence points — a syscall bracket, a newly
//! attached child, a tracee's exit — are surfaced to the caller as
//! `PatcherEvent`s rather than dispatched through an internal callback,
//! so `jit`/`fork` mode callers can ignore them and the MemCheck driver
//! can act on them without the Patcher depending on `MemCheckDriver`.

use std::collections::HashMap;

use nix::sys::ptrace;

use crate::arena::Arena;
use crate::block::{Block, BlockHandle};
use crate::block_pool::BlockPool;
use crate::block_translator::BlockTranslator;
use crate::breakpoint::{BreakpointAction, BreakpointMap, JccArm};
use crate::encode::{jmp_rel32, rel32_for, INT3};
use crate::error::{Error, Result};
use crate::kernel_abi::{PTRACE_EVENT_FORK, PTRACE_O_EXITKILL, PTRACE_O_TRACEFORK};
use crate::remote_ptr::RemotePtr;
use crate::terminator::{Arm, PredictionMode, Terminator};
use crate::tracee::{ResumeRequest, Tracee};
use crate::wait_status::WaitStatus;

/// A tool-level occurrence the caller may need to act on; anything purely
/// about code-cache bookkeeping is resolved inside `step` instead.
pub enum PatcherEvent {
    Forked { parent_idx: usize, child: Tracee },
    Exited { tracee_idx: usize, status: WaitStatus },
    PreSyscall { tracee_idx: usize, orig_addr: u64 },
    PostSyscall { tracee_idx: usize, orig_addr: u64 },
    /// A body instruction claimed by a tracker other than `syscall`
    /// (spec.md §4.8): `lock_rtm_rdtsc` or `stack`.
    TrackerPre { tracee_idx: usize, orig_addr: u64, tracker: &'static str },
    TrackerPost { tracee_idx: usize, orig_addr: u64, tracker: &'static str },
    /// A `DirJcc` arm was just resolved; the branch's flags/direction are
    /// available for the `jcc_tracker`'s checksum. Only fires once per
    /// arm (the first time it traps), not on every dynamic execution,
    /// since resolution patches in a direct jump (see DESIGN.md).
    JccResolved { tracee_idx: usize, branch_addr: u64, flags: u32, taken: bool },
    /// A `DirCall`/`IndCall`'s callee was just resolved — the tracee has
    /// already pushed the real return address onto its stack by this
    /// point. Fires once per static call site, not per dynamic call (see
    /// DESIGN.md).
    CallEntered { tracee_idx: usize, old_sp: u64, new_sp: u64 },
    /// A `Ret`'s RSB entry mismatched and fell back to the slow path;
    /// the real stack pop has already happened. Fires only on a mismatch,
    /// not on every return (see DESIGN.md).
    RetCompleted { tracee_idx: usize, old_sp: u64, new_sp: u64 },
    EntryReached { tracee_idx: usize, pool_addr: u64 },
}

pub struct Patcher {
    pub tracees: Vec<Tracee>,
    pub blocks: Arena<Block>,
    block_by_orig: HashMap<u64, BlockHandle>,
    pub bkpts: BreakpointMap,
    pub pool: BlockPool,
    translator: BlockTranslator,
    entry_addr: u64,
    entry_orig_byte: u8,
    /// Base address of the per-tracee scratch page (spec.md §9's
    /// `ScratchLayout`); threaded into every terminator trampoline that
    /// needs the depth-1 RSB cells (`Ret`, `DirCall`, `IndCall`).
    scratch_addr: u64,
    pub default_resume: ResumeRequest,
}

impl Patcher {
    pub fn new(
        tracees: Vec<Tracee>,
        pool: BlockPool,
        prediction_mode: PredictionMode,
        entry_addr: u64,
        scratch_addr: u64,
    ) -> Patcher {
        Patcher {
            tracees,
            blocks: Arena::new(),
            block_by_orig: HashMap::new(),
            bkpts: BreakpointMap::new(),
            pool,
            translator: BlockTranslator::new(prediction_mode),
            entry_addr,
            entry_orig_byte: INT3,
            scratch_addr,
            default_resume: ResumeRequest::Cont,
        }
    }

    /// `PTRACE_O_EXITKILL | PTRACE_O_TRACEFORK` (spec.md §5) and the
    /// startup entry-point breakpoint (spec.md §4.6: "Startup injects a
    /// single breakpoint at the ELF entry point").
    pub fn start(&mut self, tracee_idx: usize) -> Result<()> {
        let pid = self.tracees[tracee_idx].pid();
        ptrace::setoptions(
            pid,
            ptrace::Options::from_bits_truncate(PTRACE_O_EXITKILL | PTRACE_O_TRACEFORK),
        )?;

        let addr: RemotePtr<u8> = RemotePtr::new(self.entry_addr);
        let orig = self.tracees[tracee_idx].read_vec(addr, 1)?[0];
        self.entry_orig_byte = orig;
        self.tracees[tracee_idx].write_bytes(addr, &[INT3])?;
        self.bkpts.install(self.entry_addr, BreakpointAction::EntryPoint);
        Ok(())
    }

    pub fn lookup_or_translate(&mut self, tracee_idx: usize, orig_addr: u64) -> Result<BlockHandle> {
        if let Some(&h) = self.block_by_orig.get(&orig_addr) {
            return Ok(h);
        }
        let h = self.translator.translate(
            &mut self.tracees[tracee_idx],
            &mut self.pool,
            &mut self.blocks,
            &mut self.bkpts,
            self.scratch_addr,
            orig_addr,
        )?;
        self.block_by_orig.insert(orig_addr, h);
        Ok(h)
    }

    /// One iteration of the run loop (spec.md §4.6 steps 1-4): resume
    /// every non-suspended tracee, wait on each, dispatch its stop, and
    /// fold in any newly forked children or exits. Returns the tool-level
    /// events the caller should act on.
    pub fn step(&mut self) -> Result<Vec<PatcherEvent>> {
        for t in self.tracees.iter_mut() {
            if !t.suspended() {
                t.resume(self.default_resume)?;
            }
        }

        let mut events = Vec::new();
        let mut exited = Vec::new();
        let live_count = self.tracees.len();
        for idx in 0..live_count {
            if self.tracees[idx].suspended() {
                continue;
            }
            let ws = self.tracees[idx].wait()?;
            if ws.exited() || ws.signaled() {
                events.push(PatcherEvent::Exited { tracee_idx: idx, status: ws });
                exited.push(idx);
                continue;
            }
            if let Some(event) = ws.ptrace_event() {
                if event == PTRACE_EVENT_FORK {
                    let child = self.complete_fork_event(idx)?;
                    events.push(PatcherEvent::Forked { parent_idx: idx, child });
                    continue;
                }
            }
            if let Some(ev) = self.handle_stop(idx, ws)? {
                events.push(ev);
            }
        }

        // Remove exited tracees highest-index-first so earlier indices
        // stay valid; `Forked` children were appended separately below by
        // the caller (the Patcher doesn't know the caller's `Tracee` slot
        // assignment, per spec.md §9 avoiding a single omniscient owner
        // of both code-cache and MemCheck-round state).
        exited.sort_unstable_by(|a, b| b.cmp(a));
        for idx in exited {
            self.tracees.remove(idx);
        }

        Ok(events)
    }

    fn complete_fork_event(&mut self, idx: usize) -> Result<Tracee> {
        let new_pid = ptrace::getevent(self.tracees[idx].pid())? as libc::pid_t;
        let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(new_pid), None);
        Tracee::attach(new_pid)
    }

    /// Dispatch a `SIGTRAP` stop: either a registered breakpoint (int3 at
    /// `pc-1`) or an unhandled signal, which is fatal (spec.md §4.6 step 3).
    fn handle_stop(&mut self, idx: usize, ws: WaitStatus) -> Result<Option<PatcherEvent>> {
        let sig = ws.stop_sig().ok_or_else(|| {
            Error::Fatal(format!("tracee {} stopped with no signal", self.tracees[idx].tid))
        })?;
        if sig != libc::SIGTRAP {
            return Err(Error::Fatal(format!(
                "tracee {} stopped on unhandled signal {}",
                self.tracees[idx].tid, sig
            )));
        }

        let mut regs = self.tracees[idx].get_gpregs()?;
        let trap_addr = regs.ip() - 1;
        if !self.bkpts.contains(trap_addr) {
            return Err(Error::InvariantViolation(format!(
                "trap at unregistered pool address {:#x}",
                trap_addr
            )));
        }
        regs.set_ip(trap_addr);
        self.tracees[idx].set_gpregs(regs);

        let action = *self.bkpts.lookup(trap_addr).unwrap();
        self.handle_breakpoint(idx, trap_addr, action)
    }

    fn handle_breakpoint(
        &mut self,
        idx: usize,
        trap_addr: u64,
        action: BreakpointAction,
    ) -> Result<Option<PatcherEvent>> {
        match action {
            BreakpointAction::EntryPoint => {
                let entry_addr: RemotePtr<u8> = RemotePtr::new(self.entry_addr);
                self.tracees[idx].write_bytes(entry_addr, &[self.entry_orig_byte])?;
                self.bkpts.remove(self.entry_addr);
                let handle = self.lookup_or_translate(idx, self.entry_addr)?;
                let pool_addr = self.blocks.get(handle).pool_addr;
                let mut regs = self.tracees[idx].get_gpregs()?;
                regs.set_ip(pool_addr);
                self.tracees[idx].set_gpregs(regs);
                Ok(Some(PatcherEvent::EntryReached { tracee_idx: idx, pool_addr }))
            }
            BreakpointAction::DirJmpMiss { owner } => {
                let orig_dst = match &self.blocks.get(owner).terminator {
                    Terminator::DirJmp(j) => j.orig_dst,
                    _ => {
                        return Err(Error::InvariantViolation(
                            "DirJmpMiss breakpoint's owner block is not a DirJmp".to_string(),
                        ))
                    }
                };
                let pool_dst = self.resolve_direct_branch(idx, trap_addr, orig_dst)?;
                if let Terminator::DirJmp(j) = &mut self.blocks.get_mut(owner).terminator {
                    j.dst = Arm::Resolved { pool_dst };
                }
                Ok(None)
            }
            BreakpointAction::JccMiss { owner, arm } => self.resolve_jcc_miss(idx, owner, arm, trap_addr),
            BreakpointAction::IndJmpMiss { owner } => {
                self.resolve_indjmp_miss(idx, owner, trap_addr)?;
                Ok(None)
            }
            BreakpointAction::RetMiss { owner } => self.resolve_ret_miss(idx, owner, trap_addr),
            BreakpointAction::DirCallMiss { owner } => self.resolve_dircall_miss(idx, owner, trap_addr),
            BreakpointAction::IndCallMiss { owner } => {
                self.resolve_indcall_miss(idx, owner, trap_addr)?;
                Ok(None)
            }
            BreakpointAction::CallReturnMiss { owner } => {
                self.resolve_call_return_miss(idx, owner, trap_addr)?;
                Ok(None)
            }
            BreakpointAction::PreSyscall { orig_addr, .. } => {
                Ok(Some(PatcherEvent::PreSyscall { tracee_idx: idx, orig_addr }))
            }
            BreakpointAction::PostSyscall { orig_addr, .. } => {
                Ok(Some(PatcherEvent::PostSyscall { tracee_idx: idx, orig_addr }))
            }
            BreakpointAction::TrackerPre { orig_addr, tracker, .. } => {
                Ok(Some(PatcherEvent::TrackerPre { tracee_idx: idx, orig_addr, tracker }))
            }
            BreakpointAction::TrackerPost { orig_addr, tracker, .. } => {
                Ok(Some(PatcherEvent::TrackerPost { tracee_idx: idx, orig_addr, tracker }))
            }
            BreakpointAction::Diagnostic { orig_addr, label } => {
                crate::log!(
                    crate::log::LogLevel::LogDebug,
                    "diagnostic breakpoint {} at orig {:#x} (pool {:#x})",
                    label,
                    orig_addr,
                    trap_addr
                );
                Ok(None)
            }
        }
    }

    /// Patch a 5-byte direct `jmp` over the miss breakpoint, targeting the
    /// (looked-up or freshly translated) destination block's pool address
    /// (spec.md §4.5).
    fn resolve_direct_branch(&mut self, tracee_idx: usize, bkpt_addr: u64, orig_dst: u64) -> Result<u64> {
        let dst = self.lookup_or_translate(tracee_idx, orig_dst)?;
        let pool_dst = self.blocks.get(dst).pool_addr;
        let jmp = jmp_rel32(rel32_for(bkpt_addr, 5, pool_dst));
        self.pool
            .write(&mut self.tracees[tracee_idx], RemotePtr::new(bkpt_addr), &jmp)?;
        self.bkpts.remove(bkpt_addr);
        Ok(pool_dst)
    }

    fn resolve_jcc_miss(
        &mut self,
        tracee_idx: usize,
        owner: BlockHandle,
        arm: JccArm,
        bkpt_addr: u64,
    ) -> Result<Option<PatcherEvent>> {
        let branch_addr = self.blocks.get(owner).orig_addr;
        let (orig_target, taken) = match &self.blocks.get(owner).terminator {
            Terminator::DirJcc(j) => match arm {
                JccArm::Taken => (j.orig_taken, true),
                JccArm::Fallthru => (j.orig_fallthru, false),
            },
            _ => {
                return Err(Error::InvariantViolation(
                    "JccMiss breakpoint's owner block is not a DirJcc".to_string(),
                ))
            }
        };
        let flags = self.tracees[tracee_idx].get_gpregs()?.flags() as u32;
        let pool_dst = self.resolve_direct_branch(tracee_idx, bkpt_addr, orig_target)?;
        if let Terminator::DirJcc(j) = &mut self.blocks.get_mut(owner).terminator {
            let slot = match arm {
                JccArm::Taken => &mut j.taken,
                JccArm::Fallthru => &mut j.fallthru,
            };
            *slot = Arm::Resolved { pool_dst };
            j.record_decision(taken);
        }
        Ok(Some(PatcherEvent::JccResolved { tracee_idx, branch_addr, flags, taken }))
    }

    /// A return whose real return address (recovered from
    /// `terminator::SCRATCH_REG_A`, where the `Ret` trampoline's miss
    /// path leaves it with the stack already popped) doesn't match the
    /// depth-1 RSB's cached entry falls back here: translate the real
    /// destination and redirect `%rip` directly. This must never patch
    /// code at `bkpt_addr`, unlike `DirJmp`/`DirCall`/`DirJcc`: the same
    /// trap site is shared by every dynamically different return through
    /// this block, so a fixed `jmp` would hijack all of them to whichever
    /// target resolved first (spec.md §4.5 "Ret").
    fn resolve_ret_miss(&mut self, tracee_idx: usize, owner: BlockHandle, bkpt_addr: u64) -> Result<Option<PatcherEvent>> {
        let regs = self.tracees[tracee_idx].get_gpregs()?;
        let orig_dst = regs.gpr(crate::terminator::SCRATCH_REG_A);
        let new_sp = regs.rsp();
        let dst = self.lookup_or_translate(tracee_idx, orig_dst)?;
        let pool_dst = self.blocks.get(dst).pool_addr;
        let _owner_check = &self.blocks.get(owner).terminator;
        let mut regs = regs;
        regs.set_ip(pool_dst);
        self.tracees[tracee_idx].set_gpregs(regs);
        let _ = bkpt_addr;
        Ok(Some(PatcherEvent::RetCompleted { tracee_idx, old_sp: new_sp - 8, new_sp }))
    }

    fn resolve_indjmp_miss(&mut self, tracee_idx: usize, owner: BlockHandle, bkpt_addr: u64) -> Result<()> {
        let target_reg = match &self.blocks.get(owner).terminator {
            Terminator::IndJmp(ij) => ij.target_reg,
            _ => {
                return Err(Error::InvariantViolation(
                    "IndJmpMiss breakpoint's owner block is not an IndJmp".to_string(),
                ))
            }
        };
        let regs = self.tracees[tracee_idx].get_gpregs()?;
        let orig_dst = regs.gpr(target_reg);
        let dst = self.lookup_or_translate(tracee_idx, orig_dst)?;
        let pool_dst = self.blocks.get(dst).pool_addr;
        if let Terminator::IndJmp(ij) = &mut self.blocks.get_mut(owner).terminator {
            let idx = ij.install(orig_dst, pool_dst);
            let table_addr = ij.table_addr;
            let slot_addr = table_addr + crate::terminator::IndJmp::slot_offset(idx);
            let mut cell = [0u8; 16];
            cell[0..8].copy_from_slice(&orig_dst.to_le_bytes());
            cell[8..16].copy_from_slice(&pool_dst.to_le_bytes());
            self.pool
                .write(&mut self.tracees[tracee_idx], RemotePtr::new(slot_addr), &cell)?;
        }
        let mut regs = regs;
        regs.set_ip(pool_dst);
        self.tracees[tracee_idx].set_gpregs(regs);
        let _ = bkpt_addr;
        Ok(())
    }

    /// Patch a direct `jmp` over a `DirCall`'s callee breakpoint, exactly
    /// like `DirJmpMiss` (the callee of a direct call is a single static
    /// target). The real return address has already been pushed onto the
    /// tracee's stack and mirrored into the depth-1 RSB by the trampoline
    /// by the time this traps.
    fn resolve_dircall_miss(&mut self, tracee_idx: usize, owner: BlockHandle, bkpt_addr: u64) -> Result<Option<PatcherEvent>> {
        let orig_callee = match &self.blocks.get(owner).terminator {
            Terminator::DirCall(c) => c.orig_callee,
            _ => {
                return Err(Error::InvariantViolation(
                    "DirCallMiss breakpoint's owner block is not a DirCall".to_string(),
                ))
            }
        };
        let new_sp = self.tracees[tracee_idx].get_gpregs()?.rsp();
        let pool_dst = self.resolve_direct_branch(tracee_idx, bkpt_addr, orig_callee)?;
        if let Terminator::DirCall(c) = &mut self.blocks.get_mut(owner).terminator {
            c.callee = Arm::Resolved { pool_dst };
        }
        Ok(Some(PatcherEvent::CallEntered { tracee_idx, old_sp: new_sp + 8, new_sp }))
    }

    fn resolve_indcall_miss(&mut self, tracee_idx: usize, owner: BlockHandle, bkpt_addr: u64) -> Result<()> {
        let target_reg = match &self.blocks.get(owner).terminator {
            Terminator::IndCall(ic) => ic.target_reg,
            _ => {
                return Err(Error::InvariantViolation(
                    "IndCallMiss breakpoint's owner block is not an IndCall".to_string(),
                ))
            }
        };
        let regs = self.tracees[tracee_idx].get_gpregs()?;
        let orig_dst = regs.gpr(target_reg);
        let dst = self.lookup_or_translate(tracee_idx, orig_dst)?;
        let pool_dst = self.blocks.get(dst).pool_addr;
        let mut regs = regs;
        regs.set_ip(pool_dst);
        self.tracees[tracee_idx].set_gpregs(regs);
        let _ = bkpt_addr;
        Ok(())
    }

    /// Resolve a `DirCall`/`IndCall`'s `ret_cell`: translate the call
    /// site's original return address and write the resulting pool
    /// address into the cell, a plain memory write rather than a code
    /// patch, since every future execution of the same call instruction
    /// reads the same cell (spec.md §4.5).
    fn resolve_call_return_miss(&mut self, tracee_idx: usize, owner: BlockHandle, _bkpt_addr: u64) -> Result<()> {
        let (orig_return, ret_cell_addr) = match &self.blocks.get(owner).terminator {
            Terminator::DirCall(c) => (c.orig_return, c.ret_cell_addr),
            Terminator::IndCall(c) => (c.orig_return, c.ret_cell_addr),
            _ => {
                return Err(Error::InvariantViolation(
                    "CallReturnMiss breakpoint's owner block is not a DirCall/IndCall".to_string(),
                ))
            }
        };
        let dst = self.lookup_or_translate(tracee_idx, orig_return)?;
        let pool_dst = self.blocks.get(dst).pool_addr;
        self.pool.write(
            &mut self.tracees[tracee_idx],
            RemotePtr::new(ret_cell_addr),
            &pool_dst.to_le_bytes(),
        )?;
        match &mut self.blocks.get_mut(owner).terminator {
            Terminator::DirCall(c) => c.ret = Arm::Resolved { pool_dst },
            Terminator::IndCall(c) => c.ret = Arm::Resolved { pool_dst },
            _ => {}
        }
        // The ret_cell's miss trap stays registered in `bkpts` forever:
        // unlike a code patch, the tracee never traps there again once
        // the cell holds a real pool address, so there is nothing to
        // remove.
        Ok(())
    }
}
