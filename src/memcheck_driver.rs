//! MemCheck round driver (spec.md §3 "Thread entry", §4.10). Owns the
//! page set and taint state across rounds and drives the
//! start_round / sequence-point / kill-secondary lifecycle. Grounded on
//! original_source's `src/memcheck.cc`/`.hh`; the "subround" concept from
//! an early draft is deliberately not implemented (spec.md §9).

use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::cksum::FlagChecksum;
use crate::error::{Error, Result};
use crate::kernel_abi::PAGE_SIZE;
use crate::pageset::PageSet;
use crate::snapshot::{Snapshot, State};
use crate::syscall_checker::SyscallChecker;
use crate::tracee::Tracee;
use crate::usermem::ScratchLayout;

/// `fill_byte` for the primary tracee of a round (spec.md §3, §4.10).
pub const PRIMARY_FILL: u8 = 0x00;
/// `fill_byte` for the secondary (forked) tracee of a round.
pub const SECONDARY_FILL: u8 = 0xff;

/// Per-tracee bookkeeping for the round currently in flight (spec.md §3
/// "Thread entry").
pub struct ThreadEntry {
    pub fill_byte: u8,
    pub bkpt_cksum: FlagChecksum,
    pub incore_cksum: FlagChecksum,
    pub state: Option<State>,
    pub arrived: bool,
}

impl ThreadEntry {
    fn new(fill_byte: u8) -> ThreadEntry {
        ThreadEntry {
            fill_byte,
            bkpt_cksum: FlagChecksum::new(),
            incore_cksum: FlagChecksum::new(),
            state: None,
            arrived: false,
        }
    }
}

pub struct MemCheckDriver {
    pub pages: PageSet,
    pub taint_state: Snapshot,
    pub entries: Vec<ThreadEntry>,
    pub syscall_checker: SyscallChecker,
}

impl MemCheckDriver {
    pub fn new(syscall_checker: SyscallChecker) -> MemCheckDriver {
        MemCheckDriver {
            pages: PageSet::new(),
            taint_state: Snapshot::new(),
            entries: Vec::new(),
            syscall_checker,
        }
    }

    /// spec.md §4.10 step 1: unsuspend+unlock the primary, snapshot its
    /// pre-state, bring the taint state into agreement with the writable
    /// page set, remote-fork a secondary, XOR the taint state into the
    /// secondary so it starts from `pre_state ⊕ taint_state`, clear
    /// per-thread checksums, and seed each tracee's scratch variables.
    pub fn start_round(
        &mut self,
        primary: &mut Tracee,
        primary_scratch: &ScratchLayout,
    ) -> Result<Tracee> {
        for addr in self.pages.writable_pages() {
            self.pages.unlock(addr);
        }

        let writable = self.pages.writable_pages();
        self.taint_state.reconcile_keys(&writable);

        let mut pre_snapshot = Snapshot::new();
        for &addr in &writable {
            let bytes = primary.read_vec(crate::remote_ptr::RemotePtr::new(addr), PAGE_SIZE)?;
            let mut page = [0u8; PAGE_SIZE];
            page.copy_from_slice(&bytes);
            pre_snapshot.insert(addr, page);
        }
        let pre_gp = primary.get_gpregs()?;
        let pre_fp = primary.get_extra_regs()?;
        let pre_state = State::new(pre_gp, pre_fp, pre_snapshot);

        let mut secondary = primary.remote_fork()?;

        // secondary state = pre_state XOR taint_state, restricted to the
        // shared key set (spec.md §4.10 step 1).
        for addr in writable.iter() {
            if let (Some(pre_page), Some(taint_page)) =
                (pre_state.snapshot.get(*addr), self.taint_state.get(*addr))
            {
                let mut xored = *pre_page;
                for (b, t) in xored.iter_mut().zip(taint_page.iter()) {
                    *b ^= t;
                }
                secondary.write_bytes(crate::remote_ptr::RemotePtr::new(*addr), &xored)?;
            }
        }

        self.entries = vec![ThreadEntry::new(PRIMARY_FILL), ThreadEntry::new(SECONDARY_FILL)];
        primary.write_val_mem(primary_scratch.fill_byte_ptr(), &PRIMARY_FILL)?;

        Ok(secondary)
    }

    /// spec.md §4.10 step 3: record a tracee's arrival at the sequence
    /// point. Returns `true` once every tracee in `self.entries` has
    /// arrived and comparison should proceed.
    pub fn arrive(&mut self, index: usize, state: State) -> bool {
        self.entries[index].state = Some(state);
        self.entries[index].arrived = true;
        self.entries.iter().all(|e| e.arrived)
    }

    /// Compare both tracees' post-states, extending the taint state with
    /// their XOR, and cross-check in-core vs breakpoint checksums when
    /// both are enabled (spec.md §8 property 7).
    pub fn compare_and_extend_taint(&mut self, check_bkpt_cksum: bool) -> Result<()> {
        let (primary, secondary) = match (&self.entries[0].state, &self.entries[1].state) {
            (Some(p), Some(s)) => (p, s),
            _ => {
                return Err(Error::InvariantViolation(
                    "compare_and_extend_taint called before both tracees arrived".to_string(),
                ))
            }
        };
        if !Snapshot::similar(&primary.snapshot, &secondary.snapshot) {
            return Err(Error::InvariantViolation(
                "primary/secondary snapshot key sets diverged mid-round".to_string(),
            ));
        }
        self.taint_state
            .or_assign_xor_of(&primary.snapshot, &secondary.snapshot);

        if check_bkpt_cksum {
            for entry in &self.entries {
                if entry.bkpt_cksum.cksum() != entry.incore_cksum.cksum() {
                    return Err(Error::InvariantViolation(
                        "in-core and breakpoint Jcc checksums disagree".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// spec.md §4.10 step 4: kill the secondary, reap it, and reap the
    /// resulting `SIGCHLD` on the primary.
    pub fn kill_secondary(&mut self, secondary: &mut Tracee) -> Result<()> {
        signal::kill(secondary.pid(), Signal::SIGKILL)
            .map_err(|e| Error::Fatal(format!("kill secondary {}: {}", secondary.tid, e)))?;
        let _ = waitpid(secondary.pid(), None);
        self.entries.clear();
        Ok(())
    }

    pub fn reset_for_next_round(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ViolationPolicy;

    fn page_of(byte: u8) -> [u8; PAGE_SIZE] {
        [byte; PAGE_SIZE]
    }

    #[test]
    fn arrive_gates_until_all_tracees_present() {
        let mut driver = MemCheckDriver::new(SyscallChecker::new(ViolationPolicy::Stub));
        driver.entries = vec![ThreadEntry::new(PRIMARY_FILL), ThreadEntry::new(SECONDARY_FILL)];
        let gp = crate::registers::Registers::default();
        let fp = crate::extra_registers::ExtraRegisters::default();
        let state_a = State::new(gp, fp, Snapshot::new());
        assert!(!driver.arrive(0, state_a));
        let gp2 = crate::registers::Registers::default();
        let fp2 = crate::extra_registers::ExtraRegisters::default();
        let state_b = State::new(gp2, fp2, Snapshot::new());
        assert!(driver.arrive(1, state_b));
    }

    #[test]
    fn compare_and_extend_taint_accumulates_xor() {
        let mut driver = MemCheckDriver::new(SyscallChecker::new(ViolationPolicy::Stub));
        driver.entries = vec![ThreadEntry::new(PRIMARY_FILL), ThreadEntry::new(SECONDARY_FILL)];

        let mut snap_a = Snapshot::new();
        snap_a.insert(0x1000, page_of(0x00));
        let mut snap_b = Snapshot::new();
        snap_b.insert(0x1000, page_of(0xff));

        let gp = crate::registers::Registers::default();
        let fp = crate::extra_registers::ExtraRegisters::default();
        driver.arrive(0, State::new(gp, fp, snap_a));
        let gp2 = crate::registers::Registers::default();
        let fp2 = crate::extra_registers::ExtraRegisters::default();
        driver.arrive(1, State::new(gp2, fp2, snap_b));

        driver.compare_and_extend_taint(false).unwrap();
        assert_eq!(driver.taint_state.get(0x1000).unwrap()[0], 0xff);
    }
}
