//! Shared bring-up shared by all three subcommands: launch the target,
//! read its entry point, remote-`mmap` the regions `Patcher`/trackers
//! need, and build a `Patcher` over the result. Grounded on
//! original_source's `src/dbi/patch.cc` `Patcher::open`, which performs
//! the same sequence (launch, `mmap` the pool, install the entry
//! breakpoint) inline in one function; split out here since three
//! subcommands share it instead of one.

use crate::block_pool::BlockPool;
use crate::elf;
use crate::error::{Error, Result};
use crate::kernel_abi::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE, SYS_MMAP};
use crate::launch;
use crate::patcher::Patcher;
use crate::remote_ptr::RemotePtr;
use crate::terminator::PredictionMode;
use crate::tracee::Tracee;
use crate::usermem::ScratchLayout;

/// Size of the code pool `mmap`'d in the tracee; generous for a
/// translator that never reclaims space (spec.md §4.4 "pool is
/// append-only").
const POOL_SIZE: usize = 64 * 1024 * 1024;

pub struct Session {
    pub patcher: Patcher,
    pub scratch: ScratchLayout,
}

/// Launch `prog`, remote-`mmap` an RWX pool for translated code plus a
/// scratch page for the in-core trackers' named variables, and build the
/// `Patcher` ready for its caller to drive `start()`/`step()`.
pub fn bring_up(
    prog: &str,
    args: &[String],
    preload_lib: Option<&str>,
    prediction_mode: PredictionMode,
) -> Result<Session> {
    let mut tracee = launch::spawn_traced(prog, args, preload_lib)?;
    let entry_addr = elf::read_entry_point(prog)?;

    let pool_base = remote_mmap(&mut tracee, POOL_SIZE, PROT_READ | PROT_WRITE | PROT_EXEC)?;
    let scratch_base = remote_mmap(&mut tracee, 4096, PROT_READ | PROT_WRITE)?;

    let pool = BlockPool::new(RemotePtr::new(pool_base), POOL_SIZE);
    let scratch = ScratchLayout::new(RemotePtr::new(scratch_base));

    let mut patcher = Patcher::new(vec![tracee], pool, prediction_mode, entry_addr, scratch_base);
    patcher.start(0)?;

    Ok(Session { patcher, scratch })
}

/// `mmap(NULL, len, prot, MAP_PRIVATE|MAP_ANONYMOUS, -1, 0)` injected via
/// `Tracee::remote_syscall` (spec.md §4.1 "remote syscall injection").
fn remote_mmap(tracee: &mut Tracee, len: usize, prot: u64) -> Result<u64> {
    let ret = tracee.remote_syscall(
        SYS_MMAP,
        &[0, len as u64, prot, MAP_PRIVATE | MAP_ANONYMOUS, u64::MAX, 0],
    )?;
    if ret < 0 {
        return Err(Error::Fatal(format!("remote mmap({} bytes) failed: {}", len, ret)));
    }
    Ok(ret as u64)
}
