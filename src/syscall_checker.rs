//! Per-syscall taint checker (spec.md §4.9, §9 "Runtime reflection of
//! syscalls"). A static table maps syscall number to a `SyscallSpec`
//! describing each argument's role; a single interpreter walks the table
//! for both the pre-pass (taint rejection, page unlocking) and the
//! post-pass (clearing taint bits, propagating kernel writes). Grounded
//! on original_source's `src/dbi/syscall.hh`/`syscall-args.hh` for the
//! table contents and on `isgasho-rd`'s `kernel_abi` module for syscall
//! number naming (`libc::SYS_*`).

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::{Error, Result, ViolationPolicy};
use crate::pageset::PageSet;
use crate::registers::Registers;
use crate::snapshot::Snapshot;
use crate::tracee::Tracee;

/// The role one syscall argument plays, per spec.md §9's table design.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParamRole {
    Scalar,
    /// Kernel reads `len` bytes from this pointer.
    ReadPtr { len_arg: Option<usize>, fixed_len: usize },
    /// Kernel reads a NUL-terminated string from this pointer.
    ReadStr,
    /// Kernel writes up to `len` bytes to this pointer.
    WritePtr { len_arg: Option<usize>, fixed_len: usize },
    /// Kernel writes exactly as many bytes as it returns in `%rax`
    /// (e.g. `read`, `recv`).
    WriteRet,
}

#[derive(Clone, Debug)]
pub struct SyscallSpec {
    pub name: &'static str,
    pub params: [ParamRole; 6],
    /// Whether this syscall mutates the page set directly
    /// (`mmap`/`mprotect`/`munmap`/`brk`), handled specially in the
    /// post-pass (spec.md §4.9: "reflect into tier transitions").
    pub mutates_page_set: bool,
}

const SCALAR6: [ParamRole; 6] = [ParamRole::Scalar; 6];

lazy_static! {
    static ref SYSCALL_TABLE: HashMap<i64, SyscallSpec> = {
        let mut m = HashMap::new();
        m.insert(
            libc::SYS_read,
            SyscallSpec {
                name: "read",
                params: [
                    ParamRole::Scalar,
                    ParamRole::WriteRet,
                    ParamRole::Scalar,
                    ParamRole::Scalar,
                    ParamRole::Scalar,
                    ParamRole::Scalar,
                ],
                mutates_page_set: false,
            },
        );
        m.insert(
            libc::SYS_write,
            SyscallSpec {
                name: "write",
                params: [
                    ParamRole::Scalar,
                    ParamRole::ReadPtr { len_arg: Some(2), fixed_len: 0 },
                    ParamRole::Scalar,
                    ParamRole::Scalar,
                    ParamRole::Scalar,
                    ParamRole::Scalar,
                ],
                mutates_page_set: false,
            },
        );
        m.insert(
            libc::SYS_mmap,
            SyscallSpec {
                name: "mmap",
                params: SCALAR6,
                mutates_page_set: true,
            },
        );
        m.insert(
            libc::SYS_mprotect,
            SyscallSpec {
                name: "mprotect",
                params: SCALAR6,
                mutates_page_set: true,
            },
        );
        m.insert(
            libc::SYS_munmap,
            SyscallSpec {
                name: "munmap",
                params: SCALAR6,
                mutates_page_set: true,
            },
        );
        m.insert(
            libc::SYS_brk,
            SyscallSpec {
                name: "brk",
                params: SCALAR6,
                mutates_page_set: true,
            },
        );
        m.insert(
            libc::SYS_rt_sigaction,
            SyscallSpec {
                name: "rt_sigaction",
                // TODO: the original stubs RT_SIGACTION's pre/post pass
                // (`#if 0` in the source); scenario F's act/oldact
                // read/write-checking is not yet implemented, matching
                // spec.md §9's instruction to treat the stub as
                // intentional for the first implementation.
                params: SCALAR6,
                mutates_page_set: false,
            },
        );
        m
    };
}

pub fn lookup(no: i64) -> Option<&'static SyscallSpec> {
    SYSCALL_TABLE.get(&no)
}

pub struct SyscallChecker {
    pub on_unmodeled_syscall: ViolationPolicy,
}

impl SyscallChecker {
    pub fn new(on_unmodeled_syscall: ViolationPolicy) -> SyscallChecker {
        SyscallChecker { on_unmodeled_syscall }
    }

    /// Pre-pass (spec.md §4.9 "On entry to a syscall sequence point"):
    /// reject a tainted syscall number or tainted scalar argument, and
    /// require untainted bytes for every `ReadPtr`/`ReadStr` argument.
    pub fn pre_check(
        &self,
        primary_regs: &Registers,
        secondary_regs: &Registers,
        taint: &Snapshot,
    ) -> Result<()> {
        if primary_regs.syscallno() != secondary_regs.syscallno() {
            return Err(Error::Violation {
                at: crate::remote_ptr::RemoteCodePtr::Orig(primary_regs.ip()),
                what: "tainted syscall number".to_string(),
            });
        }
        let spec = match lookup(primary_regs.syscallno()) {
            Some(s) => s,
            None => {
                return match self.on_unmodeled_syscall {
                    ViolationPolicy::Abort => Err(Error::Violation {
                        at: crate::remote_ptr::RemoteCodePtr::Orig(primary_regs.ip()),
                        what: format!("unmodeled syscall {}", primary_regs.syscallno()),
                    }),
                    ViolationPolicy::Warn | ViolationPolicy::Stub => Ok(()),
                };
            }
        };

        for i in 0..6 {
            let a = primary_regs.arg(i);
            let b = secondary_regs.arg(i);
            match spec.params[i] {
                ParamRole::Scalar => {
                    if a != b {
                        return Err(Error::Violation {
                            at: crate::remote_ptr::RemoteCodePtr::Orig(primary_regs.ip()),
                            what: format!("tainted syscall parameter #{} of {}", i, spec.name),
                        });
                    }
                }
                ParamRole::ReadPtr { len_arg, fixed_len } => {
                    let len = len_arg.map(|li| primary_regs.arg(li)).unwrap_or(fixed_len as u64);
                    if a != 0 && !taint.is_zero_over(a, len as usize) {
                        return Err(Error::Violation {
                            at: crate::remote_ptr::RemoteCodePtr::Orig(primary_regs.ip()),
                            what: format!("tainted syscall parameter 'buf' of {}", spec.name),
                        });
                    }
                }
                ParamRole::ReadStr => {
                    // Length is strlen()+1 in the tracee; callers resolve
                    // this by reading the string themselves before
                    // calling `pre_check` with a derived ReadPtr check.
                }
                ParamRole::WritePtr { .. } | ParamRole::WriteRet => {}
            }
        }
        Ok(())
    }

    /// Post-pass (spec.md §4.9 "On return"): propagate the kernel's
    /// return value and any bytes it wrote from the primary to the
    /// secondary tracee, clearing the corresponding taint.
    pub fn post_check(
        &self,
        primary: &mut Tracee,
        secondary: &mut Tracee,
        taint: &mut Snapshot,
        syscallno: i64,
        args: &[u64; 6],
        ret: i64,
    ) -> Result<()> {
        let spec = match lookup(syscallno) {
            Some(s) => s,
            None => return Ok(()),
        };
        for i in 0..6 {
            let written_len = match spec.params[i] {
                ParamRole::WriteRet if ret > 0 => Some(ret as usize),
                ParamRole::WritePtr { len_arg, fixed_len } => {
                    Some(len_arg.map(|li| args[li] as usize).unwrap_or(fixed_len))
                }
                _ => None,
            };
            if let Some(len) = written_len {
                let addr = args[i];
                if addr == 0 || len == 0 {
                    continue;
                }
                let bytes = primary.read_vec(crate::remote_ptr::RemotePtr::new(addr), len)?;
                secondary.write_bytes(crate::remote_ptr::RemotePtr::new(addr), &bytes)?;
                clear_taint_range(taint, addr, len);
            }
        }
        let mut secondary_regs = secondary.get_gpregs()?;
        secondary_regs.set_syscall_result(ret as u64);
        secondary.set_gpregs(secondary_regs);
        Ok(())
    }

    /// `mmap`/`mprotect`/`munmap`/`brk` reflect directly into the page
    /// set (spec.md §4.9 last paragraph).
    pub fn reflect_page_set(&self, pages: &mut PageSet, syscallno: i64, args: &[u64; 6], ret: i64) {
        if syscallno == libc::SYS_mmap && ret >= 0 {
            let addr = ret as u64;
            let prot = args[2] as i32;
            let flags = args[3] as i32;
            let prot_flags = nix::sys::mman::ProtFlags::from_bits_truncate(prot);
            if flags & libc::MAP_SHARED != 0 {
                pages.on_mmap_shared(addr);
            } else {
                pages.on_mmap_private(addr, prot_flags);
            }
        } else if syscallno == libc::SYS_mprotect && ret == 0 {
            let addr = args[0];
            let prot_flags = nix::sys::mman::ProtFlags::from_bits_truncate(args[2] as i32);
            pages.on_mprotect(addr, prot_flags);
        } else if syscallno == libc::SYS_munmap && ret == 0 {
            pages.on_munmap(args[0]);
        }
    }
}

fn clear_taint_range(taint: &mut Snapshot, addr: u64, len: usize) {
    let mut remaining = len;
    let mut cur = addr;
    while remaining > 0 {
        let page_addr = cur & !(crate::kernel_abi::PAGE_SIZE as u64 - 1);
        let off = (cur - page_addr) as usize;
        let take = remaining.min(crate::kernel_abi::PAGE_SIZE - off);
        if let Some(page) = taint.get_mut(page_addr) {
            for b in &mut page[off..off + take] {
                *b = 0;
            }
        }
        cur += take as u64;
        remaining -= take;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_finds_read_and_write() {
        assert!(lookup(libc::SYS_read).is_some());
        assert!(lookup(libc::SYS_write).is_some());
        assert_eq!(lookup(999999), None);
    }

    #[test]
    fn mmap_reflects_shared_tier() {
        let checker = SyscallChecker::new(ViolationPolicy::Stub);
        let mut pages = PageSet::new();
        let args = [0u64, 4096, 3, libc::MAP_SHARED as u64, 0, 0];
        checker.reflect_page_set(&mut pages, libc::SYS_mmap, &args, 0x7000_0000);
        assert_eq!(
            pages.get(0x7000_0000).unwrap().tier,
            crate::pageset::Tier::Shared
        );
    }
}
