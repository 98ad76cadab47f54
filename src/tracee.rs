//! The ptrace-mediated tracee abstraction (spec.md §4.1). Grounded on
//! the teacher's `task_interface::task::Task` (register writeback cache,
//! `flush_regs`/`invalidate_caches`, `fallible_ptrace`/`xptrace` split)
//! and on the `nix`-based ptrace call style in the pack's `systrace`
//! `TracedTask`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::extra_registers::ExtraRegisters;
use crate::kernel_abi::{PTRACE_EVENT_FORK, SYSCALL_INSN};
use crate::registers::Registers;
use crate::remote_ptr::RemotePtr;
use crate::wait_status::WaitStatus;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeRequest {
    Cont,
    Singlestep,
    ContSyscall,
}

/// One attached child process. Presents bulk memory I/O over
/// `/proc/<pid>/mem`, a lazily-fetched/write-back register cache, and
/// execution control (spec.md §4.1).
pub struct Tracee {
    pub tid: libc::pid_t,
    mem_fd: File,
    regs: Option<Registers>,
    regs_dirty: bool,
    extra_regs: Option<ExtraRegisters>,
    extra_regs_dirty: bool,
    last_status: Option<WaitStatus>,
    suspended: bool,
}

impl Tracee {
    /// Attach to an already-`PTRACE_TRACEME`'d / `PTRACE_ATTACH`'d child
    /// and open its `/proc/<pid>/mem`.
    pub fn attach(tid: libc::pid_t) -> Result<Tracee> {
        let mem_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{}/mem", tid))
            .map_err(|e| Error::Fatal(format!("open /proc/{}/mem: {}", tid, e)))?;
        Ok(Tracee {
            tid,
            mem_fd,
            regs: None,
            regs_dirty: false,
            extra_regs: None,
            extra_regs_dirty: false,
            last_status: None,
            suspended: false,
        })
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.tid)
    }

    pub fn suspended(&self) -> bool {
        self.suspended
    }
    pub fn set_suspended(&mut self, v: bool) {
        self.suspended = v;
    }

    pub fn status(&self) -> Option<WaitStatus> {
        self.last_status
    }

    // ---- bulk memory I/O -------------------------------------------------

    pub fn read_bytes(&mut self, addr: RemotePtr<u8>, buf: &mut [u8]) -> Result<()> {
        self.mem_fd
            .read_exact_at(buf, addr.as_u64())
            .map_err(|e| Error::Fatal(format!("pread at {}: {}", addr, e)))
    }

    pub fn read_vec(&mut self, addr: RemotePtr<u8>, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_bytes(addr, &mut buf)?;
        Ok(buf)
    }

    pub fn write_bytes(&mut self, addr: RemotePtr<u8>, buf: &[u8]) -> Result<()> {
        self.mem_fd
            .write_all_at(buf, addr.as_u64())
            .map_err(|e| Error::Fatal(format!("pwrite at {}: {}", addr, e)))
    }

    /// Copies `/proc/<pid>/maps` to `path`, for the `-m FILE` dump on
    /// `SIGINT` or a fatal assertion (spec.md §4.10, §6).
    pub fn dump_maps(&self, path: &str) -> Result<()> {
        std::fs::copy(format!("/proc/{}/maps", self.tid), path)
            .map(|_| ())
            .map_err(|e| Error::Fatal(format!("dump maps for {}: {}", self.tid, e)))
    }

    pub fn read_val_mem<T: Copy>(&mut self, addr: RemotePtr<T>) -> Result<T> {
        let mut buf = vec![0u8; std::mem::size_of::<T>()];
        self.read_bytes(addr.cast(), &mut buf)?;
        Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
    }

    pub fn write_val_mem<T: Copy>(&mut self, addr: RemotePtr<T>, val: &T) -> Result<()> {
        let buf = unsafe {
            std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.write_bytes(addr.cast(), buf)
    }

    // ---- register I/O with writeback cache -------------------------------

    pub fn get_gpregs(&mut self) -> Result<Registers> {
        if self.regs.is_none() {
            let raw = ptrace::getregs(self.pid())?;
            self.regs = Some(Registers::new(raw));
        }
        Ok(self.regs.unwrap())
    }

    pub fn set_gpregs(&mut self, regs: Registers) {
        self.regs = Some(regs);
        self.regs_dirty = true;
    }

    pub fn get_extra_regs(&mut self) -> Result<ExtraRegisters> {
        if self.extra_regs.is_none() {
            let raw = ptrace::getfpregs(self.pid())?;
            self.extra_regs = Some(ExtraRegisters::new(raw));
        }
        Ok(self.extra_regs.unwrap())
    }

    pub fn set_extra_regs(&mut self, regs: ExtraRegisters) {
        self.extra_regs = Some(regs);
        self.extra_regs_dirty = true;
    }

    /// Write any dirty cached registers back to the tracee. Called
    /// before each resume.
    pub fn flush_caches(&mut self) -> Result<()> {
        if self.regs_dirty {
            if let Some(r) = self.regs {
                ptrace::setregs(self.pid(), r.raw())?;
            }
            self.regs_dirty = false;
        }
        if self.extra_regs_dirty {
            if let Some(r) = self.extra_regs {
                ptrace::setfpregs(self.pid(), r.raw())?;
            }
            self.extra_regs_dirty = false;
        }
        Ok(())
    }

    /// Discard cached registers; called after a stop so the next access
    /// refetches from the kernel.
    pub fn invalidate_caches(&mut self) {
        self.regs = None;
        self.extra_regs = None;
        self.regs_dirty = false;
        self.extra_regs_dirty = false;
    }

    // ---- execution control ------------------------------------------------

    pub fn singlestep(&mut self) -> Result<()> {
        self.flush_caches()?;
        ptrace::step(self.pid(), None)?;
        Ok(())
    }

    pub fn cont(&mut self, sig: Option<Signal>) -> Result<()> {
        self.flush_caches()?;
        ptrace::cont(self.pid(), sig)?;
        Ok(())
    }

    pub fn cont_syscall(&mut self) -> Result<()> {
        self.flush_caches()?;
        ptrace::syscall(self.pid(), None)?;
        Ok(())
    }

    pub fn resume(&mut self, how: ResumeRequest) -> Result<()> {
        match how {
            ResumeRequest::Cont => self.cont(None),
            ResumeRequest::Singlestep => self.singlestep(),
            ResumeRequest::ContSyscall => self.cont_syscall(),
        }
    }

    /// Block until the tracee next stops; records stopped/exited/signaled
    /// status.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        let status = waitpid(self.pid(), None)
            .map_err(|e| Error::TraceeDied {
                tid: self.tid,
                reason: format!("waitpid failed: {}", e),
            })?;
        self.invalidate_caches();
        let raw = nix_status_to_raw(status);
        let ws = WaitStatus::from_raw(raw);
        self.last_status = Some(ws);
        Ok(ws)
    }

    pub fn get_siginfo(&self) -> Result<libc::siginfo_t> {
        let data = ptrace::getsiginfo(self.pid())?;
        Ok(data)
    }

    /// Abort the run on any stop signal other than the ones the caller
    /// is prepared to handle (spec.md §4.1: "assert_stopsig aborts on
    /// unexpected stop signals").
    pub fn assert_stopsig(&self, ws: WaitStatus, expected: i32) -> Result<()> {
        match ws.stop_sig() {
            Some(sig) if sig == expected => Ok(()),
            Some(sig) => Err(Error::Fatal(format!(
                "tracee {} stopped with unexpected signal {} (expected {})",
                self.tid, sig, expected
            ))),
            None => Err(Error::Fatal(format!(
                "tracee {} not stopped as expected",
                self.tid
            ))),
        }
    }

    // ---- remote syscall injection -----------------------------------------

    /// Overwrite 2 bytes at `%rip` with `0f 05`, singlestep, then restore
    /// the original bytes and registers. Returns the syscall's return
    /// value (`%rax`) before restoration (spec.md §4.1).
    pub fn remote_syscall(&mut self, no: i64, args: &[u64; 6]) -> Result<i64> {
        let saved_regs = self.get_gpregs()?;
        let ip: RemotePtr<u8> = RemotePtr::new(saved_regs.ip());
        let saved_bytes = self.read_vec(ip, SYSCALL_INSN.len())?;

        self.write_bytes(ip, &SYSCALL_INSN)?;

        let mut regs = saved_regs;
        regs.set_syscallno(no);
        for (i, &a) in args.iter().enumerate() {
            regs.set_arg(i, a);
        }
        self.set_gpregs(regs);
        self.singlestep()?;
        self.wait()?;

        let result_regs = self.get_gpregs()?;
        let result = result_regs.syscall_result_signed();

        self.write_bytes(ip, &saved_bytes)?;
        self.set_gpregs(saved_regs);
        self.flush_caches()?;

        Ok(result)
    }

    /// Inject a remote `fork()` using the same 2-byte-overwrite
    /// technique, then complete the `PTRACE_EVENT_FORK` handshake (two
    /// consecutive trap events) and return the new tracee, attached
    /// (spec.md §4.1).
    pub fn remote_fork(&mut self) -> Result<Tracee> {
        let saved_regs = self.get_gpregs()?;
        let ip: RemotePtr<u8> = RemotePtr::new(saved_regs.ip());
        let saved_bytes = self.read_vec(ip, SYSCALL_INSN.len())?;
        self.write_bytes(ip, &SYSCALL_INSN)?;

        let mut regs = saved_regs;
        regs.set_syscallno(libc::SYS_fork);
        self.set_gpregs(regs);
        self.cont(None)?;
        let ws = self.wait()?;

        let new_pid = if ws.ptrace_event() == Some(PTRACE_EVENT_FORK) {
            ptrace::getevent(self.pid())? as libc::pid_t
        } else {
            return Err(Error::Fatal(
                "remote fork did not produce PTRACE_EVENT_FORK".to_string(),
            ));
        };

        // The child itself also traps (group-stop on its first
        // instruction) before we can attach semantics to it.
        let _ = waitpid(Pid::from_raw(new_pid), None);

        self.write_bytes(ip, &saved_bytes)?;
        self.set_gpregs(saved_regs);
        self.flush_caches()?;

        Tracee::attach(new_pid)
    }
}

fn nix_status_to_raw(status: nix::sys::wait::WaitStatus) -> i32 {
    use nix::sys::wait::WaitStatus as NixWs;
    match status {
        NixWs::Exited(_, code) => (code & 0xff) << 8,
        NixWs::Signaled(_, sig, core) => (sig as i32) | if core { 0x80 } else { 0 },
        NixWs::Stopped(_, sig) => 0x7f | ((sig as i32) << 8),
        NixWs::PtraceEvent(_, sig, event) => 0x7f | ((sig as i32) << 8) | (event << 16),
        NixWs::PtraceSyscall(_) => 0x7f | ((libc::SIGTRAP) << 8),
        NixWs::Continued(_) => 0xffff,
        NixWs::StillAlive => 0,
    }
}

pub struct SinglestepGuard<'a> {
    tracee: &'a mut Tracee,
    prev_trap_flag: bool,
}

impl<'a> SinglestepGuard<'a> {
    pub fn engage(tracee: &'a mut Tracee) -> Result<SinglestepGuard<'a>> {
        let mut regs = tracee.get_gpregs()?;
        let prev_trap_flag = regs.trap_flag();
        regs.set_trap_flag(true);
        tracee.set_gpregs(regs);
        Ok(SinglestepGuard {
            tracee,
            prev_trap_flag,
        })
    }
}

impl<'a> Drop for SinglestepGuard<'a> {
    fn drop(&mut self) {
        if let Ok(mut regs) = self.tracee.get_gpregs() {
            regs.set_trap_flag(self.prev_trap_flag);
            self.tracee.set_gpregs(regs);
        }
    }
}
