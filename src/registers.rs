//! General-purpose register snapshot, grounded on the teacher's
//! `Registers` (get/set accessors over a `ptrace(PTRACE_GETREGS)`-shaped
//! struct, a dirty/lazy-writeback split owned by `Tracee` rather than
//! here). Single x86-64 arch only, per spec.md §1.

const X86_TF_FLAG: u64 = 1 << 8;
const X86_DF_FLAG: u64 = 1 << 10;

/// A copy of `libc::user_regs_struct`, the exact shape ptrace
/// GETREGS/SETREGS reads and writes.
#[derive(Copy, Clone)]
pub struct Registers {
    raw: libc::user_regs_struct,
}

impl Default for Registers {
    fn default() -> Registers {
        // Safety: `user_regs_struct` is a plain collection of integer
        // registers; the all-zero bit pattern is a valid value.
        Registers {
            raw: unsafe { std::mem::zeroed() },
        }
    }
}

impl PartialEq for Registers {
    fn eq(&self, other: &Registers) -> bool {
        macro_rules! same {
            ($($f:ident),* $(,)?) => {
                $(self.raw.$f == other.raw.$f)&&*
            };
        }
        same!(
            rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp, r8, r9, r10, r11, r12, r13, r14, r15, rip,
            eflags, orig_rax, cs, ss, ds, es, fs, gs, fs_base, gs_base
        )
    }
}
impl Eq for Registers {}

impl std::fmt::Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registers")
            .field("rip", &format_args!("{:#x}", self.raw.rip))
            .field("rsp", &format_args!("{:#x}", self.raw.rsp))
            .field("rax", &format_args!("{:#x}", self.raw.rax))
            .finish()
    }
}

macro_rules! reg_accessor {
    ($get:ident, $set:ident, $field:ident) => {
        pub fn $get(&self) -> u64 {
            self.raw.$field
        }
        pub fn $set(&mut self, val: u64) {
            self.raw.$field = val;
        }
    };
}

impl Registers {
    pub fn new(raw: libc::user_regs_struct) -> Registers {
        Registers { raw }
    }

    pub fn raw(&self) -> libc::user_regs_struct {
        self.raw
    }

    reg_accessor!(rax, set_rax, rax);
    reg_accessor!(rbx, set_rbx, rbx);
    reg_accessor!(rcx, set_rcx, rcx);
    reg_accessor!(rdx, set_rdx, rdx);
    reg_accessor!(rsi, set_rsi, rsi);
    reg_accessor!(rdi, set_rdi, rdi);
    reg_accessor!(rbp, set_rbp, rbp);
    reg_accessor!(rsp, set_rsp, rsp);
    reg_accessor!(r8, set_r8, r8);
    reg_accessor!(r9, set_r9, r9);
    reg_accessor!(r10, set_r10, r10);
    reg_accessor!(r11, set_r11, r11);
    reg_accessor!(r12, set_r12, r12);
    reg_accessor!(r13, set_r13, r13);
    reg_accessor!(r14, set_r14, r14);
    reg_accessor!(r15, set_r15, r15);
    reg_accessor!(ip, set_ip, rip);
    reg_accessor!(orig_rax, set_orig_rax, orig_rax);

    pub fn syscallno(&self) -> i64 {
        self.raw.orig_rax as i64
    }
    pub fn set_syscallno(&mut self, no: i64) {
        self.raw.orig_rax = no as u64;
    }

    pub fn syscall_result(&self) -> u64 {
        self.raw.rax
    }
    pub fn syscall_result_signed(&self) -> i64 {
        self.raw.rax as i64
    }
    pub fn set_syscall_result(&mut self, val: u64) {
        self.raw.rax = val;
    }

    pub fn flags(&self) -> u64 {
        self.raw.eflags
    }
    pub fn set_flags(&mut self, value: u64) {
        self.raw.eflags = value;
    }

    pub fn trap_flag(&self) -> bool {
        self.flags() & X86_TF_FLAG != 0
    }
    pub fn set_trap_flag(&mut self, on: bool) {
        let f = self.flags();
        self.set_flags(if on { f | X86_TF_FLAG } else { f & !X86_TF_FLAG });
    }
    pub fn direction_flag(&self) -> bool {
        self.flags() & X86_DF_FLAG != 0
    }

    /// Read a general-purpose register by its raw x86-64 encoding number
    /// (0=rax..7=rdi, 8=r8..15=r15), the same numbering ModR/M and REX.B
    /// use. Used to recover an indirect branch's target from the register
    /// it was decoded in, once a terminator trampoline traps rather than
    /// running the original instruction (spec.md §4.5 "IndJmp"/"IndCall").
    pub fn gpr(&self, num: u8) -> u64 {
        match num {
            0 => self.raw.rax,
            1 => self.raw.rcx,
            2 => self.raw.rdx,
            3 => self.raw.rbx,
            4 => self.raw.rsp,
            5 => self.raw.rbp,
            6 => self.raw.rsi,
            7 => self.raw.rdi,
            8 => self.raw.r8,
            9 => self.raw.r9,
            10 => self.raw.r10,
            11 => self.raw.r11,
            12 => self.raw.r12,
            13 => self.raw.r13,
            14 => self.raw.r14,
            15 => self.raw.r15,
            _ => panic!("gpr number out of range: {}", num),
        }
    }

    /// Return the syscall argument in ABI order (rdi, rsi, rdx, r10, r8, r9).
    pub fn arg(&self, index: usize) -> u64 {
        match index {
            0 => self.raw.rdi,
            1 => self.raw.rsi,
            2 => self.raw.rdx,
            3 => self.raw.r10,
            4 => self.raw.r8,
            5 => self.raw.r9,
            _ => panic!("syscall argument index out of range: {}", index),
        }
    }
    pub fn set_arg(&mut self, index: usize, val: u64) {
        match index {
            0 => self.raw.rdi = val,
            1 => self.raw.rsi = val,
            2 => self.raw.rdx = val,
            3 => self.raw.r10 = val,
            4 => self.raw.r8 = val,
            5 => self.raw.r9 = val,
            _ => panic!("syscall argument index out of range: {}", index),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trap_flag_round_trips() {
        let mut r = Registers::default();
        assert!(!r.trap_flag());
        r.set_trap_flag(true);
        assert!(r.trap_flag());
        r.set_trap_flag(false);
        assert!(!r.trap_flag());
    }

    #[test]
    fn gpr_reads_raw_encoding_numbers() {
        let mut r = Registers::default();
        r.set_r11(0xdead);
        r.raw.rdi = 0x1234;
        assert_eq!(r.gpr(11), 0xdead);
        assert_eq!(r.gpr(7), 0x1234);
    }

    #[test]
    fn syscall_args_map_to_abi_registers() {
        let mut r = Registers::default();
        r.set_arg(0, 1);
        r.set_arg(3, 42);
        assert_eq!(r.raw().rdi, 1);
        assert_eq!(r.raw().r10, 42);
        assert_eq!(r.arg(0), 1);
        assert_eq!(r.arg(3), 42);
    }
}
