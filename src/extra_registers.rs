//! Floating-point/XMM register snapshot, the `user_fpregs_struct` shape
//! read/written by `PTRACE_GETFPREGS`/`PTRACE_SETFPREGS`. Grounded on the
//! teacher's split of `Registers` (GP) from `ExtraRegisters` (FP), used
//! together to make up a `State` (spec.md §3, "State").

#[derive(Copy, Clone)]
pub struct ExtraRegisters {
    raw: libc::user_fpregs_struct,
}

impl Default for ExtraRegisters {
    fn default() -> ExtraRegisters {
        ExtraRegisters {
            raw: unsafe { std::mem::zeroed() },
        }
    }
}

impl ExtraRegisters {
    pub fn new(raw: libc::user_fpregs_struct) -> ExtraRegisters {
        ExtraRegisters { raw }
    }

    pub fn raw(&self) -> libc::user_fpregs_struct {
        self.raw
    }

    pub fn as_bytes(&self) -> &[u8] {
        let ptr = &self.raw as *const libc::user_fpregs_struct as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<libc::user_fpregs_struct>()) }
    }
}

impl PartialEq for ExtraRegisters {
    fn eq(&self, other: &ExtraRegisters) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}
impl Eq for ExtraRegisters {}

impl std::fmt::Debug for ExtraRegisters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExtraRegisters {{ {} bytes }}", self.as_bytes().len())
    }
}
