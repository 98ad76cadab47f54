//! Instruction blob: a mutable, rewrite-able copy of one original
//! instruction, living either in original or pool address space
//! (spec.md §3 "Instruction blob", §4.3). Grounded on original_source's
//! `src/inst.hh`/`.cc` and `src/dbi/inst.hh` for the exact relocation and
//! retargeting rules, expressed with `iced-x86`'s encoder/decoder instead
//! of hand-rolled byte surgery for the non-PC-relative cases.

use crate::decoder::{decode_one, IClass};
use crate::kernel_abi::MAX_INSN_LEN;
use iced_x86::Mnemonic;

/// A single rewritten instruction. `pc` is the address this blob's bytes
/// are valid *as if placed at*; it is updated by `relocate`.
#[derive(Clone, Debug)]
pub struct InstructionBlob {
    pc: u64,
    buf: [u8; MAX_INSN_LEN],
    len: usize,
    iclass: IClass,
    iform: Mnemonic,
    has_rip_relative_mem: bool,
    branch_rel_target: Option<i64>,
    cc: Option<u8>,
    indirect_target_reg: Option<u8>,
    touches_rsp: bool,
    is_push_or_pop: bool,
    has_lock_prefix: bool,
    /// False once a rewrite has produced bytes the decoder can no longer
    /// account for; callers must treat the blob as unusable.
    good: bool,
}

impl InstructionBlob {
    /// Construct directly from already-decoded bytes (the common path:
    /// the block translator decodes once, then builds blobs from the
    /// result).
    pub fn from_bytes(pc: u64, bytes: &[u8]) -> Option<InstructionBlob> {
        let d = decode_one(bytes, pc)?;
        let mut buf = [0u8; MAX_INSN_LEN];
        buf[..d.length].copy_from_slice(&d.bytes);
        Some(InstructionBlob {
            pc,
            buf,
            len: d.length,
            iclass: d.iclass,
            iform: d.iform,
            has_rip_relative_mem: d.has_rip_relative_mem,
            branch_rel_target: d.branch_rel_target,
            cc: d.cc,
            indirect_target_reg: d.indirect_target_reg,
            touches_rsp: d.touches_rsp,
            is_push_or_pop: d.is_push_or_pop,
            has_lock_prefix: d.has_lock_prefix,
            good: true,
        })
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
    pub fn iclass(&self) -> IClass {
        self.iclass
    }
    pub fn iform(&self) -> Mnemonic {
        self.iform
    }
    pub fn is_good(&self) -> bool {
        self.good
    }
    pub fn has_rip_relative_mem(&self) -> bool {
        self.has_rip_relative_mem
    }
    pub fn branch_rel_target(&self) -> Option<i64> {
        self.branch_rel_target
    }
    /// Absolute target of a direct branch (Jcc/DirJmp/DirCall only).
    pub fn branch_target(&self) -> Option<u64> {
        self.branch_rel_target
            .map(|rel| (self.pc as i64 + self.len as i64 + rel) as u64)
    }
    pub fn cc(&self) -> Option<u8> {
        self.cc
    }
    pub fn indirect_target_reg(&self) -> Option<u8> {
        self.indirect_target_reg
    }
    /// Whether any register operand is RSP (spec.md §4.8 stack tracker).
    pub fn touches_rsp(&self) -> bool {
        self.touches_rsp
    }
    pub fn is_push_or_pop(&self) -> bool {
        self.is_push_or_pop
    }
    pub fn has_lock_prefix(&self) -> bool {
        self.has_lock_prefix
    }

    fn mark_bad(&mut self) {
        self.good = false;
    }

    fn set_bytes(&mut self, bytes: &[u8]) {
        if bytes.len() > MAX_INSN_LEN {
            self.mark_bad();
            return;
        }
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
    }

    /// Adjust any PC-relative encoding so the instruction means the same
    /// thing from `new_pc`. Short (8-bit) conditional branches are
    /// widened to the 32-bit `0f 8x` form, per spec.md §4.3; the caller
    /// must have reserved the larger size in the pool.
    pub fn relocate(&mut self, new_pc: u64) {
        if !self.good {
            return;
        }
        if let Some(rel) = self.branch_rel_target {
            // absolute target is invariant across relocation
            let abs_target = self.pc as i64 + self.len as i64 + rel;
            match self.iclass {
                IClass::Jcc if self.is_short_branch() => {
                    self.widen_short_jcc();
                    let new_len = self.len;
                    let new_rel = abs_target - (new_pc as i64 + new_len as i64);
                    self.patch_rel32(new_rel);
                    self.branch_rel_target = Some(new_rel);
                }
                IClass::Jcc | IClass::DirJmp | IClass::DirCall => {
                    let new_rel = abs_target - (new_pc as i64 + self.len as i64);
                    self.patch_rel32(new_rel);
                    self.branch_rel_target = Some(new_rel);
                }
                _ => {}
            }
        }
        self.pc = new_pc;
    }

    fn is_short_branch(&self) -> bool {
        self.iclass == IClass::Jcc && self.len <= 2
    }

    /// `7x rb` -> `0f 8x rd`: widen a short conditional branch's
    /// displacement field from 8 to 32 bits in place, per spec.md §4.3.
    fn widen_short_jcc(&mut self) {
        if self.len != 2 || self.buf[0] & 0xf0 != 0x70 {
            self.mark_bad();
            return;
        }
        let cc = self.buf[0] & 0x0f;
        let mut new_buf = [0u8; MAX_INSN_LEN];
        new_buf[0] = 0x0f;
        new_buf[1] = 0x80 | cc;
        // displacement patched separately by patch_rel32
        self.buf = new_buf;
        self.len = 6;
    }

    /// Patch the trailing rel32/rel8 field of a direct branch with
    /// `new_rel`. Assumes the instruction's opcode prefix has already
    /// been set to its final (possibly widened) form.
    fn patch_rel32(&mut self, new_rel: i64) {
        if self.len < 4 {
            self.mark_bad();
            return;
        }
        if !(i32::MIN as i64..=i32::MAX as i64).contains(&new_rel) {
            self.mark_bad();
            return;
        }
        let rel32 = new_rel as i32;
        let off = self.len - 4;
        self.buf[off..off + 4].copy_from_slice(&rel32.to_le_bytes());
    }

    /// Rewrite the direct-branch target to `new_dst`, without changing
    /// `pc`. Used when a terminator resolves a previously-unresolved arm.
    pub fn retarget(&mut self, new_dst: u64) {
        if !self.good {
            return;
        }
        match self.iclass {
            IClass::Jcc | IClass::DirJmp | IClass::DirCall => {
                let new_rel = new_dst as i64 - (self.pc as i64 + self.len as i64);
                self.patch_rel32(new_rel);
                self.branch_rel_target = Some(new_rel);
            }
            _ => self.mark_bad(),
        }
    }

    /// Modify the reg field of the ModR/M byte (bits 3-5), optionally
    /// re-decoding afterward to keep the cached descriptor consistent.
    pub fn modrm_rm(&mut self, reg: u8, redecode: bool) {
        if self.len < 2 {
            self.mark_bad();
            return;
        }
        // ModR/M is the byte right after any prefixes + the primary
        // opcode byte; for the single-byte-opcode instructions this
        // rewrite targets, that's buf[1].
        let modrm = self.buf[1];
        self.buf[1] = (modrm & 0xc7) | ((reg & 0x7) << 3);
        if redecode {
            if let Some(d) = decode_one(&self.buf[..self.len], self.pc) {
                self.iclass = d.iclass;
                self.iform = d.iform;
            } else {
                self.mark_bad();
            }
        }
    }

    /// Convert a near CALL into the equivalent near JMP (both direct
    /// `e8` -> `e9` and indirect `ff /2` -> `ff /4` forms), per spec.md
    /// §4.3.
    pub fn call_to_jmp(&mut self) {
        if !matches!(self.iclass, IClass::DirCall | IClass::IndCall) {
            self.mark_bad();
            return;
        }
        if self.len >= 1 && self.buf[0] == 0xe8 {
            self.buf[0] = 0xe9; // direct call -> direct jmp, same rel32 layout
            self.iclass = IClass::DirJmp;
            return;
        }
        if self.len >= 2 && self.buf[0] == 0xff {
            let modrm = self.buf[1];
            let reg = (modrm >> 3) & 0x7;
            if reg == 2 {
                self.buf[1] = (modrm & 0xc7) | (4 << 3); // /2 -> /4
                self.iclass = IClass::IndJmp;
                return;
            }
        }
        self.mark_bad();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn relocate_rewrites_rel32_jmp() {
        // e9 00 00 00 00 = jmp rel32=0, target = pc+5
        let mut blob = InstructionBlob::from_bytes(0x1000, &[0xe9, 0x00, 0x00, 0x00, 0x00]).unwrap();
        let target = 0x1000 + 5;
        blob.relocate(0x2000);
        let new_target = 0x2000i64 + blob.len() as i64 + i32::from_le_bytes(blob.bytes()[1..5].try_into().unwrap()) as i64;
        assert_eq!(new_target, target);
    }

    #[test]
    fn widen_short_jcc_on_relocate() {
        // 74 10 = je rel8=0x10, target = pc + 2 + 0x10
        let mut blob = InstructionBlob::from_bytes(0x1000, &[0x74, 0x10]).unwrap();
        let target = 0x1000 + 2 + 0x10;
        blob.relocate(0x5000);
        assert_eq!(blob.len(), 6);
        assert_eq!(blob.bytes()[0], 0x0f);
        assert_eq!(blob.bytes()[1], 0x84);
        let new_target = 0x5000i64 + 6 + i32::from_le_bytes(blob.bytes()[2..6].try_into().unwrap()) as i64;
        assert_eq!(new_target, target);
    }

    #[test]
    fn call_to_jmp_direct() {
        let mut blob = InstructionBlob::from_bytes(0x1000, &[0xe8, 0, 0, 0, 0]).unwrap();
        blob.call_to_jmp();
        assert_eq!(blob.bytes()[0], 0xe9);
        assert_eq!(blob.iclass(), IClass::DirJmp);
    }

    #[test]
    fn retarget_direct_jmp() {
        let mut blob = InstructionBlob::from_bytes(0x1000, &[0xe9, 0, 0, 0, 0]).unwrap();
        blob.retarget(0x9000);
        let rel = i32::from_le_bytes(blob.bytes()[1..5].try_into().unwrap()) as i64;
        assert_eq!(blob.pc() as i64 + blob.len() as i64 + rel, 0x9000);
    }
}
