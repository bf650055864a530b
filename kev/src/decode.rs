//! Instruction decoder.
//!
//! Wraps `iced_x86`'s decoder — already pulled in by [`crate::vmcs`] to
//! read the faulting instruction off an EPT-violation exit — and produces
//! the shape [`crate::emulate`] actually wants to dispatch on: a decoded
//! [`iced_x86::Instruction`] plus the prefix/flag metadata the emulator
//! needs to know before it starts reading operands.

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};

/// Processor mode in effect for the instruction being decoded, matching
/// the CS descriptor / `EFER.LMA` combination the vCPU was in at the
/// time of the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// Unpaged real-address mode. `opsize=2, adsize=2`.
    Real,
    /// 16-bit protected mode. `opsize=2, adsize=2`.
    Prot16,
    /// 32-bit protected mode. `opsize=4, adsize=4`.
    Prot32,
    /// IA-32e 64-bit mode. `opsize=4, adsize=8` (REX.W promotes opsize to 8).
    Prot64,
}

impl CpuMode {
    /// Decoder bitness (`16`/`32`/`64`) iced_x86 wants.
    pub fn bitness(self) -> u32 {
        match self {
            CpuMode::Real | CpuMode::Prot16 => 16,
            CpuMode::Prot32 => 32,
            CpuMode::Prot64 => 64,
        }
    }

    /// Default, unprefixed operand size in bytes.
    pub fn default_operand_size(self) -> u32 {
        match self {
            CpuMode::Real | CpuMode::Prot16 => 2,
            CpuMode::Prot32 | CpuMode::Prot64 => 4,
        }
    }

    /// Default, unprefixed address size in bytes.
    pub fn default_address_size(self) -> u32 {
        match self {
            CpuMode::Real | CpuMode::Prot16 => 2,
            CpuMode::Prot32 => 4,
            CpuMode::Prot64 => 8,
        }
    }
}

/// REP-class prefix actually present on the instruction, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepPrefix {
    /// `F3` on a string instruction (unconditional repeat).
    Rep,
    /// `F3` on a `CMPS`/`SCAS`-class instruction (repeat while `ZF=1`).
    RepE,
    /// `F2` on a `CMPS`/`SCAS`-class instruction (repeat while `ZF=0`).
    RepNe,
}

/// Why [`decode_insn`] refused to produce a usable decode. The caller
/// (vmexit handling, one layer up) is expected to translate any of these
/// into a `#UD` injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// iced_x86 itself rejected the byte stream (reserved/invalid opcode,
    /// truncated instruction, bad VEX).
    Invalid,
    /// A `REP`/`REPE`/`REPNE` prefix decorates a non-string opcode.
    RepOnNonString,
    /// VEX-encoded instruction also carries `LOCK`, a legacy `66/F2/F3`
    /// prefix, or `REX` — SDM-illegal combination.
    VexPrefixConflict,
}

/// Fully decoded instruction plus the prefix metadata the emulator
/// dispatch loop consults before reading any operand.
#[derive(Debug, Clone)]
pub struct EmContext {
    /// Processor mode the decode was performed under.
    pub mode: CpuMode,
    /// The decoded instruction, in `iced_x86`'s representation.
    pub insn: Instruction,
    /// Exact encoded length in bytes; RIP advances by this much on
    /// successful commit.
    pub len: u32,
    /// REP-class prefix, if present and valid for this mnemonic.
    pub rep: Option<RepPrefix>,
    /// Whether this mnemonic is handled by a fixed-width ALU fastop
    /// rather than a bespoke soft handler.
    pub is_fastop: bool,
}

fn is_string_mnemonic(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Movsb
            | Mnemonic::Movsw
            | Mnemonic::Movsd
            | Mnemonic::Movsq
            | Mnemonic::Stosb
            | Mnemonic::Stosw
            | Mnemonic::Stosd
            | Mnemonic::Stosq
            | Mnemonic::Lodsb
            | Mnemonic::Lodsw
            | Mnemonic::Lodsd
            | Mnemonic::Lodsq
            | Mnemonic::Cmpsb
            | Mnemonic::Cmpsw
            | Mnemonic::Cmpsd
            | Mnemonic::Cmpsq
            | Mnemonic::Scasb
            | Mnemonic::Scasw
            | Mnemonic::Scasd
            | Mnemonic::Scasq
    )
}

fn is_repx_mnemonic(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Cmpsb
            | Mnemonic::Cmpsw
            | Mnemonic::Cmpsd
            | Mnemonic::Cmpsq
            | Mnemonic::Scasb
            | Mnemonic::Scasw
            | Mnemonic::Scasd
            | Mnemonic::Scasq
    )
}

/// ALU-class mnemonics dispatched through the fixed-width fastop path
/// rather than a bespoke soft handler (SDM "Design Notes": sized dispatch
/// on a generic handler rather than the source's `handler_base +
/// size_index*16` assembly jump table).
pub fn is_fastop_mnemonic(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Add
            | Mnemonic::Or
            | Mnemonic::Adc
            | Mnemonic::Sbb
            | Mnemonic::And
            | Mnemonic::Sub
            | Mnemonic::Xor
            | Mnemonic::Cmp
            | Mnemonic::Test
            | Mnemonic::Not
            | Mnemonic::Neg
            | Mnemonic::Inc
            | Mnemonic::Dec
            | Mnemonic::Bt
            | Mnemonic::Bts
            | Mnemonic::Btr
            | Mnemonic::Btc
    )
}

/// Mnemonics this core implements a soft (non-fastop) handler for. Any
/// other mnemonic that reaches the dispatcher is `NOTIMPL`.
pub fn has_soft_handler(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Mov
            | Mnemonic::Movzx
            | Mnemonic::Movsx
            | Mnemonic::Movsxd
            | Mnemonic::Push
            | Mnemonic::Pop
            | Mnemonic::Andn
            | Mnemonic::Bextr
    ) || is_string_mnemonic(m)
}

/// Decode one instruction starting at `rip` out of `bytes` (which must
/// contain at least the instruction's encoded length; extra trailing
/// bytes are ignored). Rejects anything this core can't emulate before
/// the caller ever builds an [`EmContext`] around it for the general
/// opcode-table flags described in the component design.
pub fn decode_insn(mode: CpuMode, bytes: &[u8], rip: u64) -> Result<EmContext, DecodeError> {
    let mut decoder = Decoder::with_ip(mode.bitness(), bytes, rip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(DecodeError::Invalid);
    }
    let mut insn = Instruction::default();
    decoder.decode_out(&mut insn);
    if insn.is_invalid() {
        return Err(DecodeError::Invalid);
    }

    if insn.has_vex_prefix() || insn.has_xop_prefix() {
        // A 2-/3-byte VEX/XOP encoding is, by construction, mutually
        // exclusive with LOCK and legacy 66/F2/F3/REX bytes; iced_x86
        // would already have failed to decode an illegal combination,
        // but a defensive re-check keeps this invariant explicit and
        // independent of decoder internals.
        if insn.has_lock_prefix() || insn.has_rep_prefix() || insn.has_repne_prefix() {
            return Err(DecodeError::VexPrefixConflict);
        }
    }

    let mnemonic = insn.mnemonic();
    let rep = if insn.has_rep_prefix() {
        Some(if is_repx_mnemonic(mnemonic) {
            RepPrefix::RepE
        } else {
            RepPrefix::Rep
        })
    } else if insn.has_repne_prefix() {
        Some(RepPrefix::RepNe)
    } else {
        None
    };

    if rep.is_some() && !is_string_mnemonic(mnemonic) {
        return Err(DecodeError::RepOnNonString);
    }

    let is_fastop = is_fastop_mnemonic(mnemonic);
    if !is_fastop && !has_soft_handler(mnemonic) {
        return Err(DecodeError::Invalid);
    }

    Ok(EmContext {
        mode,
        len: insn.len() as u32,
        insn,
        rep,
        is_fastop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_add_al_imm8() {
        // ADD AL, 0x01
        let ctx = decode_insn(CpuMode::Prot64, &[0x04, 0x01], 0).unwrap();
        assert_eq!(ctx.insn.mnemonic(), Mnemonic::Add);
        assert_eq!(ctx.len, 2);
        assert!(ctx.is_fastop);
        assert!(ctx.rep.is_none());
    }

    #[test]
    fn decodes_movzx_32_from_16() {
        // MOVZX EAX, CX
        let ctx = decode_insn(CpuMode::Prot64, &[0x0f, 0xb7, 0xc1], 0).unwrap();
        assert_eq!(ctx.insn.mnemonic(), Mnemonic::Movzx);
        assert!(!ctx.is_fastop);
    }

    #[test]
    fn rep_movsw_is_accepted_as_string_rep() {
        // REP MOVSW
        let ctx = decode_insn(CpuMode::Prot64, &[0xf3, 0x66, 0xa5], 0).unwrap();
        assert_eq!(ctx.insn.mnemonic(), Mnemonic::Movsw);
        assert_eq!(ctx.rep, Some(RepPrefix::Rep));
    }

    #[test]
    fn rep_on_non_string_opcode_is_rejected() {
        // F3 04 01 -- REP prefix glued onto ADD AL, imm8.
        let err = decode_insn(CpuMode::Prot64, &[0xf3, 0x04, 0x01], 0).unwrap_err();
        assert_eq!(err, DecodeError::RepOnNonString);
    }

    #[test]
    fn bt_memory_reg_decodes_as_fastop_bitop() {
        // BT [RCX+0x08], RAX  ->  0F A3 /r
        let ctx = decode_insn(CpuMode::Prot64, &[0x48, 0x0f, 0xa3, 0x41, 0x08], 0).unwrap();
        assert_eq!(ctx.insn.mnemonic(), Mnemonic::Bt);
        assert!(ctx.is_fastop);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = decode_insn(CpuMode::Prot64, &[0x0f, 0xff], 0).unwrap_err();
        assert_eq!(err, DecodeError::Invalid);
    }
}
