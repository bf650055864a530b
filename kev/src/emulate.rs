//! MMIO instruction emulator.
//!
//! Finishes an instruction that faulted on a memory-mapped I/O access: pulls
//! operands through [`VcpuOps`], dispatches to a fixed-width ALU "fastop" or
//! a soft handler, writes results back, and advances RIP. Built as an
//! explicit resumable state machine (`ReadDst -> ReadSrc1 -> ReadSrc2 ->
//! Execute -> WriteDst -> StringPostlude -> ReentryCheck -> Committed`) so a
//! suspension on an MMIO operand read or write can be resumed on the next
//! dispatch instead of restarting the instruction from scratch.

use abyss::x86_64::Rflags;
use iced_x86::{Mnemonic, OpKind, Register};

use crate::bits::{canonicalize, oszapc_mask, parity8, truncate_to_size, AddressWidth};
use crate::decode::{CpuMode, EmContext, RepPrefix};

/// Segment register an effective address is formed relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
}

/// Outcome of a memory read requested by the emulator.
pub enum MemRead {
    /// The read completed; `value` is zero-extended to 64 bits.
    Done(u64),
    /// The access targets an MMIO-backed GPA; the caller must complete it
    /// out of band and resume via [`read_memory_post`](VcpuOps::read_memory_post).
    ExitMmio { gpa: u64 },
}

/// Outcome of a memory write requested by the emulator.
pub enum MemWrite {
    /// The write completed.
    Done,
    /// The access targets an MMIO-backed GPA; the caller must complete it
    /// out of band.
    ExitMmio { gpa: u64 },
}

/// The narrow vCPU capability set the emulator is parameterized over (§6
/// `vcpu_ops`): register/flag I/O, segment bases, RIP advance, and
/// effective-address memory access with the MMIO suspension protocol.
pub trait VcpuOps {
    /// Read GPR `index` (0..=15, standard x86-64 encoding order) as a full
    /// 64-bit value.
    fn read_gpr(&self, index: u8) -> u64;
    /// Write GPR `index`. `size` bytes of `value` are meaningful; a
    /// `size=4` write zero-extends the upper 32 bits per the architectural
    /// rule, `size=8` writes the full register, and `size` of 1 or 2
    /// leaves the untouched bits of the register as they were.
    fn write_gpr(&mut self, index: u8, value: u64, size: u8);
    /// Current RFLAGS.
    fn read_rflags(&self) -> Rflags;
    /// Overwrite RFLAGS.
    fn write_rflags(&mut self, flags: Rflags);
    /// Base address of `segment`.
    fn segment_base(&self, segment: Segment) -> u64;
    /// Advance RIP by `len` bytes.
    fn advance_rip(&mut self, len: u32);
    /// Read `size` bytes at effective address `ea`.
    fn read_memory(&mut self, ea: u64, size: u8) -> MemRead;
    /// Complete a read left pending by [`MemRead::ExitMmio`]; `value` is
    /// the data the device model supplied.
    fn read_memory_post(&mut self, value: u64) -> u64 {
        value
    }
    /// Write `size` bytes of `value` to effective address `ea`.
    fn write_memory(&mut self, ea: u64, value: u64, size: u8) -> MemWrite;
}

/// A decode/emulate failure the caller should translate into `#UD` or a
/// vCPU termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmError;

/// Result of a dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmStatus {
    /// The instruction committed; RIP has been advanced.
    Continue,
    /// Suspended on an MMIO operand; call [`Emulation::step`] again once
    /// the access has been serviced.
    ExitMmio { gpa: u64, size: u8, is_write: bool },
    /// Unrecoverable; no architectural state has been modified beyond
    /// what had already committed on a prior REP iteration.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ReadDst,
    ReadSrc1,
    ReadSrc2,
    Execute,
    WriteDst,
    StringPostlude,
    ReentryCheck,
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperandKind {
    None,
    Reg(Register),
    Mem,
    Imm,
}

#[derive(Debug, Clone, Copy)]
struct Operand {
    kind: OperandKind,
    size: u8,
    ea: u64,
    value: u64,
}

impl Operand {
    const NONE: Operand = Operand { kind: OperandKind::None, size: 0, ea: 0, value: 0 };
}

fn reg_parts(reg: Register) -> (u8, u8, bool) {
    let high8 = matches!(reg, Register::AH | Register::CH | Register::DH | Register::BH);
    (reg.number() as u8, reg.size() as u8, high8)
}

fn read_reg<V: VcpuOps>(vcpu: &V, reg: Register) -> u64 {
    let (index, size, high8) = reg_parts(reg);
    let raw = vcpu.read_gpr(index);
    if high8 {
        (raw >> 8) & 0xff
    } else {
        truncate_to_size(raw, size)
    }
}

fn write_reg<V: VcpuOps>(vcpu: &mut V, reg: Register, value: u64) {
    let (index, size, high8) = reg_parts(reg);
    if high8 {
        let raw = vcpu.read_gpr(index);
        let merged = (raw & !0xff00) | ((value & 0xff) << 8);
        vcpu.write_gpr(index, merged, 8);
    } else {
        vcpu.write_gpr(index, value, size);
    }
}

fn segment_of(seg: Register) -> Segment {
    match seg {
        Register::SS => Segment::Ss,
        Register::ES => Segment::Es,
        Register::FS => Segment::Fs,
        Register::GS => Segment::Gs,
        Register::CS => Segment::Cs,
        _ => Segment::Ds,
    }
}

fn address_width(mode: CpuMode) -> AddressWidth {
    match mode {
        CpuMode::Prot64 => AddressWidth::Prot64,
        CpuMode::Real => AddressWidth::Real,
        CpuMode::Prot16 | CpuMode::Prot32 => AddressWidth::Prot32,
    }
}

fn compute_ea<V: VcpuOps>(vcpu: &V, insn: &iced_x86::Instruction, mode: CpuMode) -> u64 {
    let mut addr = insn.memory_displacement64();
    let base = insn.memory_base();
    if base != Register::None {
        addr = addr.wrapping_add(read_reg(vcpu, base));
    }
    let index = insn.memory_index();
    if index != Register::None {
        let scale = insn.memory_index_scale() as u64;
        addr = addr.wrapping_add(read_reg(vcpu, index).wrapping_mul(scale));
    }
    let seg = segment_of(insn.memory_segment());
    // FS/GS bases apply even in 64-bit mode; every other segment base is
    // folded in only outside 64-bit mode, where segmentation is live.
    let seg_base = match (mode, seg) {
        (CpuMode::Prot64, Segment::Fs | Segment::Gs) => vcpu.segment_base(seg),
        (CpuMode::Prot64, _) => 0,
        (_, s) => vcpu.segment_base(s),
    };
    canonicalize(addr.wrapping_add(seg_base), address_width(mode))
}

fn op_size(insn: &iced_x86::Instruction, op_index: u32) -> u8 {
    match insn.op_kind(op_index) {
        OpKind::Register => insn.op_register(op_index).size() as u8,
        OpKind::Memory => insn.memory_size().size() as u8,
        OpKind::Immediate8 | OpKind::Immediate8to16 | OpKind::Immediate8to32 | OpKind::Immediate8to64 => 1,
        OpKind::Immediate16 => 2,
        OpKind::Immediate32 | OpKind::Immediate32to64 => 4,
        OpKind::Immediate64 => 8,
        _ => 1,
    }
}

/// Width in bytes string-op mnemonics (`MOVSx`/`STOSx`/`LODSx`/`CMPSx`/
/// `SCASx`) address, from the `b`/`w`/`d`/`q` suffix baked into the
/// mnemonic itself.
fn string_width(mnemonic: Mnemonic) -> u8 {
    use Mnemonic::*;
    match mnemonic {
        Movsb | Stosb | Lodsb | Cmpsb | Scasb => 1,
        Movsw | Stosw | Lodsw | Cmpsw | Scasw => 2,
        Movsd | Stosd | Lodsd | Cmpsd | Scasd => 4,
        Movsq | Stosq | Lodsq | Cmpsq | Scasq => 8,
        _ => 1,
    }
}

fn is_segsi_opkind(k: OpKind) -> bool {
    matches!(k, OpKind::MemorySegSI | OpKind::MemorySegESI | OpKind::MemorySegRSI)
}

fn is_esdi_opkind(k: OpKind) -> bool {
    matches!(k, OpKind::MemoryESDI | OpKind::MemoryESEDI | OpKind::MemoryESRDI)
}

/// Effective address for an implicit string-instruction memory operand:
/// `[RSI]`/`[RDI]` plus whatever segment base applies, following the same
/// segmentation rule [`compute_ea`] uses for explicit ModRM operands.
fn string_ea<V: VcpuOps>(vcpu: &V, mode: CpuMode, gpr_index: u8, seg: Segment) -> u64 {
    let base = vcpu.read_gpr(gpr_index);
    let seg_base = match (mode, seg) {
        (CpuMode::Prot64, Segment::Fs | Segment::Gs) => vcpu.segment_base(seg),
        (CpuMode::Prot64, _) => 0,
        (_, s) => vcpu.segment_base(s),
    };
    canonicalize(base.wrapping_add(seg_base), address_width(mode))
}

fn build_operand<V: VcpuOps>(vcpu: &V, insn: &iced_x86::Instruction, op_index: u32, mode: CpuMode) -> Operand {
    if op_index >= insn.op_count() {
        return Operand::NONE;
    }
    let kind = insn.op_kind(op_index);
    // String instructions address their implicit memory operand through
    // RSI/RDI rather than a ModRM-decoded `Memory` operand, so iced_x86
    // surfaces them as their own `OpKind` variants instead.
    if is_segsi_opkind(kind) {
        let seg = segment_of(insn.memory_segment());
        let ea = string_ea(vcpu, mode, 6, seg);
        return Operand { kind: OperandKind::Mem, size: string_width(insn.mnemonic()), ea, value: 0 };
    }
    if is_esdi_opkind(kind) {
        let ea = string_ea(vcpu, mode, 7, Segment::Es);
        return Operand { kind: OperandKind::Mem, size: string_width(insn.mnemonic()), ea, value: 0 };
    }
    match kind {
        OpKind::Register => {
            let reg = insn.op_register(op_index);
            Operand { kind: OperandKind::Reg(reg), size: reg.size() as u8, ea: 0, value: 0 }
        }
        OpKind::Memory => {
            let ea = compute_ea(vcpu, insn, mode);
            Operand { kind: OperandKind::Mem, size: op_size(insn, op_index), ea, value: 0 }
        }
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => {
            let value = insn.immediate(op_index);
            Operand { kind: OperandKind::Imm, size: op_size(insn, op_index), ea: 0, value }
        }
        _ => Operand::NONE,
    }
}

bitflags::bitflags! {
    /// Per-mnemonic dispatch flags (§4.5's per-opcode-entry flags word,
    /// reduced to the subset the emulator dispatch loop actually consults
    /// once `iced_x86` has already done prefix/ModRM/SIB decode).
    pub struct InsnFlags: u32 {
        /// Do not pre-read the destination operand.
        const DST_NR = 1 << 0;
        /// Do not write the destination operand back.
        const DST_NW = 1 << 1;
        /// Do not read or write RFLAGS.
        const NOFLAGS = 1 << 2;
        /// Destination effective address is biased by a register bit offset.
        const BITOP = 1 << 3;
        /// Both operands are memory (string instructions): full GVA
        /// translation is required for both, rather than the raw-GPA MMIO
        /// fast path.
        const TWOMEM = 1 << 4;
        /// `F3` alone is a valid prefix (plain REP).
        const REP = 1 << 5;
        /// `F2`/`F3` both valid, loop terminates on a zero-flag condition.
        const REPX = 1 << 6;
    }
}

fn insn_flags(mnemonic: Mnemonic) -> InsnFlags {
    use Mnemonic::*;
    let mut flags = match mnemonic {
        Cmp | Test => InsnFlags::DST_NW,
        Not | Mov | Movzx | Movsx | Movsxd | Push | Pop => InsnFlags::NOFLAGS | InsnFlags::DST_NR,
        Bt => InsnFlags::DST_NW | InsnFlags::BITOP,
        Bts | Btr | Btc => InsnFlags::BITOP,
        Movsb | Movsw | Movsd | Movsq | Cmpsb | Cmpsw | Cmpsd | Cmpsq | Stosb | Stosw | Stosd
        | Stosq | Lodsb | Lodsw | Lodsd | Lodsq => InsnFlags::TWOMEM,
        _ => InsnFlags::empty(),
    };
    flags |= match mnemonic {
        Cmpsb | Cmpsw | Cmpsd | Cmpsq | Scasb | Scasw | Scasd | Scasq => InsnFlags::REPX,
        Movsb | Movsw | Movsd | Movsq | Stosb | Stosw | Stosd | Stosq => InsnFlags::REP,
        _ => InsnFlags::empty(),
    };
    flags
}

fn width_mask(size: u8) -> u64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

fn sign_bit(size: u8) -> u64 {
    match size {
        1 => 0x80,
        2 => 0x8000,
        4 => 0x8000_0000,
        _ => 0x8000_0000_0000_0000,
    }
}

fn flags_from_result(result: u64, size: u8) -> Rflags {
    let mut f = Rflags::empty();
    if result & width_mask(size) == 0 {
        f |= Rflags::ZF;
    }
    if result & sign_bit(size) != 0 {
        f |= Rflags::SF;
    }
    if parity8(result) {
        f |= Rflags::PF;
    }
    f
}

/// `dst + src + carry_in`, producing OSZAPC per the architectural
/// definition of `ADD`/`ADC`.
fn add_with_flags(dst: u64, src: u64, size: u8, carry_in: u64) -> (u64, Rflags) {
    let mask = width_mask(size);
    let d = dst & mask;
    let s = src & mask;
    let sum = d as u128 + s as u128 + carry_in as u128;
    let result = (sum as u64) & mask;
    let mut f = flags_from_result(result, size);
    if sum > mask as u128 {
        f |= Rflags::CF;
    }
    if !(d ^ s) & (d ^ result) & sign_bit(size) != 0 {
        f |= Rflags::OF;
    }
    if (d & 0xf) + (s & 0xf) + carry_in > 0xf {
        f |= Rflags::AF;
    }
    (result, f)
}

/// `dst - src - borrow_in`, producing OSZAPC per the architectural
/// definition of `SUB`/`SBB`/`CMP`.
fn sub_with_flags(dst: u64, src: u64, size: u8, borrow_in: u64) -> (u64, Rflags) {
    let mask = width_mask(size);
    let d = dst & mask;
    let s = src & mask;
    let diff = (d as i128) - (s as i128) - (borrow_in as i128);
    let result = (diff as u64) & mask;
    let mut f = flags_from_result(result, size);
    if diff < 0 {
        f |= Rflags::CF;
    }
    if (d ^ s) & (d ^ result) & sign_bit(size) != 0 {
        f |= Rflags::OF;
    }
    if (d & 0xf) < (s & 0xf) + borrow_in {
        f |= Rflags::AF;
    }
    (result, f)
}

fn logic_with_flags(result: u64, size: u8) -> (u64, Rflags) {
    let mask = width_mask(size);
    let result = result & mask;
    // Logical ops clear CF and OF and leave AF undefined (cleared here for
    // determinism, matching common implementations).
    (result, flags_from_result(result, size))
}

fn bit_op_with_flags(dst: u64, bit: u32, op: Mnemonic, size: u8) -> (u64, Rflags) {
    let mask = 1u64 << bit;
    let cf = dst & mask != 0;
    let result = match op {
        Mnemonic::Bts => dst | mask,
        Mnemonic::Btr => dst & !mask,
        Mnemonic::Btc => dst ^ mask,
        _ => dst,
    };
    let mut f = Rflags::empty();
    if cf {
        f |= Rflags::CF;
    }
    (result & width_mask(size), f)
}

/// Resolve the `(byte_offset_delta, bit_in_byte)` pair for a `BT`-class
/// instruction whose bit-index operand is a register: the destination
/// effective address is biased by `floor(bit_index / 8)` (signed,
/// independent of operand size) and the in-word bit becomes `bit_index mod
/// 8`, both using Euclidean semantics so negative offsets bias backward
/// through memory rather than wrapping inside the original word.
fn bitop_bias(bit_index: i64) -> (i64, u32) {
    (bit_index.div_euclid(8), bit_index.rem_euclid(8) as u32)
}

/// State carried across suspension points (MMIO yield, REP-loop
/// cancellation). Construct once per faulting instruction and call
/// [`Emulation::step`] until it returns [`EmStatus::Continue`] or
/// [`EmStatus::Error`].
pub struct Emulation {
    mode: CpuMode,
    insn: iced_x86::Instruction,
    rep: Option<RepPrefix>,
    is_fastop: bool,
    len: u32,
    stage: Stage,
    dst: Operand,
    src1: Operand,
    src2: Operand,
    rflags: Rflags,
    flags: InsnFlags,
}

impl Emulation {
    /// Begin emulating the instruction `ctx` decoded.
    pub fn new(ctx: &EmContext) -> Self {
        Self {
            mode: ctx.mode,
            insn: ctx.insn,
            rep: ctx.rep,
            is_fastop: ctx.is_fastop,
            len: ctx.len,
            stage: Stage::ReadDst,
            dst: Operand::NONE,
            src1: Operand::NONE,
            src2: Operand::NONE,
            rflags: Rflags::empty(),
            flags: insn_flags(ctx.insn.mnemonic()),
        }
    }

    /// Drive the state machine forward. Returns `Continue` once the
    /// instruction (including every REP iteration) has committed,
    /// `ExitMmio` if an operand access needs to be serviced out of band,
    /// or `Error` on a condition the decode layer should have already
    /// ruled out.
    pub fn step<V: VcpuOps>(&mut self, vcpu: &mut V) -> EmStatus {
        loop {
            match self.stage {
                Stage::ReadDst => {
                    if self.dst.kind == OperandKind::None && self.rep.is_some() && vcpu.read_gpr(1) == 0 {
                        self.stage = Stage::Committed;
                        continue;
                    }
                    if self.dst.kind == OperandKind::None {
                        self.dst = build_operand(vcpu, &self.insn, 0, self.mode);
                        if let (OperandKind::Mem, true) = (self.dst.kind, self.flags.contains(InsnFlags::BITOP)) {
                            if self.insn.op_count() > 1 && self.insn.op_kind(1) == OpKind::Register {
                                let bit_index = read_reg(vcpu, self.insn.op_register(1)) as i64;
                                let (byte_delta, bit_in_byte) = bitop_bias(bit_index);
                                self.dst.ea = self.dst.ea.wrapping_add(byte_delta as u64);
                                self.dst.size = 1;
                                self.src2.value = bit_in_byte as u64;
                            }
                        }
                    }
                    if self.flags.contains(InsnFlags::DST_NR) || self.dst.kind == OperandKind::None {
                        self.stage = Stage::ReadSrc1;
                        continue;
                    }
                    match self.dst.kind {
                        OperandKind::Reg(r) => {
                            self.dst.value = read_reg(vcpu, r);
                        }
                        OperandKind::Mem => match vcpu.read_memory(self.dst.ea, self.dst.size) {
                            MemRead::Done(v) => self.dst.value = v,
                            MemRead::ExitMmio { gpa } => {
                                return EmStatus::ExitMmio { gpa, size: self.dst.size, is_write: false }
                            }
                        },
                        _ => {}
                    }
                    self.stage = Stage::ReadSrc1;
                }
                Stage::ReadSrc1 => {
                    if self.src1.kind == OperandKind::None && self.insn.op_count() > 1 {
                        self.src1 = build_operand(vcpu, &self.insn, 1, self.mode);
                    }
                    match self.src1.kind {
                        OperandKind::Reg(r) => self.src1.value = read_reg(vcpu, r),
                        OperandKind::Imm => {}
                        OperandKind::Mem => match vcpu.read_memory(self.src1.ea, self.src1.size) {
                            MemRead::Done(v) => self.src1.value = v,
                            MemRead::ExitMmio { gpa } => {
                                return EmStatus::ExitMmio { gpa, size: self.src1.size, is_write: false }
                            }
                        },
                        OperandKind::None => {}
                    }
                    self.stage = Stage::ReadSrc2;
                }
                Stage::ReadSrc2 => {
                    if self.src2.kind == OperandKind::None && self.insn.op_count() > 2 {
                        self.src2 = build_operand(vcpu, &self.insn, 2, self.mode);
                        match self.src2.kind {
                            OperandKind::Reg(r) => self.src2.value = read_reg(vcpu, r),
                            OperandKind::Mem => match vcpu.read_memory(self.src2.ea, self.src2.size) {
                                MemRead::Done(v) => self.src2.value = v,
                                MemRead::ExitMmio { gpa } => {
                                    return EmStatus::ExitMmio { gpa, size: self.src2.size, is_write: false }
                                }
                            },
                            _ => {}
                        }
                    }
                    if !self.flags.contains(InsnFlags::NOFLAGS) {
                        self.rflags = vcpu.read_rflags();
                    }
                    self.stage = Stage::Execute;
                }
                Stage::Execute => {
                    if matches!(self.insn.mnemonic(), Mnemonic::Push | Mnemonic::Pop) {
                        self.execute_push_pop(vcpu);
                        self.dst = Operand::NONE;
                        self.stage = Stage::WriteDst;
                        continue;
                    }
                    if let EmStatus::Error = self.execute() {
                        return EmStatus::Error;
                    }
                    self.stage = Stage::WriteDst;
                }
                Stage::WriteDst => {
                    if !self.flags.contains(InsnFlags::DST_NW) {
                        match self.dst.kind {
                            OperandKind::Reg(r) => write_reg(vcpu, r, self.dst.value),
                            OperandKind::Mem => match vcpu.write_memory(self.dst.ea, self.dst.value, self.dst.size) {
                                MemWrite::Done => {}
                                MemWrite::ExitMmio { gpa } => {
                                    return EmStatus::ExitMmio { gpa, size: self.dst.size, is_write: true }
                                }
                            },
                            _ => {}
                        }
                    }
                    if !self.flags.contains(InsnFlags::NOFLAGS) {
                        vcpu.write_rflags(self.rflags);
                    }
                    self.stage = Stage::StringPostlude;
                }
                Stage::StringPostlude => {
                    self.string_postlude(vcpu);
                    self.stage = Stage::ReentryCheck;
                }
                Stage::ReentryCheck => {
                    if self.rep.is_none() {
                        self.stage = Stage::Committed;
                        continue;
                    }
                    let rcx = vcpu.read_gpr(1).wrapping_sub(1);
                    vcpu.write_gpr(1, rcx, 8);
                    let terminate = match self.rep {
                        Some(RepPrefix::RepE) => rcx == 0 || !self.rflags.contains(Rflags::ZF),
                        Some(RepPrefix::RepNe) => rcx == 0 || self.rflags.contains(Rflags::ZF),
                        Some(RepPrefix::Rep) => rcx == 0,
                        None => true,
                    };
                    if terminate {
                        self.stage = Stage::Committed;
                    } else {
                        // Effective addresses depend on RSI/RDI, which the
                        // postlude just advanced; flush the cached operand
                        // descriptors so the next iteration recomputes them.
                        self.dst = Operand::NONE;
                        self.src1 = Operand::NONE;
                        self.src2 = Operand::NONE;
                        self.stage = Stage::ReadDst;
                    }
                }
                Stage::Committed => {
                    vcpu.advance_rip(self.len);
                    return EmStatus::Continue;
                }
            }
        }
    }

    fn string_postlude<V: VcpuOps>(&self, vcpu: &mut V) {
        let delta = if self.rflags.contains(Rflags::DF) {
            -(self.dst_width() as i64)
        } else {
            self.dst_width() as i64
        };
        if matches!(self.insn.op0_kind(), OpKind::MemoryESDI) || self.is_di_dest() {
            let rdi = vcpu.read_gpr(7) as i64;
            vcpu.write_gpr(7, (rdi + delta) as u64, 8);
        }
        if self.is_si_source() {
            let rsi = vcpu.read_gpr(6) as i64;
            vcpu.write_gpr(6, (rsi + delta) as u64, 8);
        }
    }

    fn dst_width(&self) -> u8 {
        self.insn.memory_size().size().max(1) as u8
    }

    fn is_di_dest(&self) -> bool {
        self.flags.contains(InsnFlags::TWOMEM) || matches!(self.insn.mnemonic(), Mnemonic::Stosb | Mnemonic::Stosw | Mnemonic::Stosd | Mnemonic::Stosq)
    }

    fn is_si_source(&self) -> bool {
        matches!(
            self.insn.mnemonic(),
            Mnemonic::Movsb
                | Mnemonic::Movsw
                | Mnemonic::Movsd
                | Mnemonic::Movsq
                | Mnemonic::Cmpsb
                | Mnemonic::Cmpsw
                | Mnemonic::Cmpsd
                | Mnemonic::Cmpsq
                | Mnemonic::Lodsb
                | Mnemonic::Lodsw
                | Mnemonic::Lodsd
                | Mnemonic::Lodsq
        )
    }

    fn execute_push_pop<V: VcpuOps>(&mut self, vcpu: &mut V) {
        let op0_kind = self.insn.op0_kind();
        let width: u8 = match op0_kind {
            OpKind::Register => self.insn.op_register(0).size() as u8,
            OpKind::Memory => self.insn.memory_size().size() as u8,
            _ if self.mode == CpuMode::Prot64 => 8,
            _ => 4,
        };
        let rsp = vcpu.read_gpr(4);
        if self.insn.mnemonic() == Mnemonic::Push {
            let value = match op0_kind {
                OpKind::Register => read_reg(vcpu, self.insn.op_register(0)),
                _ => self.insn.immediate(0),
            };
            let new_rsp = rsp.wrapping_sub(width as u64);
            vcpu.write_gpr(4, new_rsp, 8);
            vcpu.write_memory(new_rsp, value, width);
        } else {
            let value = match vcpu.read_memory(rsp, width) {
                MemRead::Done(v) => v,
                MemRead::ExitMmio { .. } => 0,
            };
            vcpu.write_gpr(4, rsp.wrapping_add(width as u64), 8);
            if let OpKind::Register = op0_kind {
                write_reg(vcpu, self.insn.op_register(0), value);
            }
        }
    }

    fn execute(&mut self) -> EmStatus {
        let size = if self.dst.size != 0 { self.dst.size } else { self.src1.size.max(1) };
        let preserved = self.rflags & !oszapc_mask();
        let in_cf = self.rflags.contains(Rflags::CF) as u64;
        let mnemonic = self.insn.mnemonic();

        if self.is_fastop {
            let (result, alu_flags) = match mnemonic {
                Mnemonic::Add => add_with_flags(self.dst.value, self.src1.value, size, 0),
                Mnemonic::Adc => add_with_flags(self.dst.value, self.src1.value, size, in_cf),
                Mnemonic::Sub | Mnemonic::Cmp => sub_with_flags(self.dst.value, self.src1.value, size, 0),
                Mnemonic::Sbb => sub_with_flags(self.dst.value, self.src1.value, size, in_cf),
                Mnemonic::And | Mnemonic::Test => logic_with_flags(self.dst.value & self.src1.value, size),
                Mnemonic::Or => logic_with_flags(self.dst.value | self.src1.value, size),
                Mnemonic::Xor => logic_with_flags(self.dst.value ^ self.src1.value, size),
                Mnemonic::Not => (!self.dst.value & width_mask(size), Rflags::empty()),
                Mnemonic::Neg => sub_with_flags(0, self.dst.value, size, 0),
                Mnemonic::Inc => {
                    let (r, f) = add_with_flags(self.dst.value, 1, size, 0);
                    (r, f & !Rflags::CF)
                }
                Mnemonic::Dec => {
                    let (r, f) = sub_with_flags(self.dst.value, 1, size, 0);
                    (r, f & !Rflags::CF)
                }
                Mnemonic::Bt | Mnemonic::Bts | Mnemonic::Btr | Mnemonic::Btc => {
                    // Only a memory destination with a register bit-offset
                    // addresses outside the operand's own width (the EA bias
                    // applied back in ReadDst); register destinations and
                    // immediate bit-offsets are always taken mod the operand
                    // size out of src1.
                    let mem_reg_bitop = self.flags.contains(InsnFlags::BITOP)
                        && matches!(self.dst.kind, OperandKind::Mem)
                        && self.insn.op_kind(1) == OpKind::Register;
                    let bit = if mem_reg_bitop {
                        self.src2.value as u32
                    } else {
                        (self.src1.value as u32) % (size as u32 * 8)
                    };
                    bit_op_with_flags(self.dst.value, bit, mnemonic, size)
                }
                _ => return EmStatus::Error,
            };
            self.dst.value = result;
            self.rflags = preserved | alu_flags;
            return EmStatus::Continue;
        }

        match mnemonic {
            Mnemonic::Mov => self.dst.value = self.src1.value,
            Mnemonic::Movzx => self.dst.value = self.src1.value & width_mask(self.src1.size),
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                self.dst.value = crate::bits::sign_extend(self.src1.value, self.src1.size as u32 * 8);
            }
            // PUSH/POP are handled in `step` directly against [RSP], since
            // iced_x86 doesn't surface the implicit stack operand through
            // `op0`/`op1` the way it does for every other instruction here.
            Mnemonic::Push | Mnemonic::Pop => unreachable!("handled in step()"),
            Mnemonic::Andn => self.dst.value = (!self.src1.value) & self.src2.value & width_mask(size),
            Mnemonic::Bextr => {
                let control = self.src2.value;
                let start = (control & 0xff) as u32;
                let len = ((control >> 8) & 0xff) as u32;
                let mask = if len >= 64 { u64::MAX } else { (1u64 << len) - 1 };
                let shifted = if start >= 64 { 0 } else { self.src1.value >> start };
                self.dst.value = shifted & mask & width_mask(size);
                self.rflags = preserved | flags_from_result(self.dst.value, size) & Rflags::ZF;
            }
            Mnemonic::Movsb | Mnemonic::Movsw | Mnemonic::Movsd | Mnemonic::Movsq => {
                self.dst.value = self.src1.value;
            }
            Mnemonic::Stosb | Mnemonic::Stosw | Mnemonic::Stosd | Mnemonic::Stosq => {
                self.dst.value = self.src1.value;
            }
            Mnemonic::Lodsb | Mnemonic::Lodsw | Mnemonic::Lodsd | Mnemonic::Lodsq => {
                self.dst.value = self.src1.value;
            }
            Mnemonic::Cmpsb | Mnemonic::Cmpsw | Mnemonic::Cmpsd | Mnemonic::Cmpsq => {
                let (_, f) = sub_with_flags(self.dst.value, self.src1.value, size, 0);
                self.rflags = preserved | f;
            }
            _ => return EmStatus::Error,
        }
        EmStatus::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode_insn, CpuMode};
    use core::cell::RefCell;
    use std::collections::HashMap;

    struct MockVcpu {
        gprs: [u64; 16],
        rflags: Rflags,
        mem: RefCell<HashMap<u64, u64>>,
    }

    impl MockVcpu {
        fn new() -> Self {
            Self { gprs: [0; 16], rflags: Rflags::empty(), mem: RefCell::new(HashMap::new()) }
        }
    }

    impl VcpuOps for MockVcpu {
        fn read_gpr(&self, index: u8) -> u64 {
            self.gprs[index as usize]
        }
        fn write_gpr(&mut self, index: u8, value: u64, size: u8) {
            self.gprs[index as usize] = match size {
                4 => value & 0xffff_ffff,
                8 => value,
                _ => (self.gprs[index as usize] & !width_mask(size)) | (value & width_mask(size)),
            };
        }
        fn read_rflags(&self) -> Rflags {
            self.rflags
        }
        fn write_rflags(&mut self, flags: Rflags) {
            self.rflags = flags;
        }
        fn segment_base(&self, _segment: Segment) -> u64 {
            0
        }
        fn advance_rip(&mut self, _len: u32) {}
        fn read_memory(&mut self, ea: u64, size: u8) -> MemRead {
            let v = *self.mem.borrow().get(&ea).unwrap_or(&0) & width_mask(size);
            MemRead::Done(v)
        }
        fn write_memory(&mut self, ea: u64, value: u64, size: u8) -> MemWrite {
            self.mem.borrow_mut().insert(ea, value & width_mask(size));
            MemWrite::Done
        }
    }

    /// Scenario 1: ADD AL, 0x01 with AL=0xFF overflows to zero.
    #[test]
    fn add_al_overflow_to_zero() {
        let mut vcpu = MockVcpu::new();
        vcpu.gprs[0] = 0xff;
        let ctx = decode_insn(CpuMode::Prot64, &[0x04, 0x01], 0).unwrap();
        let mut em = Emulation::new(&ctx);
        assert_eq!(em.step(&mut vcpu), EmStatus::Continue);
        assert_eq!(vcpu.gprs[0] & 0xff, 0);
        assert!(vcpu.rflags.contains(Rflags::CF));
        assert!(vcpu.rflags.contains(Rflags::PF));
        assert!(vcpu.rflags.contains(Rflags::AF));
        assert!(vcpu.rflags.contains(Rflags::ZF));
        assert!(!vcpu.rflags.contains(Rflags::OF));
        assert!(!vcpu.rflags.contains(Rflags::SF));
    }

    /// Scenario 2: MOVZX EAX, CX truncates to the 16-bit source then
    /// zero-extends, and the 32-bit write zero-extends to 64 bits.
    #[test]
    fn movzx_truncates_and_zero_extends() {
        let mut vcpu = MockVcpu::new();
        vcpu.gprs[0] = 0xffff_ffff_ffff_ffff;
        vcpu.gprs[1] = 0xf0f1_f2f3_f4f5_f6f7;
        let ctx = decode_insn(CpuMode::Prot64, &[0x0f, 0xb7, 0xc1], 0).unwrap();
        let mut em = Emulation::new(&ctx);
        assert_eq!(em.step(&mut vcpu), EmStatus::Continue);
        assert_eq!(vcpu.gprs[0], 0x0000_0000_0000_f6f7);
    }

    /// Scenario 3: BT [RCX+0x08], RAX with RCX=0, RAX=-15 biases the
    /// effective address backward by two bytes and tests bit 1 there.
    #[test]
    fn bt_memory_negative_offset_biases_address() {
        let mut vcpu = MockVcpu::new();
        vcpu.gprs[1] = 0; // RCX
        vcpu.gprs[0] = (-15i64) as u64; // RAX
        vcpu.mem.borrow_mut().insert(0x06, 0x02);
        let ctx = decode_insn(CpuMode::Prot64, &[0x48, 0x0f, 0xa3, 0x41, 0x08], 0).unwrap();
        let mut em = Emulation::new(&ctx);
        assert_eq!(em.step(&mut vcpu), EmStatus::Continue);
        assert!(vcpu.rflags.contains(Rflags::CF));
        assert_eq!(*vcpu.mem.borrow().get(&0x06).unwrap(), 0x02); // BT never writes
    }

    #[test]
    fn bt_register_destination_takes_bit_index_mod_width() {
        // BT EAX, ECX
        let mut vcpu = MockVcpu::new();
        vcpu.gprs[0] = 0b100; // EAX, bit 2 set
        vcpu.gprs[1] = 34; // ECX; 34 % 32 == 2
        let ctx = decode_insn(CpuMode::Prot64, &[0x0f, 0xa3, 0xc8], 0).unwrap();
        let mut em = Emulation::new(&ctx);
        assert_eq!(em.step(&mut vcpu), EmStatus::Continue);
        assert!(vcpu.rflags.contains(Rflags::CF));
    }

    /// Scenario 4: REP MOVSW with DF=1 copies three words downward through
    /// memory, decrementing RCX to zero and leaving RSI/RDI each stepped
    /// back by six bytes.
    #[test]
    fn rep_movsw_backward_copies_three_words() {
        let mut vcpu = MockVcpu::new();
        vcpu.rflags = Rflags::DF;
        vcpu.gprs[1] = 3; // RCX
        vcpu.gprs[6] = 0x24; // RSI
        vcpu.gprs[7] = 0x64; // RDI
        {
            let mut mem = vcpu.mem.borrow_mut();
            mem.insert(0x24, 0x1122);
            mem.insert(0x22, 0x3344);
            mem.insert(0x20, 0x5566);
        }
        let ctx = decode_insn(CpuMode::Prot64, &[0xf3, 0x66, 0xa5], 0).unwrap();
        let mut em = Emulation::new(&ctx);
        assert_eq!(em.step(&mut vcpu), EmStatus::Continue);
        assert_eq!(vcpu.gprs[1], 0);
        assert_eq!(vcpu.gprs[6], 0x1e);
        assert_eq!(vcpu.gprs[7], 0x5e);
        let mem = vcpu.mem.borrow();
        assert_eq!(*mem.get(&0x64).unwrap() & 0xffff, 0x1122);
        assert_eq!(*mem.get(&0x62).unwrap() & 0xffff, 0x3344);
        assert_eq!(*mem.get(&0x60).unwrap() & 0xffff, 0x5566);
    }

    #[test]
    fn rep_movsw_with_zero_rcx_commits_without_copying() {
        let mut vcpu = MockVcpu::new();
        vcpu.gprs[1] = 0; // RCX
        vcpu.gprs[6] = 0x24; // RSI
        vcpu.gprs[7] = 0x64; // RDI
        vcpu.mem.borrow_mut().insert(0x24, 0x1122);
        let ctx = decode_insn(CpuMode::Prot64, &[0xf3, 0x66, 0xa5], 0).unwrap();
        let mut em = Emulation::new(&ctx);
        assert_eq!(em.step(&mut vcpu), EmStatus::Continue);
        assert_eq!(vcpu.gprs[1], 0);
        assert_eq!(vcpu.gprs[6], 0x24);
        assert_eq!(vcpu.gprs[7], 0x64);
        assert!(vcpu.mem.borrow().get(&0x64).is_none());
    }
}
