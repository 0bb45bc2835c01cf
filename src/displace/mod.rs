//! Instruction decoder and displacer.
//!
//! A breakpoint overwrites the first instruction of a hooked function, so the
//! original instruction has to run somewhere else: in a scratch slot of the
//! traced process. Most instructions do not care where they execute. The ones
//! that read or write the PC do, and are classified here into an
//! [`InsnClass`] describing how to relocate them:
//!
//! - `Unchanged`: copied to the slot verbatim.
//! - `Remap`: PC (and the other register operands) are renamed to scratch
//!   registers staged before the slot runs and copied back afterwards.
//! - everything else: a no-op runs in the slot and the whole effect is
//!   emulated after it, from the register snapshot taken at the trap.
//!
//! The decode tree follows the ARMv7 encoding tables. Unpredictable and
//! undefined encodings pass through unchanged.

mod arm;
mod fixup;
mod thumb16;
mod thumb32;

pub use fixup::StepContext;

use crate::regs::{COND_AL, Mode};

/// Most substitute instructions a displaced sequence may hold.
pub const MAX_DISPLACED_INSNS: usize = 10;

/// `MOV R0, R0`
pub const ARM_NOP: u32 = 0xe1a0_0000;
/// `MOV R0, R0`
pub const THUMB16_NOP: u16 = 0x4600;
/// `MOV.W R0, R0`, first halfword in the low 16 bits.
pub const THUMB32_NOP: u32 = 0x0000_ea4f;

/// Pack a Thumb32 instruction, first halfword in the low 16 bits.
pub const fn make_thumb32(first: u16, second: u16) -> u32 {
    ((second as u32) << 16) | first as u32
}

/// Split a packed Thumb32 instruction into (first, second) halfwords.
pub const fn split_thumb32(raw: u32) -> (u16, u16) {
    (raw as u16, (raw >> 16) as u16)
}

/// Sign-extend the low `bits` bits of `value`.
pub(crate) const fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// One machine instruction with its encoded size (2 or 4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub raw: u32,
    pub size: u8,
}

impl Instruction {
    pub const fn arm(raw: u32) -> Self {
        Self { raw, size: 4 }
    }

    pub const fn thumb16(hw: u16) -> Self {
        Self { raw: hw as u32, size: 2 }
    }

    pub const fn thumb32(first: u16, second: u16) -> Self {
        Self {
            raw: make_thumb32(first, second),
            size: 4,
        }
    }

    /// No-op of the same size in the given instruction set.
    pub const fn nop(mode: Mode, size: u8) -> Self {
        match (mode, size) {
            (Mode::Arm, _) => Self::arm(ARM_NOP),
            (Mode::Thumb, 2) => Self::thumb16(THUMB16_NOP),
            (Mode::Thumb, _) => Self {
                raw: THUMB32_NOP,
                size: 4,
            },
        }
    }
}

/// How a value copied into R15 changes the PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcWrite {
    /// Data-processing result.
    Alu,
    /// Loaded from memory.
    Load,
}

/// One register operand renamed to a scratch register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    /// Register named by the original instruction.
    pub reg: u8,
    /// Register the substitute uses instead.
    pub scratch: u8,
    /// The substitute writes a result that belongs in `reg`.
    pub output: bool,
    /// Stage the PC word-aligned (Thumb literal addressing).
    pub align_pc: bool,
}

const NO_OPERAND: Operand = Operand {
    reg: 0,
    scratch: 0,
    output: false,
    align_pc: false,
};

/// Register renaming for an instruction that reads or writes the PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remap {
    /// The rewritten instruction executed in the slot.
    pub substitute: u32,
    operands: [Operand; 4],
    len: u8,
    pub pc_write: PcWrite,
    pub cond: u8,
}

impl Remap {
    pub fn operands(&self) -> &[Operand] {
        &self.operands[..self.len as usize]
    }
}

/// Builds a [`Remap`] by rewriting 4-bit register fields in place.
pub(crate) struct RemapBuilder {
    raw: u32,
    operands: [Operand; 4],
    len: u8,
}

impl RemapBuilder {
    pub(crate) fn new(raw: u32) -> Self {
        Self {
            raw,
            operands: [NO_OPERAND; 4],
            len: 0,
        }
    }

    /// Rename the register field at bit `shift` to `scratch`.
    pub(crate) fn field(self, shift: u32, scratch: u8, output: bool) -> Self {
        self.field_with(shift, scratch, output, false)
    }

    pub(crate) fn field_with(mut self, shift: u32, scratch: u8, output: bool, align_pc: bool) -> Self {
        let reg = ((self.raw >> shift) & 0xf) as u8;
        self.raw = (self.raw & !(0xf << shift)) | ((scratch as u32) << shift);
        self.push(reg, scratch, output, align_pc)
    }

    /// Record a renaming whose encoding the caller rewrites itself.
    pub(crate) fn push(mut self, reg: u8, scratch: u8, output: bool, align_pc: bool) -> Self {
        if (self.len as usize) < self.operands.len() {
            self.operands[self.len as usize] = Operand {
                reg,
                scratch,
                output,
                align_pc,
            };
            self.len += 1;
        }
        self
    }

    pub(crate) fn with_raw(mut self, raw: u32) -> Self {
        self.raw = raw;
        self
    }

    pub(crate) fn build(self, pc_write: PcWrite, cond: u8) -> InsnClass {
        InsnClass::Remap(Remap {
            substitute: self.raw,
            operands: self.operands,
            len: self.len,
            pc_write,
            cond,
        })
    }
}

/// Target instruction set of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Keep,
    ToThumb,
    ToArm,
}

/// Access width of an emulated load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
    Double,
}

/// Block-transfer addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    IncrementAfter,
    IncrementBefore,
    DecrementAfter,
    DecrementBefore,
}

impl Addressing {
    pub(crate) fn from_pu(p: bool, u: bool) -> Self {
        match (p, u) {
            (false, true) => Self::IncrementAfter,
            (true, true) => Self::IncrementBefore,
            (false, false) => Self::DecrementAfter,
            (true, false) => Self::DecrementBefore,
        }
    }

    /// Lowest address touched by a transfer of `count` words from `base`.
    pub fn start_address(self, base: u32, count: u32) -> u32 {
        match self {
            Self::IncrementAfter => base,
            Self::IncrementBefore => base.wrapping_add(4),
            Self::DecrementAfter => base.wrapping_sub(4 * count).wrapping_add(4),
            Self::DecrementBefore => base.wrapping_sub(4 * count),
        }
    }

    /// Base register value after write-back.
    pub fn written_back(self, base: u32, count: u32) -> u32 {
        match self {
            Self::IncrementAfter | Self::IncrementBefore => base.wrapping_add(4 * count),
            Self::DecrementAfter | Self::DecrementBefore => base.wrapping_sub(4 * count),
        }
    }
}

/// Relocation class of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnClass {
    /// Position independent; runs verbatim.
    Unchanged,
    /// Register operands renamed to scratch registers.
    Remap(Remap),
    /// B, BL, BLX (immediate) and conditional branches.
    Branch {
        offset: i32,
        link: bool,
        exchange: Exchange,
        cond: u8,
        /// Base is `Align(PC, 4)` rather than PC.
        align_base: bool,
    },
    /// BX and BLX (register).
    BranchExchange { rm: u8, link: bool, cond: u8 },
    /// CBZ / CBNZ.
    CompareBranch { rn: u8, nonzero: bool, offset: u32 },
    /// TBB / TBH.
    TableBranch { rn: u8, rm: u8, halfword: bool },
    /// PC-relative loads of every width.
    LoadLiteral {
        rt: u8,
        rt2: Option<u8>,
        offset: u32,
        add: bool,
        width: Width,
        signed: bool,
        cond: u8,
    },
    /// LDM / POP with the PC in the list or the PC as base.
    LoadMultiple {
        rn: u8,
        list: u16,
        addressing: Addressing,
        writeback: bool,
        cond: u8,
    },
    /// STM with the PC in the list or the PC as base.
    StoreMultiple {
        rn: u8,
        list: u16,
        addressing: Addressing,
        writeback: bool,
        cond: u8,
    },
    /// ADR: `Rd = Align(PC, 4) +/- offset`.
    Adr { rd: u8, offset: u32, add: bool },
    /// SUBS PC, LR, #imm.
    ExceptionReturn { offset: u32 },
}

impl InsnClass {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Remap(_) => "remap",
            Self::Branch { .. } => "branch",
            Self::BranchExchange { .. } => "branch-exchange",
            Self::CompareBranch { .. } => "compare-branch",
            Self::TableBranch { .. } => "table-branch",
            Self::LoadLiteral { .. } => "load-literal",
            Self::LoadMultiple { .. } => "load-multiple",
            Self::StoreMultiple { .. } => "store-multiple",
            Self::Adr { .. } => "adr",
            Self::ExceptionReturn { .. } => "exception-return",
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

/// Relocated form of one instruction: what runs in the slot plus the class
/// whose `pre`/`post` fix up everything the slot cannot do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Displacement {
    insns: [Instruction; MAX_DISPLACED_INSNS],
    count: usize,
    pub class: InsnClass,
}

impl Displacement {
    fn new(original: Instruction, mode: Mode, class: InsnClass) -> Self {
        let mut insns = [Instruction::nop(mode, original.size); MAX_DISPLACED_INSNS];
        let count = match class {
            InsnClass::Unchanged => {
                insns[0] = original;
                1
            }
            InsnClass::Remap(remap) => {
                insns[0] = Instruction {
                    raw: remap.substitute,
                    size: original.size,
                };
                1
            }
            // Thumb32 BL/BLX: the post step does the whole job.
            InsnClass::Branch { link: true, .. } if mode == Mode::Thumb && original.size == 4 => 0,
            _ => 1,
        };
        Self {
            insns,
            count,
            class,
        }
    }

    /// Substitute instructions in execution order.
    pub fn insns(&self) -> &[Instruction] {
        &self.insns[..self.count]
    }

    /// Bytes the substitutes occupy.
    pub fn total_size(&self) -> u32 {
        self.insns().iter().map(|i| i.size as u32).sum()
    }
}

/// Classify `insn` (fetched in `mode`) and build its displaced form.
pub fn decode_and_displace(insn: Instruction, mode: Mode) -> Displacement {
    let class = match (mode, insn.size) {
        (Mode::Arm, _) => arm::classify(insn.raw),
        (Mode::Thumb, 2) => thumb16::classify(insn.raw as u16),
        (Mode::Thumb, _) => thumb32::classify(insn.raw),
    };
    trace!(
        "displace: {:#010x} ({:?}, {} bytes) -> {}",
        insn.raw,
        mode,
        insn.size,
        class.label()
    );
    Displacement::new(insn, mode, class)
}

/// Condition for instructions outside the ARM conditional space.
pub(crate) const ALWAYS: u8 = COND_AL;
