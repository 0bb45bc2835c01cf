//! 32-bit Thumb instruction classification.
//!
//! Instructions arrive packed with the first halfword in the low 16 bits, so
//! a field at bit `k` of the first halfword is raw bit `k` and a field at bit
//! `k` of the second halfword is raw bit `16 + k`.

use super::{
    Addressing, Exchange, InsnClass, PcWrite, RemapBuilder, Width, ALWAYS, sign_extend, split_thumb32,
};

const PC: u8 = 15;

pub(super) fn classify(raw: u32) -> InsnClass {
    let (hw1, hw2) = split_thumb32(raw);
    let op1 = (hw1 >> 11) & 3;
    let op2 = (hw1 >> 4) & 0x7f;

    match op1 {
        0b01 => match op2 {
            op if op & 0x64 == 0x00 => load_multiple(hw1, hw2),
            op if op & 0x64 == 0x04 => dual_exclusive_table(hw1, hw2),
            op if op & 0x60 == 0x20 => shifted_register(raw, hw1, hw2),
            _ => coprocessor(raw, hw1),
        },
        0b10 if hw2 & 0x8000 == 0 => {
            if op2 & 0x20 != 0 {
                plain_binary_immediate(hw1, hw2)
            } else {
                InsnClass::Unchanged
            }
        }
        0b10 => branch_misc(hw1, hw2),
        0b11 => match op2 & 0x67 {
            0x01 | 0x03 | 0x05 => load_single(raw, hw1, hw2),
            _ if op2 & 0x40 != 0 => coprocessor(raw, hw1),
            _ => InsnClass::Unchanged,
        },
        _ => InsnClass::Unchanged,
    }
}

/// LDM.W / POP.W with the PC in the list.
fn load_multiple(hw1: u16, hw2: u16) -> InsnClass {
    let op = (hw1 >> 7) & 3;
    let load = hw1 & 0x10 != 0;
    if !load || hw2 & 0x8000 == 0 || !(op == 0b01 || op == 0b10) {
        return InsnClass::Unchanged;
    }
    InsnClass::LoadMultiple {
        rn: (hw1 & 0xf) as u8,
        list: hw2,
        addressing: if op == 0b01 {
            Addressing::IncrementAfter
        } else {
            Addressing::DecrementBefore
        },
        writeback: hw1 & 0x20 != 0,
        cond: ALWAYS,
    }
}

/// TBB/TBH and LDRD (literal).
fn dual_exclusive_table(hw1: u16, hw2: u16) -> InsnClass {
    if hw1 & 0xfff0 == 0xe8d0 && hw2 & 0xffe0 == 0xf000 {
        return InsnClass::TableBranch {
            rn: (hw1 & 0xf) as u8,
            rm: (hw2 & 0xf) as u8,
            halfword: hw2 & 0x10 != 0,
        };
    }
    // LDRD needs P or W set; both clear is the exclusive group.
    if hw1 & 0xfe5f == 0xe85f && hw1 & 0x0120 != 0 {
        return InsnClass::LoadLiteral {
            rt: (hw2 >> 12) as u8,
            rt2: Some(((hw2 >> 8) & 0xf) as u8),
            offset: ((hw2 & 0xff) as u32) << 2,
            add: hw1 & 0x80 != 0,
            width: Width::Double,
            signed: false,
            cond: ALWAYS,
        };
    }
    InsnClass::Unchanged
}

/// Data-processing (shifted register) with Rm == PC.
///
/// A PC value in Rd or Rn selects the compare and move encodings, so only
/// Rm can actually name the PC.
fn shifted_register(raw: u32, hw1: u16, hw2: u16) -> InsnClass {
    if hw2 & 0xf != 0xf {
        return InsnClass::Unchanged;
    }
    let rd = (hw2 >> 8) & 0xf;
    let rn = hw1 & 0xf;

    let mut b = RemapBuilder::new(raw);
    if rd != 0xf {
        b = b.field(24, 0, true);
    }
    if rn != 0xf {
        b = b.field(0, 1, false);
    }
    b.field(16, 2, false).build(PcWrite::Alu, ALWAYS)
}

/// LDC/STC and VFP loads addressed off the PC.
fn coprocessor(raw: u32, hw1: u16) -> InsnClass {
    let is_transfer = hw1 & 0x0e00 == 0x0c00 && hw1 & 0x01a0 != 0 && hw1 & 0x0fe0 != 0x0c40;
    if !is_transfer || hw1 & 0xf != 0xf {
        return InsnClass::Unchanged;
    }
    RemapBuilder::new(raw)
        .field_with(0, 0, false, true)
        .build(PcWrite::Load, ALWAYS)
}

/// ADDW/SUBW with Rn == PC, i.e. ADR.W.
fn plain_binary_immediate(hw1: u16, hw2: u16) -> InsnClass {
    let op = (hw1 >> 4) & 0x1f;
    if hw1 & 0xf != 0xf || !(op == 0x00 || op == 0x0a) {
        return InsnClass::Unchanged;
    }
    let imm = ((hw1 as u32 & 0x400) << 1) | ((hw2 as u32 & 0x7000) >> 4) | (hw2 as u32 & 0xff);
    InsnClass::Adr {
        rd: ((hw2 >> 8) & 0xf) as u8,
        offset: imm,
        add: op == 0x00,
    }
}

/// B, B<cond>, BL, BLX (immediate) and SUBS PC, LR.
fn branch_misc(hw1: u16, hw2: u16) -> InsnClass {
    let s = ((hw1 >> 10) & 1) as u32;
    let j1 = ((hw2 >> 13) & 1) as u32;
    let j2 = ((hw2 >> 11) & 1) as u32;
    let i1 = !(j1 ^ s) & 1;
    let i2 = !(j2 ^ s) & 1;
    let imm10 = (hw1 & 0x3ff) as u32;

    match (hw2 >> 12) & 0b101 {
        0b000 => {
            if (hw1 >> 7) & 7 != 7 {
                let imm = (s << 20)
                    | (j2 << 19)
                    | (j1 << 18)
                    | (((hw1 & 0x3f) as u32) << 12)
                    | (((hw2 & 0x7ff) as u32) << 1);
                return InsnClass::Branch {
                    offset: sign_extend(imm, 21),
                    link: false,
                    exchange: Exchange::Keep,
                    cond: ((hw1 >> 6) & 0xf) as u8,
                    align_base: false,
                };
            }
            if hw1 == 0xf3de && hw2 & 0xff00 == 0x8f00 {
                return InsnClass::ExceptionReturn {
                    offset: (hw2 & 0xff) as u32,
                };
            }
            InsnClass::Unchanged
        }
        0b001 | 0b101 => {
            let imm = (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (((hw2 & 0x7ff) as u32) << 1);
            InsnClass::Branch {
                offset: sign_extend(imm, 25),
                link: hw2 & 0x4000 != 0,
                exchange: Exchange::Keep,
                cond: ALWAYS,
                align_base: false,
            }
        }
        _ => {
            let imm = (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (((hw2 & 0x7fe) as u32) << 1);
            InsnClass::Branch {
                offset: sign_extend(imm, 25),
                link: true,
                exchange: Exchange::ToArm,
                cond: ALWAYS,
                align_base: true,
            }
        }
    }
}

/// LDR/LDRB/LDRH/LDRSB/LDRSH in all addressing forms.
fn load_single(raw: u32, hw1: u16, hw2: u16) -> InsnClass {
    let size = (hw1 >> 5) & 3;
    let rn = (hw1 & 0xf) as u8;
    let rt = (hw2 >> 12) as u8;

    // PLD/PLI
    if rt == PC && size != 2 {
        return InsnClass::Unchanged;
    }

    if rn == PC {
        return InsnClass::LoadLiteral {
            rt,
            rt2: None,
            offset: (hw2 & 0xfff) as u32,
            add: hw1 & 0x80 != 0,
            width: match size {
                0 => Width::Byte,
                1 => Width::Half,
                _ => Width::Word,
            },
            signed: hw1 & 0x100 != 0,
            cond: ALWAYS,
        };
    }

    let register_form = hw1 & 0x80 == 0 && hw2 & 0x0fc0 == 0;
    let rm = (hw2 & 0xf) as u8;
    if rt != PC && !(register_form && rm == PC) {
        return InsnClass::Unchanged;
    }

    let imm8_form = hw1 & 0x80 == 0 && hw2 & 0x0800 != 0;
    let writeback = imm8_form && hw2 & 0x0100 != 0;
    let mut b = RemapBuilder::new(raw).field(0, 0, writeback).field(28, 1, true);
    if register_form {
        b = b.field(16, 2, false);
    }
    b.build(PcWrite::Load, ALWAYS)
}
