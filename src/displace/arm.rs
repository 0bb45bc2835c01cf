//! ARM (A32) instruction classification.

use super::{Addressing, Exchange, InsnClass, PcWrite, RemapBuilder, Width, ALWAYS, sign_extend};

const PC: u8 = 15;

fn reg(raw: u32, shift: u32) -> u8 {
    ((raw >> shift) & 0xf) as u8
}

fn bit(raw: u32, n: u32) -> bool {
    raw & (1 << n) != 0
}

pub(super) fn classify(raw: u32) -> InsnClass {
    let cond = (raw >> 28) as u8;
    if cond == 0xf {
        return unconditional(raw);
    }

    match (raw >> 25) & 7 {
        0 => data_processing_misc(raw, cond),
        1 => data_processing_imm(raw, cond),
        2 => load_store_single(raw, cond, false),
        3 if !bit(raw, 4) => load_store_single(raw, cond, true),
        // media instructions never touch the PC
        3 => InsnClass::Unchanged,
        4 => block_transfer(raw, cond),
        5 => branch(raw, cond),
        _ => coprocessor(raw, cond),
    }
}

fn data_processing_misc(raw: u32, cond: u8) -> InsnClass {
    let op1 = (raw >> 20) & 0x1f;
    let op2 = (raw >> 4) & 0xf;

    if op2 == 0b1001 {
        // multiply and synchronization primitives
        return InsnClass::Unchanged;
    }
    if op2 & 0b1001 == 0b1001 {
        if op1 & 0x12 == 0x02 {
            // unprivileged forms, PC operands are unpredictable
            return InsnClass::Unchanged;
        }
        return extra_load_store(raw, cond);
    }
    if op1 & 0x19 == 0x10 {
        if op2 & 0b1000 == 0 {
            return misc(raw, cond);
        }
        // halfword multiply
        return InsnClass::Unchanged;
    }
    data_processing(raw, cond, false, op2 & 1 != 0)
}

fn data_processing_imm(raw: u32, cond: u8) -> InsnClass {
    let op1 = (raw >> 20) & 0x1f;
    if op1 & 0x19 == 0x10 {
        // MOVW, MOVT, MSR (immediate) and hints
        return InsnClass::Unchanged;
    }
    data_processing(raw, cond, true, false)
}

/// Data-processing with Rd -> R0, Rn -> R1, Rm -> R2, Rs -> R3.
fn data_processing(raw: u32, cond: u8, immediate: bool, register_shift: bool) -> InsnClass {
    let opcode = (raw >> 21) & 0xf;
    let (rd, rn, rm, rs) = (reg(raw, 12), reg(raw, 16), reg(raw, 0), reg(raw, 8));
    // TST, TEQ, CMP, CMN have no destination; MOV and MVN no first operand.
    let compare = (8..=11).contains(&opcode);
    let move_op = opcode == 13 || opcode == 15;

    let uses_pc = (!compare && rd == PC)
        || (!move_op && rn == PC)
        || (!immediate && rm == PC)
        || (register_shift && rs == PC);
    if !uses_pc {
        return InsnClass::Unchanged;
    }

    let mut b = RemapBuilder::new(raw);
    if !compare {
        b = b.field(12, 0, true);
    }
    if !move_op {
        b = b.field(16, 1, false);
    }
    if !immediate {
        b = b.field(0, 2, false);
    }
    if register_shift {
        b = b.field(8, 3, false);
    }
    b.build(PcWrite::Alu, cond)
}

fn misc(raw: u32, cond: u8) -> InsnClass {
    let op = (raw >> 21) & 3;
    let op2 = (raw >> 4) & 7;
    match (op, op2) {
        (0b01, 0b001) => InsnClass::BranchExchange {
            rm: reg(raw, 0),
            link: false,
            cond,
        },
        (0b01, 0b011) => InsnClass::BranchExchange {
            rm: reg(raw, 0),
            link: true,
            cond,
        },
        _ => InsnClass::Unchanged,
    }
}

/// LDRH/STRH/LDRSB/LDRSH/LDRD/STRD.
fn extra_load_store(raw: u32, cond: u8) -> InsnClass {
    let op2 = (raw >> 5) & 3;
    let l = bit(raw, 20);
    let immediate = bit(raw, 22);
    let (rn, rt, rm) = (reg(raw, 16), reg(raw, 12), reg(raw, 0));
    let writeback = !bit(raw, 24) || bit(raw, 21);

    let dual = !l && op2 != 1;
    let load = if dual { op2 == 0b10 } else { l };

    if load && immediate && rn == PC {
        let offset = ((raw >> 4) & 0xf0) | (raw & 0xf);
        let (width, signed) = match (dual, op2) {
            (true, _) => (Width::Double, false),
            (false, 0b01) => (Width::Half, false),
            (false, 0b10) => (Width::Byte, true),
            _ => (Width::Half, true),
        };
        return InsnClass::LoadLiteral {
            rt,
            rt2: dual.then_some(rt + 1),
            offset,
            add: bit(raw, 23),
            width,
            signed,
            cond,
        };
    }

    let uses_pc = rn == PC || rt == PC || (dual && rt == 14) || (!immediate && rm == PC);
    if !uses_pc {
        return InsnClass::Unchanged;
    }

    let mut b = RemapBuilder::new(raw).field(16, 0, writeback);
    if !immediate {
        b = b.field(0, 1, false);
    }
    b = b.field(12, 2, load);
    if dual && rt < PC {
        b = b.push(rt + 1, 3, load, false);
    }
    b.build(PcWrite::Load, cond)
}

/// LDR/STR/LDRB/STRB with Rt -> R0, Rn -> R1, Rm -> R2.
fn load_store_single(raw: u32, cond: u8, register_form: bool) -> InsnClass {
    let load = bit(raw, 20);
    let (rn, rt, rm) = (reg(raw, 16), reg(raw, 12), reg(raw, 0));
    let writeback = !bit(raw, 24) || bit(raw, 21);

    if load && !register_form && rn == PC {
        return InsnClass::LoadLiteral {
            rt,
            rt2: None,
            offset: raw & 0xfff,
            add: bit(raw, 23),
            width: if bit(raw, 22) { Width::Byte } else { Width::Word },
            signed: false,
            cond,
        };
    }

    let uses_pc = rn == PC || rt == PC || (register_form && rm == PC);
    if !uses_pc {
        return InsnClass::Unchanged;
    }

    let mut b = RemapBuilder::new(raw).field(12, 0, load).field(16, 1, writeback);
    if register_form {
        b = b.field(0, 2, false);
    }
    b.build(PcWrite::Load, cond)
}

fn block_transfer(raw: u32, cond: u8) -> InsnClass {
    let rn = reg(raw, 16);
    let list = raw as u16;
    if list & 0x8000 == 0 && rn != PC {
        return InsnClass::Unchanged;
    }

    let addressing = Addressing::from_pu(bit(raw, 24), bit(raw, 23));
    let writeback = bit(raw, 21);
    if bit(raw, 20) {
        InsnClass::LoadMultiple {
            rn,
            list,
            addressing,
            writeback,
            cond,
        }
    } else {
        InsnClass::StoreMultiple {
            rn,
            list,
            addressing,
            writeback,
            cond,
        }
    }
}

fn branch(raw: u32, cond: u8) -> InsnClass {
    InsnClass::Branch {
        offset: sign_extend((raw & 0x00ff_ffff) << 2, 26),
        link: bit(raw, 24),
        exchange: Exchange::Keep,
        cond,
        align_base: false,
    }
}

/// LDC/STC, VLDR/VSTR and VLDM/VSTM addressed off the PC.
fn coprocessor(raw: u32, cond: u8) -> InsnClass {
    let op1 = (raw >> 20) & 0x3f;
    let is_transfer = op1 & 0x20 == 0 && op1 & 0x3e != 0 && op1 & 0x3e != 0x04;
    if (raw >> 24) & 0xf == 0xf || !is_transfer || reg(raw, 16) != PC {
        return InsnClass::Unchanged;
    }
    RemapBuilder::new(raw).field(16, 0, false).build(PcWrite::Load, cond)
}

fn unconditional(raw: u32) -> InsnClass {
    let op1 = (raw >> 20) & 0xff;
    if op1 & 0xe0 == 0xa0 {
        let imm = ((raw & 0x00ff_ffff) << 2) | (((raw >> 24) & 1) << 1);
        return InsnClass::Branch {
            offset: sign_extend(imm, 26),
            link: true,
            exchange: Exchange::ToThumb,
            cond: ALWAYS,
            align_base: false,
        };
    }
    // LDC2/STC2; PLD/PLI literal are hints and run as they are.
    if op1 & 0xe0 == 0xc0 && !matches!(op1 & 0xfe, 0xc0 | 0xc4) && reg(raw, 16) == PC {
        return RemapBuilder::new(raw).field(16, 0, false).build(PcWrite::Load, ALWAYS);
    }
    InsnClass::Unchanged
}
