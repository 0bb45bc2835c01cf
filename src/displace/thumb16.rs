//! 16-bit Thumb instruction classification.

use super::{Addressing, Exchange, InsnClass, PcWrite, RemapBuilder, Width, ALWAYS, sign_extend};

pub(super) fn classify(hw: u16) -> InsnClass {
    match hw >> 10 {
        0x11 => special_data(hw),
        // LDR (literal)
        0x12 | 0x13 => InsnClass::LoadLiteral {
            rt: ((hw >> 8) & 7) as u8,
            rt2: None,
            offset: ((hw & 0xff) as u32) << 2,
            add: true,
            width: Width::Word,
            signed: false,
            cond: ALWAYS,
        },
        // ADR
        0x28 | 0x29 => InsnClass::Adr {
            rd: ((hw >> 8) & 7) as u8,
            offset: ((hw & 0xff) as u32) << 2,
            add: true,
        },
        op if op & 0x3c == 0x2c => miscellaneous(hw),
        op if op & 0x3c == 0x34 => conditional_branch(hw),
        0x38 | 0x39 => InsnClass::Branch {
            offset: sign_extend(((hw & 0x7ff) as u32) << 1, 12),
            link: false,
            exchange: Exchange::Keep,
            cond: ALWAYS,
            align_base: false,
        },
        _ => InsnClass::Unchanged,
    }
}

/// High-register ADD/CMP/MOV and BX/BLX.
fn special_data(hw: u16) -> InsnClass {
    let op = (hw >> 6) & 0xf;
    let rdn = (((hw >> 4) & 8) | (hw & 7)) as u8;
    let rm = ((hw >> 3) & 0xf) as u8;

    if op >> 2 == 0b11 {
        return InsnClass::BranchExchange {
            rm,
            link: op & 0b10 != 0,
            cond: ALWAYS,
        };
    }
    if rdn != 15 && rm != 15 {
        return InsnClass::Unchanged;
    }

    // Same opcode on R8 (Rdn) and R9 (Rm).
    let substitute = (hw & 0xff00) as u32 | 0xc8;
    let writes_rdn = op >> 2 != 0b01;
    RemapBuilder::new(hw as u32)
        .with_raw(substitute)
        .push(rdn, 8, writes_rdn, false)
        .push(rm, 9, false, false)
        .build(PcWrite::Alu, ALWAYS)
}

fn miscellaneous(hw: u16) -> InsnClass {
    if hw & 0xf500 == 0xb100 {
        return InsnClass::CompareBranch {
            rn: (hw & 7) as u8,
            nonzero: hw & 0x0800 != 0,
            offset: (((hw >> 3) & 0x40) | ((hw >> 2) & 0x3e)) as u32,
        };
    }
    if hw & 0xff00 == 0xbd00 {
        // POP with the PC in the list
        return InsnClass::LoadMultiple {
            rn: 13,
            list: (hw & 0xff) | 0x8000,
            addressing: Addressing::IncrementAfter,
            writeback: true,
            cond: ALWAYS,
        };
    }
    InsnClass::Unchanged
}

fn conditional_branch(hw: u16) -> InsnClass {
    let cond = ((hw >> 8) & 0xf) as u8;
    if cond >= 0xe {
        // UDF and SVC
        return InsnClass::Unchanged;
    }
    InsnClass::Branch {
        offset: sign_extend(((hw & 0xff) as u32) << 1, 9),
        link: false,
        exchange: Exchange::Keep,
        cond,
        align_base: false,
    }
}
