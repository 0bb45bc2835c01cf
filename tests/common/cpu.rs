//! Reference interpreter for the ARM and Thumb subset the tests execute.
//!
//! Enough of the architecture to run small functions, call sequences and
//! every instruction the displacement tests relocate. Unsupported
//! encodings panic so a test never silently runs garbage.

use uhook::regs::{CPSR_C, CPSR_N, CPSR_V, CPSR_Z};
use uhook::{Pid, ProcessOps, Regs};

use super::host::MockHost;

pub enum Step {
    Executed,
    /// A trap encoding; the value is what the host hands to the dispatcher.
    Trap(u32),
}

pub struct Cpu<'a> {
    pub host: &'a MockHost,
    pub pid: Pid,
}

fn sign_extend(value: u32, bits: u32) -> u32 {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as u32
}

fn bit(raw: u32, n: u32) -> bool {
    raw & (1 << n) != 0
}

fn set_nz(regs: &mut Regs, result: u32) {
    regs.cpsr &= !(CPSR_N | CPSR_Z);
    if result & 0x8000_0000 != 0 {
        regs.cpsr |= CPSR_N;
    }
    if result == 0 {
        regs.cpsr |= CPSR_Z;
    }
}

fn add_with_carry(regs: &mut Regs, a: u32, b: u32, carry: bool, update: bool) -> u32 {
    let wide = a as u64 + b as u64 + carry as u64;
    let result = wide as u32;
    if update {
        set_nz(regs, result);
        regs.cpsr &= !(CPSR_C | CPSR_V);
        if wide > u32::MAX as u64 {
            regs.cpsr |= CPSR_C;
        }
        if (!(a ^ b) & (a ^ result)) & 0x8000_0000 != 0 {
            regs.cpsr |= CPSR_V;
        }
    }
    result
}

impl Cpu<'_> {
    fn read_u32(&self, addr: u32) -> u32 {
        self.host.peek_u32(self.pid, addr)
    }

    fn write_u32(&self, addr: u32, value: u32) {
        self.host.write_memory(self.pid, addr, &value.to_le_bytes()).unwrap();
    }

    fn read_u8(&self, addr: u32) -> u32 {
        let mut b = [0u8; 1];
        self.host.read_memory(self.pid, addr, &mut b).unwrap();
        b[0] as u32
    }

    fn read_u16(&self, addr: u32) -> u32 {
        self.host.peek_u16(self.pid, addr) as u32
    }

    pub fn step(&self, regs: &mut Regs) -> Step {
        if regs.is_thumb() { self.step_thumb(regs) } else { self.step_arm(regs) }
    }

    // =========================================================================
    // ARM
    // =========================================================================

    fn step_arm(&self, regs: &mut Regs) -> Step {
        let pc = regs.pc();
        let raw = self.read_u32(pc);
        if raw & 0xffff_fff0 == 0xe7fa_dbf0 {
            return Step::Trap(raw);
        }
        let read = |regs: &Regs, r: u32| if r == 15 { pc + 8 } else { regs.r[r as usize] };
        regs.set_pc(pc + 4);

        let cond = (raw >> 28) as u8;
        if cond == 0xf {
            assert_eq!((raw >> 25) & 7, 5, "unsupported unconditional {:#010x}", raw);
            let imm = sign_extend(((raw & 0x00ff_ffff) << 2) | (((raw >> 24) & 1) << 1), 26);
            regs.set_lr(pc + 4);
            regs.set_thumb(true);
            regs.set_pc(pc.wrapping_add(8).wrapping_add(imm) & !1);
            return Step::Executed;
        }
        if !regs.condition_passed(cond) {
            return Step::Executed;
        }

        if raw & 0x0fff_ffd0 == 0x012f_ff10 {
            let target = read(&*regs, raw & 0xf);
            if bit(raw, 5) {
                regs.set_lr(pc + 4);
            }
            regs.bx_write_pc(target);
            return Step::Executed;
        }

        match (raw >> 25) & 7 {
            0 if raw & 0x90 == 0x90 && raw & 0x60 != 0 => self.arm_extra_load(regs, raw, pc),
            0 | 1 => Self::arm_data_processing(regs, raw, pc),
            2 | 3 => self.arm_load_store(regs, raw, pc),
            4 => self.arm_block(regs, raw, pc),
            5 => {
                let imm = sign_extend((raw & 0x00ff_ffff) << 2, 26);
                if bit(raw, 24) {
                    regs.set_lr(pc + 4);
                }
                regs.set_pc(pc.wrapping_add(8).wrapping_add(imm));
            }
            _ => panic!("unsupported ARM instruction {:#010x}", raw),
        }
        Step::Executed
    }

    fn arm_data_processing(regs: &mut Regs, raw: u32, pc: u32) {
        let read = |regs: &Regs, r: u32| if r == 15 { pc + 8 } else { regs.r[r as usize] };
        let rn = read(&*regs, (raw >> 16) & 0xf);
        let op2 = if bit(raw, 25) {
            let rot = ((raw >> 8) & 0xf) * 2;
            (raw & 0xff).rotate_right(rot)
        } else {
            assert!(!bit(raw, 4), "register-shifted operand {:#010x}", raw);
            let amount = (raw >> 7) & 0x1f;
            assert!(amount == 0 || (raw >> 5) & 3 == 0, "shift {:#010x}", raw);
            read(&*regs, raw & 0xf) << amount
        };

        let s = bit(raw, 20);
        let rd = (raw >> 12) & 0xf;
        let c = regs.cpsr & CPSR_C != 0;
        let (result, write) = match (raw >> 21) & 0xf {
            0 => (rn & op2, true),
            1 => (rn ^ op2, true),
            2 => (add_with_carry(regs, rn, !op2, true, s), true),
            3 => (add_with_carry(regs, op2, !rn, true, s), true),
            4 => (add_with_carry(regs, rn, op2, false, s), true),
            5 => (add_with_carry(regs, rn, op2, c, s), true),
            8 => (rn & op2, false),
            9 => (rn ^ op2, false),
            10 => (add_with_carry(regs, rn, !op2, true, true), false),
            11 => (add_with_carry(regs, rn, op2, false, true), false),
            12 => (rn | op2, true),
            13 => (op2, true),
            14 => (rn & !op2, true),
            15 => (!op2, true),
            op => panic!("unsupported data-processing op {} in {:#010x}", op, raw),
        };
        let logical = matches!((raw >> 21) & 0xf, 0 | 1 | 8 | 9 | 12 | 13 | 14 | 15);
        if logical && (s || !write) {
            set_nz(regs, result);
        }
        if write {
            if rd == 15 {
                regs.alu_write_pc(result);
            } else {
                regs.r[rd as usize] = result;
            }
        }
    }

    fn arm_load_store(&self, regs: &mut Regs, raw: u32, pc: u32) {
        let read = |regs: &Regs, r: u32| if r == 15 { pc + 8 } else { regs.r[r as usize] };
        let (rn, rt) = ((raw >> 16) & 0xf, (raw >> 12) & 0xf);
        let base = read(&*regs, rn);
        let offset = if bit(raw, 25) {
            assert!(!bit(raw, 4) && (raw >> 5) & 3 == 0, "unsupported offset {:#010x}", raw);
            read(&*regs, raw & 0xf) << ((raw >> 7) & 0x1f)
        } else {
            raw & 0xfff
        };
        let offset_addr = if bit(raw, 23) { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
        let addr = if bit(raw, 24) { offset_addr } else { base };
        let writeback = !bit(raw, 24) || bit(raw, 21);
        let byte = bit(raw, 22);

        if bit(raw, 20) {
            let value = if byte { self.read_u8(addr) } else { self.read_u32(addr) };
            if writeback && rn != 15 {
                regs.r[rn as usize] = offset_addr;
            }
            if rt == 15 {
                regs.load_write_pc(value);
            } else {
                regs.r[rt as usize] = value;
            }
        } else {
            assert!(!byte, "STRB unsupported");
            self.write_u32(addr, read(&*regs, rt));
            if writeback && rn != 15 {
                regs.r[rn as usize] = offset_addr;
            }
        }
    }

    /// LDRH/LDRSB/LDRSH/LDRD, immediate and register offsets.
    fn arm_extra_load(&self, regs: &mut Regs, raw: u32, pc: u32) {
        let read = |regs: &Regs, r: u32| if r == 15 { pc + 8 } else { regs.r[r as usize] };
        let (rn, rt) = ((raw >> 16) & 0xf, (raw >> 12) & 0xf);
        let op2 = (raw >> 5) & 3;
        let dual = !bit(raw, 20);
        assert!(!dual || op2 == 2, "unsupported extra store {:#010x}", raw);
        assert!(rt != 15, "load into PC {:#010x}", raw);

        let base = read(&*regs, rn);
        let offset = if bit(raw, 22) {
            ((raw >> 4) & 0xf0) | (raw & 0xf)
        } else {
            read(&*regs, raw & 0xf)
        };
        let offset_addr = if bit(raw, 23) { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
        let addr = if bit(raw, 24) { offset_addr } else { base };

        let value = match (dual, op2) {
            (true, _) => self.read_u32(addr),
            (false, 1) => self.read_u16(addr),
            (false, 2) => sign_extend(self.read_u8(addr), 8),
            _ => sign_extend(self.read_u16(addr), 16),
        };
        let second = if dual { self.read_u32(addr + 4) } else { 0 };
        if (!bit(raw, 24) || bit(raw, 21)) && rn != 15 {
            regs.r[rn as usize] = offset_addr;
        }
        regs.r[rt as usize] = value;
        if dual {
            regs.r[rt as usize + 1] = second;
        }
    }

    fn arm_block(&self, regs: &mut Regs, raw: u32, pc: u32) {
        let read = |regs: &Regs, r: u32| if r == 15 { pc + 8 } else { regs.r[r as usize] };
        let rn = (raw >> 16) & 0xf;
        let list = raw & 0xffff;
        let count = list.count_ones();
        let base = read(&*regs, rn);
        let mut addr = match (bit(raw, 24), bit(raw, 23)) {
            (false, true) => base,
            (true, true) => base + 4,
            (false, false) => base - 4 * count + 4,
            (true, false) => base - 4 * count,
        };
        let after = if bit(raw, 23) { base + 4 * count } else { base - 4 * count };

        if bit(raw, 20) {
            let mut loaded = [0u32; 16];
            for r in (0..16).filter(|r| list & (1 << r) != 0) {
                loaded[r as usize] = self.read_u32(addr);
                addr += 4;
            }
            if bit(raw, 21) && list & (1 << rn) == 0 {
                regs.r[rn as usize] = after;
            }
            for r in (0..16u32).filter(|r| list & (1 << r) != 0) {
                if r == 15 {
                    regs.load_write_pc(loaded[15]);
                } else {
                    regs.r[r as usize] = loaded[r as usize];
                }
            }
        } else {
            for r in (0..16).filter(|r| list & (1 << r) != 0) {
                self.write_u32(addr, read(&*regs, r));
                addr += 4;
            }
            if bit(raw, 21) {
                regs.r[rn as usize] = after;
            }
        }
    }

    // =========================================================================
    // Thumb
    // =========================================================================

    fn step_thumb(&self, regs: &mut Regs) -> Step {
        let pc = regs.pc();
        let hw = self.host.peek_u16(self.pid, pc) as u32;
        if hw & 0xfff0 == 0xdeb0 {
            return Step::Trap(hw);
        }
        if matches!(hw >> 11, 0x1d | 0x1e | 0x1f) {
            let hw2 = self.host.peek_u16(self.pid, pc + 2) as u32;
            regs.set_pc(pc + 4);
            self.thumb32(regs, pc, hw, hw2);
        } else {
            regs.set_pc(pc + 2);
            self.thumb16(regs, pc, hw);
        }
        Step::Executed
    }

    fn thumb16(&self, regs: &mut Regs, pc: u32, hw: u32) {
        let read = |regs: &Regs, r: u32| if r == 15 { pc + 4 } else { regs.r[r as usize] };
        let lo = |shift: u32| ((hw >> shift) & 7) as usize;
        let literal_base = (pc + 4) & !3;

        match hw >> 11 {
            // ADDS/SUBS (3-bit immediate)
            0x03 if (hw >> 9) & 2 != 0 => {
                let (rn, imm) = (regs.r[lo(3)], (hw >> 6) & 7);
                regs.r[lo(0)] = if bit(hw, 9) {
                    add_with_carry(regs, rn, !imm, true, true)
                } else {
                    add_with_carry(regs, rn, imm, false, true)
                };
            }
            0x04 => {
                regs.r[lo(8)] = hw & 0xff;
                set_nz(regs, hw & 0xff);
            }
            0x05..=0x07 => {
                let (rdn, imm) = (regs.r[lo(8)], hw & 0xff);
                let result = match hw >> 11 {
                    0x06 => add_with_carry(regs, rdn, imm, false, true),
                    _ => add_with_carry(regs, rdn, !imm, true, true),
                };
                if hw >> 11 != 0x05 {
                    regs.r[lo(8)] = result;
                }
            }
            0x08 => self.thumb_special(regs, pc, hw),
            0x09 => regs.r[lo(8)] = self.read_u32(literal_base + (hw & 0xff) * 4),
            0x0c => self.write_u32(regs.r[lo(3)] + ((hw >> 6) & 0x1f) * 4, regs.r[lo(0)]),
            0x0d => regs.r[lo(0)] = self.read_u32(regs.r[lo(3)] + ((hw >> 6) & 0x1f) * 4),
            0x14 => regs.r[lo(8)] = literal_base + (hw & 0xff) * 4,
            0x16 | 0x17 => self.thumb_misc(regs, pc, hw),
            0x1a | 0x1b => {
                let cond = ((hw >> 8) & 0xf) as u8;
                assert!(cond < 0xe, "UDF/SVC {:#06x}", hw);
                if regs.condition_passed(cond) {
                    let imm = sign_extend((hw & 0xff) << 1, 9);
                    regs.set_pc(read(&*regs, 15).wrapping_add(imm));
                }
            }
            0x1c => {
                let imm = sign_extend((hw & 0x7ff) << 1, 12);
                regs.set_pc(read(&*regs, 15).wrapping_add(imm));
            }
            _ => panic!("unsupported Thumb instruction {:#06x}", hw),
        }
    }

    fn thumb_special(&self, regs: &mut Regs, pc: u32, hw: u32) {
        let read = |regs: &Regs, r: u32| if r == 15 { pc + 4 } else { regs.r[r as usize] };
        assert_eq!(hw >> 10, 0x11, "unsupported data-processing {:#06x}", hw);
        let rdn = ((hw >> 4) & 8) | (hw & 7);
        let rm = (hw >> 3) & 0xf;
        match (hw >> 8) & 3 {
            0 | 2 => {
                let value = if (hw >> 8) & 3 == 0 {
                    read(&*regs, rdn).wrapping_add(read(&*regs, rm))
                } else {
                    read(&*regs, rm)
                };
                if rdn == 15 {
                    regs.branch_write_pc(value);
                } else {
                    regs.r[rdn as usize] = value;
                }
            }
            1 => {
                let (a, b) = (read(&*regs, rdn), read(&*regs, rm));
                add_with_carry(regs, a, !b, true, true);
            }
            _ => {
                let target = read(&*regs, rm);
                if bit(hw, 7) {
                    regs.set_lr((pc + 2) | 1);
                }
                regs.bx_write_pc(target);
            }
        }
    }

    fn thumb_misc(&self, regs: &mut Regs, pc: u32, hw: u32) {
        if hw & 0xf500 == 0xb100 {
            let rn = (hw & 7) as usize;
            let imm = ((hw >> 3) & 0x40) | ((hw >> 2) & 0x3e);
            if (regs.r[rn] != 0) == bit(hw, 11) {
                regs.set_pc(pc + 4 + imm);
            }
            return;
        }
        match hw & 0xfe00 {
            // PUSH
            0xb400 => {
                let list = (hw & 0xff) | if bit(hw, 8) { 1 << 14 } else { 0 };
                let mut addr = regs.sp() - 4 * list.count_ones();
                regs.r[13] = addr;
                for r in (0..15).filter(|r| list & (1 << r) != 0) {
                    self.write_u32(addr, regs.r[r as usize]);
                    addr += 4;
                }
            }
            // POP
            0xbc00 => {
                let list = (hw & 0xff) | if bit(hw, 8) { 1 << 15 } else { 0 };
                let mut addr = regs.sp();
                let mut loaded = [0u32; 16];
                for r in (0..16).filter(|r| list & (1 << r) != 0) {
                    loaded[r as usize] = self.read_u32(addr);
                    addr += 4;
                }
                regs.r[13] = addr;
                for r in (0..15).filter(|r| list & (1 << r) != 0) {
                    regs.r[r as usize] = loaded[r as usize];
                }
                if bit(hw, 8) {
                    regs.load_write_pc(loaded[15]);
                }
            }
            // NOP and other hints
            0xbe00 if hw & 0xff00 == 0xbf00 => {}
            _ => panic!("unsupported Thumb miscellaneous {:#06x}", hw),
        }
    }

    fn thumb32(&self, regs: &mut Regs, pc: u32, hw1: u32, hw2: u32) {
        // BL, BLX, B.W (T4)
        if hw1 & 0xf800 == 0xf000 && hw2 & 0x8000 != 0 {
            let s = (hw1 >> 10) & 1;
            let i1 = !((hw2 >> 13) & 1 ^ s) & 1;
            let i2 = !((hw2 >> 11) & 1 ^ s) & 1;
            let imm = sign_extend(
                (s << 24) | (i1 << 23) | (i2 << 22) | ((hw1 & 0x3ff) << 12) | ((hw2 & 0x7ff) << 1),
                25,
            );
            match hw2 & 0xd000 {
                // B<cond>.W (T3)
                0x8000 => {
                    let cond = ((hw1 >> 6) & 0xf) as u8;
                    assert!(cond < 0xe, "unsupported branch {:#06x} {:#06x}", hw1, hw2);
                    if regs.condition_passed(cond) {
                        let (j1, j2) = ((hw2 >> 13) & 1, (hw2 >> 11) & 1);
                        let imm = sign_extend(
                            (s << 20) | (j2 << 19) | (j1 << 18) | ((hw1 & 0x3f) << 12) | ((hw2 & 0x7ff) << 1),
                            21,
                        );
                        regs.set_pc((pc + 4).wrapping_add(imm));
                    }
                }
                0xd000 => {
                    regs.set_lr((pc + 4) | 1);
                    regs.set_pc((pc + 4).wrapping_add(imm));
                }
                0xc000 => {
                    regs.set_lr((pc + 4) | 1);
                    regs.set_thumb(false);
                    regs.set_pc(((pc + 4) & !3).wrapping_add(imm) & !3);
                }
                0x9000 => regs.set_pc((pc + 4).wrapping_add(imm)),
                _ => panic!("unsupported branch {:#06x} {:#06x}", hw1, hw2),
            }
            return;
        }
        // MOV.W Rd, Rm
        if hw1 == 0xea4f && hw2 & 0x70f0 == 0 {
            let value = regs.r[(hw2 & 0xf) as usize];
            regs.r[((hw2 >> 8) & 0xf) as usize] = value;
            return;
        }
        // TBB, TBH
        if hw1 & 0xfff0 == 0xe8d0 && hw2 & 0xffe0 == 0xf000 {
            let rn = hw1 & 0xf;
            let base = if rn == 15 { pc + 4 } else { regs.r[rn as usize] };
            let index = regs.r[(hw2 & 0xf) as usize];
            let entry = if bit(hw2, 4) {
                self.read_u16(base.wrapping_add(index * 2))
            } else {
                self.read_u8(base.wrapping_add(index))
            };
            regs.set_pc(pc + 4 + entry * 2);
            return;
        }
        // LDM.W (IA), LDMDB, POP.W
        if matches!(hw1 & 0xffd0, 0xe890 | 0xe910) {
            let rn = (hw1 & 0xf) as usize;
            let base = regs.r[rn];
            let count = hw2.count_ones();
            let decrement = bit(hw1, 8);
            let mut addr = if decrement { base - 4 * count } else { base };
            let after = if decrement { base - 4 * count } else { base + 4 * count };
            let mut loaded = [0u32; 16];
            for r in (0..16).filter(|r| hw2 & (1 << r) != 0) {
                loaded[r as usize] = self.read_u32(addr);
                addr += 4;
            }
            if bit(hw1, 5) {
                regs.r[rn] = after;
            }
            for r in (0..15).filter(|r| hw2 & (1 << r) != 0) {
                regs.r[r as usize] = loaded[r as usize];
            }
            if bit(hw2, 15) {
                regs.load_write_pc(loaded[15]);
            }
            return;
        }
        // LDRD (literal)
        if hw1 & 0xfe5f == 0xe85f && hw1 & 0x0120 != 0 {
            let base = (pc + 4) & !3;
            let imm = (hw2 & 0xff) << 2;
            let addr = if bit(hw1, 7) { base + imm } else { base - imm };
            regs.r[(hw2 >> 12) as usize] = self.read_u32(addr);
            regs.r[((hw2 >> 8) & 0xf) as usize] = self.read_u32(addr + 4);
            return;
        }
        // LDR.W, LDRB.W, LDRH.W, LDRSB, LDRSH (literal)
        if hw1 & 0xfe1f == 0xf81f {
            let base = (pc + 4) & !3;
            let imm = hw2 & 0xfff;
            let addr = if bit(hw1, 7) { base + imm } else { base - imm };
            let value = match ((hw1 >> 5) & 3, bit(hw1, 8)) {
                (0, false) => self.read_u8(addr),
                (0, true) => sign_extend(self.read_u8(addr), 8),
                (1, false) => self.read_u16(addr),
                (1, true) => sign_extend(self.read_u16(addr), 16),
                _ => self.read_u32(addr),
            };
            let rt = (hw2 >> 12) & 0xf;
            if rt == 15 {
                regs.load_write_pc(value);
            } else {
                regs.r[rt as usize] = value;
            }
            return;
        }
        panic!("unsupported Thumb32 instruction {:#06x} {:#06x}", hw1, hw2);
    }
}
