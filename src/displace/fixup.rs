//! Pre/post fix-ups around a displaced instruction.
//!
//! `pre` runs at the breakpoint trap, before the thread is sent to the slot.
//! `post` runs at the return trap after the slot executed. Both read operand
//! values from the snapshot taken at the breakpoint, never from the live
//! registers, so the substitute cannot disturb the emulation.

use crate::error::Result;
use crate::memory::RemoteMemory;
use crate::regs::{Mode, REG_PC, Regs};

use super::{Addressing, Exchange, InsnClass, PcWrite, Remap, Width};

/// Everything a fix-up needs to know about the original instruction.
pub struct StepContext<'a> {
    /// Address of the original instruction, without the mode bit.
    pub addr: u32,
    pub size: u8,
    pub mode: Mode,
    /// Registers at the breakpoint trap.
    pub snapshot: &'a Regs,
    pub mem: &'a dyn RemoteMemory,
}

impl StepContext<'_> {
    fn read(&self, reg: u8) -> u32 {
        self.snapshot.operand(reg, self.addr, self.mode)
    }

    fn aligned_pc(&self) -> u32 {
        self.read(REG_PC as u8) & !3
    }

    fn passed(&self, cond: u8) -> bool {
        self.snapshot.condition_passed(cond)
    }

    /// Link value for a call from the original instruction.
    fn link(&self) -> u32 {
        match self.mode {
            Mode::Arm => self.addr.wrapping_add(4),
            Mode::Thumb => self.addr.wrapping_add(self.size as u32) | 1,
        }
    }
}

impl InsnClass {
    /// Stage scratch registers before the slot executes.
    pub fn pre(&self, regs: &mut Regs, ctx: &StepContext<'_>) {
        if let Self::Remap(remap) = self {
            let mut staged = [0u32; 4];
            for (value, op) in staged.iter_mut().zip(remap.operands()) {
                let v = ctx.read(op.reg);
                *value = if op.align_pc && op.reg as usize == REG_PC { v & !3 } else { v };
            }
            for (value, op) in staged.iter().zip(remap.operands()) {
                regs.r[op.scratch as usize] = *value;
            }
        }
    }

    /// Complete the instruction after the slot executed.
    ///
    /// Returns `true` when the PC was redirected and must not be advanced
    /// past the original instruction.
    pub fn post(&self, regs: &mut Regs, ctx: &StepContext<'_>) -> Result<bool> {
        match *self {
            Self::Unchanged => Ok(false),
            Self::Remap(ref remap) => Ok(remap_post(remap, regs, ctx)),
            Self::Branch {
                offset,
                link,
                exchange,
                cond,
                align_base,
            } => {
                if !ctx.passed(cond) {
                    return Ok(false);
                }
                let base = if align_base { ctx.aligned_pc() } else { ctx.read(REG_PC as u8) };
                let target = base.wrapping_add(offset as u32);
                if link {
                    regs.set_lr(ctx.link());
                }
                match exchange {
                    Exchange::Keep => regs.branch_write_pc(target),
                    Exchange::ToThumb => {
                        regs.set_thumb(true);
                        regs.set_pc(target & !1);
                    }
                    Exchange::ToArm => {
                        regs.set_thumb(false);
                        regs.set_pc(target & !3);
                    }
                }
                Ok(true)
            }
            Self::BranchExchange { rm, link, cond } => {
                if !ctx.passed(cond) {
                    return Ok(false);
                }
                let target = ctx.read(rm);
                if link {
                    regs.set_lr(ctx.link());
                }
                regs.bx_write_pc(target);
                Ok(true)
            }
            Self::CompareBranch { rn, nonzero, offset } => {
                if (ctx.snapshot.r[rn as usize] != 0) != nonzero {
                    return Ok(false);
                }
                let target = ctx.read(REG_PC as u8).wrapping_add(offset);
                regs.branch_write_pc(target);
                Ok(true)
            }
            Self::TableBranch { rn, rm, halfword } => {
                let base = ctx.read(rn);
                let index = ctx.snapshot.r[rm as usize];
                let entry = if halfword {
                    ctx.mem.read_u16(base.wrapping_add(index.wrapping_mul(2)))? as u32
                } else {
                    ctx.mem.read_u8(base.wrapping_add(index))? as u32
                };
                let target = ctx.read(REG_PC as u8).wrapping_add(entry * 2);
                regs.branch_write_pc(target);
                Ok(true)
            }
            Self::LoadLiteral {
                rt,
                rt2,
                offset,
                add,
                width,
                signed,
                cond,
            } => {
                if !ctx.passed(cond) {
                    return Ok(false);
                }
                let base = ctx.aligned_pc();
                let ea = if add { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
                let value = match (width, signed) {
                    (Width::Byte, false) => ctx.mem.read_u8(ea)? as u32,
                    (Width::Byte, true) => ctx.mem.read_u8(ea)? as i8 as i32 as u32,
                    (Width::Half, false) => ctx.mem.read_u16(ea)? as u32,
                    (Width::Half, true) => ctx.mem.read_u16(ea)? as i16 as i32 as u32,
                    (Width::Word | Width::Double, _) => ctx.mem.read_u32(ea)?,
                };
                let second = match rt2 {
                    Some(rt2) if width == Width::Double => Some((rt2, ctx.mem.read_u32(ea.wrapping_add(4))?)),
                    _ => None,
                };
                let mut redirected = write_result(regs, rt, value, PcWrite::Load);
                if let Some((rt2, value)) = second {
                    redirected |= write_result(regs, rt2, value, PcWrite::Load);
                }
                Ok(redirected)
            }
            Self::LoadMultiple {
                rn,
                list,
                addressing,
                writeback,
                cond,
            } => {
                if !ctx.passed(cond) {
                    return Ok(false);
                }
                load_multiple(regs, ctx, rn, list, addressing, writeback)
            }
            Self::StoreMultiple {
                rn,
                list,
                addressing,
                writeback,
                cond,
            } => {
                if !ctx.passed(cond) {
                    return Ok(false);
                }
                let base = ctx.read(rn);
                let count = list.count_ones();
                let mut addr = addressing.start_address(base, count);
                for reg in registers(list) {
                    ctx.mem.write_u32(addr, ctx.read(reg))?;
                    addr = addr.wrapping_add(4);
                }
                if writeback && rn as usize != REG_PC {
                    regs.r[rn as usize] = addressing.written_back(base, count);
                }
                Ok(false)
            }
            Self::Adr { rd, offset, add } => {
                let base = ctx.aligned_pc();
                let value = if add { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
                Ok(write_result(regs, rd, value, PcWrite::Alu))
            }
            Self::ExceptionReturn { offset } => {
                regs.bx_write_pc(ctx.snapshot.lr().wrapping_sub(offset));
                Ok(true)
            }
        }
    }
}

fn remap_post(remap: &Remap, regs: &mut Regs, ctx: &StepContext<'_>) -> bool {
    let ops = remap.operands();
    let mut outputs = [(0u8, 0u32); 4];
    let mut n = 0;

    if ctx.passed(remap.cond) {
        for op in ops.iter().filter(|op| op.output) {
            outputs[n] = (op.reg, regs.r[op.scratch as usize]);
            n += 1;
        }
    }

    for op in ops {
        regs.r[op.scratch as usize] = ctx.snapshot.r[op.scratch as usize];
    }

    // Ordinary registers first so a PC write sees the final state.
    let mut redirected = false;
    for &(reg, value) in outputs[..n].iter().filter(|(reg, _)| *reg as usize != REG_PC) {
        write_result(regs, reg, value, remap.pc_write);
    }
    for &(reg, value) in outputs[..n].iter().filter(|(reg, _)| *reg as usize == REG_PC) {
        redirected |= write_result(regs, reg, value, remap.pc_write);
    }
    redirected
}

fn load_multiple(
    regs: &mut Regs,
    ctx: &StepContext<'_>,
    rn: u8,
    list: u16,
    addressing: Addressing,
    writeback: bool,
) -> Result<bool> {
    let base = ctx.read(rn);
    let count = list.count_ones();
    let mut addr = addressing.start_address(base, count);

    let mut loaded = [0u32; 16];
    for reg in registers(list) {
        loaded[reg as usize] = ctx.mem.read_u32(addr)?;
        addr = addr.wrapping_add(4);
    }

    if writeback && list & (1 << rn) == 0 && rn as usize != REG_PC {
        regs.r[rn as usize] = addressing.written_back(base, count);
    }

    let mut redirected = false;
    for reg in registers(list) {
        redirected |= write_result(regs, reg, loaded[reg as usize], PcWrite::Load);
    }
    Ok(redirected)
}

/// Registers named by a block-transfer list, lowest first.
fn registers(list: u16) -> impl Iterator<Item = u8> {
    (0..16u8).filter(move |r| list & (1 << r) != 0)
}

/// Write one result register; returns whether it was the PC.
fn write_result(regs: &mut Regs, reg: u8, value: u32, how: PcWrite) -> bool {
    if reg as usize != REG_PC {
        regs.r[reg as usize] = value;
        return false;
    }
    match how {
        PcWrite::Alu => regs.alu_write_pc(value),
        PcWrite::Load => regs.load_write_pc(value),
    }
    true
}
