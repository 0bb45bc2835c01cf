//! ARM register snapshot and program-counter write semantics.

/// Negative flag.
pub const CPSR_N: u32 = 0x8000_0000;
/// Zero flag.
pub const CPSR_Z: u32 = 0x4000_0000;
/// Carry flag.
pub const CPSR_C: u32 = 0x2000_0000;
/// Overflow flag.
pub const CPSR_V: u32 = 0x1000_0000;
/// Thumb execution state bit.
pub const CPSR_T: u32 = 0x20;

pub const REG_SP: usize = 13;
pub const REG_LR: usize = 14;
pub const REG_PC: usize = 15;

/// Condition field value meaning "always".
pub const COND_AL: u8 = 0xe;

/// Processor instruction-set state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Arm,
    Thumb,
}

impl Mode {
    /// Mode encoded in the low bit of a code address.
    pub fn of_address(addr: u32) -> Self {
        if addr & 1 != 0 { Mode::Thumb } else { Mode::Arm }
    }

    /// Tag a code address with this mode (Thumb addresses carry bit 0).
    pub fn tag(self, addr: u32) -> u32 {
        match self {
            Mode::Arm => addr & !1,
            Mode::Thumb => addr | 1,
        }
    }

    /// Offset of the architectural PC value from the instruction address.
    pub fn pc_offset(self) -> u32 {
        match self {
            Mode::Arm => 8,
            Mode::Thumb => 4,
        }
    }
}

/// Register snapshot of a user thread (R0-R15 plus CPSR).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Regs {
    pub r: [u32; 16],
    pub cpsr: u32,
}

impl Regs {
    pub fn pc(&self) -> u32 {
        self.r[REG_PC]
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.r[REG_PC] = pc;
    }

    pub fn sp(&self) -> u32 {
        self.r[REG_SP]
    }

    pub fn lr(&self) -> u32 {
        self.r[REG_LR]
    }

    pub fn set_lr(&mut self, lr: u32) {
        self.r[REG_LR] = lr;
    }

    pub fn is_thumb(&self) -> bool {
        self.cpsr & CPSR_T != 0
    }

    pub fn mode(&self) -> Mode {
        if self.is_thumb() { Mode::Thumb } else { Mode::Arm }
    }

    pub fn set_thumb(&mut self, thumb: bool) {
        if thumb {
            self.cpsr |= CPSR_T;
        } else {
            self.cpsr &= !CPSR_T;
        }
    }

    /// Current PC tagged with the execution mode, as breakpoints are keyed.
    pub fn tagged_pc(&self) -> u32 {
        self.mode().tag(self.pc())
    }

    /// Value an instruction at `insn_addr` observes when reading `reg`.
    ///
    /// Reading R15 yields the instruction address plus 8 (ARM) or 4 (Thumb).
    pub fn operand(&self, reg: u8, insn_addr: u32, mode: Mode) -> u32 {
        let reg = (reg & 0xf) as usize;
        if reg == REG_PC {
            (insn_addr & !1).wrapping_add(mode.pc_offset())
        } else {
            self.r[reg]
        }
    }

    /// Evaluate an ARM condition code against the saved flags.
    pub fn condition_passed(&self, cond: u8) -> bool {
        let n = self.cpsr & CPSR_N != 0;
        let z = self.cpsr & CPSR_Z != 0;
        let c = self.cpsr & CPSR_C != 0;
        let v = self.cpsr & CPSR_V != 0;

        match cond & 0xf {
            0x0 => z,
            0x1 => !z,
            0x2 => c,
            0x3 => !c,
            0x4 => n,
            0x5 => !n,
            0x6 => v,
            0x7 => !v,
            0x8 => c && !z,
            0x9 => !c || z,
            0xa => n == v,
            0xb => n != v,
            0xc => !z && n == v,
            0xd => z || n != v,
            // AL, and the unconditional space
            _ => true,
        }
    }

    /// Branch without changing instruction-set state.
    pub fn branch_write_pc(&mut self, addr: u32) {
        if self.is_thumb() {
            self.set_pc(addr & !1);
        } else {
            self.set_pc(addr & !3);
        }
    }

    /// Branch selecting the instruction set from bit 0 of the target.
    pub fn bx_write_pc(&mut self, addr: u32) {
        if addr & 1 != 0 {
            self.set_thumb(true);
            self.set_pc(addr & !1);
        } else {
            self.set_thumb(false);
            self.set_pc(addr);
        }
    }

    /// PC write from a load (interworking).
    pub fn load_write_pc(&mut self, addr: u32) {
        self.bx_write_pc(addr);
    }

    /// PC write from a data-processing result.
    pub fn alu_write_pc(&mut self, addr: u32) {
        if self.is_thumb() {
            self.branch_write_pc(addr);
        } else {
            self.bx_write_pc(addr);
        }
    }
}
