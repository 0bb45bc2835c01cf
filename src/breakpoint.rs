//! Software breakpoints: trap encodings, classification and install/restore.
//!
//! A breakpoint is a reserved undefined instruction whose low four bits carry
//! the [`Classification`] of the trap. The ARM form keeps the top 28 bits
//! fixed, the Thumb form is a 16-bit `UDF` with a fixed top 12 bits. A Thumb
//! trap overwrites only the first halfword of a 32-bit instruction.

use alloc::string::String;

use crate::displace::Instruction;
use crate::error::{Error, Result};
use crate::hook::HookHandlers;
use crate::memory::{RemoteMemory, read_instruction, write_instruction};
use crate::regs::Mode;

/// ARM trap encoding with the classification code in bits 3:0.
pub const ARM_TRAP_BASE: u32 = 0xe7fa_dbf0;
pub const ARM_TRAP_MASK: u32 = 0xffff_fff0;
/// Thumb trap encoding with the classification code in bits 3:0.
pub const THUMB_TRAP_BASE: u16 = 0xdeb0;
pub const THUMB_TRAP_MASK: u16 = 0xfff0;

/// CPSR mode field plus T bit, as matched at trap registration.
pub const USER_MODE_MASK: u32 = 0x3f;
pub const ARM_USER_MODE: u32 = 0x10;
pub const THUMB_USER_MODE: u32 = 0x30;

/// Why a breakpoint exists.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// First instruction of a freshly executed image (one-shot bootstrap).
    ExeEntry = 0,
    /// Start routine of a thread created through `pthread_create`.
    ThreadFuncEntry = 1,
    /// Return address of a thread start routine.
    ThreadFuncExit = 2,
    /// Entry of a hooked function.
    UserHook = 3,
    /// Return address of a hooked function.
    HookedFuncExit = 4,
    /// End of a displaced sequence in a scratch slot.
    DisplacedSteppingReturn = 5,
    /// Housekeeping placeholder whose callbacks never run.
    Ignore = 6,
}

impl Classification {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::ExeEntry,
            1 => Self::ThreadFuncEntry,
            2 => Self::ThreadFuncExit,
            3 => Self::UserHook,
            4 => Self::HookedFuncExit,
            5 => Self::DisplacedSteppingReturn,
            6 => Self::Ignore,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_exit(self) -> bool {
        matches!(self, Self::ThreadFuncExit | Self::HookedFuncExit)
    }

    /// Class of the breakpoint armed at the return address of an entry.
    pub fn exit_class(self) -> Option<Self> {
        match self {
            Self::UserHook => Some(Self::HookedFuncExit),
            Self::ThreadFuncEntry => Some(Self::ThreadFuncExit),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::ExeEntry => "exe-entry",
            Self::ThreadFuncEntry => "thread-func-entry",
            Self::ThreadFuncExit => "thread-func-exit",
            Self::UserHook => "user-hook",
            Self::HookedFuncExit => "hooked-func-exit",
            Self::DisplacedSteppingReturn => "displaced-stepping-return",
            Self::Ignore => "ignore",
        }
    }
}

/// Trap instruction for a breakpoint of class `class` in `mode`.
pub fn trap_instruction(mode: Mode, class: Classification) -> Instruction {
    match mode {
        Mode::Arm => Instruction::arm(ARM_TRAP_BASE | class.code() as u32),
        Mode::Thumb => Instruction::thumb16(THUMB_TRAP_BASE | class.code() as u16),
    }
}

/// Classification carried by a trapping instruction, if it is one of ours.
///
/// For Thumb only the first halfword (low 16 bits) is examined.
pub fn decode_trap(insn: u32, mode: Mode) -> Option<Classification> {
    let code = match mode {
        Mode::Arm if insn & ARM_TRAP_MASK == ARM_TRAP_BASE => insn & 0xf,
        Mode::Thumb if insn as u16 & THUMB_TRAP_MASK == THUMB_TRAP_BASE => insn & 0xf,
        _ => return None,
    };
    Classification::from_code(code as u8)
}

pub fn is_trap_instruction(insn: &Instruction, mode: Mode) -> bool {
    match mode {
        Mode::Arm => insn.raw & ARM_TRAP_MASK == ARM_TRAP_BASE,
        Mode::Thumb => insn.raw as u16 & THUMB_TRAP_MASK == THUMB_TRAP_BASE,
    }
}

/// One undefined-instruction hook the host must register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapPattern {
    pub insn_mask: u32,
    pub insn_value: u32,
    pub cpsr_mask: u32,
    pub cpsr_value: u32,
}

/// Patterns for the host's undefined-instruction dispatcher, ARM then Thumb.
pub fn trap_patterns() -> [TrapPattern; 2] {
    [
        TrapPattern {
            insn_mask: ARM_TRAP_MASK,
            insn_value: ARM_TRAP_BASE,
            cpsr_mask: USER_MODE_MASK,
            cpsr_value: ARM_USER_MODE,
        },
        TrapPattern {
            insn_mask: THUMB_TRAP_MASK as u32,
            insn_value: THUMB_TRAP_BASE as u32,
            cpsr_mask: USER_MODE_MASK,
            cpsr_value: THUMB_USER_MODE,
        },
    ]
}

/// One installed breakpoint.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    /// Mode-tagged address.
    pub addr: u32,
    pub class: Classification,
    pub symbol: Option<String>,
    /// Instruction the trap replaced.
    pub original: Instruction,
    pub handlers: HookHandlers,
    pub hits: u64,
}

impl Breakpoint {
    pub fn mode(&self) -> Mode {
        Mode::of_address(self.addr)
    }

    /// Address without the mode bit.
    pub fn code_addr(&self) -> u32 {
        self.addr & !1
    }

    /// Bookkeeping entry for a return trap written by the area code.
    pub(crate) fn displaced_return(addr: u32) -> Self {
        let mode = Mode::of_address(addr);
        Self {
            addr,
            class: Classification::DisplacedSteppingReturn,
            symbol: None,
            original: trap_instruction(mode, Classification::DisplacedSteppingReturn),
            handlers: HookHandlers::default(),
            hits: 0,
        }
    }

    /// Same breakpoint re-targeted at another process's copy of the code.
    pub(crate) fn inherited(&self) -> Self {
        Self { hits: 0, ..self.clone() }
    }
}

/// Overwrite the instruction at `addr` with a trap of class `class`.
///
/// Fails with [`Error::AlreadyExists`] when the live instruction already is
/// a trap, whatever the registry says.
pub fn install(
    mem: &dyn RemoteMemory,
    addr: u32,
    class: Classification,
    handlers: HookHandlers,
    symbol: Option<String>,
) -> Result<Breakpoint> {
    let mode = Mode::of_address(addr);
    let original = read_instruction(mem, addr, mode)?;
    if is_trap_instruction(&original, mode) {
        return Err(Error::AlreadyExists);
    }

    write_instruction(mem, addr, &trap_instruction(mode, class))?;
    debug!("uhook: armed {} breakpoint at {:#x}", class.label(), addr);
    Ok(Breakpoint {
        addr,
        class,
        symbol,
        original,
        handlers,
        hits: 0,
    })
}

/// Write the trap of an already known breakpoint into another address space.
pub(crate) fn rearm(mem: &dyn RemoteMemory, bp: &Breakpoint) -> Result<()> {
    write_instruction(mem, bp.addr, &trap_instruction(bp.mode(), bp.class))
}

/// Put the original instruction back.
pub fn restore(mem: &dyn RemoteMemory, bp: &Breakpoint) -> Result<()> {
    write_instruction(mem, bp.addr, &bp.original)?;
    debug!("uhook: restored {:#x}", bp.addr);
    Ok(())
}
