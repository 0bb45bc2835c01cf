//! Displaced-stepping execution area.
//!
//! Each traced process owns one anonymous executable mapping, carved into
//! fixed-size slots. A slot holds the substitute sequence for one trap plus
//! the return trap that hands control back to the dispatcher.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::Pid;
use crate::breakpoint::{Classification, trap_instruction};
use crate::displace::Instruction;
use crate::error::{Error, Result};
use crate::memory::{ProcessOps, RemoteMemory, write_instruction};
use crate::regs::Mode;

/// Size of each slot in bytes (eight machine words).
pub const SLOT_SIZE: u32 = 32;

/// Size of an area allocated lazily on first need.
pub const DEFAULT_AREA_SIZE: u32 = 1024;

/// Scratch mapping inside one traced process.
#[derive(Debug)]
pub struct ExecArea {
    base: u32,
    size: u32,
    /// Bit N = 1 means slot N is in use.
    bitmap: Mutex<Vec<u64>>,
}

impl ExecArea {
    /// Track slots over an existing mapping at `base`.
    pub fn new(base: u32, size: u32) -> Self {
        let slots = (size / SLOT_SIZE) as usize;
        Self {
            base,
            size: slots as u32 * SLOT_SIZE,
            bitmap: Mutex::new(vec![0u64; slots.div_ceil(64)]),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn slot_count(&self) -> usize {
        (self.size / SLOT_SIZE) as usize
    }

    /// First-fit slot allocation. Returns the slot address.
    pub fn acquire_slot(&self) -> Option<u32> {
        let mut bitmap = self.bitmap.lock();
        for i in 0..self.slot_count() {
            let (word, bit) = (i / 64, i % 64);
            if bitmap[word] & (1u64 << bit) == 0 {
                bitmap[word] |= 1u64 << bit;
                let addr = self.base + i as u32 * SLOT_SIZE;
                debug!("area: acquired slot {} at {:#x}", i, addr);
                return Some(addr);
            }
        }
        warn!("area: no free slots in area at {:#x}", self.base);
        None
    }

    /// Return a slot. Addresses outside the area are ignored.
    pub fn release_slot(&self, addr: u32) {
        if !self.contains(addr) {
            warn!("area: invalid slot address {:#x}", addr);
            return;
        }
        let idx = ((addr - self.base) / SLOT_SIZE) as usize;
        let mut bitmap = self.bitmap.lock();
        bitmap[idx / 64] &= !(1u64 << (idx % 64));
        debug!("area: released slot {} at {:#x}", idx, addr);
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    pub fn free_count(&self) -> usize {
        let used: u32 = self.bitmap.lock().iter().map(|w| w.count_ones()).sum();
        self.slot_count() - used as usize
    }
}

/// Map a fresh area of `size` bytes inside `tgid`.
pub fn allocate_area(host: &dyn ProcessOps, tgid: Pid, size: u32) -> Result<ExecArea> {
    if size < SLOT_SIZE {
        return Err(Error::OutOfMemory);
    }
    let base = host.map_exec_area(tgid, size)?;
    info!("area: mapped {} bytes at {:#x} in {}", size, base, tgid);
    Ok(ExecArea::new(base, size))
}

/// Unmap an area. A process that is already gone needs no unmapping.
pub fn free_area(host: &dyn ProcessOps, tgid: Pid, area: ExecArea) {
    if !host.is_alive(tgid) {
        return;
    }
    if let Err(e) = host.unmap_exec_area(tgid, area.base, area.size) {
        warn!("area: unmapping {:#x} in {} failed: {}", area.base, tgid, e);
    }
}

/// Write `insns` at `slot` followed by a displaced-stepping return trap.
///
/// Returns the mode-tagged address of the return trap.
pub fn write_displaced_sequence(mem: &dyn RemoteMemory, slot: u32, insns: &[Instruction], mode: Mode) -> Result<u32> {
    let trap = trap_instruction(mode, Classification::DisplacedSteppingReturn);
    let body: u32 = insns.iter().map(|i| i.size as u32).sum();
    if body + trap.size as u32 > SLOT_SIZE {
        return Err(Error::SequenceTooLong);
    }

    let mut addr = slot;
    for insn in insns {
        write_instruction(mem, addr, insn)?;
        addr += insn.size as u32;
    }
    write_instruction(mem, addr, &trap)?;
    debug!(
        "area: wrote {} displaced instruction(s) at {:#x}, return trap at {:#x}",
        insns.len(),
        slot,
        addr
    );
    Ok(mode.tag(addr))
}
