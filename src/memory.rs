//! Access to the traced process's address space.
//!
//! The engine never dereferences traced-process pointers. Everything goes
//! through the host's cross-address-space accessor, which may fail or page
//! in memory, so every access is fallible.

use alloc::string::String;
use alloc::vec::Vec;

use crate::Pid;
use crate::error::{Error, Result};
use crate::regs::Mode;

/// Host capabilities the engine consumes.
///
/// Implemented by the embedding kernel glue; tests provide an in-memory mock.
pub trait ProcessOps: Send + Sync {
    /// Read `buf.len()` bytes at `addr` in the address space of `pid`.
    fn read_memory(&self, pid: Pid, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `addr` in the address space of `pid`.
    fn write_memory(&self, pid: Pid, addr: u32, data: &[u8]) -> Result<()>;

    /// Create an anonymous private executable mapping inside `pid`.
    fn map_exec_area(&self, pid: Pid, size: u32) -> Result<u32>;

    /// Remove a mapping created by [`ProcessOps::map_exec_area`].
    fn unmap_exec_area(&self, pid: Pid, addr: u32, size: u32) -> Result<()>;

    /// Thread-group id of a thread, `None` when the thread is gone.
    fn thread_group(&self, tid: Pid) -> Option<Pid>;

    /// Thread-group id of the parent process.
    fn parent(&self, tgid: Pid) -> Option<Pid>;

    /// Whether the task still exists and owns an address space.
    fn is_alive(&self, pid: Pid) -> bool;

    /// Load address of the main executable image.
    fn executable_base(&self, tgid: Pid) -> Option<u32>;

    /// All live thread groups, used for static enumeration at start.
    fn processes(&self) -> Vec<Pid> {
        Vec::new()
    }

    /// Make freshly written code visible to instruction fetch.
    fn sync_icache(&self, _pid: Pid, _addr: u32, _len: u32) {}
}

/// Byte-level access to one address space, as used by the decoder.
pub trait RemoteMemory {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()>;
    fn write(&self, addr: u32, data: &[u8]) -> Result<()>;

    fn read_u8(&self, addr: u32) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(addr, &mut b)?;
        Ok(b[0])
    }

    fn read_u16(&self, addr: u32) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32(&self, addr: u32) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn write_u32(&self, addr: u32, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// [`RemoteMemory`] view of one traced process through the host.
#[derive(Clone, Copy)]
pub struct ProcessMemory<'a> {
    host: &'a dyn ProcessOps,
    pid: Pid,
}

impl<'a> ProcessMemory<'a> {
    pub fn new(host: &'a dyn ProcessOps, pid: Pid) -> Self {
        Self { host, pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl RemoteMemory for ProcessMemory<'_> {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.host.read_memory(self.pid, addr, buf)
    }

    fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
        self.host.write_memory(self.pid, addr, data)?;
        self.host.sync_icache(self.pid, addr, data.len() as u32);
        Ok(())
    }
}

const MAX_STRING_LEN: usize = 256;
const STRING_CHUNK: u32 = 32;

/// Read a NUL-terminated string, chunk by chunk, up to 256 bytes.
pub fn read_cstring(mem: &dyn RemoteMemory, addr: u32) -> Result<String> {
    let mut bytes = Vec::new();
    let mut cursor = addr;

    while bytes.len() < MAX_STRING_LEN {
        let mut chunk = [0u8; STRING_CHUNK as usize];
        // A string near the end of a mapping may not have a full chunk after it.
        if mem.read(cursor, &mut chunk).is_err() {
            let b = mem.read_u8(cursor)?;
            if b == 0 {
                break;
            }
            bytes.push(b);
            cursor = cursor.wrapping_add(1);
            continue;
        }
        match chunk.iter().position(|&b| b == 0) {
            Some(end) => {
                bytes.extend_from_slice(&chunk[..end]);
                break;
            }
            None => bytes.extend_from_slice(&chunk),
        }
        cursor = cursor.wrapping_add(STRING_CHUNK);
    }

    bytes.truncate(MAX_STRING_LEN);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Whether a Thumb halfword starts a 32-bit instruction.
pub fn is_thumb32_prefix(hw: u16) -> bool {
    matches!(hw >> 11, 0x1d | 0x1e | 0x1f)
}

/// Fetch the instruction at a (mode-tagged or plain) address.
pub fn read_instruction(mem: &dyn RemoteMemory, addr: u32, mode: Mode) -> Result<crate::displace::Instruction> {
    let addr = addr & !1;
    match mode {
        Mode::Arm => Ok(crate::displace::Instruction::arm(mem.read_u32(addr)?)),
        Mode::Thumb => {
            let first = mem.read_u16(addr)?;
            if is_thumb32_prefix(first) {
                let second = mem.read_u16(addr + 2)?;
                Ok(crate::displace::Instruction::thumb32(first, second))
            } else {
                Ok(crate::displace::Instruction::thumb16(first))
            }
        }
    }
}

/// Write an instruction; Thumb32 halfwords land in program order.
pub fn write_instruction(mem: &dyn RemoteMemory, addr: u32, insn: &crate::displace::Instruction) -> Result<()> {
    let bytes = insn.raw.to_le_bytes();
    mem.write(addr & !1, &bytes[..insn.size as usize])
}
