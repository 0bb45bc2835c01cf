//! In-memory `ProcessOps` with paged per-process address spaces.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use uhook::error::{Error, Result};
use uhook::{Pid, ProcessOps};

pub const PAGE: u32 = 0x1000;
pub const EXEC_AREA_BASE: u32 = 0x7000_0000;

#[derive(Default, Clone)]
struct Space {
    pages: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct State {
    spaces: HashMap<Pid, Space>,
    /// tid -> tgid
    threads: HashMap<Pid, Pid>,
    parents: HashMap<Pid, Pid>,
    exe_bases: HashMap<Pid, u32>,
    next_area: HashMap<Pid, u32>,
    unmapped: Vec<(Pid, u32, u32)>,
    refuse_areas: bool,
}

#[derive(Default)]
pub struct MockHost {
    state: Mutex<State>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// New process with a single thread whose tid equals the tgid.
    pub fn spawn(&self, tgid: Pid, parent: Option<Pid>, exe_base: Option<u32>) {
        let mut s = self.state.lock().unwrap();
        s.spaces.entry(tgid).or_default();
        s.threads.insert(tgid, tgid);
        if let Some(p) = parent {
            s.parents.insert(tgid, p);
        }
        if let Some(base) = exe_base {
            s.exe_bases.insert(tgid, base);
        }
    }

    pub fn add_thread(&self, tid: Pid, tgid: Pid) {
        self.state.lock().unwrap().threads.insert(tid, tgid);
    }

    /// Child gets a copy of the parent's address space.
    pub fn fork(&self, parent: Pid, child: Pid) {
        let mut s = self.state.lock().unwrap();
        let space = s.spaces.get(&parent).cloned().unwrap_or_default();
        s.spaces.insert(child, space);
        s.threads.insert(child, child);
        s.parents.insert(child, parent);
        if let Some(base) = s.exe_bases.get(&parent).copied() {
            s.exe_bases.insert(child, base);
        }
        if let Some(next) = s.next_area.get(&parent).copied() {
            s.next_area.insert(child, next);
        }
    }

    /// Drop the address space, as `execve` does before the new image loads.
    pub fn wipe(&self, pid: Pid) {
        let mut s = self.state.lock().unwrap();
        s.spaces.insert(pid, Space::default());
        s.next_area.remove(&pid);
    }

    pub fn kill(&self, pid: Pid) {
        let mut s = self.state.lock().unwrap();
        s.spaces.remove(&pid);
        s.threads.retain(|_, tgid| *tgid != pid);
    }

    pub fn refuse_exec_areas(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_areas = refuse;
    }

    pub fn unmapped(&self) -> Vec<(Pid, u32, u32)> {
        self.state.lock().unwrap().unmapped.clone()
    }

    /// Map zeroed pages covering `[addr, addr + len)`.
    pub fn map(&self, pid: Pid, addr: u32, len: u32) {
        let mut s = self.state.lock().unwrap();
        let space = s.spaces.entry(pid).or_default();
        let first = addr / PAGE;
        let last = (addr + len - 1) / PAGE;
        for page in first..=last {
            space.pages.entry(page).or_insert_with(|| vec![0; PAGE as usize]);
        }
    }

    /// Map and fill.
    pub fn load(&self, pid: Pid, addr: u32, bytes: &[u8]) {
        self.map(pid, addr, bytes.len().max(1) as u32);
        self.write_memory(pid, addr, bytes).unwrap();
    }

    pub fn poke_u32(&self, pid: Pid, addr: u32, value: u32) {
        self.load(pid, addr, &value.to_le_bytes());
    }

    pub fn poke_u16(&self, pid: Pid, addr: u32, value: u16) {
        self.load(pid, addr, &value.to_le_bytes());
    }

    pub fn peek_u32(&self, pid: Pid, addr: u32) -> u32 {
        let mut b = [0u8; 4];
        self.read_memory(pid, addr, &mut b).unwrap();
        u32::from_le_bytes(b)
    }

    pub fn peek_u16(&self, pid: Pid, addr: u32) -> u16 {
        let mut b = [0u8; 2];
        self.read_memory(pid, addr, &mut b).unwrap();
        u16::from_le_bytes(b)
    }

    fn access(&self, pid: Pid, addr: u32, len: usize, mut f: impl FnMut(&mut u8, usize)) -> bool {
        let mut s = self.state.lock().unwrap();
        let Some(space) = s.spaces.get_mut(&pid) else {
            return false;
        };
        // all pages must exist before touching any byte
        for i in 0..len as u32 {
            if !space.pages.contains_key(&(addr.wrapping_add(i) / PAGE)) {
                return false;
            }
        }
        for i in 0..len {
            let a = addr.wrapping_add(i as u32);
            let page = space.pages.get_mut(&(a / PAGE)).unwrap();
            f(&mut page[(a % PAGE) as usize], i);
        }
        true
    }
}

impl ProcessOps for MockHost {
    fn read_memory(&self, pid: Pid, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut out = vec![0u8; buf.len()];
        if !self.access(pid, addr, buf.len(), |b, i| out[i] = *b) {
            return Err(Error::RemoteReadFailed(addr));
        }
        buf.copy_from_slice(&out);
        Ok(())
    }

    fn write_memory(&self, pid: Pid, addr: u32, data: &[u8]) -> Result<()> {
        if !self.access(pid, addr, data.len(), |b, i| *b = data[i]) {
            return Err(Error::RemoteWriteFailed(addr));
        }
        Ok(())
    }

    fn map_exec_area(&self, pid: Pid, size: u32) -> Result<u32> {
        let base = {
            let mut s = self.state.lock().unwrap();
            if s.refuse_areas || !s.spaces.contains_key(&pid) {
                return Err(Error::OutOfMemory);
            }
            let next = s.next_area.entry(pid).or_insert(EXEC_AREA_BASE);
            let base = *next;
            *next += size.div_ceil(PAGE) * PAGE;
            base
        };
        self.map(pid, base, size);
        Ok(base)
    }

    fn unmap_exec_area(&self, pid: Pid, addr: u32, size: u32) -> Result<()> {
        self.state.lock().unwrap().unmapped.push((pid, addr, size));
        Ok(())
    }

    fn thread_group(&self, tid: Pid) -> Option<Pid> {
        self.state.lock().unwrap().threads.get(&tid).copied()
    }

    fn parent(&self, tgid: Pid) -> Option<Pid> {
        self.state.lock().unwrap().parents.get(&tgid).copied()
    }

    fn is_alive(&self, pid: Pid) -> bool {
        self.state.lock().unwrap().spaces.contains_key(&pid)
    }

    fn executable_base(&self, tgid: Pid) -> Option<u32> {
        self.state.lock().unwrap().exe_bases.get(&tgid).copied()
    }

    fn processes(&self) -> Vec<Pid> {
        let s = self.state.lock().unwrap();
        let mut pids: Vec<Pid> = s.spaces.keys().copied().collect();
        pids.sort();
        pids
    }
}
