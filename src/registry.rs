//! Traced processes and threads.
//!
//! The registry owns everything by value: a process owns its modules,
//! breakpoints, hooks and scratch area; a thread owns its in-flight
//! displaced step and its return frames. Dropping an entry releases it all.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::Pid;
use crate::area::ExecArea;
use crate::breakpoint::{self, Breakpoint, Classification};
use crate::displace::{Displacement, Instruction};
use crate::elf::{self, Module};
use crate::error::{Error, Result};
use crate::hook::{EntrySnapshot, FunctionHook, Handler, HookHandlers, HookTarget};
use crate::memory::{ProcessOps, ProcessMemory};
use crate::regs::{Mode, Regs};

/// Deepest nesting of hooked calls tracked per thread.
pub const MAX_RETURN_FRAMES: usize = 64;

/// A hooked call waiting for its return.
#[derive(Debug, Clone)]
pub struct ReturnFrame {
    /// Mode-tagged return address (the caller's link register).
    pub return_addr: u32,
    pub entry: EntrySnapshot,
    pub handlers: HookHandlers,
}

/// State carried from a breakpoint trap to its displaced-stepping return trap.
#[derive(Clone)]
pub struct DisplacedStep {
    /// Mode-tagged address of the breakpoint being stepped over.
    pub breakpoint: u32,
    pub original: Instruction,
    pub mode: Mode,
    pub displacement: Displacement,
    /// Registers at the breakpoint trap.
    pub snapshot: Regs,
    pub slot: u32,
    /// Mode-tagged address of the return trap.
    pub slot_end: u32,
    pub entry: Option<EntrySnapshot>,
    pub post: Option<Handler>,
}

impl DisplacedStep {
    /// Address just past the original instruction.
    pub fn resume_addr(&self) -> u32 {
        (self.breakpoint & !1).wrapping_add(self.original.size as u32)
    }
}

/// Per-thread execution state.
pub struct TracedThread {
    pub tid: Pid,
    pub tgid: Pid,
    pub stepping: Option<DisplacedStep>,
    frames: Vec<ReturnFrame>,
}

impl TracedThread {
    pub fn new(tid: Pid, tgid: Pid) -> Self {
        Self {
            tid,
            tgid,
            stepping: None,
            frames: Vec::new(),
        }
    }

    pub fn push_frame(&mut self, frame: ReturnFrame) {
        if self.frames.len() == MAX_RETURN_FRAMES {
            warn!("uhook: return frames of {} overflowed, dropping oldest", self.tid);
            self.frames.remove(0);
        }
        self.frames.push(frame);
    }

    pub fn has_frame(&self, return_addr: u32) -> bool {
        self.frames.iter().any(|f| f.return_addr == return_addr)
    }

    /// Pop the innermost frame returning to `return_addr`.
    ///
    /// Frames above it belong to calls that never returned normally
    /// (longjmp, thread cancellation) and are discarded.
    pub fn pop_frame(&mut self, return_addr: u32) -> Option<ReturnFrame> {
        let idx = self.frames.iter().rposition(|f| f.return_addr == return_addr)?;
        let frame = self.frames.swap_remove(idx);
        self.frames.truncate(idx);
        Some(frame)
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }
}

/// One traced thread group.
pub struct TracedProcess {
    pub tgid: Pid,
    /// Loaded modules keyed by base address.
    pub modules: BTreeMap<u32, Module>,
    /// Installed breakpoints keyed by mode-tagged address.
    pub breakpoints: HashMap<u32, Breakpoint>,
    /// Process-wide hooks, re-applied on module refresh and fork.
    pub hooks: Vec<FunctionHook>,
    pub area: Option<ExecArea>,
    pub exe_base: Option<u32>,
}

impl TracedProcess {
    pub fn new(tgid: Pid, exe_base: Option<u32>) -> Self {
        Self {
            tgid,
            modules: BTreeMap::new(),
            breakpoints: HashMap::new(),
            hooks: Vec::new(),
            area: None,
            exe_base,
        }
    }

    /// Arm a breakpoint; no registry entry is created if the write fails.
    pub fn add_breakpoint(
        &mut self,
        host: &dyn ProcessOps,
        addr: u32,
        class: Classification,
        handlers: HookHandlers,
        symbol: Option<String>,
    ) -> Result<&Breakpoint> {
        if self.breakpoints.contains_key(&addr) {
            return Err(Error::AlreadyExists);
        }
        let mem = ProcessMemory::new(host, self.tgid);
        let bp = breakpoint::install(&mem, addr, class, handlers, symbol)?;
        Ok(self.breakpoints.entry(addr).or_insert(bp))
    }

    /// Drop a breakpoint, optionally writing the original instruction back.
    ///
    /// Restoring is skipped for a process that no longer exists. A failed
    /// restore leaves the breakpoint registered.
    pub fn remove_breakpoint(&mut self, host: &dyn ProcessOps, addr: u32, restore: bool) -> Result<Breakpoint> {
        let bp = self.breakpoints.remove(&addr).ok_or(Error::NoSuchBreakpoint(addr))?;
        if restore && host.is_alive(self.tgid) {
            let mem = ProcessMemory::new(host, self.tgid);
            if let Err(e) = breakpoint::restore(&mem, &bp) {
                self.breakpoints.insert(addr, bp);
                return Err(e);
            }
        }
        debug!(
            "uhook: removed {} breakpoint {:#x} from {} after {} hit(s)",
            bp.class.label(),
            addr,
            self.tgid,
            bp.hits
        );
        Ok(bp)
    }

    /// Remove every breakpoint except in-flight return traps.
    pub fn clear_breakpoints(&mut self, host: &dyn ProcessOps, restore: bool) {
        let addrs: Vec<u32> = self
            .breakpoints
            .values()
            .filter(|bp| bp.class != Classification::DisplacedSteppingReturn)
            .map(|bp| bp.addr)
            .collect();
        for addr in addrs {
            if let Err(e) = self.remove_breakpoint(host, addr, restore) {
                warn!("uhook: failed to remove breakpoint {:#x} in {}: {}", addr, self.tgid, e);
            }
        }
    }

    pub fn set_modules(&mut self, modules: Vec<Module>) {
        self.modules = modules.into_iter().map(|m| (m.base, m)).collect();
    }

    /// Module whose image covers `addr`.
    pub fn module_at(&self, addr: u32) -> Option<&Module> {
        let (_, m) = self.modules.range(..=(addr & !1)).next_back()?;
        m.contains(addr).then_some(m)
    }

    /// Whether `addr` lies in the dynamic linker or libc.
    pub fn is_library_internal(&self, addr: u32) -> bool {
        self.module_at(addr).is_some_and(|m| m.is_ld || m.is_libc)
    }

    /// Re-walk the link map and replace the module table.
    pub fn refresh_modules(&mut self, host: &dyn ProcessOps) -> Result<usize> {
        let base = self
            .exe_base
            .or_else(|| host.executable_base(self.tgid))
            .ok_or(Error::InvalidModule)?;
        self.exe_base = Some(base);
        let mem = ProcessMemory::new(host, self.tgid);
        let modules = elf::enumerate_modules(&mem, base)?;
        debug!("uhook: {} has {} module(s)", self.tgid, modules.len());
        self.set_modules(modules);
        Ok(self.modules.len())
    }

    /// Mode-tagged address and symbol name of a hook target.
    pub fn resolve(&self, host: &dyn ProcessOps, target: &HookTarget) -> Result<(u32, Option<String>)> {
        match target {
            HookTarget::Address(addr) => Ok((*addr, None)),
            HookTarget::Symbol(name) => {
                let mem = ProcessMemory::new(host, self.tgid);
                let (_, sym) =
                    elf::lookup_symbol_in_process(&mem, self.modules.values(), name).ok_or(Error::SymbolNotFound)?;
                Ok((sym.addr, Some(name.clone())))
            }
        }
    }

    /// Resolve and arm one hook. Returns the breakpoint address.
    pub fn install_hook(&mut self, host: &dyn ProcessOps, hook: &FunctionHook) -> Result<u32> {
        let (addr, symbol) = self.resolve(host, &hook.target)?;
        self.add_breakpoint(host, addr, hook.class, hook.handlers.clone(), symbol)?;
        info!("uhook: hooked {} at {:#x} in {}", hook.target, addr, self.tgid);
        Ok(addr)
    }

    /// Arm every hook whose target resolves now. Returns how many were armed.
    pub fn install_pending_hooks(&mut self, host: &dyn ProcessOps) -> usize {
        let hooks = self.hooks.clone();
        let mut armed = 0;
        for hook in &hooks {
            match self.install_hook(host, hook) {
                Ok(_) => armed += 1,
                Err(Error::AlreadyExists) | Err(Error::SymbolNotFound) => {}
                Err(e) => warn!("uhook: cannot hook {} in {}: {}", hook.target, self.tgid, e),
            }
        }
        armed
    }
}

/// All traced processes and threads.
#[derive(Default)]
pub struct Registry {
    processes: HashMap<Pid, TracedProcess>,
    threads: HashMap<Pid, TracedThread>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&self, tgid: Pid) -> Option<&TracedProcess> {
        self.processes.get(&tgid)
    }

    pub fn process_mut(&mut self, tgid: Pid) -> Option<&mut TracedProcess> {
        self.processes.get_mut(&tgid)
    }

    pub fn contains_process(&self, tgid: Pid) -> bool {
        self.processes.contains_key(&tgid)
    }

    /// Register a process, replacing any stale record for the same tgid.
    pub fn insert_process(&mut self, process: TracedProcess) -> &mut TracedProcess {
        let tgid = process.tgid;
        if self.processes.contains_key(&tgid) {
            warn!("uhook: replacing stale record for {}", tgid);
            self.remove_process(tgid);
        }
        self.processes.entry(tgid).or_insert(process)
    }

    /// Remove a process together with all of its threads.
    pub fn remove_process(&mut self, tgid: Pid) -> Option<TracedProcess> {
        self.threads.retain(|_, t| t.tgid != tgid);
        self.processes.remove(&tgid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &TracedProcess> {
        self.processes.values()
    }

    pub fn process_ids(&self) -> Vec<Pid> {
        self.processes.keys().copied().collect()
    }

    pub fn thread(&self, tid: Pid) -> Option<&TracedThread> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: Pid) -> Option<&mut TracedThread> {
        self.threads.get_mut(&tid)
    }

    /// Thread record, created on first use.
    pub fn thread_entry(&mut self, tid: Pid, tgid: Pid) -> &mut TracedThread {
        let thread = self.threads.entry(tid).or_insert_with(|| TracedThread::new(tid, tgid));
        if thread.tgid != tgid {
            // tid reuse after a missed exit notification
            *thread = TracedThread::new(tid, tgid);
        }
        thread
    }

    pub fn remove_thread(&mut self, tid: Pid) -> Option<TracedThread> {
        self.threads.remove(&tid)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn threads_mut(&mut self) -> impl Iterator<Item = &mut TracedThread> {
        self.threads.values_mut()
    }

    /// Whether any thread of `tgid` is between the two traps of a step.
    pub fn has_stepping_threads(&self, tgid: Pid) -> bool {
        self.threads.values().any(|t| t.tgid == tgid && t.stepping.is_some())
    }

    /// Exact-address lookup, falling back to the parent's breakpoints.
    ///
    /// A forked child runs on a copy of its parent's code, traps included,
    /// before its own table is populated. Such a breakpoint is copied into
    /// the child and its trap rewritten into the child's memory.
    pub fn find_breakpoint(&mut self, host: &dyn ProcessOps, tgid: Pid, addr: u32) -> Option<&mut Breakpoint> {
        if self.processes.get(&tgid)?.breakpoints.contains_key(&addr) {
            return self.processes.get_mut(&tgid)?.breakpoints.get_mut(&addr);
        }

        let parent = host.parent(tgid)?;
        let inherited = self.processes.get(&parent)?.breakpoints.get(&addr)?.inherited();
        if inherited.class == Classification::DisplacedSteppingReturn {
            return None;
        }

        let mem = ProcessMemory::new(host, tgid);
        if let Err(e) = breakpoint::rearm(&mem, &inherited) {
            warn!("uhook: cannot copy breakpoint {:#x} from {} to {}: {}", addr, parent, tgid, e);
            return None;
        }
        debug!("uhook: copied breakpoint {:#x} from {} to {}", addr, parent, tgid);
        let child = self.processes.get_mut(&tgid)?;
        Some(child.breakpoints.entry(addr).or_insert(inherited))
    }
}
