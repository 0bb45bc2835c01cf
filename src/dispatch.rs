//! Trap dispatch and process lifecycle handling.
//!
//! A live breakpoint is handled in two traps. The first runs the entry or
//! return callbacks, then moves the thread into a scratch slot holding the
//! displaced original instruction. The slot ends in a return trap; the
//! second trap finishes the instruction's effect, releases the slot and
//! resumes after the original instruction.

use alloc::vec::Vec;

use crate::Pid;
use crate::area::{ExecArea, allocate_area, write_displaced_sequence};
use crate::breakpoint::{Breakpoint, Classification, decode_trap};
use crate::displace::{StepContext, decode_and_displace};
use crate::elf;
use crate::error::{Error, Result};
use crate::hook::{EntrySnapshot, FunctionHook, Handler, HookContext, HookRequest, HookTarget};
use crate::memory::{ProcessMemory, ProcessOps};
use crate::platform;
use crate::registry::{DisplacedStep, Registry, ReturnFrame, TracedProcess};
use crate::regs::Regs;
use crate::session::SessionConfig;

/// `clone(2)` flag: the new task joins the caller's thread group.
pub const CLONE_THREAD: u32 = 0x0001_0000;

/// What the host should do after a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Registers were updated; resume the thread.
    Handled,
    /// Something failed; the registers still describe a sane resume point
    /// but the original instruction's effect may be lost.
    Degraded,
    /// Not ours, or no state to act on; the host decides.
    Unhandled,
}

/// Which exit path reported a thread's end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadExit {
    /// Library-level exit (`pthread_exit`); the thread may still run
    /// instrumented code, so its record stays.
    Cooperative,
    /// The kernel is tearing the thread down.
    Kernel,
}

/// Trap handler and lifecycle hooks over an injected registry.
pub struct Dispatcher<'a> {
    registry: &'a mut Registry,
    host: &'a dyn ProcessOps,
    config: &'a SessionConfig,
    defaults: &'a [FunctionHook],
}

impl<'a> Dispatcher<'a> {
    pub fn new(registry: &'a mut Registry, host: &'a dyn ProcessOps, config: &'a SessionConfig) -> Self {
        Self {
            registry,
            host,
            config,
            defaults: &[],
        }
    }

    /// Hooks given to every process the dispatcher starts tracing.
    pub fn with_default_hooks(mut self, defaults: &'a [FunctionHook]) -> Self {
        self.defaults = defaults;
        self
    }

    // =========================================================================
    // Trap path
    // =========================================================================

    /// Handle an undefined-instruction trap raised by `tid`.
    ///
    /// `insn` is the trapping instruction as fetched by the host; for Thumb
    /// only its first halfword matters.
    pub fn handle_trap(&mut self, tid: Pid, regs: &mut Regs, insn: u32) -> TrapOutcome {
        let Some(class) = decode_trap(insn, regs.mode()) else {
            return TrapOutcome::Unhandled;
        };
        let Some(tgid) = self.host.thread_group(tid) else {
            warn!("uhook: trap from unknown task {}", tid);
            return TrapOutcome::Unhandled;
        };
        if !self.registry.contains_process(tgid) && !self.adopt(tgid) {
            warn!("uhook: {} trap in untraced process {}", class.label(), tgid);
            return TrapOutcome::Unhandled;
        }
        self.registry.thread_entry(tid, tgid);

        debug!(
            "uhook: {} trap in {}/{} at {:#x} on cpu {}",
            class.label(),
            tgid,
            tid,
            regs.tagged_pc(),
            platform::cpu_id()
        );
        match class {
            Classification::DisplacedSteppingReturn => self.finish_step(tid, tgid, regs),
            Classification::ExeEntry => self.bootstrap(tgid, regs),
            _ => self.hit(tid, tgid, regs),
        }
    }

    /// Whether a breakpoint's callbacks must be skipped for this hit.
    ///
    /// True for housekeeping classes, for an exit with no matching entry
    /// frame on the thread, and (when configured) for calls made from the
    /// dynamic linker or libc into themselves.
    pub fn should_ignore_breakpoint(&self, tid: Pid, bp: &Breakpoint, regs: &Regs) -> bool {
        match bp.class {
            Classification::Ignore | Classification::DisplacedSteppingReturn | Classification::ExeEntry => {
                return true;
            }
            class if class.is_exit() => {
                return !self.registry.thread(tid).is_some_and(|t| t.has_frame(bp.addr));
            }
            _ => {}
        }
        if !self.config.ignore_library_internal_calls {
            return false;
        }
        let Some(process) = self.registry.thread(tid).and_then(|t| self.registry.process(t.tgid)) else {
            return false;
        };
        process.is_library_internal(regs.lr()) && process.is_library_internal(regs.pc())
    }

    fn hit(&mut self, tid: Pid, tgid: Pid, regs: &mut Regs) -> TrapOutcome {
        let addr = regs.tagged_pc();
        let timestamp = platform::time_ns();

        let Some(bp) = self.registry.find_breakpoint(self.host, tgid, addr) else {
            warn!("uhook: no breakpoint at {:#x} in {}", addr, tgid);
            return TrapOutcome::Unhandled;
        };
        bp.hits += 1;
        let bp = bp.clone();

        let ignored = self.should_ignore_breakpoint(tid, &bp, regs);
        let mut step_entry = None;
        let mut post = None;

        if bp.class.is_exit() {
            let frame = if ignored {
                None
            } else {
                self.registry.thread_mut(tid).and_then(|t| t.pop_frame(addr))
            };
            if let Some(frame) = frame {
                if let Some(ret) = &frame.handlers.ret {
                    self.invoke(ret, tid, tgid, frame.entry.address, bp.class, timestamp, regs, Some(&frame.entry));
                }
                step_entry = Some(frame.entry);
            }
        } else if !ignored {
            let entry = EntrySnapshot {
                address: addr,
                regs: *regs,
                timestamp,
            };
            if let Some(pre) = &bp.handlers.pre {
                self.invoke(pre, tid, tgid, addr, bp.class, timestamp, regs, None);
            }
            if bp.handlers.ret.is_some() {
                self.arm_return(tid, tgid, &bp, entry);
            }
            post = bp.handlers.post.clone();
            step_entry = Some(entry);
        }

        self.begin_step(tid, tgid, &bp, regs, step_entry, post)
    }

    /// Push a return frame and make sure the return address traps.
    fn arm_return(&mut self, tid: Pid, tgid: Pid, bp: &Breakpoint, entry: EntrySnapshot) {
        let Some(exit_class) = bp.class.exit_class() else {
            return;
        };
        let return_addr = entry.regs.lr();
        if let Some(thread) = self.registry.thread_mut(tid) {
            thread.push_frame(ReturnFrame {
                return_addr,
                entry,
                handlers: bp.handlers.clone(),
            });
        }
        let Some(process) = self.registry.process_mut(tgid) else {
            return;
        };
        if process.breakpoints.contains_key(&return_addr) {
            return;
        }
        match process.add_breakpoint(self.host, return_addr, exit_class, Default::default(), None) {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => warn!("uhook: cannot arm return of {:#x} at {:#x}: {}", bp.addr, return_addr, e),
        }
    }

    /// Move the thread into a scratch slot holding the displaced instruction.
    fn begin_step(
        &mut self,
        tid: Pid,
        tgid: Pid,
        bp: &Breakpoint,
        regs: &mut Regs,
        entry: Option<EntrySnapshot>,
        post: Option<Handler>,
    ) -> TrapOutcome {
        let mode = bp.mode();
        let addr = bp.code_addr();
        let skip_to = addr.wrapping_add(bp.original.size as u32);
        let displacement = decode_and_displace(bp.original, mode);
        let mem = ProcessMemory::new(self.host, tgid);

        let Some(process) = self.registry.process_mut(tgid) else {
            error!("uhook: breakpoint {:#x} found but process {} is gone", bp.addr, tgid);
            return TrapOutcome::Unhandled;
        };
        if process.area.is_none() {
            match allocate_area(self.host, tgid, self.config.area_size) {
                Ok(area) => process.area = Some(area),
                Err(e) => {
                    warn!("uhook: no scratch area for {}: {}, skipping {:#x}", tgid, e, bp.addr);
                    regs.set_pc(skip_to);
                    return TrapOutcome::Degraded;
                }
            }
        }
        let Some(slot) = process.area.as_ref().and_then(|a| a.acquire_slot()) else {
            warn!("uhook: no free slot in {}, skipping {:#x}", tgid, bp.addr);
            regs.set_pc(skip_to);
            return TrapOutcome::Degraded;
        };

        let slot_end = match write_displaced_sequence(&mem, slot, displacement.insns(), mode) {
            Ok(end) => end,
            Err(e) => {
                warn!("uhook: writing slot {:#x} in {} failed: {}, skipping {:#x}", slot, tgid, e, bp.addr);
                if let Some(area) = &process.area {
                    area.release_slot(slot);
                }
                regs.set_pc(skip_to);
                return TrapOutcome::Degraded;
            }
        };
        process.breakpoints.insert(slot_end, Breakpoint::displaced_return(slot_end));

        let snapshot = *regs;
        let ctx = StepContext {
            addr,
            size: bp.original.size,
            mode,
            snapshot: &snapshot,
            mem: &mem,
        };
        displacement.class.pre(regs, &ctx);
        regs.set_pc(slot);

        if let Some(thread) = self.registry.thread_mut(tid) {
            thread.stepping = Some(DisplacedStep {
                breakpoint: bp.addr,
                original: bp.original,
                mode,
                displacement,
                snapshot,
                slot,
                slot_end,
                entry,
                post,
            });
        }
        TrapOutcome::Handled
    }

    /// Return trap at the end of a slot.
    fn finish_step(&mut self, tid: Pid, tgid: Pid, regs: &mut Regs) -> TrapOutcome {
        let end = regs.tagged_pc();
        let Some(step) = self.registry.thread_mut(tid).and_then(|t| t.stepping.take()) else {
            warn!("uhook: return trap at {:#x} but {} is not stepping", end, tid);
            return TrapOutcome::Unhandled;
        };
        if step.slot_end != end {
            error!("uhook: {} returned at {:#x}, expected {:#x}", tid, end, step.slot_end);
        }

        let mem = ProcessMemory::new(self.host, tgid);
        let ctx = StepContext {
            addr: step.breakpoint & !1,
            size: step.original.size,
            mode: step.mode,
            snapshot: &step.snapshot,
            mem: &mem,
        };
        let mut outcome = TrapOutcome::Handled;
        let redirected = match step.displacement.class.post(regs, &ctx) {
            Ok(redirected) => redirected,
            Err(e) => {
                warn!(
                    "uhook: completing {} at {:#x} failed: {}",
                    step.displacement.class.label(),
                    step.breakpoint,
                    e
                );
                outcome = TrapOutcome::Degraded;
                false
            }
        };

        if let Some(process) = self.registry.process_mut(tgid) {
            if let Some(area) = &process.area {
                area.release_slot(step.slot);
            }
            process.breakpoints.remove(&step.slot_end);
        }

        if !redirected && regs.pc() == step.slot_end & !1 {
            regs.set_pc(step.resume_addr());
        }

        if let (Some(post), Some(entry)) = (&step.post, &step.entry) {
            let class = self
                .registry
                .process(tgid)
                .and_then(|p| p.breakpoints.get(&step.breakpoint))
                .map_or(Classification::UserHook, |bp| bp.class);
            self.invoke(post, tid, tgid, step.breakpoint, class, platform::time_ns(), regs, Some(entry));
        }
        outcome
    }

    /// One-shot trap at the entry point of a freshly executed image.
    fn bootstrap(&mut self, tgid: Pid, regs: &mut Regs) -> TrapOutcome {
        let addr = regs.tagged_pc();
        let Some(process) = self.registry.process_mut(tgid) else {
            return TrapOutcome::Unhandled;
        };
        if let Err(e) = process.refresh_modules(self.host) {
            warn!("uhook: module enumeration of {} failed: {}", tgid, e);
        }
        let armed = process.install_pending_hooks(self.host);
        info!("uhook: {} started, {} hook(s) armed", tgid, armed);

        match process.remove_breakpoint(self.host, addr, true) {
            Ok(_) => TrapOutcome::Handled,
            Err(e) => {
                warn!("uhook: cannot restore entry point {:#x} of {}: {}", addr, tgid, e);
                TrapOutcome::Degraded
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &mut self,
        handler: &Handler,
        tid: Pid,
        tgid: Pid,
        address: u32,
        class: Classification,
        timestamp: u64,
        regs: &Regs,
        entry: Option<&EntrySnapshot>,
    ) {
        let mem = ProcessMemory::new(self.host, tgid);
        let mut ctx = HookContext::new(tid, tgid, address, class, timestamp, regs, entry, &mem);
        handler(&mut ctx);
        let requests = ctx.take_requests();
        self.apply_requests(tgid, requests);
    }

    fn apply_requests(&mut self, tgid: Pid, requests: Vec<HookRequest>) {
        for request in requests {
            match request {
                HookRequest::Install { addr, class, handlers } => {
                    let Some(process) = self.registry.process_mut(tgid) else {
                        continue;
                    };
                    match process.add_breakpoint(self.host, addr, class, handlers, None) {
                        Ok(_) => {}
                        Err(e) if e.is_already_exists() => {}
                        Err(e) => warn!("uhook: cannot arm {} at {:#x}: {}", class.label(), addr, e),
                    }
                }
                HookRequest::RefreshModules => {
                    if let Err(e) = self.refresh_modules(tgid) {
                        warn!("uhook: module refresh of {} failed: {}", tgid, e);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Modules and hooks
    // =========================================================================

    /// Re-enumerate modules and arm hooks that became resolvable.
    pub fn refresh_modules(&mut self, tgid: Pid) -> Result<usize> {
        let process = self.registry.process_mut(tgid).ok_or(Error::NoSuchProcess(tgid))?;
        process.refresh_modules(self.host)?;
        Ok(process.install_pending_hooks(self.host))
    }

    pub fn install_pending_hooks(&mut self, tgid: Pid) -> Result<usize> {
        let process = self.registry.process_mut(tgid).ok_or(Error::NoSuchProcess(tgid))?;
        Ok(process.install_pending_hooks(self.host))
    }

    /// Start tracing a running process: enumerate modules, arm defaults.
    pub fn register_process(&mut self, tgid: Pid) -> Result<usize> {
        let mut process = TracedProcess::new(tgid, self.host.executable_base(tgid));
        process.hooks = self.hooks_for(tgid);
        let process = self.registry.insert_process(process);
        process.refresh_modules(self.host)?;
        Ok(process.install_pending_hooks(self.host))
    }

    fn hooks_for(&self, tgid: Pid) -> Vec<FunctionHook> {
        if self.config.profiler_tgid == Some(tgid) {
            Vec::new()
        } else {
            self.defaults.to_vec()
        }
    }

    /// Add a process-wide hook and arm it if its target resolves now.
    ///
    /// Returns the breakpoint address when armed, `None` while the symbol
    /// is still missing (it is retried on every module refresh).
    pub fn register_user_function_hook(&mut self, tgid: Pid, hook: FunctionHook) -> Result<Option<u32>> {
        if !self.registry.contains_process(tgid) {
            self.register_process(tgid)?;
        }
        let process = self.registry.process_mut(tgid).ok_or(Error::NoSuchProcess(tgid))?;
        let armed = match process.install_hook(self.host, &hook) {
            Ok(addr) => Some(addr),
            Err(Error::SymbolNotFound) => None,
            Err(e) => return Err(e),
        };
        process.hooks.push(hook);
        Ok(armed)
    }

    /// Forget a hook and restore the instruction it replaced.
    pub fn unregister_user_function_hook(&mut self, tgid: Pid, target: &HookTarget) -> Result<()> {
        let process = self.registry.process_mut(tgid).ok_or(Error::NoSuchProcess(tgid))?;
        let before = process.hooks.len();
        process.hooks.retain(|h| &h.target != target);
        if process.hooks.len() == before {
            return Err(Error::SymbolNotFound);
        }
        if let Ok((addr, _)) = process.resolve(self.host, target) {
            match process.remove_breakpoint(self.host, addr, true) {
                Ok(_) | Err(Error::NoSuchBreakpoint(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!("uhook: unhooked {} in {}", target, tgid);
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a record for a process first seen trapping, if its parent is
    /// traced.
    fn adopt(&mut self, tgid: Pid) -> bool {
        match self.host.parent(tgid) {
            Some(parent) if self.registry.contains_process(parent) => self.on_fork(parent, tgid).is_ok(),
            _ => false,
        }
    }

    /// A new process was forked from `parent`.
    pub fn on_fork(&mut self, parent: Pid, child: Pid) -> Result<()> {
        let mut process = TracedProcess::new(child, self.host.executable_base(child));
        let parent_record = self.registry.process(parent);

        let mem = ProcessMemory::new(self.host, child);
        let modules = process
            .exe_base
            .and_then(|base| elf::enumerate_modules(&mem, base).ok())
            .or_else(|| parent_record.map(|p| p.modules.values().cloned().collect()))
            .unwrap_or_default();
        process.set_modules(modules);

        let from_profiler = self.config.profiler_tgid == Some(parent);
        process.hooks = match parent_record {
            Some(p) if !from_profiler => p.hooks.clone(),
            _ => self.defaults.to_vec(),
        };
        if let Some(area) = parent_record.and_then(|p| p.area.as_ref()) {
            // The mapping was duplicated along with the rest of the address space.
            process.area = Some(ExecArea::new(area.base(), area.size()));
        }

        self.registry.insert_process(process);
        self.registry.thread_entry(child, child);
        info!("uhook: tracing {} (forked from {})", child, parent);

        if !from_profiler {
            self.rehook_child(parent, child);
        }
        Ok(())
    }

    /// Arm the child's hooks; traps inherited with the memory are adopted.
    fn rehook_child(&mut self, parent: Pid, child: Pid) {
        let Some(process) = self.registry.process(child) else {
            return;
        };
        let hooks = process.hooks.clone();
        for hook in &hooks {
            let Some(process) = self.registry.process_mut(child) else {
                return;
            };
            let addr = match process.resolve(self.host, &hook.target) {
                Ok((addr, _)) => addr,
                Err(_) => continue,
            };
            match process.install_hook(self.host, hook) {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {
                    let inherited = self
                        .registry
                        .process(parent)
                        .and_then(|p| p.breakpoints.get(&addr))
                        .map(Breakpoint::inherited);
                    if let (Some(bp), Some(process)) = (inherited, self.registry.process_mut(child)) {
                        process.breakpoints.entry(addr).or_insert(bp);
                    }
                }
                Err(e) => warn!("uhook: cannot re-hook {} in {}: {}", hook.target, child, e),
            }
        }
    }

    /// The child shares the parent's address space until it executes.
    pub fn on_vfork(&mut self, parent: Pid, child: Pid) -> Result<()> {
        let mut process = TracedProcess::new(child, self.host.executable_base(child));
        if let Some(p) = self.registry.process(parent) {
            process.modules = p.modules.clone();
            process.hooks = p.hooks.clone();
        } else {
            process.hooks = self.hooks_for(child);
        }
        self.registry.insert_process(process);
        self.registry.thread_entry(child, child);
        info!("uhook: tracing {} (vforked from {})", child, parent);
        Ok(())
    }

    /// A task was cloned; threads join the caller's record.
    pub fn on_clone(&mut self, parent_tid: Pid, child_tid: Pid, flags: u32) -> Result<()> {
        let parent_tgid = self.host.thread_group(parent_tid).ok_or(Error::NoSuchThread(parent_tid))?;
        if flags & CLONE_THREAD == 0 {
            return self.on_fork(parent_tgid, child_tid);
        }
        if !self.registry.contains_process(parent_tgid) {
            return Err(Error::NoSuchProcess(parent_tgid));
        }
        self.registry.thread_entry(child_tid, parent_tgid);
        debug!("uhook: thread {} joined {}", child_tid, parent_tgid);
        Ok(())
    }

    /// The process of `tid` replaced its image.
    ///
    /// The old record goes without restoring anything. The new one keeps
    /// the defaults plus user hooks named by symbol, and traps at the new
    /// entry point to enumerate modules once the image is running.
    pub fn on_exec(&mut self, tid: Pid) -> Result<()> {
        let tgid = self.host.thread_group(tid).ok_or(Error::NoSuchThread(tid))?;
        let old = self.registry.remove_process(tgid);

        let mut hooks = self.hooks_for(tgid);
        if let Some(old) = old {
            let carried = old.hooks.into_iter().filter(|h| {
                matches!(h.target, HookTarget::Symbol(_)) && !hooks.iter().any(|d| d.target == h.target)
            });
            let carried: Vec<FunctionHook> = carried.collect();
            hooks.extend(carried);
        }

        let base = self.host.executable_base(tgid);
        let mut process = TracedProcess::new(tgid, base);
        process.hooks = hooks;
        self.registry.insert_process(process);
        self.registry.thread_entry(tid, tgid);

        let base = base.ok_or(Error::InvalidModule)?;
        let mem = ProcessMemory::new(self.host, tgid);
        let entry = elf::executable_entry(&mem, base)?;
        let process = self.registry.process_mut(tgid).ok_or(Error::NoSuchProcess(tgid))?;
        match process.add_breakpoint(self.host, entry, Classification::ExeEntry, Default::default(), None) {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        info!("uhook: {} executed a new image, entry {:#x}", tgid, entry);
        Ok(())
    }

    pub fn on_thread_exit(&mut self, tid: Pid, exit: ThreadExit) {
        if exit == ThreadExit::Cooperative {
            return;
        }
        let Some(thread) = self.registry.remove_thread(tid) else {
            return;
        };
        if let Some(step) = thread.stepping {
            if let Some(process) = self.registry.process_mut(thread.tgid) {
                if let Some(area) = &process.area {
                    area.release_slot(step.slot);
                }
                process.breakpoints.remove(&step.slot_end);
            }
        }
        debug!("uhook: thread {} of {} gone", tid, thread.tgid);
    }

    /// The whole thread group exited; nothing is restored.
    pub fn on_process_group_exit(&mut self, tgid: Pid) {
        if let Some(process) = self.registry.remove_process(tgid) {
            info!(
                "uhook: {} exited with {} breakpoint(s) armed",
                tgid,
                process.breakpoints.len()
            );
        }
    }
}
