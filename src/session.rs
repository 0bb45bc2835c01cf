//! The profiling session: global entry points used by the host glue.
//!
//! One session at a time owns the [`Registry`] and the host capabilities.
//! Every entry point takes the session lock for its whole lookup and
//! modify sequence, so traps on other CPUs never see a half-updated
//! registry.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::Pid;
use crate::area::{DEFAULT_AREA_SIZE, free_area};
use crate::dispatch::{CLONE_THREAD, Dispatcher, ThreadExit, TrapOutcome};
use crate::error::{Error, Result};
use crate::event;
use crate::hook::{FunctionHook, HookTarget};
use crate::memory::ProcessOps;
use crate::platform;
use crate::registry::Registry;
use crate::regs::Regs;

/// Run-time settings of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bytes of scratch area mapped into each traced process.
    pub area_size: u32,
    /// The profiler's own process; its children are not re-hooked on fork.
    pub profiler_tgid: Option<Pid>,
    /// Bytes of the event stream.
    pub ring_capacity: usize,
    /// Install the built-in profiler hooks into every traced process.
    pub builtin_hooks: bool,
    /// Skip callbacks for calls made from the loader or libc into themselves.
    pub ignore_library_internal_calls: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            area_size: DEFAULT_AREA_SIZE,
            profiler_tgid: None,
            ring_capacity: event::DEFAULT_RING_CAPACITY,
            builtin_hooks: true,
            ignore_library_internal_calls: true,
        }
    }
}

struct Session {
    registry: Registry,
    host: Arc<dyn ProcessOps>,
    config: SessionConfig,
    defaults: Vec<FunctionHook>,
}

impl Session {
    fn dispatcher(&mut self) -> Dispatcher<'_> {
        Dispatcher::new(&mut self.registry, &*self.host, &self.config).with_default_hooks(&self.defaults)
    }
}

static SESSION: Mutex<Option<Session>> = Mutex::new(None);

/// Processes of stopped sessions with threads still inside a scratch slot.
///
/// Their areas stay mapped until the last return trap is taken or the
/// thread or process is gone.
struct Draining {
    registry: Registry,
    host: Arc<dyn ProcessOps>,
    config: SessionConfig,
}

static DRAINING: Mutex<Vec<Draining>> = Mutex::new(Vec::new());

/// Whether lifecycle notifications are acted upon.
static OS_HOOKS: AtomicBool = AtomicBool::new(false);

fn with_session<R>(f: impl FnOnce(&mut Session) -> R) -> Result<R> {
    let mut guard = SESSION.lock();
    let session = guard.as_mut().ok_or(Error::NotStarted)?;
    Ok(f(session))
}

fn with_dispatcher<R>(f: impl FnOnce(&mut Dispatcher<'_>) -> R) -> Result<R> {
    with_session(|s| f(&mut s.dispatcher()))
}

pub fn is_started() -> bool {
    SESSION.lock().is_some()
}

/// Start a session: enumerate every live process and arm the default hooks.
pub fn start_module_tracking(host: Arc<dyn ProcessOps>, config: SessionConfig) -> Result<()> {
    let mut guard = SESSION.lock();
    if guard.is_some() {
        return Err(Error::AlreadyStarted);
    }

    if !platform::has_host_clock() {
        warn!("uhook: no host clock registered, timestamps come from the software clock");
    }
    event::init_events(config.ring_capacity);
    let defaults = default_hooks(&config);
    let mut session = Session {
        registry: Registry::new(),
        host,
        config,
        defaults,
    };

    let pids = session.host.processes();
    let profiler = session.config.profiler_tgid;
    let mut dispatcher = session.dispatcher();
    for pid in pids.into_iter().filter(|&p| Some(p) != profiler) {
        match dispatcher.register_process(pid) {
            Ok(armed) => debug!("uhook: {} registered, {} hook(s) armed", pid, armed),
            Err(e) => warn!("uhook: cannot register {}: {}", pid, e),
        }
    }

    info!(
        "uhook: module tracking started, {} process(es) traced",
        session.registry.process_ids().len()
    );
    *guard = Some(session);
    Ok(())
}

#[cfg(feature = "profiler")]
fn default_hooks(config: &SessionConfig) -> Vec<FunctionHook> {
    crate::profiler::reset();
    if config.builtin_hooks {
        crate::profiler::builtin_hooks()
    } else {
        Vec::new()
    }
}

#[cfg(not(feature = "profiler"))]
fn default_hooks(_config: &SessionConfig) -> Vec<FunctionHook> {
    Vec::new()
}

/// End the session, restoring every instruction still patched.
pub fn stop_module_tracking() -> Result<()> {
    let session = SESSION.lock().take().ok_or(Error::NotStarted)?;
    OS_HOOKS.store(false, Ordering::SeqCst);

    let host = session.host.clone();
    let mut registry = session.registry;
    for tgid in registry.process_ids() {
        if let Some(process) = registry.process_mut(tgid) {
            process.clear_breakpoints(&*host, true);
        }
        if registry.has_stepping_threads(tgid) {
            debug!("uhook: {} is mid-step, keeping its scratch area", tgid);
            continue;
        }
        if let Some(mut process) = registry.remove_process(tgid) {
            if let Some(area) = process.area.take() {
                free_area(&*host, tgid, area);
            }
        }
    }

    if !registry.process_ids().is_empty() {
        // no callbacks after stop
        for thread in registry.threads_mut() {
            if let Some(step) = &mut thread.stepping {
                step.entry = None;
                step.post = None;
            }
        }
        info!(
            "uhook: {} process(es) still stepping, draining",
            registry.process_ids().len()
        );
        DRAINING.lock().push(Draining {
            registry,
            host,
            config: session.config,
        });
    }

    #[cfg(feature = "profiler")]
    crate::profiler::reset();
    info!("uhook: module tracking stopped");
    Ok(())
}

/// Number of processes whose scratch areas wait on in-flight steps.
pub fn draining_processes() -> usize {
    DRAINING.lock().iter().map(|d| d.registry.process_ids().len()).sum()
}

/// Free a drained process once none of its threads is stepping.
fn settle(drain: &mut Draining, tgid: Pid) {
    if drain.registry.has_stepping_threads(tgid) {
        return;
    }
    if let Some(mut process) = drain.registry.remove_process(tgid) {
        if let Some(area) = process.area.take() {
            free_area(&*drain.host, tgid, area);
        }
        debug!("uhook: {} drained", tgid);
    }
}

fn prune_drained(drains: &mut Vec<Draining>) {
    drains.retain(|d| !d.registry.process_ids().is_empty());
}

/// Return trap of a step begun before the session stopped.
fn finish_drained_step(tid: Pid, regs: &mut Regs, insn: u32) -> Option<TrapOutcome> {
    let mut drains = DRAINING.lock();
    let pc = regs.tagged_pc();
    let drain = drains.iter_mut().find(|d| {
        d.registry
            .thread(tid)
            .and_then(|t| t.stepping.as_ref())
            .is_some_and(|step| step.slot_end == pc)
    })?;
    let tgid = drain.registry.thread(tid).map(|t| t.tgid)?;

    let outcome = Dispatcher::new(&mut drain.registry, &*drain.host, &drain.config).handle_trap(tid, regs, insn);
    settle(drain, tgid);
    prune_drained(&mut drains);
    Some(outcome)
}

fn drained_thread_exit(tid: Pid, exit: ThreadExit) {
    let mut drains = DRAINING.lock();
    for drain in drains.iter_mut() {
        let Some(tgid) = drain.registry.thread(tid).map(|t| t.tgid) else {
            continue;
        };
        Dispatcher::new(&mut drain.registry, &*drain.host, &drain.config).on_thread_exit(tid, exit);
        settle(drain, tgid);
    }
    prune_drained(&mut drains);
}

fn drained_process_exit(tgid: Pid) {
    let mut drains = DRAINING.lock();
    for drain in drains.iter_mut() {
        drain.registry.remove_process(tgid);
    }
    prune_drained(&mut drains);
}

/// Start acting on lifecycle notifications.
pub fn install_os_hooks() -> Result<()> {
    if !is_started() {
        return Err(Error::NotStarted);
    }
    OS_HOOKS.store(true, Ordering::SeqCst);
    info!("uhook: lifecycle hooks installed");
    Ok(())
}

pub fn remove_os_hooks() {
    if OS_HOOKS.swap(false, Ordering::SeqCst) {
        info!("uhook: lifecycle hooks removed");
    }
}

pub fn os_hooks_installed() -> bool {
    OS_HOOKS.load(Ordering::SeqCst)
}

/// Undefined-instruction trap entry for the host.
pub fn handle_trap(tid: Pid, regs: &mut Regs, insn: u32) -> TrapOutcome {
    if let Some(outcome) = finish_drained_step(tid, regs, insn) {
        return outcome;
    }
    with_dispatcher(|d| d.handle_trap(tid, regs, insn)).unwrap_or(TrapOutcome::Unhandled)
}

// =============================================================================
// Lifecycle notifications
// =============================================================================

fn notify<R: Default>(f: impl FnOnce(&mut Session) -> R) -> R {
    if !os_hooks_installed() {
        return R::default();
    }
    with_session(f).unwrap_or_default()
}

pub fn notify_fork(parent: Pid, child: Pid, pc: u32) {
    notify(|s| {
        let ptgid = s.host.thread_group(parent).unwrap_or(parent);
        if let Err(e) = s.dispatcher().on_fork(ptgid, child) {
            warn!("uhook: fork {} -> {}: {}", ptgid, child, e);
        }
        task_created(parent, ptgid, child, child, pc);
    })
}

pub fn notify_vfork(parent: Pid, child: Pid, pc: u32) {
    notify(|s| {
        let ptgid = s.host.thread_group(parent).unwrap_or(parent);
        if let Err(e) = s.dispatcher().on_vfork(ptgid, child) {
            warn!("uhook: vfork {} -> {}: {}", ptgid, child, e);
        }
        task_created(parent, ptgid, child, child, pc);
    })
}

pub fn notify_clone(parent_tid: Pid, child_tid: Pid, flags: u32, pc: u32) {
    notify(|s| {
        let ptgid = s.host.thread_group(parent_tid).unwrap_or(parent_tid);
        if let Err(e) = s.dispatcher().on_clone(parent_tid, child_tid, flags) {
            warn!("uhook: clone {} -> {}: {}", parent_tid, child_tid, e);
        }
        let child_tgid = if flags & CLONE_THREAD != 0 { ptgid } else { child_tid };
        task_created(parent_tid, ptgid, child_tid, child_tgid, pc);
    })
}

pub fn notify_exec(tid: Pid, pc: u32) {
    notify(|s| {
        if let Err(e) = s.dispatcher().on_exec(tid) {
            warn!("uhook: exec in {}: {}", tid, e);
        }
        let tgid = s.host.thread_group(tid).unwrap_or(tid);
        task_created(tid, tgid, tid, tgid, pc);
    })
}

pub fn notify_thread_exit(tid: Pid, exit: ThreadExit, code: u32) {
    drained_thread_exit(tid, exit);
    notify(|s| {
        let tgid = s
            .registry
            .thread(tid)
            .map(|t| t.tgid)
            .or_else(|| s.host.thread_group(tid))
            .unwrap_or(tid);
        s.dispatcher().on_thread_exit(tid, exit);
        #[cfg(feature = "profiler")]
        {
            crate::profiler::report_thread_exit(tid, tgid, code, platform::time_ns());
            if exit == ThreadExit::Kernel {
                crate::profiler::forget_thread(tid);
            }
        }
        #[cfg(not(feature = "profiler"))]
        let _ = (tgid, code);
    })
}

pub fn notify_process_group_exit(tgid: Pid, code: u32) {
    drained_process_exit(tgid);
    notify(|s| {
        s.dispatcher().on_process_group_exit(tgid);
        #[cfg(feature = "profiler")]
        crate::profiler::on_process_exit(tgid, code, platform::time_ns());
        #[cfg(not(feature = "profiler"))]
        let _ = code;
    })
}

#[cfg(feature = "profiler")]
fn task_created(ptid: Pid, ptgid: Pid, child: Pid, child_tgid: Pid, pc: u32) {
    crate::profiler::on_task_created(ptid, ptgid, child, child_tgid, pc, platform::time_ns());
}

#[cfg(not(feature = "profiler"))]
fn task_created(_ptid: Pid, _ptgid: Pid, _child: Pid, _child_tgid: Pid, _pc: u32) {}

// =============================================================================
// Hooks and modules
// =============================================================================

/// See [`Dispatcher::register_user_function_hook`].
pub fn register_user_function_hook(tgid: Pid, hook: FunctionHook) -> Result<Option<u32>> {
    with_dispatcher(|d| d.register_user_function_hook(tgid, hook))?
}

pub fn unregister_user_function_hook(tgid: Pid, target: &HookTarget) -> Result<()> {
    with_dispatcher(|d| d.unregister_user_function_hook(tgid, target))?
}

/// Re-walk the link map of `tgid` and arm hooks that became resolvable.
pub fn refresh_modules(tgid: Pid) -> Result<usize> {
    with_dispatcher(|d| d.refresh_modules(tgid))?
}

/// Read-only access to the registry, for inspection and tests.
pub fn with_registry<R>(f: impl FnOnce(&Registry) -> R) -> Result<R> {
    with_session(|s| f(&s.registry))
}

/// Copy the oldest event record into `out`.
pub fn read_events(out: &mut [u8]) -> usize {
    event::read_event(out)
}
