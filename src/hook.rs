//! Hook handlers and the context they observe.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::Pid;
use crate::breakpoint::Classification;
use crate::error::Result;
use crate::memory::{RemoteMemory, is_thumb32_prefix, read_cstring};
use crate::regs::Regs;

/// Callback invoked from trap context.
pub type Handler = Arc<dyn Fn(&mut HookContext<'_>) + Send + Sync>;

/// Entry, post-step and return callbacks of one breakpoint.
#[derive(Clone, Default)]
pub struct HookHandlers {
    /// Runs at function entry, before the original instruction is stepped.
    pub pre: Option<Handler>,
    /// Runs once the displaced original instruction has completed.
    pub post: Option<Handler>,
    /// Runs when the hooked function returns to its caller.
    pub ret: Option<Handler>,
}

impl HookHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre(mut self, f: impl Fn(&mut HookContext<'_>) + Send + Sync + 'static) -> Self {
        self.pre = Some(Arc::new(f));
        self
    }

    pub fn with_post(mut self, f: impl Fn(&mut HookContext<'_>) + Send + Sync + 'static) -> Self {
        self.post = Some(Arc::new(f));
        self
    }

    pub fn with_return(mut self, f: impl Fn(&mut HookContext<'_>) + Send + Sync + 'static) -> Self {
        self.ret = Some(Arc::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_none() && self.post.is_none() && self.ret.is_none()
    }
}

impl fmt::Debug for HookHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandlers")
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("ret", &self.ret.is_some())
            .finish()
    }
}

/// Registers and time captured at function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub address: u32,
    pub regs: Regs,
    pub timestamp: u64,
}

/// Deferred registry change queued by a handler.
#[derive(Debug, Clone)]
pub enum HookRequest {
    /// Arm a breakpoint at a (mode-tagged) address of the current process.
    Install {
        addr: u32,
        class: Classification,
        handlers: HookHandlers,
    },
    /// Re-walk the link map and install hooks whose symbols just appeared.
    RefreshModules,
}

/// What a handler sees about the trap that invoked it.
pub struct HookContext<'a> {
    pub tid: Pid,
    pub tgid: Pid,
    /// Mode-tagged address of the breakpoint.
    pub address: u32,
    pub class: Classification,
    pub timestamp: u64,
    pub regs: &'a Regs,
    /// Entry state for return and post callbacks.
    pub entry: Option<&'a EntrySnapshot>,
    pub memory: &'a dyn RemoteMemory,
    requests: Vec<HookRequest>,
}

impl<'a> HookContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tid: Pid,
        tgid: Pid,
        address: u32,
        class: Classification,
        timestamp: u64,
        regs: &'a Regs,
        entry: Option<&'a EntrySnapshot>,
        memory: &'a dyn RemoteMemory,
    ) -> Self {
        Self {
            tid,
            tgid,
            address,
            class,
            timestamp,
            regs,
            entry,
            memory,
            requests: Vec::new(),
        }
    }

    /// Argument register `n` (r0-r3) per the ARM procedure call standard.
    pub fn arg(&self, n: usize) -> u32 {
        if n < 4 { self.regs.r[n] } else { 0 }
    }

    /// Function result, meaningful in return callbacks.
    pub fn return_value(&self) -> u32 {
        self.regs.r[0]
    }

    /// Address of the call instruction that led here.
    ///
    /// Uses the link register of the entry snapshot when there is one.
    pub fn call_site(&self) -> u32 {
        let lr = self.entry.map_or(self.regs.lr(), |e| e.regs.lr());
        call_site_of(self.memory, lr)
    }

    pub fn read_string(&self, addr: u32) -> Result<String> {
        read_cstring(self.memory, addr)
    }

    pub fn install(&mut self, addr: u32, class: Classification, handlers: HookHandlers) {
        self.requests.push(HookRequest::Install { addr, class, handlers });
    }

    pub fn refresh_modules(&mut self) {
        self.requests.push(HookRequest::RefreshModules);
    }

    pub(crate) fn take_requests(&mut self) -> Vec<HookRequest> {
        core::mem::take(&mut self.requests)
    }
}

/// Link register minus the size of the instruction before it.
pub fn call_site_of(mem: &dyn RemoteMemory, lr: u32) -> u32 {
    if lr & 1 == 0 {
        return lr.wrapping_sub(4);
    }
    let ret = lr & !1;
    match mem.read_u16(ret.wrapping_sub(4)) {
        Ok(hw) if is_thumb32_prefix(hw) => ret.wrapping_sub(4),
        _ => ret.wrapping_sub(2),
    }
}

/// What a function hook attaches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookTarget {
    Symbol(String),
    /// Mode-tagged address.
    Address(u32),
}

impl fmt::Display for HookTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symbol(name) => f.write_str(name),
            Self::Address(addr) => write!(f, "{:#x}", addr),
        }
    }
}

/// A process-wide hook, re-applied on fork and module refresh.
#[derive(Debug, Clone)]
pub struct FunctionHook {
    pub target: HookTarget,
    pub handlers: HookHandlers,
    pub class: Classification,
}

impl FunctionHook {
    pub fn symbol(name: &str, handlers: HookHandlers) -> Self {
        Self {
            target: HookTarget::Symbol(String::from(name)),
            handlers,
            class: Classification::UserHook,
        }
    }

    pub fn address(addr: u32, handlers: HookHandlers) -> Self {
        Self {
            target: HookTarget::Address(addr),
            handlers,
            class: Classification::UserHook,
        }
    }

    pub fn with_class(mut self, class: Classification) -> Self {
        self.class = class;
        self
    }
}
