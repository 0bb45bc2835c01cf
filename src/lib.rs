//! User-space function hooking for ARM processes.
//!
//! This crate installs software breakpoints into traced user processes,
//! runs hook callbacks when they trap, and steps the overwritten
//! instruction out of line in a scratch area mapped into the process
//! ("displaced stepping"), so the traced code behaves as if never patched.
//!
//! # Features
//!
//! - `profiler` - built-in thread-profiler hook table and event records (default)
//!
//! # Quick Start
//!
//! ```ignore
//! use uhook::hook::{FunctionHook, HookHandlers};
//! use uhook::session::{self, SessionConfig};
//!
//! // The host glue provides remote memory access and process queries.
//! session::start_module_tracking(host, SessionConfig::default())?;
//! session::install_os_hooks()?;
//!
//! // Hook `foo` in process 1234
//! let handlers = HookHandlers::new()
//!     .with_pre(|ctx| log::info!("foo({:#x})", ctx.arg(0)))
//!     .with_return(|ctx| log::info!("foo -> {:#x}", ctx.return_value()));
//! session::register_user_function_hook(1234, FunctionHook::symbol("foo", handlers))?;
//!
//! // From the undefined-instruction handler registered for
//! // `uhook::trap_patterns()`:
//! let outcome = session::handle_trap(tid, &mut regs, insn);
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

/// Kernel task id (thread id or thread-group id).
pub type Pid = i32;

// =============================================================================
// Host Abstraction
// =============================================================================

pub mod error;
pub mod memory;
pub mod platform;
pub mod regs;

// =============================================================================
// Engine
// =============================================================================

pub mod area;
pub mod breakpoint;
pub mod displace;
pub mod dispatch;
pub mod elf;
pub mod hook;
pub mod registry;
pub mod session;

// =============================================================================
// Event Stream
// =============================================================================

pub mod event;
pub mod ring_buffer;

#[cfg(feature = "profiler")]
pub mod profiler;

// Re-export key types for convenience
pub use breakpoint::{Classification, TrapPattern, trap_patterns};
pub use dispatch::{Dispatcher, ThreadExit, TrapOutcome};
pub use error::{Error, Result};
pub use hook::{FunctionHook, HookContext, HookHandlers, HookTarget};
pub use memory::{ProcessOps, RemoteMemory};
pub use registry::Registry;
pub use regs::{Mode, Regs};
pub use session::SessionConfig;

// =============================================================================
// Initialization
// =============================================================================

/// Register the host's clock and CPU-id sources.
///
/// Call once before the first session; without it, timestamps come from
/// the mock clock in [`platform`].
pub fn init(clock: fn() -> u64, cpu: fn() -> u32) {
    platform::register_clock_source(clock);
    platform::register_cpu_source(cpu);
    info!("uhook: initialized");

    #[cfg(feature = "profiler")]
    info!("  - profiler hook table enabled");
}
