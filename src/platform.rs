//! Timestamps and CPU ids for trap handling and event records.
//!
//! The embedding kernel registers its clock and CPU query once through
//! [`crate::init`]. Until then a software clock stands in: every read
//! advances it by [`MOCK_TICK_NS`], so an entry and its matching return
//! never share a timestamp even when nothing else moves time forward.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Source of time and CPU identity.
pub trait PlatformOps {
    /// Monotonic nanoseconds.
    fn time_ns() -> u64;

    fn cpu_id() -> u32;
}

static CLOCK_SOURCE: spin::Once<fn() -> u64> = spin::Once::new();
static CPU_SOURCE: spin::Once<fn() -> u32> = spin::Once::new();

/// Install the host clock. Later calls are ignored.
pub fn register_clock_source(f: fn() -> u64) {
    CLOCK_SOURCE.call_once(|| f);
}

/// Install the host's current-CPU query. Later calls are ignored.
pub fn register_cpu_source(f: fn() -> u32) {
    CPU_SOURCE.call_once(|| f);
}

pub fn has_host_clock() -> bool {
    CLOCK_SOURCE.get().is_some()
}

/// Registered host sources, with the software clock as fallback.
pub struct HostPlatform;

impl PlatformOps for HostPlatform {
    fn time_ns() -> u64 {
        CLOCK_SOURCE.get().map_or_else(MockPlatform::time_ns, |f| f())
    }

    fn cpu_id() -> u32 {
        CPU_SOURCE.get().map_or_else(MockPlatform::cpu_id, |f| f())
    }
}

// =============================================================================
// Software clock
// =============================================================================

/// Step of the software clock per read.
pub const MOCK_TICK_NS: u64 = 1_000;

static MOCK_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000);
static MOCK_CPU_ID: AtomicU32 = AtomicU32::new(0);

/// Software clock and a settable CPU id, for user-space runs and tests.
pub struct MockPlatform;

impl PlatformOps for MockPlatform {
    fn time_ns() -> u64 {
        MOCK_TIME_NS.fetch_add(MOCK_TICK_NS, Ordering::Relaxed)
    }

    fn cpu_id() -> u32 {
        MOCK_CPU_ID.load(Ordering::Relaxed)
    }
}

pub fn set_mock_time(ns: u64) {
    MOCK_TIME_NS.store(ns, Ordering::Relaxed);
}

pub fn advance_mock_time(ns: u64) {
    MOCK_TIME_NS.fetch_add(ns, Ordering::Relaxed);
}

pub fn set_mock_cpu_id(id: u32) {
    MOCK_CPU_ID.store(id, Ordering::Relaxed);
}

#[inline]
pub fn time_ns() -> u64 {
    HostPlatform::time_ns()
}

#[inline]
pub fn cpu_id() -> u32 {
    HostPlatform::cpu_id()
}
