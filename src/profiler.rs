//! Built-in thread profiler: hooks on the threading and synchronisation
//! entry points of libc, turned into records on the event stream.

use alloc::vec::Vec;

use hashbrown::{HashMap, HashSet};
use spin::Mutex;

use crate::Pid;
use crate::breakpoint::Classification;
use crate::event::{self, EventKind};
use crate::hook::{FunctionHook, HookContext, HookHandlers};

/// Synchronisation primitive operation, first argument of sync records.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    MutexLock = 0,
    MutexTryLock = 1,
    MutexUnlock = 2,
    CondWait = 3,
    CondSignal = 4,
    SemWait = 5,
    SemPost = 6,
    MutexTimedLock = 7,
    CondTimedWait = 8,
    CondBroadcast = 9,
    SemTryWait = 10,
    SemTimedWait = 11,
    RwlockRdLock = 12,
    RwlockWrLock = 13,
    RwlockTryRdLock = 14,
    RwlockTryWrLock = 15,
    RwlockTimedRdLock = 16,
    RwlockTimedWrLock = 17,
    RwlockUnlock = 18,
    SpinLock = 19,
    SpinTryLock = 20,
    SpinUnlock = 21,
    MqReceive = 22,
    MqTimedReceive = 23,
    MqSend = 24,
    MqTimedSend = 25,
    /// System V `semop`.
    SemOp = 26,
    SemTimedOp = 27,
    /// System V `msgrcv`.
    MsgReceive = 28,
    MsgSend = 29,
}

/// Kind of synchronisation object, first argument of object records.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncObject {
    Mutex = 0,
    RwLock = 1,
    SpinLock = 2,
    Cond = 3,
    Semaphore = 4,
    MessageQueue = 5,
    /// System V semaphore set.
    SemSet = 6,
    /// System V message queue.
    MsgQueue = 7,
}

/// `O_CREAT` for `sem_open` and `mq_open` on ARM Linux.
const O_CREAT: u32 = 0o100;
/// `IPC_CREAT` for `semget` and `msgget`.
const IPC_CREAT: u32 = 0o1000;
/// `IPC_RMID` command of `semctl` and `msgctl`.
const IPC_RMID: u32 = 0;
/// `sem_open` failure value.
const SEM_FAILED: u32 = 0;

/// How an acquiring call waits, which picks its record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    Wait,
    Try,
    Timed,
    Spin,
}

impl Acquire {
    fn kinds(self) -> (EventKind, EventKind) {
        match self {
            Self::Wait => (EventKind::SyncWaitBegin, EventKind::SyncWaitEnd),
            Self::Try => (EventKind::SyncTryBegin, EventKind::SyncTryEnd),
            Self::Timed => (EventKind::SyncTimedBegin, EventKind::SyncTimedEnd),
            Self::Spin => (EventKind::SpinBegin, EventKind::SpinEnd),
        }
    }
}

/// Child spawned by the last thread-creating clone of each parent thread.
static SPAWNED: Mutex<Option<HashMap<Pid, Pid>>> = Mutex::new(None);
/// `pthread_t` values to kernel tids, per process.
static PTHREADS: Mutex<Option<HashMap<(Pid, u32), Pid>>> = Mutex::new(None);
/// Threads whose exit has already been reported.
static EXITED: Mutex<Option<HashSet<Pid>>> = Mutex::new(None);

/// Forget all tracking state; called at session start and stop.
pub fn reset() {
    *SPAWNED.lock() = Some(HashMap::new());
    *PTHREADS.lock() = Some(HashMap::new());
    *EXITED.lock() = Some(HashSet::new());
}

/// Kernel tid behind a `pthread_t` of `tgid`.
pub fn thread_for(tgid: Pid, pthread: u32) -> Option<Pid> {
    PTHREADS.lock().as_ref()?.get(&(tgid, pthread)).copied()
}

/// Hooks installed into every traced process.
pub fn builtin_hooks() -> Vec<FunctionHook> {
    use Acquire::{Spin, Timed, Try, Wait};

    let mut hooks = alloc::vec![
        FunctionHook::symbol(
            "pthread_create",
            HookHandlers::new().with_pre(on_pthread_create).with_return(on_pthread_create_return),
        ),
        FunctionHook::symbol("pthread_exit", HookHandlers::new().with_pre(on_pthread_exit)),
        FunctionHook::symbol(
            "pthread_join",
            HookHandlers::new().with_pre(on_join).with_return(on_join_return),
        ),
        FunctionHook::symbol("waitpid", child_wait(|ctx| ctx.arg(0))),
        FunctionHook::symbol("wait", child_wait(|_| u32::MAX)),
        FunctionHook::symbol("dlopen", HookHandlers::new().with_return(|ctx| ctx.refresh_modules())),
    ];

    for (name, op, how) in [
        ("pthread_mutex_lock", SyncOp::MutexLock, Wait),
        ("pthread_mutex_trylock", SyncOp::MutexTryLock, Try),
        ("pthread_mutex_timedlock", SyncOp::MutexTimedLock, Timed),
        ("pthread_rwlock_rdlock", SyncOp::RwlockRdLock, Wait),
        ("pthread_rwlock_wrlock", SyncOp::RwlockWrLock, Wait),
        ("pthread_rwlock_tryrdlock", SyncOp::RwlockTryRdLock, Try),
        ("pthread_rwlock_trywrlock", SyncOp::RwlockTryWrLock, Try),
        ("pthread_rwlock_timedrdlock", SyncOp::RwlockTimedRdLock, Timed),
        ("pthread_rwlock_timedwrlock", SyncOp::RwlockTimedWrLock, Timed),
        ("pthread_spin_lock", SyncOp::SpinLock, Spin),
        ("pthread_spin_trylock", SyncOp::SpinTryLock, Try),
        ("pthread_cond_wait", SyncOp::CondWait, Wait),
        ("pthread_cond_timedwait", SyncOp::CondTimedWait, Timed),
        ("sem_wait", SyncOp::SemWait, Wait),
        ("sem_trywait", SyncOp::SemTryWait, Try),
        ("sem_timedwait", SyncOp::SemTimedWait, Timed),
        ("mq_receive", SyncOp::MqReceive, Wait),
        ("mq_timedreceive", SyncOp::MqTimedReceive, Timed),
        ("semop", SyncOp::SemOp, Wait),
        ("semtimedop", SyncOp::SemTimedOp, Timed),
        ("msgrcv", SyncOp::MsgReceive, Wait),
    ] {
        hooks.push(FunctionHook::symbol(name, sync_acquire(op, how)));
    }

    for (name, op, kind) in [
        ("pthread_mutex_unlock", SyncOp::MutexUnlock, EventKind::SyncRelease),
        ("pthread_rwlock_unlock", SyncOp::RwlockUnlock, EventKind::SyncRelease),
        ("pthread_spin_unlock", SyncOp::SpinUnlock, EventKind::SyncRelease),
        ("pthread_cond_signal", SyncOp::CondSignal, EventKind::SyncRelease),
        ("pthread_cond_broadcast", SyncOp::CondBroadcast, EventKind::SyncBroadcast),
        ("sem_post", SyncOp::SemPost, EventKind::SyncRelease),
        ("mq_send", SyncOp::MqSend, EventKind::SyncRelease),
        ("mq_timedsend", SyncOp::MqTimedSend, EventKind::SyncRelease),
        ("msgsnd", SyncOp::MsgSend, EventKind::SyncRelease),
    ] {
        hooks.push(FunctionHook::symbol(name, sync_release(op, kind)));
    }

    for (name, object) in [
        ("pthread_mutex_init", SyncObject::Mutex),
        ("pthread_rwlock_init", SyncObject::RwLock),
        ("pthread_spin_init", SyncObject::SpinLock),
        ("pthread_cond_init", SyncObject::Cond),
        ("sem_init", SyncObject::Semaphore),
    ] {
        hooks.push(FunctionHook::symbol(name, object_init(object)));
    }
    for (name, object) in [
        ("pthread_mutex_destroy", SyncObject::Mutex),
        ("pthread_rwlock_destroy", SyncObject::RwLock),
        ("pthread_spin_destroy", SyncObject::SpinLock),
        ("pthread_cond_destroy", SyncObject::Cond),
        ("sem_destroy", SyncObject::Semaphore),
        ("sem_close", SyncObject::Semaphore),
        ("mq_close", SyncObject::MessageQueue),
    ] {
        hooks.push(FunctionHook::symbol(name, object_destroy(object)));
    }
    for (name, object, flags_arg, create, failed) in [
        ("sem_open", SyncObject::Semaphore, 1, O_CREAT, SEM_FAILED),
        ("mq_open", SyncObject::MessageQueue, 1, O_CREAT, u32::MAX),
        ("semget", SyncObject::SemSet, 2, IPC_CREAT, u32::MAX),
        ("msgget", SyncObject::MsgQueue, 1, IPC_CREAT, u32::MAX),
    ] {
        hooks.push(FunctionHook::symbol(name, object_open(object, flags_arg, create, failed)));
    }
    for (name, object, cmd_arg) in [("semctl", SyncObject::SemSet, 2), ("msgctl", SyncObject::MsgQueue, 1)] {
        hooks.push(FunctionHook::symbol(name, object_control(object, cmd_arg)));
    }
    hooks
}

/// Handlers recording a timed [`EventKind::FunctionCall`] for any hook.
///
/// Arguments: entry timestamp (low, high), r0-r3 at entry, return value.
pub fn call_timing() -> HookHandlers {
    HookHandlers::new().with_return(|ctx| {
        let Some(entry) = ctx.entry else {
            return;
        };
        let r = &entry.regs.r;
        let args = [
            entry.timestamp as u32,
            (entry.timestamp >> 32) as u32,
            r[0],
            r[1],
            r[2],
            r[3],
            ctx.return_value(),
        ];
        event::emit(EventKind::FunctionCall, ctx.tid, ctx.tgid, entry.address, ctx.timestamp, &args);
    })
}

fn on_pthread_create(ctx: &mut HookContext<'_>) {
    let routine = ctx.arg(2);
    if routine == 0 {
        return;
    }
    debug!("profiler: {} starts a thread at {:#x}", ctx.tid, routine);
    ctx.install(
        routine,
        Classification::ThreadFuncEntry,
        HookHandlers::new().with_return(on_thread_routine_return),
    );
}

fn on_pthread_create_return(ctx: &mut HookContext<'_>) {
    let Some(entry) = ctx.entry else {
        return;
    };
    let spawned = SPAWNED.lock().as_mut().and_then(|m| m.remove(&ctx.tid));
    if ctx.return_value() != 0 {
        return;
    }
    let Some(child) = spawned else {
        warn!("profiler: pthread_create in {} returned without a clone", ctx.tid);
        return;
    };
    match ctx.memory.read_u32(entry.regs.r[0]) {
        Ok(pthread) => {
            if let Some(map) = PTHREADS.lock().as_mut() {
                map.insert((ctx.tgid, pthread), child);
            }
        }
        Err(e) => warn!("profiler: cannot read pthread id of {}: {}", child, e),
    }
}

fn on_thread_routine_return(ctx: &mut HookContext<'_>) {
    report_thread_exit(ctx.tid, ctx.tgid, ctx.return_value(), ctx.timestamp);
}

fn on_pthread_exit(ctx: &mut HookContext<'_>) {
    report_thread_exit(ctx.tid, ctx.tgid, ctx.arg(0), ctx.timestamp);
}

fn on_join(ctx: &mut HookContext<'_>) {
    let target = thread_for(ctx.tgid, ctx.arg(0)).unwrap_or(0);
    let site = ctx.call_site();
    event::emit(EventKind::JoinBegin, ctx.tid, ctx.tgid, site, ctx.timestamp, &[target as u32]);
}

fn on_join_return(ctx: &mut HookContext<'_>) {
    let Some(entry) = ctx.entry else {
        return;
    };
    let pthread = entry.regs.r[0];
    let target = thread_for(ctx.tgid, pthread).unwrap_or(0);
    // a joined pthread_t is free for reuse
    if ctx.return_value() == 0 {
        if let Some(map) = PTHREADS.lock().as_mut() {
            map.remove(&(ctx.tgid, pthread));
        }
    }
    let site = ctx.call_site();
    event::emit(
        EventKind::JoinEnd,
        ctx.tid,
        ctx.tgid,
        site,
        ctx.timestamp,
        &[target as u32, ctx.return_value()],
    );
}

/// `r<n>` as it was when the call was entered.
fn entry_arg(ctx: &HookContext<'_>, n: usize) -> u32 {
    ctx.entry.map_or(0, |e| e.regs.r[n])
}

/// Begin and end records around a call that may block on `arg(0)`.
fn sync_acquire(op: SyncOp, how: Acquire) -> HookHandlers {
    let (begin, end) = how.kinds();
    HookHandlers::new()
        .with_pre(move |ctx| {
            let site = ctx.call_site();
            event::emit(begin, ctx.tid, ctx.tgid, site, ctx.timestamp, &[op as u32, ctx.arg(0)]);
        })
        .with_return(move |ctx| {
            let object = entry_arg(ctx, 0);
            let site = ctx.call_site();
            event::emit(
                end,
                ctx.tid,
                ctx.tgid,
                site,
                ctx.timestamp,
                &[op as u32, object, ctx.return_value()],
            );
        })
}

fn sync_release(op: SyncOp, kind: EventKind) -> HookHandlers {
    HookHandlers::new().with_pre(move |ctx| {
        let site = ctx.call_site();
        event::emit(kind, ctx.tid, ctx.tgid, site, ctx.timestamp, &[op as u32, ctx.arg(0)]);
    })
}

fn object_event(ctx: &HookContext<'_>, kind: EventKind, object: SyncObject, handle: u32) {
    let site = ctx.call_site();
    event::emit(
        kind,
        ctx.tid,
        ctx.tgid,
        site,
        ctx.timestamp,
        &[object as u32, handle, ctx.return_value()],
    );
}

/// `*_init(obj, ...)`: created when it returns 0.
fn object_init(object: SyncObject) -> HookHandlers {
    HookHandlers::new().with_return(move |ctx| {
        if ctx.return_value() == 0 {
            object_event(ctx, EventKind::SyncObjectCreate, object, entry_arg(ctx, 0));
        }
    })
}

/// `*_destroy(obj)`, `*_close(obj)`: gone when it returns 0.
fn object_destroy(object: SyncObject) -> HookHandlers {
    HookHandlers::new().with_return(move |ctx| {
        if ctx.return_value() == 0 {
            object_event(ctx, EventKind::SyncObjectDestroy, object, entry_arg(ctx, 0));
        }
    })
}

/// Calls returning a handle: created with the create flag in `r<flags_arg>`,
/// opened otherwise.
fn object_open(object: SyncObject, flags_arg: usize, create: u32, failed: u32) -> HookHandlers {
    HookHandlers::new().with_return(move |ctx| {
        let handle = ctx.return_value();
        if handle == failed {
            return;
        }
        let kind = if entry_arg(ctx, flags_arg) & create != 0 {
            EventKind::SyncObjectCreate
        } else {
            EventKind::SyncObjectOpen
        };
        object_event(ctx, kind, object, handle);
    })
}

/// System V `*ctl(id, ..)`: only `IPC_RMID` is recorded.
fn object_control(object: SyncObject, cmd_arg: usize) -> HookHandlers {
    HookHandlers::new().with_return(move |ctx| {
        if entry_arg(ctx, cmd_arg) == IPC_RMID && ctx.return_value() == 0 {
            object_event(ctx, EventKind::SyncObjectDestroy, object, entry_arg(ctx, 0));
        }
    })
}

fn child_wait(pid: fn(&HookContext<'_>) -> u32) -> HookHandlers {
    HookHandlers::new()
        .with_pre(move |ctx| {
            let site = ctx.call_site();
            event::emit(EventKind::ChildWaitBegin, ctx.tid, ctx.tgid, site, ctx.timestamp, &[pid(ctx)]);
        })
        .with_return(|ctx| {
            let site = ctx.call_site();
            event::emit(EventKind::ChildWaitEnd, ctx.tid, ctx.tgid, site, ctx.timestamp, &[ctx.return_value()]);
        })
}

// =============================================================================
// Lifecycle events
// =============================================================================

/// A task was created by `parent_tid`.
pub fn on_task_created(parent_tid: Pid, parent_tgid: Pid, child_tid: Pid, child_tgid: Pid, pc: u32, timestamp: u64) {
    if let Some(exited) = EXITED.lock().as_mut() {
        exited.remove(&child_tid);
    }
    if child_tgid == parent_tgid {
        if let Some(spawned) = SPAWNED.lock().as_mut() {
            spawned.insert(parent_tid, child_tid);
        }
    }
    event::emit(
        EventKind::ThreadCreate,
        child_tid,
        child_tgid,
        pc,
        timestamp,
        &[parent_tid as u32, parent_tgid as u32],
    );
}

/// Report a thread's end once, whichever path sees it first.
pub fn report_thread_exit(tid: Pid, tgid: Pid, code: u32, timestamp: u64) {
    let first = EXITED.lock().as_mut().is_none_or(|exited| exited.insert(tid));
    if first {
        event::emit(EventKind::ThreadExit, tid, tgid, 0, timestamp, &[code]);
    }
}

/// Drop what is kept about a thread the kernel has torn down.
///
/// Its `pthread_t` mapping stays until joined: the join usually comes
/// after the kernel exit, and a new thread reusing the handle replaces it.
pub fn forget_thread(tid: Pid) {
    if let Some(exited) = EXITED.lock().as_mut() {
        exited.remove(&tid);
    }
    if let Some(spawned) = SPAWNED.lock().as_mut() {
        spawned.remove(&tid);
    }
}

pub fn on_process_exit(tgid: Pid, code: u32, timestamp: u64) {
    event::emit(EventKind::ProcessExit, tgid, tgid, 0, timestamp, &[code]);
    if let Some(map) = PTHREADS.lock().as_mut() {
        map.retain(|(pid, _), _| *pid != tgid);
    }
}
