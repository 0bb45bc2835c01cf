//! Profiling event records and the global event stream.
//!
//! Every record is a fixed [`EventHeader`] followed by `payload_len` bytes
//! of little-endian `u32` arguments. Records go into one [`RingBuffer`]
//! that the consumer drains with [`read_event`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::Pid;
use crate::ring_buffer::{RingBuffer, WriteStatus};

/// Default stream size.
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;

/// Largest argument list a record carries.
pub const MAX_EVENT_ARGS: usize = 8;

/// What happened.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ThreadCreate = 1,
    ThreadExit = 2,
    ProcessExit = 3,
    /// Timed call of a hooked function.
    FunctionCall = 4,
    JoinBegin = 5,
    JoinEnd = 6,
    SyncWaitBegin = 7,
    SyncWaitEnd = 8,
    SyncRelease = 9,
    ChildWaitBegin = 10,
    ChildWaitEnd = 11,
    /// Non-blocking acquire attempt (`*_trylock`, `sem_trywait`).
    SyncTryBegin = 12,
    SyncTryEnd = 13,
    /// Acquire with a deadline.
    SyncTimedBegin = 14,
    SyncTimedEnd = 15,
    /// Busy-wait acquire of a spin lock.
    SpinBegin = 16,
    SpinEnd = 17,
    /// Release waking every waiter.
    SyncBroadcast = 18,
    SyncObjectCreate = 19,
    /// Existing named or keyed object opened.
    SyncObjectOpen = 20,
    SyncObjectDestroy = 21,
}

impl EventKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::ThreadCreate,
            2 => Self::ThreadExit,
            3 => Self::ProcessExit,
            4 => Self::FunctionCall,
            5 => Self::JoinBegin,
            6 => Self::JoinEnd,
            7 => Self::SyncWaitBegin,
            8 => Self::SyncWaitEnd,
            9 => Self::SyncRelease,
            10 => Self::ChildWaitBegin,
            11 => Self::ChildWaitEnd,
            12 => Self::SyncTryBegin,
            13 => Self::SyncTryEnd,
            14 => Self::SyncTimedBegin,
            15 => Self::SyncTimedEnd,
            16 => Self::SpinBegin,
            17 => Self::SpinEnd,
            18 => Self::SyncBroadcast,
            19 => Self::SyncObjectCreate,
            20 => Self::SyncObjectOpen,
            21 => Self::SyncObjectDestroy,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThreadCreate => "thread-create",
            Self::ThreadExit => "thread-exit",
            Self::ProcessExit => "process-exit",
            Self::FunctionCall => "function-call",
            Self::JoinBegin => "join-begin",
            Self::JoinEnd => "join-end",
            Self::SyncWaitBegin => "sync-wait-begin",
            Self::SyncWaitEnd => "sync-wait-end",
            Self::SyncRelease => "sync-release",
            Self::ChildWaitBegin => "child-wait-begin",
            Self::ChildWaitEnd => "child-wait-end",
            Self::SyncTryBegin => "sync-try-begin",
            Self::SyncTryEnd => "sync-try-end",
            Self::SyncTimedBegin => "sync-timed-begin",
            Self::SyncTimedEnd => "sync-timed-end",
            Self::SpinBegin => "spin-begin",
            Self::SpinEnd => "spin-end",
            Self::SyncBroadcast => "sync-broadcast",
            Self::SyncObjectCreate => "sync-object-create",
            Self::SyncObjectOpen => "sync-object-open",
            Self::SyncObjectDestroy => "sync-object-destroy",
        }
    }
}

/// Fixed record header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub kind: u16,
    /// Bytes of arguments following the header.
    pub payload_len: u16,
    pub tid: Pid,
    pub tgid: Pid,
    /// Instruction address the event refers to (call site, routine, ...).
    pub pc: u32,
    /// Monotonic nanoseconds.
    pub timestamp: u64,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<EventHeader>();

const _: () = assert!(HEADER_SIZE == 24);

impl EventHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[0..2].copy_from_slice(&self.kind.to_le_bytes());
        b[2..4].copy_from_slice(&self.payload_len.to_le_bytes());
        b[4..8].copy_from_slice(&self.tid.to_le_bytes());
        b[8..12].copy_from_slice(&self.tgid.to_le_bytes());
        b[12..16].copy_from_slice(&self.pc.to_le_bytes());
        b[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < HEADER_SIZE {
            return None;
        }
        let u16_at = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&b[16..24]);
        Some(Self {
            kind: u16_at(0),
            payload_len: u16_at(2),
            tid: u32_at(4) as Pid,
            tgid: u32_at(8) as Pid,
            pc: u32_at(12),
            timestamp: u64::from_le_bytes(ts),
        })
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_u16(self.kind)
    }
}

/// A record as handed back to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub header: EventHeader,
    pub args: Vec<u32>,
}

/// Decode one record produced by [`EventWriter::emit`].
pub fn parse_event(bytes: &[u8]) -> Option<Event> {
    let header = EventHeader::from_bytes(bytes)?;
    let payload = bytes.get(HEADER_SIZE..HEADER_SIZE + header.payload_len as usize)?;
    let args = payload
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some(Event { header, args })
}

/// Serialises records into a ring and latches flush requests.
pub struct EventWriter {
    ring: RingBuffer,
    flush_requested: AtomicBool,
}

impl EventWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            flush_requested: AtomicBool::new(false),
        }
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Append one record. Arguments past [`MAX_EVENT_ARGS`] are dropped.
    pub fn emit(&self, kind: EventKind, tid: Pid, tgid: Pid, pc: u32, timestamp: u64, args: &[u32]) -> WriteStatus {
        let args = &args[..args.len().min(MAX_EVENT_ARGS)];
        let mut payload = [0u8; MAX_EVENT_ARGS * 4];
        for (chunk, arg) in payload.chunks_exact_mut(4).zip(args) {
            chunk.copy_from_slice(&arg.to_le_bytes());
        }
        let payload = &payload[..args.len() * 4];

        let header = EventHeader {
            kind: kind as u16,
            payload_len: payload.len() as u16,
            tid,
            tgid,
            pc,
            timestamp,
        };
        let status = self.ring.write_event(&header.to_bytes(), payload);
        if status.needs_flush && !self.flush_requested.swap(true, Ordering::AcqRel) {
            debug!("ring: flush requested, {} bytes free", self.ring.free_space());
        }
        status
    }

    /// Consume the pending flush request, if any.
    pub fn take_flush_request(&self) -> bool {
        self.flush_requested.swap(false, Ordering::AcqRel)
    }
}

// =============================================================================
// Global Stream
// =============================================================================

static WRITER: Mutex<Option<Arc<EventWriter>>> = Mutex::new(None);

/// Create (or replace) the global stream.
pub fn init_events(capacity: usize) {
    *WRITER.lock() = Some(Arc::new(EventWriter::new(capacity)));
    info!("ring: event stream initialized, {} bytes", capacity);
}

pub fn writer() -> Option<Arc<EventWriter>> {
    WRITER.lock().clone()
}

/// Write to the global stream; a no-op before [`init_events`].
pub fn emit(kind: EventKind, tid: Pid, tgid: Pid, pc: u32, timestamp: u64, args: &[u32]) {
    if let Some(w) = writer() {
        w.emit(kind, tid, tgid, pc, timestamp, args);
    }
}

/// Copy the oldest record into `out`; see [`RingBuffer::read_event`].
pub fn read_event(out: &mut [u8]) -> usize {
    writer().map_or(0, |w| w.ring().read_event(out))
}

/// Drain up to `max_events` records (`0` means all).
pub fn consume_events(max_events: usize) -> Vec<Event> {
    let Some(w) = writer() else {
        return Vec::new();
    };
    let limit = if max_events == 0 { usize::MAX } else { max_events };
    let mut buf = [0u8; HEADER_SIZE + MAX_EVENT_ARGS * 4];
    let mut events = Vec::new();
    while events.len() < limit {
        let n = w.ring().read_event(&mut buf);
        if n == 0 {
            break;
        }
        if let Some(ev) = parse_event(&buf[..n]) {
            events.push(ev);
        }
    }
    events
}

/// Consume the global stream's pending flush request.
pub fn take_flush_request() -> bool {
    writer().is_some_and(|w| w.take_flush_request())
}
