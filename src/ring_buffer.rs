//! Byte ring carrying profiling records to the consumer.
//!
//! Each record is stored as a little-endian `u32` length followed by the
//! header and payload bytes, so readers always get whole records back.
//! One byte of the storage always stays unused: equal read and write
//! offsets therefore mean empty, never full.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

const LEN_PREFIX: usize = 4;

/// Result of one write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStatus {
    /// The record did not fit and was dropped.
    pub full: bool,
    /// Free space fell below a fifth of the capacity.
    pub needs_flush: bool,
}

struct Inner {
    data: Vec<u8>,
    read: usize,
    write: usize,
    full: bool,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn used(&self) -> usize {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.capacity() - self.read + self.write
        }
    }

    fn free(&self) -> usize {
        self.capacity().saturating_sub(self.used() + 1)
    }

    fn put(&mut self, bytes: &[u8]) {
        let cap = self.capacity();
        let first = bytes.len().min(cap - self.write);
        self.data[self.write..self.write + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.write = (self.write + bytes.len()) % cap;
    }

    fn peek(&self, offset: usize, out: &mut [u8]) {
        let cap = self.capacity();
        let start = (self.read + offset) % cap;
        let first = out.len().min(cap - start);
        out[..first].copy_from_slice(&self.data[start..start + first]);
        let rest = out.len() - first;
        out[first..].copy_from_slice(&self.data[..rest]);
    }
}

/// Bounded multi-producer ring of variable-length records.
pub struct RingBuffer {
    inner: Mutex<Inner>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: vec![0; capacity],
                read: 0,
                write: 0,
                full: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Append one record made of `header` then `payload`.
    ///
    /// The record is written completely or not at all. A record that does
    /// not fit raises the full flag, which stays set until the next read.
    pub fn write_event(&self, header: &[u8], payload: &[u8]) -> WriteStatus {
        let mut inner = self.inner.lock();
        let len = header.len() + payload.len();
        let cap = inner.capacity();

        if LEN_PREFIX + len > inner.free() {
            if !inner.full {
                warn!("ring: dropped {}-byte record, {} bytes free", len, inner.free());
            }
            inner.full = true;
            return WriteStatus {
                full: true,
                needs_flush: true,
            };
        }

        inner.put(&(len as u32).to_le_bytes());
        inner.put(header);
        inner.put(payload);

        let free = inner.free();
        WriteStatus {
            full: free == 0,
            needs_flush: free < cap / 5,
        }
    }

    /// Copy the oldest record into `out` and consume it.
    ///
    /// Returns the record length, or 0 when the ring is empty or `out` is
    /// too small (the record then stays queued).
    pub fn read_event(&self, out: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        if inner.used() < LEN_PREFIX {
            return 0;
        }
        let mut prefix = [0u8; LEN_PREFIX];
        inner.peek(0, &mut prefix);
        let len = u32::from_le_bytes(prefix) as usize;
        if out.len() < len {
            return 0;
        }

        inner.peek(LEN_PREFIX, &mut out[..len]);
        let cap = inner.capacity();
        inner.read = (inner.read + LEN_PREFIX + len) % cap;
        inner.full = false;
        len
    }

    /// Bytes currently queued, length prefixes included.
    pub fn len(&self) -> usize {
        self.inner.lock().used()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_space(&self) -> usize {
        self.inner.lock().free()
    }

    /// Whether a write was refused since the last read.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.full || inner.free() == 0
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.read = 0;
        inner.write = 0;
        inner.full = false;
    }
}
