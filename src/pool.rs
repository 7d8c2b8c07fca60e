//! A pool of reusable byte buffers for outbound frames.
//!
//! Buffers are bucketed by power-of-two size classes. Releasing returns the
//! storage to its bucket so the next frame of a similar size skips the
//! allocation. The pool may grow to any number of outstanding buffers but
//! bounds how many idle ones it retains per class.

use bytes::BytesMut;
use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

const MIN_CAPACITY: usize = 64;
const MAX_POOLED_CAPACITY: usize = 4 * 1024 * 1024;
const MAX_IDLE_PER_CLASS: usize = 32;
const CLASS_COUNT: usize = (MAX_POOLED_CAPACITY / MIN_CAPACITY).trailing_zeros() as usize + 1;

/// Lends contiguous writable regions of at least the requested size
#[derive(Clone)]
pub(crate) struct BufferPool {
    inner: Arc<Mutex<Buckets>>,
}

struct Buckets {
    classes: Vec<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buckets {
                classes: vec![Vec::new(); CLASS_COUNT],
            })),
        }
    }

    /// Lend a buffer with capacity of at least `hint` bytes
    pub fn get(&self, hint: usize) -> PooledBuf {
        let capacity = class_capacity(hint);
        let reused = if let Some(class) = class_index(capacity) {
            self.inner
                .lock()
                .expect("buffer pool lock poisoned")
                .classes[class]
                .pop()
        } else {
            // Oversize buffers bypass the buckets entirely
            None
        };
        let buf = reused.unwrap_or_else(|| BytesMut::with_capacity(capacity));
        PooledBuf {
            buf,
            pool: self.clone(),
            released: false,
        }
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        if let Some(class) = class_index(buf.capacity()) {
            let mut buckets = self.inner.lock().expect("buffer pool lock poisoned");
            let class = &mut buckets.classes[class];
            if class.len() < MAX_IDLE_PER_CLASS {
                class.push(buf);
            }
        }
    }
}

fn class_capacity(hint: usize) -> usize {
    hint.max(MIN_CAPACITY).next_power_of_two()
}

// Only exact power-of-two capacities within the pooled range go back to a
// bucket; anything else (including split-off remainders) is dropped.
fn class_index(capacity: usize) -> Option<usize> {
    if !capacity.is_power_of_two() || capacity < MIN_CAPACITY || capacity > MAX_POOLED_CAPACITY {
        return None;
    }
    Some((capacity / MIN_CAPACITY).trailing_zeros() as usize)
}

/// A byte buffer on loan from a [`BufferPool`]
///
/// The buffer returns to the pool when dropped. Dereferences to the
/// underlying `BytesMut`, so writers use the usual `BufMut` interface. The
/// written length travels with the buffer, which is what lets the sender
/// treat it as a complete frame.
pub(crate) struct PooledBuf {
    buf: BytesMut,
    pool: BufferPool,
    released: bool,
}

impl PooledBuf {
    /// Return the storage to the pool. Dropping does the same; this form
    /// reads better at sites where the release is the point.
    pub fn release(mut self) {
        self.release_storage();
    }

    fn release_storage(&mut self) {
        debug_assert!(!self.released, "pooled buffer released twice");
        if !self.released {
            self.released = true;
            let buf = std::mem::take(&mut self.buf);
            self.pool.release(buf);
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if !self.released {
            self.release_storage();
        }
    }
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}
