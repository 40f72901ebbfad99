//! Size-classed pool of reusable byte buffers.
//!
//! Buffers are grouped into buckets whose capacities grow geometrically from
//! `smallest` to `largest`. A checked-out [`PooledBuf`] is exclusively owned by
//! whoever filled it; once filled it can be frozen into a [`SharedBuf`] and
//! handed to any number of consumers. Storage goes back to its bucket when the
//! last handle is dropped, so every consumer releases exactly once.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("a pool needs at least 2 buckets, got {0}")]
    BucketCount(usize),
    #[error("smallest bucket capacity must be at least 1")]
    Smallest,
    #[error("largest bucket capacity {largest} is below smallest {smallest}")]
    Range { smallest: usize, largest: usize },
    #[error("requested {requested} bytes but the largest bucket holds {largest}")]
    TooLarge { requested: usize, largest: usize },
    #[error("buffer overflow: {requested} bytes requested, capacity is {capacity}")]
    Overflow { requested: usize, capacity: usize },
}

/// One size class. Every buffer on the free list has exactly `capacity` bytes.
struct Bucket {
    capacity: usize,
    free: SegQueue<Box<[u8]>>,
}

impl Bucket {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: SegQueue::new(),
        }
    }

    fn take(self: &Arc<Self>) -> PooledBuf {
        let storage = self
            .free
            .pop()
            .unwrap_or_else(|| vec![0u8; self.capacity].into_boxed_slice());
        PooledBuf {
            storage,
            len: 0,
            bucket: Arc::clone(self),
        }
    }

    fn recycle(&self, storage: Box<[u8]>) {
        debug_assert_eq!(storage.len(), self.capacity);
        self.free.push(storage);
    }
}

/// Lock-free pool shared by every connection thread.
pub struct BufferPool {
    buckets: Box<[Arc<Bucket>]>,
}

impl BufferPool {
    /// Builds `bucket_count` size classes spaced geometrically between
    /// `smallest` and `largest`.
    pub fn new(bucket_count: usize, smallest: usize, largest: usize) -> Result<Self, PoolError> {
        if bucket_count < 2 {
            return Err(PoolError::BucketCount(bucket_count));
        }
        if smallest < 1 {
            return Err(PoolError::Smallest);
        }
        if largest < smallest {
            return Err(PoolError::Range { smallest, largest });
        }

        let step = (largest as f64 / smallest as f64).ln() / (bucket_count - 1) as f64;
        let buckets = (0..bucket_count)
            .map(|i| {
                let capacity = if i == bucket_count - 1 {
                    // Pin the top class so `take(largest)` fits and `largest + 1` does not.
                    largest
                } else {
                    ((smallest as f64) * (i as f64 * step).exp()).ceil() as usize
                };
                Arc::new(Bucket::new(capacity.clamp(smallest, largest)))
            })
            .collect();

        Ok(Self { buckets })
    }

    /// Checks out a buffer with capacity of at least `size` from the smallest
    /// fitting bucket, allocating when that bucket's free list is empty.
    pub fn take(&self, size: usize) -> Result<PooledBuf, PoolError> {
        let index = self.buckets.partition_point(|b| b.capacity < size);
        match self.buckets.get(index) {
            Some(bucket) => Ok(bucket.take()),
            None => Err(PoolError::TooLarge {
                requested: size,
                largest: self.largest(),
            }),
        }
    }

    /// Takes a buffer sized for `bytes` and copies them in.
    pub fn copy_from(&self, bytes: &[u8]) -> Result<PooledBuf, PoolError> {
        let mut buf = self.take(bytes.len())?;
        buf.extend_from_slice(bytes)?;
        Ok(buf)
    }

    pub fn largest(&self) -> usize {
        self.buckets.last().map_or(0, |b| b.capacity)
    }

    pub fn capacities(&self) -> impl Iterator<Item = usize> + '_ {
        self.buckets.iter().map(|b| b.capacity)
    }

    /// Number of idle buffers in the bucket that would serve `size`.
    pub fn free_buffers(&self, size: usize) -> usize {
        let index = self.buckets.partition_point(|b| b.capacity < size);
        self.buckets.get(index).map_or(0, |b| b.free.len())
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacities", &self.capacities().collect::<Vec<_>>())
            .finish()
    }
}

/// Exclusively owned pool buffer. `len` is the filled prefix of the storage.
///
/// Dropping the handle returns the storage to its bucket; the fill count does
/// not travel with it, so the next holder starts at zero.
pub struct PooledBuf {
    storage: Box<[u8]>,
    len: usize,
    bucket: Arc<Bucket>,
}

impl PooledBuf {
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `bytes`, refusing to write past capacity.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), PoolError> {
        let end = self.len + bytes.len();
        if end > self.capacity() {
            return Err(PoolError::Overflow {
                requested: end,
                capacity: self.capacity(),
            });
        }
        self.storage[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// Sets the filled length without touching the bytes, so a reader can
    /// fill the buffer in place through `DerefMut`.
    pub fn set_len(&mut self, len: usize) -> Result<(), PoolError> {
        if len > self.capacity() {
            return Err(PoolError::Overflow {
                requested: len,
                capacity: self.capacity(),
            });
        }
        self.len = len;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Address of the underlying storage, stable across reuse.
    pub fn storage_ptr(&self) -> *const u8 {
        self.storage.as_ptr()
    }

    /// Freezes the buffer so it can be handed to several consumers.
    pub fn share(self) -> SharedBuf {
        SharedBuf(Arc::new(self))
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage[..self.len]
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.storage[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let storage = mem::take(&mut self.storage);
        self.bucket.recycle(storage);
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Read-only, reference-counted view of a filled buffer.
///
/// Each clone is one outstanding release; the storage returns to the pool
/// when the last clone is released.
#[derive(Clone)]
pub struct SharedBuf(Arc<PooledBuf>);

impl SharedBuf {
    /// Relinquishes this holder's reference.
    pub fn release(self) {
        drop(self);
    }

    /// Number of holders that still have to release.
    pub fn releases_pending(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn storage_ptr(&self) -> *const u8 {
        self.0.storage_ptr()
    }
}

impl Deref for SharedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SharedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedBuf").field(&self.0).finish()
    }
}
