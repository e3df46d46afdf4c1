//! Chunk buffers and the stripe buffer pool.
//!
//! Reload I/O moves whole stripes through `chunks_per_stripe` chunk-sized
//! buffers. Buffers are aligned for direct NVMe submission and recycled
//! through a fixed-capacity pool that is sized for the worst case (every
//! resident stripe reloading at once), so exhaustion is an invariant
//! violation rather than a condition to retry.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Alignment required for direct NVMe DMA (4 KiB).
pub const CHUNK_ALIGNMENT: usize = 4096;

// =============================================================================
// ChunkBuf
// =============================================================================

/// A chunk-sized buffer aligned for direct I/O.
///
/// The buffer is zero-initialized on allocation, owned exclusively, and
/// freed on drop. It derefs to a byte slice for staging stripe data.
#[derive(Debug)]
pub struct ChunkBuf {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: ChunkBuf owns its memory exclusively; access is controlled via
// borrowing, so moving it between threads is sound.
unsafe impl Send for ChunkBuf {}
unsafe impl Sync for ChunkBuf {}

impl ChunkBuf {
    /// Allocate a new zero-initialized chunk buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::BufferPoolCreation` if `size` is 0 or the allocation
    /// fails.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::BufferPoolCreation { size, count: 1 });
        }

        let layout = Layout::from_size_align(size, CHUNK_ALIGNMENT)
            .map_err(|_| Error::BufferPoolCreation { size, count: 1 })?;

        // SAFETY: layout is valid (checked above).
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr).map_or(Err(Error::BufferPoolCreation { size, count: 1 }), |ptr| {
            Ok(Self { ptr, size, layout })
        })
    }

    /// Returns the size of the buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns `true` if the buffer has zero size. Always `false` for a
    /// successfully constructed buffer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Check that the buffer start is aligned for direct I/O.
    #[inline]
    pub fn is_aligned(&self) -> bool {
        (self.ptr.as_ptr() as usize) % CHUNK_ALIGNMENT == 0
    }

    /// Zero the buffer contents.
    pub fn zero(&mut self) {
        // SAFETY: exclusive access, pointer and size are valid.
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.size);
        }
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for self.size bytes and we have shared access.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for self.size bytes and we have exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for ChunkBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout and not yet freed.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl Deref for ChunkBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for ChunkBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for ChunkBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

// =============================================================================
// BufferPool
// =============================================================================

/// A fixed-capacity pool of pre-allocated chunk buffers.
///
/// Unlike a growable pool, `try_get` never allocates: when the pool is
/// empty it returns `None`. The reload path treats that as fatal because
/// the pool is provisioned for the worst case up front.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<ChunkBuf>>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `buffer_size` bytes each.
    pub fn new(buffer_size: usize, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(Error::BufferPoolCreation {
                size: buffer_size,
                count,
            });
        }

        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            buffers.push(ChunkBuf::new(buffer_size).map_err(|_| Error::BufferPoolCreation {
                size: buffer_size,
                count,
            })?);
        }

        Ok(Self {
            buffers: Mutex::new(buffers),
            buffer_size,
            capacity: count,
        })
    }

    /// Take a buffer from the pool, or `None` under exhaustion.
    pub fn try_get(&self) -> Option<ChunkBuf> {
        self.buffers.lock().pop()
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer is zeroed before it becomes available again. Buffers of
    /// the wrong size are dropped instead of pooled.
    pub fn put(&self, mut buf: ChunkBuf) {
        if buf.len() != self.buffer_size {
            return;
        }
        buf.zero();

        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Size of the buffers in this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total number of buffers the pool was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_buf_is_aligned_and_zeroed() {
        let buf = ChunkBuf::new(8192).unwrap();
        assert_eq!(buf.len(), 8192);
        assert!(buf.is_aligned());
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_size_is_an_error() {
        assert!(ChunkBuf::new(0).is_err());
        assert!(BufferPool::new(4096, 0).is_err());
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let pool = BufferPool::new(4096, 2).unwrap();
        let a = pool.try_get().unwrap();
        let b = pool.try_get().unwrap();
        assert!(pool.try_get().is_none());

        pool.put(a);
        assert_eq!(pool.available(), 1);
        pool.put(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn pool_zeroes_returned_buffers() {
        let pool = BufferPool::new(4096, 1).unwrap();
        let mut buf = pool.try_get().unwrap();
        buf[0] = 0xAB;
        pool.put(buf);

        let buf = pool.try_get().unwrap();
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn mismatched_size_is_dropped() {
        let pool = BufferPool::new(4096, 1).unwrap();
        let _ = pool.try_get().unwrap();
        pool.put(ChunkBuf::new(8192).unwrap());
        assert_eq!(pool.available(), 0);
    }
}
