//! Chunk allocators.
//!
//! Archetypes obtain their fixed-size chunk blocks through the
//! [`ChunkAllocator`] capability: one call to get a block, one to give it
//! back. The store never assumes anything about the algorithm behind it.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Source of chunk memory for archetypes.
///
/// `allocate` returns `None` on exhaustion; the caller decides what to do
/// with that. Implementations must be callable from whichever thread owns
/// the archetype, which is why the trait requires `Send + Sync`.
pub trait ChunkAllocator: Send + Sync {
    /// Allocate a block of `layout.size()` bytes aligned to `layout.align()`.
    /// `layout.size()` is never zero.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a block to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

impl<A: ChunkAllocator + ?Sized> ChunkAllocator for Arc<A> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        (**self).deallocate(ptr, layout)
    }
}

// ---------------------------------------------------------------------------
// SystemAllocator
// ---------------------------------------------------------------------------

/// Allocates chunks from the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl ChunkAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}

// ---------------------------------------------------------------------------
// NullAllocator
// ---------------------------------------------------------------------------

/// An allocator that never has memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAllocator;

impl ChunkAllocator for NullAllocator {
    fn allocate(&self, _layout: Layout) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        panic!("NullAllocator never hands out blocks");
    }
}

// ---------------------------------------------------------------------------
// ChunkPool
// ---------------------------------------------------------------------------

/// Recycles released blocks of one layout instead of returning them to the
/// backing allocator.
///
/// Blocks of any other layout go straight through. At most `max_free`
/// blocks are kept; anything beyond is handed back immediately.
pub struct ChunkPool<A: ChunkAllocator> {
    backing: A,
    layout: Layout,
    max_free: usize,
    free: Mutex<Vec<NonNull<u8>>>,
}

// The pooled pointers are unused blocks owned by the pool.
unsafe impl<A: ChunkAllocator> Send for ChunkPool<A> {}
unsafe impl<A: ChunkAllocator> Sync for ChunkPool<A> {}

impl<A: ChunkAllocator> ChunkPool<A> {
    /// Create a pool recycling blocks of `layout`.
    pub fn new(backing: A, layout: Layout, max_free: usize) -> Self {
        Self {
            backing,
            layout,
            max_free,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Number of blocks currently waiting for reuse.
    pub fn free_blocks(&self) -> usize {
        self.free.lock().len()
    }

    /// Return every pooled block to the backing allocator.
    pub fn release_free(&self) {
        let blocks = std::mem::take(&mut *self.free.lock());
        for block in blocks {
            unsafe { self.backing.deallocate(block, self.layout) };
        }
    }
}

impl<A: ChunkAllocator> ChunkAllocator for ChunkPool<A> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout == self.layout {
            if let Some(block) = self.free.lock().pop() {
                return Some(block);
            }
        }
        self.backing.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout == self.layout {
            let mut free = self.free.lock();
            if free.len() < self.max_free {
                free.push(ptr);
                return;
            }
        }
        self.backing.deallocate(ptr, layout);
    }
}

impl<A: ChunkAllocator> Drop for ChunkPool<A> {
    fn drop(&mut self) {
        self.release_free();
    }
}

impl<A: ChunkAllocator> std::fmt::Debug for ChunkPool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("layout", &self.layout)
            .field("max_free", &self.max_free)
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CountingAllocator
// ---------------------------------------------------------------------------

/// Wraps another allocator and counts outstanding blocks and bytes.
#[derive(Debug, Default)]
pub struct CountingAllocator<A: ChunkAllocator> {
    inner: A,
    live_blocks: AtomicUsize,
    live_bytes: AtomicUsize,
    total_allocations: AtomicUsize,
}

impl<A: ChunkAllocator> CountingAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            live_blocks: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
        }
    }

    /// Blocks handed out and not yet returned.
    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::Relaxed)
    }

    /// Bytes handed out and not yet returned.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Successful allocations over the allocator's lifetime.
    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(Ordering::Relaxed)
    }
}

impl<A: ChunkAllocator> ChunkAllocator for CountingAllocator<A> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let block = self.inner.allocate(layout)?;
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(layout.size(), Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(layout.size(), Ordering::Relaxed);
        self.inner.deallocate(ptr, layout);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
