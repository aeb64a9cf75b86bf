//! # Pooled Buffer Pool
//!
//! Reusable growable byte buffers behind reference-counted checkout handles.
//! The pool exists so that the steady-state message rate costs zero heap
//! allocations: producers borrow a buffer, fill it, hand it to a transport
//! writer thread, and the buffer returns to the free list once the last
//! handle is dropped.
//!
//! ## Lifetime Model
//!
//! A buffer slot is either *free* (sitting in the pool's free list with no
//! live references) or *checked out* (owned jointly by all handles cloned
//! from one checkout). [`BufferHandle::clone`] is the add-reference
//! operation; dropping a handle is the release. The handle that drives the
//! count to zero resets the content, bumps the slot's generation counter and
//! pushes the slot back onto the free list.
//!
//! ## Stale Access Detection
//!
//! Each slot carries a monotonically increasing generation, incremented on
//! every return to the pool. A [`WeakBufferHandle`] remembers the generation
//! it was created under and refuses to upgrade once the slot has been
//! recycled - a use-after-return bug surfaces as [`StaleHandleError`] rather
//! than silently reading another occupant's bytes.
//!
//! Content is reset on every return *and* every checkout, so residual data
//! from a prior lessee is never visible to a new one. This is a correctness
//! requirement, not an optimization: buffers are reused across distinct
//! message types and distinct threads.

use crossbeam::queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Error returned when a pooled buffer is accessed through a handle whose
/// checkout has already ended.
///
/// This always indicates a lifetime bug in the caller, never a transient
/// condition - the handle outlived the checkout it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stale buffer handle: held generation {held} does not match slot generation {current}")]
pub struct StaleHandleError {
    /// Generation the handle was created under
    pub held: u64,
    /// The slot's current generation
    pub current: u64,
}

/// A single reusable buffer plus its bookkeeping.
///
/// `refs` is the live reference count for the current checkout (0 while the
/// slot sits in the free list). `generation` increments on every return to
/// the pool, invalidating handles from earlier checkouts.
#[derive(Debug)]
struct BufferSlot {
    refs: AtomicI32,
    generation: AtomicU64,
    content: Mutex<Vec<u8>>,
}

impl BufferSlot {
    fn lock_content(&self) -> MutexGuard<'_, Vec<u8>> {
        // A poisoned lock only means a holder panicked mid-write; the byte
        // content has no internal invariants, so recover the guard.
        self.content.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
struct PoolInner {
    free: SegQueue<Arc<BufferSlot>>,
    initial_capacity: usize,
    slots_created: AtomicUsize,
    checkouts: AtomicU64,
}

impl PoolInner {
    /// Shared release path for owning handles and failed weak upgrades.
    /// The caller that drives the count to zero performs the recycle.
    fn release(&self, slot: &Arc<BufferSlot>) {
        let prev = slot.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(
            prev >= 1,
            "pooled buffer released more times than it was referenced (count was {prev})"
        );
        if prev == 1 {
            slot.lock_content().clear();
            slot.generation.fetch_add(1, Ordering::AcqRel);
            self.free.push(Arc::clone(slot));
        }
    }
}

/// Statistics about pool usage, useful for monitoring steady-state behavior:
/// once the system warms up, `slots_created` should stop growing while
/// `checkouts` keeps climbing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total buffer slots ever allocated by this pool
    pub slots_created: usize,
    /// Total checkout operations served
    pub checkouts: u64,
    /// Slots currently sitting in the free list
    pub free_slots: usize,
}

/// A pool of reusable byte buffers shared by every producer and both
/// transport reader threads.
///
/// `checkout` never blocks: it pops a free slot or lazily allocates a new
/// one. Slots are only destroyed with the pool itself (process lifetime).
/// Cloning the pool is cheap and yields another handle to the same free
/// list.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool whose freshly allocated slots start with the given
    /// capacity. Buffers still grow past this on demand; the capacity only
    /// sets the no-reallocation baseline.
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: SegQueue::new(),
                initial_capacity,
                slots_created: AtomicUsize::new(0),
                checkouts: AtomicU64::new(0),
            }),
        }
    }

    /// Borrows a buffer from the pool, producing the checkout's first handle.
    ///
    /// Pops a free slot if one exists, otherwise allocates a new slot. The
    /// buffer content is reset (logical length 0) before the handle is
    /// returned, so the new lessee never observes a prior occupant's bytes.
    pub fn checkout(&self) -> BufferHandle {
        let slot = match self.inner.free.pop() {
            Some(slot) => slot,
            None => {
                self.inner.slots_created.fetch_add(1, Ordering::Relaxed);
                Arc::new(BufferSlot {
                    refs: AtomicI32::new(0),
                    generation: AtomicU64::new(0),
                    content: Mutex::new(Vec::with_capacity(self.inner.initial_capacity)),
                })
            }
        };
        self.inner.checkouts.fetch_add(1, Ordering::Relaxed);
        slot.lock_content().clear();

        let prev = slot.refs.swap(1, Ordering::AcqRel);
        assert_eq!(prev, 0, "checked out a buffer slot that still had {prev} live references");

        BufferHandle {
            generation: slot.generation.load(Ordering::Acquire),
            slot,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Returns a snapshot of the pool's usage counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slots_created: self.inner.slots_created.load(Ordering::Relaxed),
            checkouts: self.inner.checkouts.load(Ordering::Relaxed),
            free_slots: self.inner.free.len(),
        }
    }
}

/// An owning reference to a checked-out pooled buffer.
///
/// Cloning a handle is the add-reference operation and yields an equal
/// handle usable independently from another thread; dropping a handle is the
/// release. A handle must be cloned *before* being handed across a thread
/// boundary, and each receiving thread owns exactly one release.
///
/// Content access goes through [`bytes`](Self::bytes) /
/// [`try_bytes`](Self::try_bytes), which validate liveness first.
#[derive(Debug)]
pub struct BufferHandle {
    slot: Arc<BufferSlot>,
    generation: u64,
    pool: Arc<PoolInner>,
}

impl BufferHandle {
    /// Locks the buffer content for reading or writing.
    ///
    /// # Panics
    ///
    /// Panics if the handle no longer matches the slot's live checkout. That
    /// is a use-after-return bug in the caller and is deliberately fatal
    /// rather than recoverable.
    pub fn bytes(&self) -> BufferGuard<'_> {
        match self.try_bytes() {
            Ok(guard) => guard,
            Err(e) => panic!("fatal pooled buffer misuse: {e}"),
        }
    }

    /// Non-panicking variant of [`bytes`](Self::bytes).
    pub fn try_bytes(&self) -> Result<BufferGuard<'_>, StaleHandleError> {
        let current = self.slot.generation.load(Ordering::Acquire);
        if self.slot.refs.load(Ordering::Acquire) <= 0 || current != self.generation {
            return Err(StaleHandleError { held: self.generation, current });
        }
        Ok(BufferGuard {
            guard: self.slot.lock_content(),
        })
    }

    /// Creates a non-owning view of the same checkout. The weak handle does
    /// not keep the buffer alive and fails to upgrade once the slot has been
    /// recycled.
    pub fn downgrade(&self) -> WeakBufferHandle {
        WeakBufferHandle {
            slot: Arc::clone(&self.slot),
            generation: self.generation,
            pool: Arc::clone(&self.pool),
        }
    }

    /// The generation this handle was checked out under. Diagnostic only.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Clone for BufferHandle {
    fn clone(&self) -> Self {
        let prev = self.slot.refs.fetch_add(1, Ordering::AcqRel);
        // An owning handle implies a live checkout; anything else means a
        // release/clone race the caller must not have created.
        assert!(
            prev >= 1,
            "attempted to add a reference to a pooled buffer that was already released"
        );
        Self {
            slot: Arc::clone(&self.slot),
            generation: self.generation,
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.pool.release(&self.slot);
    }
}

/// A non-owning reference to a checkout, usable for stale-access detection.
///
/// Upgrading re-validates both the reference count and the generation, so an
/// upgrade attempted after the checkout ended yields [`StaleHandleError`] -
/// even if the slot has since been checked out by a new lessee.
#[derive(Debug, Clone)]
pub struct WeakBufferHandle {
    slot: Arc<BufferSlot>,
    generation: u64,
    pool: Arc<PoolInner>,
}

impl WeakBufferHandle {
    /// Attempts to regain an owning handle for the original checkout.
    pub fn upgrade(&self) -> Result<BufferHandle, StaleHandleError> {
        // Take a provisional reference first; once the count is raised the
        // slot cannot be recycled underneath us, making the generation check
        // race-free.
        let mut refs = self.slot.refs.load(Ordering::Acquire);
        loop {
            if refs <= 0 {
                return Err(StaleHandleError {
                    held: self.generation,
                    current: self.slot.generation.load(Ordering::Acquire),
                });
            }
            match self.slot.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => refs = actual,
            }
        }

        let current = self.slot.generation.load(Ordering::Acquire);
        if current != self.generation {
            // The slot was recycled (and possibly re-checked-out) before we
            // got here; give back the provisional reference through the
            // normal release path.
            self.pool.release(&self.slot);
            return Err(StaleHandleError {
                held: self.generation,
                current,
            });
        }

        Ok(BufferHandle {
            slot: Arc::clone(&self.slot),
            generation: self.generation,
            pool: Arc::clone(&self.pool),
        })
    }

    /// Whether the original checkout is still live.
    pub fn is_live(&self) -> bool {
        self.slot.refs.load(Ordering::Acquire) > 0
            && self.slot.generation.load(Ordering::Acquire) == self.generation
    }
}

/// RAII guard over a pooled buffer's content.
///
/// Derefs to `Vec<u8>`, so callers can use the full growable-buffer API.
/// Holding the guard serializes access between handles that share a
/// checkout.
#[derive(Debug)]
pub struct BufferGuard<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

impl Deref for BufferGuard<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.guard
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.guard
    }
}
