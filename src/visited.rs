//! visited.rs — pooled visited-bitmaps and the in-flight insertion set.

use parking_lot::{Condvar, Mutex};
use roaring::RoaringBitmap;

use crate::node::NodeId;

/// Bounded pool of reusable visited bitmaps, one loaned per search.
///
/// Sized to the hardware thread count at construction; `borrow` blocks on
/// a condvar when every bitmap is out on loan. Returned bitmaps are
/// cleared exactly once, in the guard's drop.
pub(crate) struct VisitedPool {
    free: Mutex<Vec<RoaringBitmap>>,
    returned: Condvar,
}

impl VisitedPool {
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            free: Mutex::new((0..size).map(|_| RoaringBitmap::new()).collect()),
            returned: Condvar::new(),
        }
    }

    /// Loan a bitmap, blocking until one is available.
    pub(crate) fn borrow(&self) -> VisitedGuard<'_> {
        let mut free = self.free.lock();
        loop {
            if let Some(bits) = free.pop() {
                return VisitedGuard { pool: self, bits };
            }
            self.returned.wait(&mut free);
        }
    }
}

/// A loaned visited bitmap; returns itself to the pool on drop.
pub(crate) struct VisitedGuard<'a> {
    pool: &'a VisitedPool,
    bits: RoaringBitmap,
}

impl VisitedGuard<'_> {
    /// Mark `id` visited; true when this is the first visit.
    #[inline]
    pub(crate) fn first_visit(&mut self, id: NodeId) -> bool {
        self.bits.insert(id as u32)
    }
}

impl Drop for VisitedGuard<'_> {
    fn drop(&mut self) {
        let mut bits = std::mem::take(&mut self.bits);
        bits.clear();
        self.pool.free.lock().push(bits);
        self.pool.returned.notify_one();
    }
}

/// Internal ids whose graph wiring is still in progress.
///
/// A writer publishes its id here before linking and clears it after, so
/// concurrent inserts never select a half-wired node as a neighbour.
#[derive(Default)]
pub(crate) struct InFlightSet {
    bits: Mutex<RoaringBitmap>,
}

impl InFlightSet {
    #[inline]
    pub(crate) fn insert(&self, id: NodeId) {
        self.bits.lock().insert(id as u32);
    }

    #[inline]
    pub(crate) fn remove(&self, id: NodeId) {
        self.bits.lock().remove(id as u32);
    }

    #[inline]
    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.bits.lock().contains(id as u32)
    }
}
