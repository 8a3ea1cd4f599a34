use std::collections::BTreeMap;
use std::time::Duration;

use ndarray::Array2;
use parking_lot::{Condvar, Mutex};

use crate::triple::wait_fresh;

/// One reconstructed slice generation.
#[derive(Clone, Debug)]
pub struct SliceEntry {
    /// Whether this entry holds a freshly produced reconstruction.
    pub ready: bool,
    /// Generation counter; `timestamp % MAX_NUM_SLICES` is the slot id.
    pub timestamp: u64,
    pub data: Array2<f32>,
}

impl SliceEntry {
    pub fn new(ready: bool, shape: (usize, usize)) -> Self {
        Self {
            ready,
            timestamp: 0,
            data: Array2::zeros(shape),
        }
    }
}

/// Slot id → slice entry.
pub type SliceMap = BTreeMap<usize, SliceEntry>;

/// A [`crate::TripleBuffer`] whose value is a map of slice entries.
///
/// The producer (the slice mediator) owns its back map, the consumer (the
/// RPC adapter) its front map; only the ready map lives here. In
/// **on-demand** mode the ready flag of every entry is cleared on the map
/// that goes stale at each swap, so a consumer only ever sees slices that
/// were actually reconstructed since its previous fetch.
pub struct SliceBuffer {
    inner: Mutex<Inner>,
    cv: Condvar,
    on_demand: bool,
}

struct Inner {
    ready: SliceMap,
    fresh: bool,
    shape: (usize, usize),
}

impl SliceBuffer {
    pub fn new(on_demand: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: SliceMap::new(),
                fresh: false,
                shape: (0, 0),
            }),
            cv: Condvar::new(),
            on_demand,
        }
    }

    pub fn on_demand(&self) -> bool {
        self.on_demand
    }

    /// Allocates the ready-map entry for a new slot id.
    ///
    /// Returns `false` if the slot already exists.
    pub fn insert(&self, index: usize) -> bool {
        let mut inner = self.inner.lock();
        let shape = inner.shape;
        let on_demand = self.on_demand;
        match inner.ready.entry(index) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(SliceEntry::new(!on_demand, shape));
                true
            }
        }
    }

    /// Resizes every ready-map entry; the producer and consumer maps catch
    /// up as they rotate through.
    pub fn resize(&self, shape: (usize, usize)) {
        let mut inner = self.inner.lock();
        inner.shape = shape;
        for entry in inner.ready.values_mut() {
            entry.data = Array2::zeros(shape);
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.inner.lock().shape
    }

    /// Number of tracked slots.
    pub fn len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes `back`. Returns `true` if an unconsumed map was dropped.
    pub fn prepare(&self, back: &mut SliceMap) -> bool {
        let dropped = {
            let mut inner = self.inner.lock();
            std::mem::swap(&mut inner.ready, back);
            if self.on_demand {
                for entry in back.values_mut() {
                    entry.ready = false;
                }
            }
            let dropped = inner.fresh;
            inner.fresh = true;
            dropped
        };
        self.cv.notify_one();
        dropped
    }

    /// Waits up to `timeout` (forever if `None`) for a fresh map and swaps
    /// it into `front`.
    pub fn fetch_into(&self, front: &mut SliceMap, timeout: Option<Duration>) -> bool {
        let mut inner = self.inner.lock();
        if !wait_fresh(&self.cv, &mut inner, timeout, |inner| inner.fresh) {
            return false;
        }
        std::mem::swap(&mut inner.ready, front);
        if self.on_demand {
            for entry in inner.ready.values_mut() {
                entry.ready = false;
            }
        }
        inner.fresh = false;
        true
    }

    /// Runs `f` on the current ready map, fresh or not.
    pub fn with_ready<R>(&self, f: impl FnOnce(&SliceMap) -> R) -> R {
        f(&self.inner.lock().ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_on_demand() {
        let buffer = SliceBuffer::new(false);
        assert!(!buffer.on_demand());

        assert!(buffer.insert(1));
        assert_eq!(buffer.len(), 1);
        buffer.resize((3, 5));
        assert!(buffer.insert(4));
        assert_eq!(buffer.len(), 2);
        assert!(!buffer.insert(4));
        assert_eq!(buffer.len(), 2);

        buffer.with_ready(|map| {
            for entry in map.values() {
                assert!(entry.ready);
                assert_eq!(entry.data.dim(), (3, 5));
            }
        });
        assert_eq!(buffer.shape(), (3, 5));

        let mut back = SliceMap::new();
        back.insert(1, SliceEntry::new(true, (3, 5)));
        back.insert(4, SliceEntry::new(true, (3, 5)));
        buffer.prepare(&mut back);

        let mut front = SliceMap::new();
        assert!(buffer.fetch_into(&mut front, None));
        assert!(front.values().all(|entry| entry.ready));
    }

    #[test]
    fn test_on_demand_flags_clear_on_swap() {
        let buffer = SliceBuffer::new(true);
        assert!(buffer.on_demand());

        buffer.resize((5, 6));
        buffer.insert(0);
        buffer.insert(1);
        buffer.insert(2);
        buffer.with_ready(|map| {
            for entry in map.values() {
                assert!(!entry.ready);
                assert_eq!(entry.data.dim(), (5, 6));
            }
        });

        // The producer marks every slot as freshly reconstructed.
        let mut back = SliceMap::new();
        for sid in 0..3 {
            let mut entry = SliceEntry::new(false, (5, 6));
            entry.ready = true;
            back.insert(sid, entry);
        }

        buffer.prepare(&mut back);
        let mut front = SliceMap::new();
        assert!(buffer.fetch_into(&mut front, None));
        assert!(front.values().all(|entry| entry.ready));

        // Publishing without reconstructing presents every slot as stale.
        buffer.prepare(&mut back);
        assert!(buffer.fetch_into(&mut front, None));
        buffer.with_ready(|map| assert!(map.values().all(|entry| !entry.ready)));
        assert!(front.values().all(|entry| !entry.ready));
    }

    #[test]
    fn test_prepare_reports_drop() {
        let buffer = SliceBuffer::new(false);
        buffer.resize((2, 2));
        let mut back = SliceMap::new();
        back.insert(0, SliceEntry::new(true, (2, 2)));

        assert!(!buffer.prepare(&mut back));
        assert!(buffer.prepare(&mut back));

        let mut front = SliceMap::new();
        assert!(buffer.fetch_into(&mut front, Some(Duration::ZERO)));
        assert!(!buffer.fetch_into(&mut front, Some(Duration::ZERO)));
    }
}
