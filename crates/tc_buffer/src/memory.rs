use std::collections::VecDeque;
use std::time::Duration;

use ndarray::{Array3, Axis};
use nohash_hasher::IntMap;
use parking_lot::{Condvar, Mutex};

use tc_log::warn;

use crate::triple::wait_fresh;

/// Groups incoming frames into chunks of `group_size` consecutive
/// projections, downsampling each frame into its row of a 3-D tensor
/// `[group_size, rows, cols]`.
///
/// A fixed ring of `capacity` chunk slots backs the assembly. Frames
/// belonging to a chunk older than the oldest resident one are dropped as
/// outdated; frames ahead of the newest resident chunk allocate new chunks,
/// evicting the oldest when no free slot remains. When a chunk completes,
/// every older chunk is dropped (it is now definitively late) and the
/// completed chunk is signalled ready for exactly one [`Self::fetch_into`].
///
/// Slot reuse never touches element data; a producer must overwrite all
/// `group_size` rows of a chunk for its contents to be meaningful.
pub struct MemoryBuffer {
    inner: Mutex<Inner>,
    cv: Condvar,
    capacity: usize,
}

struct Inner {
    /// Chunk indices currently resident, oldest first.
    chunk_indices: VecDeque<usize>,
    /// chunk index → slot index.
    map: IntMap<usize, usize>,
    slots: Vec<Array3<f32>>,
    unoccupied: VecDeque<usize>,
    /// Per-slot fill counter.
    counter: Vec<usize>,
    is_ready: bool,
    /// `[group_size, rows, cols]`.
    shape: (usize, usize, usize),
}

impl Inner {
    fn register_chunk(&mut self, chunk_idx: usize) {
        let slot = self
            .unoccupied
            .pop_front()
            .expect("a free slot is made available before registering");
        self.chunk_indices.push_back(chunk_idx);
        self.map.insert(chunk_idx, slot);
    }

    /// Drops the oldest resident chunk and returns its index.
    fn pop_front_chunk(&mut self) -> usize {
        let chunk_idx = self
            .chunk_indices
            .pop_front()
            .expect("pop_front_chunk requires a resident chunk");
        let slot = self.map.remove(&chunk_idx).expect("resident chunks are mapped");
        self.counter[slot] = 0;
        self.unoccupied.push_back(slot);
        self.is_ready = false;
        chunk_idx
    }

    fn reset_state(&mut self, capacity: usize) {
        self.is_ready = false;
        self.chunk_indices.clear();
        self.map.clear();
        self.unoccupied.clear();
        for i in 0..capacity {
            self.counter[i] = 0;
            self.unoccupied.push_back(i);
        }
    }
}

impl MemoryBuffer {
    /// A buffer of `capacity` chunk slots. The slots are zero-sized until
    /// the first [`Self::resize`].
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "'capacity' must be positive. Actual: {capacity}");
        Self {
            inner: Mutex::new(Inner {
                chunk_indices: VecDeque::new(),
                map: IntMap::default(),
                slots: (0..capacity).map(|_| Array3::zeros((0, 0, 0))).collect(),
                unoccupied: (0..capacity).collect(),
                counter: vec![0; capacity],
                is_ready: false,
                shape: (0, 0, 0),
            }),
            cv: Condvar::new(),
            capacity,
        }
    }

    /// Resets all assembly state and reallocates the slots to
    /// `[group_size, rows, cols]`.
    pub fn resize(&self, shape: (usize, usize, usize)) {
        let mut inner = self.inner.lock();
        let capacity = self.capacity;
        inner.reset_state(capacity);
        inner.shape = shape;
        for slot in &mut inner.slots {
            if slot.dim() != shape {
                *slot = Array3::zeros(shape);
            }
        }
    }

    /// Drops all resident chunks; slot data is left as-is.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let capacity = self.capacity;
        inner.reset_state(capacity);
    }

    /// Routes the frame with the given global `index` into its chunk row,
    /// downsampling `src` of shape `src_shape` (rows, cols) by stride
    /// decimation.
    pub fn fill<D>(&self, index: usize, src: &[D], src_shape: (usize, usize))
    where
        D: Copy,
        f32: From<D>,
    {
        debug_assert_eq!(src.len(), src_shape.0 * src_shape.1);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (group_size, dst_rows, dst_cols) = inner.shape;
        if group_size == 0 {
            warn!("Memory buffer not initialized, frame {index} ignored!");
            return;
        }

        let chunk_idx = index / group_size;
        let row_idx = index % group_size;

        if inner.chunk_indices.is_empty() {
            inner.register_chunk(chunk_idx);
        } else {
            let newest = *inner.chunk_indices.back().expect("non-empty");
            let oldest = *inner.chunk_indices.front().expect("non-empty");
            if chunk_idx > newest {
                for i in newest + 1..=chunk_idx {
                    if inner.unoccupied.is_empty() {
                        let dropped = inner.pop_front_chunk();
                        warn!("Memory buffer is full! Chunk {dropped} dropped!");
                    }
                    inner.register_chunk(i);
                }
            } else if chunk_idx < oldest {
                warn!("Received projection with outdated chunk index: {chunk_idx}, data ignored!");
                return;
            }
        }

        let Some(&slot_idx) = inner.map.get(&chunk_idx) else {
            // The chunk was evicted between registration and this frame.
            warn!("Received projection for dropped chunk {chunk_idx}, data ignored!");
            return;
        };

        let ds_r = src_shape.0 / dst_rows;
        let ds_c = src_shape.1 / dst_cols;
        debug_assert!(ds_r >= 1 && ds_c >= 1);
        let mut row = inner.slots[slot_idx].index_axis_mut(Axis(0), row_idx);
        for i in 0..dst_rows {
            for j in 0..dst_cols {
                row[[i, j]] = f32::from(src[i * ds_r * src_shape.1 + j * ds_c]);
            }
        }

        // The same row index arriving twice still advances the counter; the
        // upstream contract is that frame indices are not duplicated.
        inner.counter[slot_idx] += 1;
        if inner.counter[slot_idx] == group_size {
            while *inner.chunk_indices.front().expect("non-empty") != chunk_idx {
                let dropped = inner.pop_front_chunk();
                warn!("Chunk {chunk_idx} is ready! Earlier chunk {dropped} dropped!");
            }
            inner.is_ready = true;
            drop(guard);
            self.cv.notify_one();
        }
    }

    /// Waits up to `timeout` (forever if `None`) for a completed chunk and
    /// swaps it into `front`.
    pub fn fetch_into(&self, front: &mut Array3<f32>, timeout: Option<Duration>) -> bool {
        let mut guard = self.inner.lock();
        if !wait_fresh(&self.cv, &mut guard, timeout, |inner| inner.is_ready) {
            return false;
        }
        let inner = &mut *guard;
        let chunk_idx = *inner
            .chunk_indices
            .front()
            .expect("a ready buffer has a resident chunk");
        let slot_idx = inner.map[&chunk_idx];
        let shape = inner.shape;
        let slot = &mut inner.slots[slot_idx];
        if slot.dim() == front.dim() {
            std::mem::swap(slot, front);
        } else {
            *front = std::mem::replace(slot, Array3::zeros(shape));
        }
        inner.pop_front_chunk();
        true
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of chunk slots currently occupied.
    pub fn occupied(&self) -> usize {
        self.capacity - self.inner.lock().unoccupied.len()
    }

    /// Whether a completed chunk is waiting to be fetched.
    pub fn has_ready(&self) -> bool {
        self.inner.lock().is_ready
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.inner.lock().shape
    }

    /// Runs `f` on the oldest resident chunk, complete or not.
    pub fn with_oldest_chunk<R>(&self, f: impl FnOnce(&Array3<f32>) -> R) -> Option<R> {
        let inner = self.inner.lock();
        let chunk_idx = inner.chunk_indices.front()?;
        let slot_idx = *inner.map.get(chunk_idx)?;
        Some(f(&inner.slots[slot_idx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(data: &[u16]) -> Vec<u16> {
        data.to_vec()
    }

    fn make_buffer() -> MemoryBuffer {
        let buffer = MemoryBuffer::new(3);
        buffer.resize((4, 2, 3));
        buffer
    }

    fn chunk_values(front: &Array3<f32>) -> Vec<f32> {
        front.iter().copied().collect()
    }

    #[test]
    #[should_panic(expected = "'capacity' must be positive")]
    fn test_zero_capacity_panics() {
        let _ = MemoryBuffer::new(0);
    }

    #[test]
    fn test_general() {
        let buffer = make_buffer();
        assert_eq!(buffer.capacity(), 3);
        assert_eq!(buffer.occupied(), 0);
        assert!(buffer.with_oldest_chunk(|_| ()).is_none());

        buffer.fill(0, &raw(&[1, 2, 3, 4, 5, 6]), (2, 3));
        assert_eq!(buffer.occupied(), 1);
        // Downsampled by (1, 2):
        buffer.fill(1, &raw(&[6, 1, 5, 1, 4, 1, 3, 1, 2, 1, 1, 1]), (2, 6));
        // Downsampled by (2, 2):
        buffer.fill(
            2,
            &raw(&[
                1, 1, 2, 1, 3, 1, //
                1, 1, 2, 1, 3, 1, //
                4, 1, 5, 1, 6, 1, //
                4, 1, 5, 1, 6, 1,
            ]),
            (4, 6),
        );
        // Truncating strides (5/2, 7/3):
        buffer.fill(
            3,
            &raw(&[
                6, 1, 5, 1, 4, 1, 1, //
                6, 1, 5, 1, 4, 1, 1, //
                3, 1, 2, 1, 1, 1, 1, //
                3, 1, 2, 1, 1, 1, 1, //
                1, 1, 1, 1, 1, 1, 1,
            ]),
            (5, 7),
        );

        let mut front = Array3::zeros((4, 2, 3));
        assert!(buffer.fetch_into(&mut front, None));
        assert_eq!(
            chunk_values(&front),
            [
                1., 2., 3., 4., 5., 6., //
                6., 5., 4., 3., 2., 1., //
                1., 2., 3., 4., 5., 6., //
                6., 5., 4., 3., 2., 1.,
            ]
        );
        assert_eq!(buffer.occupied(), 0);
        assert!(!buffer.fetch_into(&mut front, Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_buffer_full() {
        let buffer = make_buffer();
        for j in 0..4 {
            buffer.fill(j, &raw(&[1, 2, 3, 4, 5, 6]), (2, 3));
        }
        assert_eq!(buffer.occupied(), 1);

        for j in 0..4 {
            buffer.fill(4 + j, &raw(&[6, 5, 4, 3, 2, 1]), (2, 3));
        }
        // Group 0 was dropped when group 1 completed.
        assert_eq!(buffer.occupied(), 1);
        let expected: Vec<f32> = [6., 5., 4., 3., 2., 1.].repeat(4);
        assert_eq!(
            buffer.with_oldest_chunk(chunk_values).unwrap(),
            expected
        );

        // Jump ahead to group 5; groups 1 and 2 get pushed out by ring
        // pressure on the way.
        for j in 0..3 {
            buffer.fill(4 * 5 + j, &raw(&[4, 5, 6, 7, 8, 9]), (2, 3));
        }
        assert_eq!(buffer.occupied(), 3);

        // Group 4 is still resident and accepts frames.
        for j in 0..3 {
            buffer.fill(4 * 4 + j, &raw(&[1, 3, 5, 7, 9, 11]), (2, 3));
        }
        assert_eq!(buffer.occupied(), 3);

        // Completing group 5 drops groups 3 and 4.
        buffer.fill(4 * 5 + 3, &raw(&[9, 8, 7, 6, 5, 4]), (2, 3));
        assert_eq!(buffer.occupied(), 1);

        let mut front = Array3::zeros((4, 2, 3));
        assert!(buffer.fetch_into(&mut front, None));
        assert_eq!(
            chunk_values(&front),
            [
                4., 5., 6., 7., 8., 9., //
                4., 5., 6., 7., 8., 9., //
                4., 5., 6., 7., 8., 9., //
                9., 8., 7., 6., 5., 4.,
            ]
        );
    }

    #[test]
    fn test_same_index_received_repeatedly() {
        // The fill counter advances even for repeated indices; the contract
        // assumes upstream never duplicates them, and the buffer stays
        // consistent either way.
        let buffer = make_buffer();
        let mut front = Array3::zeros((4, 2, 3));
        for i in 0..8 {
            for j in 0..4 {
                buffer.fill(j, &raw(&[1, 2, 3, 4, 5, 6]), (2, 3));
            }
            if i % 2 == 0 {
                assert!(buffer.fetch_into(&mut front, Some(Duration::ZERO)));
            }

            for j in 0..2 {
                buffer.fill(4 + j, &raw(&[1, 2, 3, 4, 5, 6]), (2, 3));
            }
            if i % 2 == 1 {
                assert!(buffer.fetch_into(&mut front, Some(Duration::ZERO)));
                assert_eq!(buffer.occupied(), 0);
            } else {
                assert_eq!(buffer.occupied(), 1);
            }
        }
    }

    #[test]
    fn test_resize() {
        let buffer = make_buffer();
        for j in 0..4 {
            buffer.fill(j, &raw(&[1, 2, 3, 4, 5, 6]), (2, 3));
        }
        assert_eq!(buffer.occupied(), 1);
        assert_eq!(buffer.shape(), (4, 2, 3));

        // Expanding resets all state.
        buffer.resize((4, 3, 4));
        assert_eq!(buffer.occupied(), 0);
        assert_eq!(buffer.shape(), (4, 3, 4));
        for j in 0..4 {
            buffer.fill(j, &raw(&[1, 2, 3, 4, 5, 6, 1, 2, 3, 4, 5, 6]), (3, 4));
        }
        assert_eq!(buffer.occupied(), 1);

        // Shrinking, too.
        buffer.resize((4, 2, 3));
        assert_eq!(buffer.occupied(), 0);
        assert_eq!(buffer.shape(), (4, 2, 3));
    }

    #[test]
    fn test_exactly_one_fetch_observes_a_ready_chunk() {
        let buffer = std::sync::Arc::new(make_buffer());
        for j in 0..4 {
            buffer.fill(j, &raw(&[1, 2, 3, 4, 5, 6]), (2, 3));
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let buffer = buffer.clone();
            handles.push(std::thread::spawn(move || {
                let mut front = Array3::zeros((4, 2, 3));
                buffer.fetch_into(&mut front, Some(Duration::from_millis(50)))
            }));
        }
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(successes, 1);
    }
}
