use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;

use tc_buffer::{SliceBuffer, SliceEntry, SliceMap};
use tc_log::{debug, info};
use tc_recon::Reconstructor;
use tc_types::{MAX_NUM_SLICES, Orientation, slice_id_from_timestamp};

struct Params {
    /// slot id → (timestamp, orientation).
    params: BTreeMap<usize, (u64, Orientation)>,
    /// Slot ids whose orientation changed since the last reconstruction.
    updated: HashSet<usize>,
}

/// Tracks the slice definitions requested by clients and orchestrates
/// periodic (every tomogram) and on-demand slice reconstruction.
///
/// Owns two slice buffers: `all_slices` is refreshed on every tomogram;
/// `ondemand_slices` only carries slices whose orientation changed since
/// the last cycle, produced between tomograms.
pub struct SliceMediator {
    state: Mutex<Params>,
    all_slices: SliceBuffer,
    ondemand_slices: SliceBuffer,
    all_back: Mutex<SliceMap>,
    ondemand_back: Mutex<SliceMap>,
}

impl Default for SliceMediator {
    fn default() -> Self {
        Self::new()
    }
}

impl SliceMediator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Params {
                params: BTreeMap::new(),
                updated: HashSet::new(),
            }),
            all_slices: SliceBuffer::new(false),
            ondemand_slices: SliceBuffer::new(true),
            all_back: Mutex::new(SliceMap::new()),
            ondemand_back: Mutex::new(SliceMap::new()),
        }
    }

    pub fn resize(&self, shape: (usize, usize)) {
        self.all_slices.resize(shape);
        self.ondemand_slices.resize(shape);
    }

    /// Registers or refreshes the slice slot addressed by `timestamp`.
    ///
    /// A timestamp older than the slot's current generation is stale and
    /// dropped.
    pub fn update(&self, timestamp: u64, orientation: Orientation) {
        let sid = slice_id_from_timestamp(timestamp);
        let mut state = self.state.lock();

        if let Some(&(current, _)) = state.params.get(&sid) {
            if timestamp < current {
                debug!("Stale request for slice {sid}: timestamp {timestamp} < {current}");
                return;
            }
        } else {
            self.all_slices.insert(sid);
            self.ondemand_slices.insert(sid);
        }

        state.params.insert(sid, (timestamp, orientation));
        state.updated.insert(sid);
        debug_assert!(state.params.len() <= MAX_NUM_SLICES);

        info!("Slice {sid} orientation updated");
    }

    /// Reconstructs every tracked slice into the all-slices buffer.
    pub fn recon_all(&self, recon: &mut dyn Reconstructor, gpu_buffer_index: usize) {
        let dropped = {
            let mut state = self.state.lock();
            let mut back = self.all_back.lock();
            let shape = self.all_slices.shape();

            for (&sid, &(timestamp, orientation)) in &state.params {
                let entry = reconcile_entry(&mut back, sid, shape, true);
                recon.reconstruct_slice(orientation, gpu_buffer_index, &mut entry.data);
                entry.timestamp = timestamp;
            }
            state.updated.clear();

            self.all_slices.prepare(&mut back)
        };

        if dropped {
            debug!("Reconstructed slices dropped due to slowness of clients");
        }
    }

    /// Reconstructs only the slices whose orientation changed since the
    /// last cycle, if any, into the on-demand buffer.
    pub fn recon_on_demand(&self, recon: &mut dyn Reconstructor, gpu_buffer_index: usize) {
        let mut state = self.state.lock();
        if state.updated.is_empty() {
            return;
        }

        let dropped = {
            let mut back = self.ondemand_back.lock();
            let shape = self.ondemand_slices.shape();

            for &sid in &state.updated {
                let &(timestamp, orientation) = state
                    .params
                    .get(&sid)
                    .expect("updated slots always have params");
                let entry = reconcile_entry(&mut back, sid, shape, false);
                recon.reconstruct_slice(orientation, gpu_buffer_index, &mut entry.data);
                entry.timestamp = timestamp;
                entry.ready = true;

                debug!("On-demand slice {sid} ({timestamp}) reconstructed");
            }
            state.updated.clear();

            self.ondemand_slices.prepare(&mut back)
        };

        if dropped {
            debug!("On-demand reconstructed slices dropped due to slowness of clients");
        }
    }

    pub fn all_slices(&self) -> &SliceBuffer {
        &self.all_slices
    }

    pub fn on_demand_slices(&self) -> &SliceBuffer {
        &self.ondemand_slices
    }

    /// Snapshot of the tracked parameters, for inspection.
    pub fn params(&self) -> BTreeMap<usize, (u64, Orientation)> {
        self.state.lock().params.clone()
    }
}

/// Back maps rotate through the triple buffer, so a given map may lag
/// behind on inserted slots or a resize; bring the entry up to date.
fn reconcile_entry(
    back: &mut SliceMap,
    sid: usize,
    shape: (usize, usize),
    ready: bool,
) -> &mut SliceEntry {
    let entry = back
        .entry(sid)
        .or_insert_with(|| SliceEntry::new(ready, shape));
    if entry.data.dim() != shape {
        entry.data = ndarray::Array2::zeros(shape);
    }
    entry
}
