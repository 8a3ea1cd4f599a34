//! The shared vocabulary of the tomocast reconstruction pipeline:
//! frame classification, beam and volume geometries, parameter structs
//! and the handful of pipeline-wide constants.

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------

/// Maximum number of concurrently tracked slices.
pub const MAX_NUM_SLICES: usize = 3;

pub const SCAN_UPDATE_INTERVAL_STEP: u32 = 16;
pub const MIN_SCAN_UPDATE_INTERVAL: u32 = 16;
pub const MAX_SCAN_UPDATE_INTERVAL: u32 = 128;

/// Recognized upper limits on the number of accumulated calibration images.
pub const MAX_NUM_DARKS: usize = 1000;
pub const MAX_NUM_FLATS: usize = 1000;

/// Capacity of the DAQ ingest queue, in frames.
pub const DAQ_BUFFER_SIZE: usize = 1000;
/// Log a received-projections progress message every this many frames.
pub const DAQ_MONITOR_EVERY: usize = 1000;
/// Capacity of the projection-preview image queue.
pub const PROJECTION_QUEUE_CAPACITY: usize = 10;

/// Raw detector pixel type.
pub type RawPixel = u16;
/// Processed pixel type.
pub type ProPixel = f32;

/// A slice plane in world coordinates: `[x-axis, y-axis, base]`,
/// each a 3-vector, flattened.
pub type Orientation = [f32; 9];

// ----------------------------------------------------------------------------

/// Classification of an incoming detector frame.
///
/// The discriminants match the `scan_index` values of the ingest wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionType {
    Dark = 0,
    Flat = 1,
    Projection = 2,
    Unknown = 99,
}

impl ProjectionType {
    pub fn from_scan_index(scan_index: i64) -> Self {
        match scan_index {
            0 => Self::Dark,
            1 => Self::Flat,
            2 => Self::Projection,
            _ => Self::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeamShape {
    #[default]
    Parallel,
    Cone,
}

/// The server state machine: `Unknown → Ready ↔ Acquiring`, `Ready ↔ Processing`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServerState {
    #[default]
    Unknown = 0,
    Ready = 1,
    Acquiring = 2,
    Processing = 3,
}

impl ServerState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Ready,
            2 => Self::Acquiring,
            3 => Self::Processing,
            _ => Self::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    #[default]
    Discrete,
    Continuous,
}

/// Is `interval` a valid continuous-mode update interval?
pub fn valid_scan_update_interval(interval: u32) -> bool {
    (MIN_SCAN_UPDATE_INTERVAL..=MAX_SCAN_UPDATE_INTERVAL).contains(&interval)
        && interval % SCAN_UPDATE_INTERVAL_STEP == 0
}

// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProjectionGeometry {
    pub beam_shape: BeamShape,
    /// Number of detector columns.
    pub col_count: usize,
    /// Number of detector rows.
    pub row_count: usize,
    /// Width of each detector pixel.
    pub pixel_width: f32,
    /// Height of each detector pixel.
    pub pixel_height: f32,
    pub source2origin: f32,
    pub origin2detector: f32,
    /// Projection angles, one per frame of a tomogram.
    pub angles: Vec<f32>,
}

/// Equispaced angles over `[0, π)`.
pub fn default_angles(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| i as f32 * std::f32::consts::PI / n as f32)
        .collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VolumeGeometry {
    pub col_count: usize,
    pub row_count: usize,
    pub slice_count: usize,
    pub min_x: f32,
    pub max_x: f32,
    pub min_y: f32,
    pub max_y: f32,
    pub min_z: f32,
    pub max_z: f32,
}

// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RampFilterParams {
    /// `"shepp"` (Shepp-Logan) or `"ramlak"` (Ram-Lak).
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageprocParams {
    pub num_threads: usize,
    pub downsampling_col: u32,
    pub downsampling_row: u32,
    pub disable_negative_log: bool,
    pub ramp_filter: RampFilterParams,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PaganinParams {
    pub pixel_size: f32,
    /// X-ray wavelength λ.
    pub lambda: f32,
    /// Refractive index decrement δ.
    pub delta: f32,
    /// Absorption index β.
    pub beta: f32,
    /// Propagation distance between sample and detector.
    pub distance: f32,
}

impl Default for PaganinParams {
    fn default() -> Self {
        Self {
            pixel_size: 1.0,
            lambda: 1.239_841_9e-9,
            delta: 1e-8,
            beta: 1e-10,
            distance: 40.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RpcServerConfig {
    pub port: u16,
}

// ----------------------------------------------------------------------------

/// The slot a slice generation counter addresses.
///
/// For any slice in any buffer, `timestamp % MAX_NUM_SLICES` is its slot id;
/// updating a slot advances its timestamp by `MAX_NUM_SLICES`.
pub fn slice_id_from_timestamp(timestamp: u64) -> usize {
    (timestamp % MAX_NUM_SLICES as u64) as usize
}

/// Round `s` up to a multiple of `chunk_size`.
pub fn expand_data_size_for_gpu(s: usize, chunk_size: usize) -> usize {
    if s % chunk_size == 0 {
        s
    } else {
        (s / chunk_size + 1) * chunk_size
    }
}

// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_type_from_scan_index() {
        assert_eq!(ProjectionType::from_scan_index(0), ProjectionType::Dark);
        assert_eq!(ProjectionType::from_scan_index(1), ProjectionType::Flat);
        assert_eq!(
            ProjectionType::from_scan_index(2),
            ProjectionType::Projection
        );
        assert_eq!(ProjectionType::from_scan_index(3), ProjectionType::Unknown);
        assert_eq!(ProjectionType::from_scan_index(-1), ProjectionType::Unknown);
    }

    #[test]
    fn test_default_angles() {
        let angles = default_angles(4);
        assert_eq!(angles.len(), 4);
        assert_eq!(angles[0], 0.0);
        assert!((angles[1] - std::f32::consts::PI / 4.0).abs() < 1e-6);
        assert!(angles.iter().all(|&a| a < std::f32::consts::PI));
    }

    #[test]
    fn test_slice_id_from_timestamp() {
        assert_eq!(slice_id_from_timestamp(0), 0);
        assert_eq!(slice_id_from_timestamp(4), 1);
        assert_eq!(slice_id_from_timestamp(5), 2);
        assert_eq!(
            slice_id_from_timestamp(7 + MAX_NUM_SLICES as u64),
            slice_id_from_timestamp(7)
        );
    }

    #[test]
    fn test_valid_scan_update_interval() {
        assert!(valid_scan_update_interval(16));
        assert!(valid_scan_update_interval(128));
        assert!(valid_scan_update_interval(32));
        assert!(!valid_scan_update_interval(0));
        assert!(!valid_scan_update_interval(8));
        assert!(!valid_scan_update_interval(24));
        assert!(!valid_scan_update_interval(144));
    }

    #[test]
    fn test_expand_data_size_for_gpu() {
        assert_eq!(expand_data_size_for_gpu(128, 64), 128);
        assert_eq!(expand_data_size_for_gpu(100, 64), 128);
        assert_eq!(expand_data_size_for_gpu(1, 64), 64);
    }
}
