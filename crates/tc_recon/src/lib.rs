//! Reconstruction of oriented slices and preview volumes from streamed
//! sinograms.
//!
//! The pipeline talks to reconstruction hardware through the
//! [`Reconstructor`] contract; [`FbpReconstructorFactory`] provides the
//! built-in software back-projector, and tests inject mocks through
//! [`ReconstructorFactory`].

mod solver;
mod transform;

pub use solver::{FbpReconstructor, FbpReconstructorFactory};
pub use transform::slice_transform;

use ndarray::{Array2, Array3};

use tc_types::{Orientation, ProjectionGeometry, VolumeGeometry};

/// The compute contract behind the pipeline.
///
/// `buffer_idx` selects one of the (up to two) projection memory slots;
/// uploads and reconstructions on the same slot must be serialized by the
/// caller, which the application does under its GPU mutex.
pub trait Reconstructor: Send {
    /// Copies a chunk of sinograms (shape `[rows, count, cols]`) into
    /// projection memory slot `buffer_idx`, advancing the slot's rolling
    /// angle window by `count`.
    fn upload_sinograms(&mut self, buffer_idx: usize, sinos: &Array3<f32>);

    /// Reconstructs the arbitrarily oriented slice onto `out`
    /// (shape `[slice_rows, slice_cols]`).
    fn reconstruct_slice(
        &mut self,
        orientation: Orientation,
        buffer_idx: usize,
        out: &mut Array2<f32>,
    );

    /// Reconstructs the preview volume onto `out`
    /// (shape `[cols, rows, slices]` flattened z-major per volume geometry).
    fn reconstruct_volume(&mut self, buffer_idx: usize, out: &mut Array3<f32>);
}

pub trait ReconstructorFactory: Send + Sync {
    fn create(
        &self,
        proj_geom: &ProjectionGeometry,
        slice_geom: &VolumeGeometry,
        volume_geom: &VolumeGeometry,
        double_buffering: bool,
    ) -> Box<dyn Reconstructor>;
}
