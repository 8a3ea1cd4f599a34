use glam::{Mat3, Vec3};
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, ArrayViewMut3, Axis};

use tc_log::debug;
use tc_types::{BeamShape, Orientation, ProjectionGeometry, VolumeGeometry};

use crate::transform::slice_transform;
use crate::{Reconstructor, ReconstructorFactory};

/// Per-angle projection vectors.
///
/// For a parallel beam `ray` is the ray direction; for a cone beam it is
/// the source position. `det` is the detector center, `px`/`py` the
/// column/row pixel steps.
#[derive(Clone, Copy, Debug)]
struct ProjectionVectors {
    ray: Vec3,
    det: Vec3,
    px: Vec3,
    py: Vec3,
}

fn base_vectors(geom: &ProjectionGeometry) -> Vec<ProjectionVectors> {
    geom.angles
        .iter()
        .map(|&theta| {
            let dir = Vec3::new(theta.sin(), -theta.cos(), 0.0);
            let px = Vec3::new(theta.cos(), theta.sin(), 0.0) * geom.pixel_width;
            let py = Vec3::new(0.0, 0.0, geom.pixel_height);
            match geom.beam_shape {
                BeamShape::Parallel => ProjectionVectors {
                    ray: dir,
                    det: Vec3::ZERO,
                    px,
                    py,
                },
                BeamShape::Cone => ProjectionVectors {
                    ray: -dir * geom.source2origin,
                    det: dir * geom.origin2detector,
                    px,
                    py,
                },
            }
        })
        .collect()
}

/// One projection-memory slot with its rolling angle cursor.
struct Slot {
    /// `[det_rows, angle_count, det_cols]`.
    data: Array3<f32>,
    cursor: usize,
}

/// Software voxel-driven filtered back-projection.
///
/// Implements the same contract as a GPU-backed reconstructor: projection
/// memory is single- or double-buffered, slices are reconstructed through
/// a per-call affine re-orientation of the projection vectors, and the
/// preview volume uses the unmodified geometry.
pub struct FbpReconstructor {
    beam_shape: BeamShape,
    vectors: Vec<ProjectionVectors>,
    det_cols: usize,
    det_rows: usize,
    slice_geom: VolumeGeometry,
    volume_geom: VolumeGeometry,
    slots: Vec<Slot>,
    /// Cone-beam FDK multipliers, `[angle][det_row][det_col]`.
    fdk_weights: Option<Vec<f32>>,
}

impl FbpReconstructor {
    pub fn new(
        proj_geom: &ProjectionGeometry,
        slice_geom: &VolumeGeometry,
        volume_geom: &VolumeGeometry,
        double_buffering: bool,
    ) -> Self {
        let vectors = base_vectors(proj_geom);
        let angle_count = vectors.len();
        let det_cols = proj_geom.col_count;
        let det_rows = proj_geom.row_count;

        let slots = (0..if double_buffering { 2 } else { 1 })
            .map(|i| {
                debug!(
                    "Allocated projection memory for sinogram buffer {i}: {:.1} MB",
                    (det_cols * angle_count * det_rows * size_of::<f32>()) as f64
                        / (1024.0 * 1024.0)
                );
                Slot {
                    data: Array3::zeros((det_rows, angle_count, det_cols)),
                    cursor: 0,
                }
            })
            .collect();

        let fdk_weights = (proj_geom.beam_shape == BeamShape::Cone)
            .then(|| fdk_weights(&vectors, det_rows, det_cols));

        Self {
            beam_shape: proj_geom.beam_shape,
            vectors,
            det_cols,
            det_rows,
            slice_geom: *slice_geom,
            volume_geom: *volume_geom,
            slots,
            fdk_weights,
        }
    }

    fn reoriented_vectors(&self, orientation: Orientation) -> Vec<ProjectionVectors> {
        let [a1x, a1y, a1z, a2x, a2y, a2z, bx, by, bz] = orientation;
        let axis_1 = Vec3::new(a1x, a1y, a1z);
        let axis_2 = Vec3::new(a2x, a2y, a2z);
        let base = Vec3::new(bx, by, bz);

        let k = self.slice_geom.max_x;
        let (delta, rot, scale) = slice_transform(base, axis_1, axis_2, k);

        let num_cols = self.det_cols as f32;
        let num_rows = self.det_rows as f32;

        self.vectors
            .iter()
            .map(|vec| match self.beam_shape {
                BeamShape::Parallel => {
                    let mut d = vec.det + 0.5 * (num_cols * vec.px + num_rows * vec.py);
                    let r = scale * (rot * vec.ray);
                    d = scale * (rot * (d + delta));
                    let px = scale * (rot * vec.px);
                    let py = scale * (rot * vec.py);
                    let d = d - 0.5 * (num_cols * px + num_rows * py);
                    ProjectionVectors {
                        ray: r,
                        det: d,
                        px,
                        py,
                    }
                }
                BeamShape::Cone => ProjectionVectors {
                    ray: scale * (rot * (vec.ray + delta)),
                    det: scale * (rot * (vec.det + delta)),
                    px: scale * (rot * vec.px),
                    py: scale * (rot * vec.py),
                },
            })
            .collect()
    }
}

/// Voxel-driven back-projection of `sino` onto the volume described by
/// `geom`, accumulating over all projection vectors.
fn backproject(
    beam_shape: BeamShape,
    sino: &Array3<f32>,
    vectors: &[ProjectionVectors],
    geom: &VolumeGeometry,
    mut out: ArrayViewMut3<'_, f32>,
) {
    let (det_rows, _, det_cols) = sino.dim();
    let half_u = 0.5 * (det_cols as f32 - 1.0);
    let half_v = 0.5 * (det_rows as f32 - 1.0);

    let (nz, ny, nx) = out.dim();
    debug_assert_eq!(
        (geom.slice_count, geom.row_count, geom.col_count),
        (nz, ny, nx)
    );
    let wx = (geom.max_x - geom.min_x) / nx as f32;
    let wy = (geom.max_y - geom.min_y) / ny as f32;
    let wz = (geom.max_z - geom.min_z) / nz as f32;

    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(iz, mut plane)| {
            let z = geom.min_z + (iz as f32 + 0.5) * wz;
            for iy in 0..ny {
                let y = geom.min_y + (iy as f32 + 0.5) * wy;
                for ix in 0..nx {
                    let x = geom.min_x + (ix as f32 + 0.5) * wx;
                    let voxel = Vec3::new(x, y, z);

                    let mut acc = 0.0_f32;
                    for (a, vec) in vectors.iter().enumerate() {
                        let (m, rhs) = match beam_shape {
                            BeamShape::Parallel => {
                                (Mat3::from_cols(vec.px, vec.py, vec.ray), voxel - vec.det)
                            }
                            BeamShape::Cone => (
                                Mat3::from_cols(vec.px, vec.py, vec.ray - voxel),
                                vec.ray - vec.det,
                            ),
                        };
                        if m.determinant().abs() < 1e-8 {
                            continue;
                        }
                        let uvt = m.inverse() * rhs;
                        acc += sample_bilinear(sino, a, uvt.y + half_v, uvt.x + half_u);
                    }
                    plane[[iy, ix]] = acc;
                }
            }
        });
}

/// Bilinear sample of `sino[[v, angle, u]]`, zero outside the detector.
fn sample_bilinear(sino: &Array3<f32>, angle: usize, v: f32, u: f32) -> f32 {
    let (det_rows, _, det_cols) = sino.dim();
    if !u.is_finite() || !v.is_finite() {
        return 0.0;
    }

    let u0 = u.floor();
    let v0 = v.floor();
    let fu = u - u0;
    let fv = v - v0;

    let mut acc = 0.0;
    for (dv, wv) in [(0_i64, 1.0 - fv), (1, fv)] {
        for (du, wu) in [(0_i64, 1.0 - fu), (1, fu)] {
            let ui = u0 as i64 + du;
            let vi = v0 as i64 + dv;
            if ui >= 0 && vi >= 0 && (ui as usize) < det_cols && (vi as usize) < det_rows {
                acc += wv * wu * sino[[vi as usize, angle, ui as usize]];
            }
        }
    }
    acc
}

/// Feldkamp-Davis-Kress geometric weights `ρ / ‖y − s‖` per
/// (projection, detector row, detector column).
fn fdk_weights(vectors: &[ProjectionVectors], det_rows: usize, det_cols: usize) -> Vec<f32> {
    let mut weights = vec![0.0_f32; vectors.len() * det_rows * det_cols];
    for (a, vec) in vectors.iter().enumerate() {
        let source = vec.ray;
        let rho = (vec.det - source).length();
        for r in 0..det_rows {
            for c in 0..det_cols {
                let y = vec.det + r as f32 * vec.py + c as f32 * vec.px;
                weights[(a * det_rows + r) * det_cols + c] = rho / (y - source).length();
            }
        }
    }
    weights
}

impl Reconstructor for FbpReconstructor {
    fn upload_sinograms(&mut self, buffer_idx: usize, sinos: &Array3<f32>) {
        debug!("Copying sinogram to projection buffer {buffer_idx}");

        let (det_rows, count, det_cols) = sinos.dim();
        debug_assert_eq!(det_rows, self.det_rows);
        debug_assert_eq!(det_cols, self.det_cols);

        let angle_count = self.vectors.len();
        let slot = &mut self.slots[buffer_idx];
        for i in 0..count.min(angle_count) {
            let a = (slot.cursor + i) % angle_count;
            for v in 0..det_rows {
                for u in 0..det_cols {
                    let weight = self
                        .fdk_weights
                        .as_ref()
                        .map_or(1.0, |w| w[(a * det_rows + v) * det_cols + u]);
                    slot.data[[v, a, u]] = sinos[[v, i, u]] * weight;
                }
            }
        }
        slot.cursor = (slot.cursor + count) % angle_count;
    }

    fn reconstruct_slice(
        &mut self,
        orientation: Orientation,
        buffer_idx: usize,
        out: &mut Array2<f32>,
    ) {
        let [a1x, a1y, a1z, a2x, a2y, a2z, ..] = orientation;
        let axis_1 = Vec3::new(a1x, a1y, a1z);
        let axis_2 = Vec3::new(a2x, a2y, a2z);
        if axis_1.cross(axis_2).length_squared() < 1e-8 {
            // Collinear slice axes span no plane; report an empty slice.
            debug!("Degenerate slice orientation, returning a zero slice");
            out.fill(0.0);
            return;
        }

        debug!("Reconstructing slice with buffer index: {buffer_idx}");
        let vectors = self.reoriented_vectors(orientation);
        backproject(
            self.beam_shape,
            &self.slots[buffer_idx].data,
            &vectors,
            &self.slice_geom,
            out.view_mut().insert_axis(Axis(0)),
        );
    }

    fn reconstruct_volume(&mut self, buffer_idx: usize, out: &mut Array3<f32>) {
        debug!("Reconstructing volume with buffer index: {buffer_idx}");
        backproject(
            self.beam_shape,
            &self.slots[buffer_idx].data,
            &self.vectors,
            &self.volume_geom,
            out.view_mut(),
        );
    }
}

/// Creates the software back-projector.
#[derive(Clone, Copy, Debug, Default)]
pub struct FbpReconstructorFactory;

impl ReconstructorFactory for FbpReconstructorFactory {
    fn create(
        &self,
        proj_geom: &ProjectionGeometry,
        slice_geom: &VolumeGeometry,
        volume_geom: &VolumeGeometry,
        double_buffering: bool,
    ) -> Box<dyn Reconstructor> {
        Box::new(FbpReconstructor::new(
            proj_geom,
            slice_geom,
            volume_geom,
            double_buffering,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tc_types::default_angles;

    fn proj_geom(beam_shape: BeamShape, cols: usize, rows: usize, angles: usize) -> ProjectionGeometry {
        ProjectionGeometry {
            beam_shape,
            col_count: cols,
            row_count: rows,
            pixel_width: 1.0,
            pixel_height: 1.0,
            source2origin: 10.0,
            origin2detector: 5.0,
            angles: default_angles(angles),
        }
    }

    fn slab_geom(n: usize) -> VolumeGeometry {
        VolumeGeometry {
            col_count: n,
            row_count: n,
            slice_count: 1,
            min_x: -(n as f32) / 2.0,
            max_x: n as f32 / 2.0,
            min_y: -(n as f32) / 2.0,
            max_y: n as f32 / 2.0,
            min_z: -0.5,
            max_z: 0.5,
        }
    }

    fn cube_geom(n: usize) -> VolumeGeometry {
        VolumeGeometry {
            col_count: n,
            row_count: n,
            slice_count: n,
            min_x: -(n as f32) / 2.0,
            max_x: n as f32 / 2.0,
            min_y: -(n as f32) / 2.0,
            max_y: n as f32 / 2.0,
            min_z: -(n as f32) / 2.0,
            max_z: n as f32 / 2.0,
        }
    }

    fn axis_aligned_slice() -> Orientation {
        [2.0, 0.0, 0.0, 0.0, 2.0, 0.0, -1.0, -1.0, 0.0]
    }

    #[test]
    fn test_parallel_volume_center_accumulates_all_angles() {
        let geom = proj_geom(BeamShape::Parallel, 3, 3, 4);
        let mut recon = FbpReconstructor::new(&geom, &slab_geom(3), &cube_geom(3), false);

        recon.upload_sinograms(0, &Array3::ones((3, 4, 3)));
        let mut volume = Array3::zeros((3, 3, 3));
        recon.reconstruct_volume(0, &mut volume);

        // The center voxel projects onto the detector center under every
        // angle; with a unit sinogram it sums one per angle.
        assert!((volume[[1, 1, 1]] - 4.0).abs() < 1e-4);
        assert!(volume.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_cone_volume_center_accumulates_all_angles() {
        let geom = proj_geom(BeamShape::Cone, 3, 3, 4);
        let mut recon = FbpReconstructor::new(&geom, &slab_geom(3), &cube_geom(3), false);

        recon.upload_sinograms(0, &Array3::ones((3, 4, 3)));
        let mut volume = Array3::zeros((3, 3, 3));
        recon.reconstruct_volume(0, &mut volume);

        // The FDK weight at the detector center ray is close to 1 for the
        // center voxel path, so the sum stays near the angle count.
        assert!(volume[[1, 1, 1]] > 3.0);
        assert!(volume.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_axis_aligned_slice_matches_detector_center() {
        let geom = proj_geom(BeamShape::Parallel, 3, 3, 4);
        let mut recon = FbpReconstructor::new(&geom, &slab_geom(3), &cube_geom(3), false);

        recon.upload_sinograms(0, &Array3::ones((3, 4, 3)));
        let mut slice = Array2::zeros((3, 3));
        recon.reconstruct_slice(axis_aligned_slice(), 0, &mut slice);
        assert!((slice[[1, 1]] - 4.0).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_orientation_gives_zero_slice() {
        let geom = proj_geom(BeamShape::Parallel, 3, 3, 4);
        let mut recon = FbpReconstructor::new(&geom, &slab_geom(3), &cube_geom(3), false);
        recon.upload_sinograms(0, &Array3::ones((3, 4, 3)));

        let mut slice = Array2::from_elem((3, 3), 7.0_f32);
        let collinear = [1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        recon.reconstruct_slice(collinear, 0, &mut slice);
        assert!(slice.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_double_buffered_slots_are_independent() {
        let geom = proj_geom(BeamShape::Parallel, 3, 3, 4);
        let mut recon = FbpReconstructor::new(&geom, &slab_geom(3), &cube_geom(3), true);

        recon.upload_sinograms(0, &Array3::ones((3, 4, 3)));
        recon.upload_sinograms(1, &(Array3::ones((3, 4, 3)) * 2.0));

        let mut a = Array3::zeros((3, 3, 3));
        let mut b = Array3::zeros((3, 3, 3));
        recon.reconstruct_volume(0, &mut a);
        recon.reconstruct_volume(1, &mut b);
        assert!((a[[1, 1, 1]] - 4.0).abs() < 1e-4);
        assert!((b[[1, 1, 1]] - 8.0).abs() < 1e-4);
    }

    #[test]
    fn test_rolling_window_upload() {
        let geom = proj_geom(BeamShape::Parallel, 2, 1, 4);
        let mut recon = FbpReconstructor::new(&geom, &slab_geom(2), &cube_geom(2), false);

        recon.upload_sinograms(0, &Array3::from_elem((1, 2, 2), 1.0));
        recon.upload_sinograms(0, &Array3::from_elem((1, 2, 2), 2.0));
        {
            let slot = &recon.slots[0];
            assert_eq!(slot.cursor, 0);
            assert_eq!(slot.data[[0, 0, 0]], 1.0);
            assert_eq!(slot.data[[0, 1, 0]], 1.0);
            assert_eq!(slot.data[[0, 2, 0]], 2.0);
            assert_eq!(slot.data[[0, 3, 0]], 2.0);
        }

        // The window wraps around.
        recon.upload_sinograms(0, &Array3::from_elem((1, 2, 2), 3.0));
        let slot = &recon.slots[0];
        assert_eq!(slot.cursor, 2);
        assert_eq!(slot.data[[0, 0, 0]], 3.0);
        assert_eq!(slot.data[[0, 1, 0]], 3.0);
        assert_eq!(slot.data[[0, 2, 0]], 2.0);
    }

    #[test]
    fn test_full_chunk_upload_overwrites_in_place() {
        let geom = proj_geom(BeamShape::Parallel, 2, 1, 4);
        let mut recon = FbpReconstructor::new(&geom, &slab_geom(2), &cube_geom(2), false);

        recon.upload_sinograms(0, &Array3::from_elem((1, 4, 2), 1.0));
        recon.upload_sinograms(0, &Array3::from_elem((1, 4, 2), 5.0));
        let slot = &recon.slots[0];
        assert_eq!(slot.cursor, 0);
        assert!(slot.data.iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_fdk_weights_start_at_one_and_attenuate() {
        let geom = proj_geom(BeamShape::Cone, 4, 3, 2);
        let recon = FbpReconstructor::new(&geom, &slab_geom(4), &cube_geom(4), false);
        let weights = recon.fdk_weights.as_ref().unwrap();

        // At the detector origin the ray length equals ρ.
        assert!((weights[0] - 1.0).abs() < 1e-6);
        for &w in weights {
            assert!(w > 0.0 && w <= 1.0 + 1e-6);
        }
    }
}
