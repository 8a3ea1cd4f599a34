use ndarray::Array2;

use tc_types::{ProPixel, RawPixel};

/// Pixel-wise mean of a stack of raw images.
///
/// Returns zeros of `shape` when the stack is empty.
pub fn average(images: &[Array2<RawPixel>], shape: (usize, usize)) -> Array2<ProPixel> {
    let mut avg = Array2::<ProPixel>::zeros(shape);
    if images.is_empty() {
        return avg;
    }
    for image in images {
        debug_assert_eq!(image.dim(), shape);
        avg.zip_mut_with(image, |a, &v| *a += ProPixel::from(v));
    }
    avg /= images.len() as ProPixel;
    avg
}

/// Averages the darks and flats and computes the per-pixel reciprocal
/// `1 / (flat_avg − dark_avg)`, with `1.0` wherever the denominator is
/// zero.
///
/// Returns `(dark_avg, reciprocal)` at source resolution.
pub fn compute_reciprocal(
    darks: &[Array2<RawPixel>],
    flats: &[Array2<RawPixel>],
    shape: (usize, usize),
) -> (Array2<ProPixel>, Array2<ProPixel>) {
    let dark_avg = average(darks, shape);
    let flat_avg = average(flats, shape);

    let mut reciprocal = Array2::<ProPixel>::zeros(shape);
    for ((r, &d), &f) in reciprocal.iter_mut().zip(dark_avg.iter()).zip(flat_avg.iter()) {
        *r = if d == f { 1.0 } else { 1.0 / (f - d) };
    }

    (dark_avg, reciprocal)
}

/// Nearest-neighbor stride decimation of `src` into `dst`.
pub fn downsample(src: &Array2<ProPixel>, dst: &mut Array2<ProPixel>) {
    let (src_rows, src_cols) = src.dim();
    let (dst_rows, dst_cols) = dst.dim();
    let ds_row = src_rows / dst_rows;
    let ds_col = src_cols / dst_cols;
    debug_assert!(ds_row >= 1);
    debug_assert!(ds_col >= 1);
    for i in 0..dst_rows {
        for j in 0..dst_cols {
            dst[[i, j]] = src[[i * ds_row, j * ds_col]];
        }
    }
}

/// In-place flat-field correction: `p = (p − dark) * reciprocal`.
pub fn flat_field(data: &mut [ProPixel], dark_avg: &Array2<ProPixel>, reciprocal: &Array2<ProPixel>) {
    debug_assert_eq!(data.len(), dark_avg.len());
    debug_assert_eq!(data.len(), reciprocal.len());
    for ((p, &d), &r) in data
        .iter_mut()
        .zip(dark_avg.iter())
        .zip(reciprocal.iter())
    {
        *p = (*p - d) * r;
    }
}

/// In-place `p = −ln(p)` with non-positive values clamped to zero.
pub fn negative_log(data: &mut [ProPixel]) {
    for p in data.iter_mut() {
        *p = if *p <= 0.0 { 0.0 } else { -p.ln() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_all_near(actual: &[f32], expected: &[f32], eps: f32) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < eps, "index {i}: {a} vs {e}");
        }
    }

    #[test]
    fn test_downsample() {
        let src = array![
            [0.0_f32, 1., 2., 3.],
            [1., 2., 3., 4.],
            [2., 3., 4., 5.],
            [3., 4., 5., 6.],
        ];
        let mut dst = Array2::zeros((2, 2));
        downsample(&src, &mut dst);
        assert_eq!(dst, array![[0.0_f32, 2.], [2., 4.]]);

        let src = array![
            [0.0_f32, 1., 2., 3., 4.],
            [1., 2., 3., 4., 5.],
            [2., 3., 4., 5., 6.],
            [3., 4., 5., 6., 7.],
            [4., 5., 6., 7., 8.],
            [5., 6., 7., 8., 9.],
            [6., 7., 8., 9., 10.],
        ];
        let mut dst = Array2::zeros((3, 2));
        downsample(&src, &mut dst);
        assert_eq!(dst, array![[0.0_f32, 2.], [2., 4.], [4., 6.]]);
    }

    #[test]
    fn test_identity_downsample_preserves() {
        let src = array![[1.0_f32, 2., 3.], [4., 5., 6.]];
        let mut dst = Array2::zeros((2, 3));
        downsample(&src, &mut dst);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_compute_reciprocal() {
        let shape = (4, 3);
        let darks = vec![
            Array2::from_shape_vec(shape, vec![4, 1, 1, 2, 0, 9, 7, 4, 3, 8, 6, 8]).unwrap(),
            Array2::from_shape_vec(shape, vec![1, 7, 3, 0, 6, 6, 0, 8, 1, 8, 4, 2]).unwrap(),
            Array2::from_shape_vec(shape, vec![2, 4, 6, 0, 9, 5, 8, 3, 4, 2, 2, 0]).unwrap(),
        ];
        let flats = vec![
            Array2::from_shape_vec(shape, vec![1, 9, 5, 1, 7, 9, 0, 6, 7, 1, 5, 6]).unwrap(),
            Array2::from_shape_vec(shape, vec![2, 4, 8, 1, 3, 9, 5, 6, 1, 1, 1, 7]).unwrap(),
            Array2::from_shape_vec(shape, vec![9, 9, 4, 1, 6, 8, 6, 9, 2, 4, 9, 4]).unwrap(),
        ];

        let (dark_avg, reciprocal) = compute_reciprocal(&darks, &flats, shape);

        assert_all_near(
            dark_avg.as_slice().unwrap(),
            &[
                2.333_333_3,
                4.,
                3.333_333_3,
                0.666_666_7,
                5.,
                6.666_666_7,
                5.,
                5.,
                2.666_666_7,
                6.,
                4.,
                3.333_333_3,
            ],
            1e-5,
        );
        assert_all_near(
            reciprocal.as_slice().unwrap(),
            &[
                0.599_999_96,
                0.299_999_98,
                0.428_571_43,
                3.000_000_2,
                2.999_998_6,
                0.5,
                -0.750_000_06,
                0.5,
                1.500_000_4,
                -0.25,
                1.,
                0.428_571_43,
            ],
            1e-5,
        );
    }

    #[test]
    fn test_reciprocal_is_one_where_flat_equals_dark() {
        let shape = (2, 2);
        let darks = vec![Array2::from_elem(shape, 3_u16)];
        let flats = vec![Array2::from_elem(shape, 3_u16)];
        let (_, reciprocal) = compute_reciprocal(&darks, &flats, shape);
        assert!(reciprocal.iter().all(|&r| r == 1.0));
    }

    #[test]
    fn test_average_is_permutation_invariant() {
        let shape = (2, 3);
        let a = Array2::from_shape_vec(shape, vec![1_u16, 2, 3, 4, 5, 6]).unwrap();
        let b = Array2::from_shape_vec(shape, vec![6_u16, 5, 4, 3, 2, 1]).unwrap();
        let c = Array2::from_shape_vec(shape, vec![2_u16, 2, 2, 2, 2, 2]).unwrap();

        let fwd = average(&[a.clone(), b.clone(), c.clone()], shape);
        let rev = average(&[c, b, a], shape);
        assert_eq!(fwd, rev);
    }

    #[test]
    fn test_flat_field() {
        let dark = array![[1.0_f32, 1.], [1., 1.]];
        let reciprocal = array![[0.5_f32, 0.5], [2., 2.]];
        let mut data = vec![3.0_f32, 5., 2., 1.];
        flat_field(&mut data, &dark, &reciprocal);
        assert_eq!(data, [1.0, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn test_negative_log() {
        let mut data = vec![1.0_f32, std::f32::consts::E, 0.0, -2.0];
        negative_log(&mut data);
        assert_all_near(&data, &[0.0, -1.0, 0.0, 0.0], 1e-6);
    }
}
