use std::sync::Arc;

use parking_lot::Mutex;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use tc_types::PaganinParams;

use crate::ramp::frequency;

struct Scratch {
    image: Vec<Complex<f32>>,
    column: Vec<Complex<f32>>,
    plan: Vec<Complex<f32>>,
}

/// Single-material Paganin phase retrieval.
///
/// Per projection: 2-D forward FFT, multiplication by the spectral filter
/// `1 / (1 + k (u² + v²))` with `k = λ · distance · δ / (4π β)` and `u, v`
/// in angular frequency units of the detector pixel size, inverse FFT,
/// then the guarded negative log that brings the result back into the
/// attenuation convention of the rest of the pipeline.
pub struct Paganin {
    filter: Vec<f32>,
    fft_row: Arc<dyn Fft<f32>>,
    ifft_row: Arc<dyn Fft<f32>>,
    fft_col: Arc<dyn Fft<f32>>,
    ifft_col: Arc<dyn Fft<f32>>,
    scratch: Vec<Mutex<Scratch>>,
    num_cols: usize,
    num_rows: usize,
}

impl Paganin {
    pub fn new(params: &PaganinParams, num_cols: usize, num_rows: usize, buffer_count: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft_row = planner.plan_fft_forward(num_cols);
        let ifft_row = planner.plan_fft_inverse(num_cols);
        let fft_col = planner.plan_fft_forward(num_rows);
        let ifft_col = planner.plan_fft_inverse(num_rows);

        let k = params.lambda * params.distance * params.delta
            / (4.0 * std::f32::consts::PI * params.beta);
        let angular = 2.0 * std::f32::consts::PI / params.pixel_size;
        let freq_u: Vec<f32> = frequency(num_cols).into_iter().map(|f| f * angular).collect();
        let freq_v: Vec<f32> = frequency(num_rows).into_iter().map(|f| f * angular).collect();

        let mut filter = vec![0.0_f32; num_rows * num_cols];
        for (r, &v) in freq_v.iter().enumerate() {
            for (c, &u) in freq_u.iter().enumerate() {
                filter[r * num_cols + c] = 1.0 / (1.0 + k * (u * u + v * v));
            }
        }

        let plan_len = [&fft_row, &ifft_row, &fft_col, &ifft_col]
            .into_iter()
            .map(|p| p.get_inplace_scratch_len())
            .max()
            .unwrap_or(0);
        let scratch = (0..buffer_count.max(1))
            .map(|_| {
                Mutex::new(Scratch {
                    image: vec![Complex::default(); num_rows * num_cols],
                    column: vec![Complex::default(); num_rows],
                    plan: vec![Complex::default(); plan_len],
                })
            })
            .collect();

        Self {
            filter,
            fft_row,
            ifft_row,
            fft_col,
            ifft_col,
            scratch,
            num_cols,
            num_rows,
        }
    }

    /// Applies the filter to one projection in place.
    pub fn apply(&self, data: &mut [f32], thread_idx: usize) {
        debug_assert_eq!(data.len(), self.num_rows * self.num_cols);

        let mut scratch = self.scratch[thread_idx % self.scratch.len()].lock();
        let Scratch {
            image,
            column,
            plan,
        } = &mut *scratch;

        for (c, &v) in image.iter_mut().zip(data.iter()) {
            *c = Complex::new(v, 0.0);
        }

        for row in image.chunks_exact_mut(self.num_cols) {
            self.fft_row.process_with_scratch(row, plan);
        }
        self.transform_columns(image, column, plan, &self.fft_col);

        for (c, &f) in image.iter_mut().zip(self.filter.iter()) {
            *c *= f;
        }

        for row in image.chunks_exact_mut(self.num_cols) {
            self.ifft_row.process_with_scratch(row, plan);
        }
        self.transform_columns(image, column, plan, &self.ifft_col);

        // The FFT round trip is unnormalized.
        let norm = 1.0 / (self.num_rows * self.num_cols) as f32;
        for (v, c) in data.iter_mut().zip(image.iter()) {
            let value = c.re * norm;
            *v = if value <= 0.0 { 0.0 } else { -value.ln() };
        }
    }

    fn transform_columns(
        &self,
        image: &mut [Complex<f32>],
        column: &mut [Complex<f32>],
        plan: &mut [Complex<f32>],
        fft: &Arc<dyn Fft<f32>>,
    ) {
        for c in 0..self.num_cols {
            for r in 0..self.num_rows {
                column[r] = image[r * self.num_cols + c];
            }
            fft.process_with_scratch(column, plan);
            for r in 0..self.num_rows {
                image[r * self.num_cols + c] = column[r];
            }
        }
    }
}
