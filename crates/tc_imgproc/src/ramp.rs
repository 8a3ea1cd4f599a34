use std::sync::Arc;

use parking_lot::Mutex;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// A per-projection filter applied by the preprocessing arena.
///
/// `thread_idx` selects per-thread scratch storage; callers must hand out
/// distinct indices to concurrently running threads.
pub trait Filter: Send + Sync + std::fmt::Debug {
    fn apply(&self, data: &mut [f32], thread_idx: usize);
}

/// Constructs filters by name, so the pipeline can be exercised with mock
/// filters in tests.
pub trait FilterFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        num_cols: usize,
        num_rows: usize,
        buffer_count: usize,
    ) -> Result<Box<dyn Filter>, UnknownFilter>;
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown ramp filter: {0}")]
pub struct UnknownFilter(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RampFilterKind {
    /// `H(k) = (2 / n) · |k|`.
    Ramlak,
    /// Ram-Lak tapered by `sinc(π k)`; `H(0) = 0`.
    Shepp,
}

/// Signed frequency of each FFT bin, in cycles per sample:
/// `{0, 1, …, mid−1, −mid, …, −1} / n`.
pub(crate) fn frequency(n: usize) -> Vec<f32> {
    let mid = n.div_ceil(2);
    (0..n)
        .map(|i| {
            if i < mid {
                i as f32 / n as f32
            } else {
                i as f32 / n as f32 - 1.0
            }
        })
        .collect()
}

fn ramlak_weights(n: usize) -> Vec<f32> {
    // The 2/n compensates for the unnormalized FFT round trip.
    let c = 2.0 / n as f32;
    frequency(n).into_iter().map(|f| c * f.abs()).collect()
}

fn shepp_weights(n: usize) -> Vec<f32> {
    let c = 2.0 / n as f32;
    let mut weights = frequency(n);
    for w in weights.iter_mut().skip(1) {
        let tmp = std::f32::consts::PI * *w;
        *w = c * (*w * tmp.sin() / tmp).abs();
    }
    weights
}

struct Scratch {
    line: Vec<Complex<f32>>,
    fft: Vec<Complex<f32>>,
    ifft: Vec<Complex<f32>>,
}

/// Band-limited ramp filter: per detector row, FFT of length `num_cols`,
/// multiply by the frequency weights, inverse FFT.
///
/// One FFT plan pair is shared across all rows and threads; each thread
/// gets its own complex scratch line.
pub struct RampFilter {
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    weights: Vec<f32>,
    scratch: Vec<Mutex<Scratch>>,
    num_cols: usize,
    num_rows: usize,
}

impl RampFilter {
    pub fn new(kind: RampFilterKind, num_cols: usize, num_rows: usize, buffer_count: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(num_cols);
        let ifft = planner.plan_fft_inverse(num_cols);

        let weights = match kind {
            RampFilterKind::Ramlak => ramlak_weights(num_cols),
            RampFilterKind::Shepp => shepp_weights(num_cols),
        };

        let scratch = (0..buffer_count.max(1))
            .map(|_| {
                Mutex::new(Scratch {
                    line: vec![Complex::default(); num_cols],
                    fft: vec![Complex::default(); fft.get_inplace_scratch_len()],
                    ifft: vec![Complex::default(); ifft.get_inplace_scratch_len()],
                })
            })
            .collect();

        Self {
            fft,
            ifft,
            weights,
            scratch,
            num_cols,
            num_rows,
        }
    }
}

impl std::fmt::Debug for RampFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RampFilter")
            .field("num_cols", &self.num_cols)
            .field("num_rows", &self.num_rows)
            .finish_non_exhaustive()
    }
}

impl Filter for RampFilter {
    fn apply(&self, data: &mut [f32], thread_idx: usize) {
        debug_assert_eq!(data.len(), self.num_rows * self.num_cols);

        let mut scratch = self.scratch[thread_idx % self.scratch.len()].lock();
        let Scratch { line, fft, ifft } = &mut *scratch;

        for row in data.chunks_exact_mut(self.num_cols) {
            for (c, &v) in line.iter_mut().zip(row.iter()) {
                *c = Complex::new(v, 0.0);
            }
            self.fft.process_with_scratch(line, fft);
            for (c, &w) in line.iter_mut().zip(self.weights.iter()) {
                *c *= w;
            }
            self.ifft.process_with_scratch(line, ifft);
            for (v, c) in row.iter_mut().zip(line.iter()) {
                *v = c.re;
            }
        }
    }
}

/// The default [`FilterFactory`]: `"shepp"` and `"ramlak"`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RampFilterFactory;

impl FilterFactory for RampFilterFactory {
    fn create(
        &self,
        name: &str,
        num_cols: usize,
        num_rows: usize,
        buffer_count: usize,
    ) -> Result<Box<dyn Filter>, UnknownFilter> {
        let kind = match name {
            "shepp" => RampFilterKind::Shepp,
            "ramlak" => RampFilterKind::Ramlak,
            _ => return Err(UnknownFilter(name.to_owned())),
        };
        Ok(Box::new(RampFilter::new(
            kind,
            num_cols,
            num_rows,
            buffer_count,
        )))
    }
}
