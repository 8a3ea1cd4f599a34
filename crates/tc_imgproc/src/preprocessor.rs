use std::sync::Arc;

use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, Axis};

use tc_log::info;
use tc_types::{ImageprocParams, PaganinParams};

use crate::flatfield::{flat_field, negative_log};
use crate::paganin::Paganin;
use crate::ramp::{Filter, FilterFactory, UnknownFilter};

/// Drives flat-field correction, phase retrieval / negative log and ramp
/// filtering over a thread arena, then reorders the chunk into sinogram
/// layout.
///
/// The arena worker count equals the filters' internal buffer count so
/// per-thread scratch is race-free. The Paganin and ramp-filter instances
/// live here; recreating them on a parameter change is the application's
/// call via [`Self::init`].
pub struct Preprocessor {
    pool: rayon::ThreadPool,
    num_threads: usize,
    filter_factory: Arc<dyn FilterFactory>,
    ramp_filter: Option<Box<dyn Filter>>,
    paganin: Option<Paganin>,
    disable_negative_log: bool,
}

impl Preprocessor {
    pub fn new(filter_factory: Arc<dyn FilterFactory>, num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("preproc-{i}"))
            .build()
            .expect("failed to build the preprocessing thread pool");
        Self {
            pool,
            num_threads,
            filter_factory,
            ramp_filter: None,
            paganin: None,
            disable_negative_log: false,
        }
    }

    /// (Re)creates the filters for the given downsampled frame size.
    pub fn init(
        &mut self,
        col_count: usize,
        row_count: usize,
        imgproc_params: &ImageprocParams,
        paganin_params: Option<&PaganinParams>,
    ) -> Result<(), UnknownFilter> {
        self.ramp_filter = Some(self.filter_factory.create(
            &imgproc_params.ramp_filter.name,
            col_count,
            row_count,
            self.num_threads,
        )?);
        self.paganin =
            paganin_params.map(|params| Paganin::new(params, col_count, row_count, self.num_threads));
        self.disable_negative_log = imgproc_params.disable_negative_log;

        info!("- Ramp filter: {}", imgproc_params.ramp_filter.name);
        info!("- Number of image-processing threads: {}", self.num_threads);
        Ok(())
    }

    /// Preprocesses `projs` (shape `[G, rows, cols]`) in place and writes
    /// the index-transposed result (`[i, r, c] → [r, i, c]`) into `sinos`
    /// (shape `[rows, G, cols]`).
    pub fn process(
        &self,
        projs: &mut Array3<f32>,
        sinos: &mut Array3<f32>,
        dark_avg: &Array2<f32>,
        reciprocal: &Array2<f32>,
    ) {
        let (chunk_size, row_count, col_count) = projs.dim();
        debug_assert_eq!(sinos.dim(), (row_count, chunk_size, col_count));
        let ramp_filter = self
            .ramp_filter
            .as_ref()
            .expect("init() must run before process()");

        self.pool.install(|| {
            projs
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .for_each(|mut proj| {
                    let thread_idx = rayon::current_thread_index().unwrap_or(0);
                    let data = proj
                        .as_slice_mut()
                        .expect("chunk projections are contiguous");

                    flat_field(data, dark_avg, reciprocal);

                    // Paganin wins over the negative-log switch when both
                    // are configured.
                    if let Some(paganin) = &self.paganin {
                        paganin.apply(data, thread_idx);
                    } else if !self.disable_negative_log {
                        negative_log(data);
                    }

                    ramp_filter.apply(data, thread_idx);
                });

            let projs = &*projs;
            sinos
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(r, mut sino)| {
                    for i in 0..chunk_size {
                        sino.row_mut(i).assign(&projs.index_axis(Axis(0), i).row(r));
                    }
                });
        });
    }
}
