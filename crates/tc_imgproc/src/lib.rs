//! CPU preprocessing of raw projections: flat-field correction, optional
//! Paganin phase retrieval, ramp filtering and the sinogram reordering
//! that feeds the reconstructor.

mod flatfield;
mod paganin;
mod preprocessor;
mod ramp;

pub use flatfield::{average, compute_reciprocal, downsample, flat_field, negative_log};
pub use paganin::Paganin;
pub use preprocessor::Preprocessor;
pub use ramp::{Filter, FilterFactory, RampFilter, RampFilterFactory, RampFilterKind, UnknownFilter};
