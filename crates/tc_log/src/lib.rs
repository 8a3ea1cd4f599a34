//! Text logging for use in the tomocast crates.
//!
//! * `trace`: spammy things
//! * `debug`: things that might be useful when debugging (dropped buffers, stale slices, …)
//! * `info`: things that we want to show to users (state changes, tomogram counts, …)
//! * `warn`: problems that we can recover from (protocol errors, buffer overflows, …)
//! * `error`: problems that lead to loss of functionality or data
//!
//! The `warn_once` etc macros are for when you want to suppress repeated
//! logging of the exact same message, e.g. per-frame protocol complaints.

pub use log::{Level, LevelFilter, debug, error, info, trace, warn};
pub use log_once::{debug_once, error_once, info_once, trace_once, warn_once};

mod setup;

pub use setup::setup_logging;
