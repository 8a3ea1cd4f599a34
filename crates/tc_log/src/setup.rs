//! Function to set up logging in binaries.

/// Directs [`log`] calls to stderr.
///
/// The default filter is `info`; override it with the `RUST_LOG`
/// environment variable (e.g. `RUST_LOG=tc_server=debug`).
pub fn setup_logging() {
    fn setup() {
        let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());

        let mut builder = env_logger::Builder::new();
        builder.parse_filters(&log_filter);
        builder.init();
    }

    use std::sync::Once;
    static START: Once = Once::new();
    START.call_once(setup);
}
