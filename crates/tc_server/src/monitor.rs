use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use tc_log::{debug, info};

const REPORT_TOMO_THROUGHPUT_EVERY: usize = 10;
const REPORT_PROJECTIONS_EVERY: usize = 100;
const REPORT_DARKS_EVERY: usize = 10;
const REPORT_FLATS_EVERY: usize = 10;

/// Counts what flows through a run and reports throughput.
pub struct Monitor {
    /// Bytes of one full scan, for MB/s reporting.
    scan_byte_size: usize,
    num_darks: AtomicUsize,
    num_flats: AtomicUsize,
    num_projections: AtomicUsize,
    num_tomograms: AtomicUsize,
    timers: Mutex<Timers>,
}

struct Timers {
    start: Instant,
    tomo_start: Instant,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Monitor {
    pub fn new(scan_byte_size: usize) -> Self {
        let now = Instant::now();
        Self {
            scan_byte_size,
            num_darks: AtomicUsize::new(0),
            num_flats: AtomicUsize::new(0),
            num_projections: AtomicUsize::new(0),
            num_tomograms: AtomicUsize::new(0),
            timers: Mutex::new(Timers {
                start: now,
                tomo_start: now,
            }),
        }
    }

    pub fn reset_timer(&self) {
        let now = Instant::now();
        let mut timers = self.timers.lock();
        timers.start = now;
        timers.tomo_start = now;
    }

    pub fn count_dark(&self) {
        let n = self.num_darks.fetch_add(1, Ordering::Relaxed) + 1;
        if n % REPORT_DARKS_EVERY == 0 {
            info!("# of darks received: {n}");
        }
    }

    pub fn count_flat(&self) {
        let n = self.num_flats.fetch_add(1, Ordering::Relaxed) + 1;
        if n % REPORT_FLATS_EVERY == 0 {
            info!("# of flats received: {n}");
        }
    }

    pub fn count_projection(&self) {
        let n = self.num_projections.fetch_add(1, Ordering::Relaxed) + 1;
        if n % REPORT_PROJECTIONS_EVERY == 0 {
            debug!("# of projections consumed: {n}");
        }
    }

    pub fn count_tomogram(&self) {
        let n = self.num_tomograms.fetch_add(1, Ordering::Relaxed) + 1;
        info!("{n} tomograms reconstructed");

        if n % REPORT_TOMO_THROUGHPUT_EVERY == 0 {
            // The first report window underestimates: it includes ramp-up.
            let mut timers = self.timers.lock();
            let end = Instant::now();
            let dt = end.duration_since(timers.tomo_start).as_secs_f64();
            if dt > 0.0 {
                let throughput = self.scan_byte_size as f64 * REPORT_TOMO_THROUGHPUT_EVERY as f64
                    / dt
                    / (1024.0 * 1024.0);
                let tomo_rate = REPORT_TOMO_THROUGHPUT_EVERY as f64 / dt;
                info!(
                    "Throughput (averaged over the last {REPORT_TOMO_THROUGHPUT_EVERY} tomograms): {throughput:.1} (MB/s) / {tomo_rate:.1} (tomo/s)"
                );
            }
            timers.tomo_start = end;
        }
    }

    pub fn num_projections(&self) -> usize {
        self.num_projections.load(Ordering::Relaxed)
    }

    pub fn num_tomograms(&self) -> usize {
        self.num_tomograms.load(Ordering::Relaxed)
    }

    pub fn summarize(&self) {
        let dt = self.timers.lock().start.elapsed().as_secs_f64();
        let tomograms = self.num_tomograms.load(Ordering::Relaxed);
        let throughput = if dt > 0.0 {
            self.scan_byte_size as f64 * tomograms as f64 / dt / (1024.0 * 1024.0)
        } else {
            0.0
        };

        info!("Summary of run:");
        info!(
            "- Number of darks processed: {}",
            self.num_darks.load(Ordering::Relaxed)
        );
        info!(
            "- Number of flats processed: {}",
            self.num_flats.load(Ordering::Relaxed)
        );
        info!(
            "- Number of projections processed: {}",
            self.num_projections.load(Ordering::Relaxed)
        );
        info!(
            "- Tomograms reconstructed: {tomograms}, average throughput: {throughput:.1} (MB/s)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let monitor = Monitor::new(1024);
        for _ in 0..3 {
            monitor.count_projection();
        }
        monitor.count_dark();
        monitor.count_flat();
        monitor.count_tomogram();
        assert_eq!(monitor.num_projections(), 3);
        assert_eq!(monitor.num_tomograms(), 1);
        monitor.summarize();
    }
}
