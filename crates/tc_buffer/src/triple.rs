use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Single-producer/single-consumer hand-off of the latest value.
///
/// Three slots rotate: the producer owns its *back* value, the consumer
/// owns its *front* value, and the buffer holds the *ready* slot in
/// between. [`Self::prepare`] swaps back↔ready and signals; [`Self::fetch`]
/// waits for a fresh ready value and swaps front↔ready. A fetch that
/// returns `true` observes the most recent successful prepare;
/// intermediate prepares may have been dropped.
///
/// Values keep their allocations: the swap rotation means a producer gets
/// a previously used value back to overwrite, never a fresh allocation.
pub struct TripleBuffer<T> {
    ready: Mutex<Ready<T>>,
    cv: Condvar,
}

struct Ready<T> {
    value: T,
    fresh: bool,
}

impl<T: Default> Default for TripleBuffer<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> TripleBuffer<T> {
    pub fn new(initial: T) -> Self {
        Self {
            ready: Mutex::new(Ready {
                value: initial,
                fresh: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Publishes `back` by swapping it into the ready slot.
    ///
    /// Returns `true` if the previous ready value had not been consumed,
    /// i.e. the publication dropped data.
    pub fn prepare(&self, back: &mut T) -> bool {
        let dropped = {
            let mut ready = self.ready.lock();
            std::mem::swap(&mut ready.value, back);
            let dropped = ready.fresh;
            ready.fresh = true;
            dropped
        };
        self.cv.notify_one();
        dropped
    }

    /// Waits up to `timeout` (forever if `None`) for a fresh value, then
    /// swaps it into `front`.
    pub fn fetch(&self, front: &mut T, timeout: Option<Duration>) -> bool {
        let mut ready = self.ready.lock();
        if !wait_fresh(&self.cv, &mut ready, timeout, |r| r.fresh) {
            return false;
        }
        std::mem::swap(&mut ready.value, front);
        ready.fresh = false;
        true
    }

    /// Runs `f` on the current ready value, fresh or not.
    pub fn with_ready<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.ready.lock().value)
    }
}

/// Waits on `cv` until `cond` holds, up to `timeout`. Returns whether the
/// condition held before the deadline.
pub(crate) fn wait_fresh<T>(
    cv: &Condvar,
    guard: &mut parking_lot::MutexGuard<'_, T>,
    timeout: Option<Duration>,
    cond: impl Fn(&T) -> bool,
) -> bool {
    match timeout {
        None => {
            while !cond(&**guard) {
                cv.wait(guard);
            }
            true
        }
        Some(timeout) => {
            let deadline = Instant::now() + timeout;
            while !cond(&**guard) {
                if cv.wait_until(guard, deadline).timed_out() {
                    return cond(&**guard);
                }
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_and_fetch() {
        let buffer = TripleBuffer::new(vec![0.0f32; 6]);
        let mut back = vec![1.0f32, 2.0, 1.0, 2.0, 1.0, 2.0];
        let mut front = vec![0.0f32; 6];

        assert!(!buffer.prepare(&mut back));
        buffer.with_ready(|v| assert_eq!(v, &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]));
        assert!(buffer.fetch(&mut front, None));
        assert_eq!(front, [1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);

        // Nothing new: the fetch times out.
        assert!(!buffer.fetch(&mut front, Some(Duration::ZERO)));
        assert!(!buffer.fetch(&mut front, Some(Duration::from_millis(1))));

        back.fill(3.0);
        assert!(!buffer.prepare(&mut back));
        buffer.with_ready(|v| assert_eq!(v, &[3.0; 6]));
    }

    #[test]
    fn test_prepare_reports_drop() {
        let buffer = TripleBuffer::new(0u32);
        let mut back = 1;
        assert!(!buffer.prepare(&mut back));
        back = 2;
        // The previous ready value (1) was never fetched.
        assert!(buffer.prepare(&mut back));

        let mut front = 0;
        assert!(buffer.fetch(&mut front, Some(Duration::ZERO)));
        // A successful fetch observes the most recent prepare.
        assert_eq!(front, 2);
    }

    #[test]
    fn test_fetch_wakes_on_prepare() {
        let buffer = std::sync::Arc::new(TripleBuffer::new(0u32));

        let consumer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                let mut front = 0;
                assert!(buffer.fetch(&mut front, Some(Duration::from_secs(5))));
                front
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        let mut back = 42;
        buffer.prepare(&mut back);
        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn test_allocation_recycling() {
        let buffer = TripleBuffer::new(vec![0u8; 4]);
        let mut back = vec![1u8; 4];
        let mut front = Vec::new();

        buffer.prepare(&mut back);
        // The producer got the initial ready allocation back.
        assert_eq!(back, [0; 4]);
        assert!(buffer.fetch(&mut front, None));
        assert_eq!(front, [1; 4]);
    }
}
