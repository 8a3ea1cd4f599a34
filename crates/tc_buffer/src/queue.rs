use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError};

/// A multi-producer/multi-consumer queue with an optional bound.
///
/// In bounded mode [`Self::push`] evicts the oldest element to make room,
/// while [`Self::try_push`] refuses and never blocks. Consumers either poll
/// ([`Self::try_pop`]) or wait with a timeout ([`Self::wait_pop`]) so that
/// shutdown flags are re-checked at a bounded interval.
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `max_len` elements; `0` means unbounded.
    pub fn new(max_len: usize) -> Self {
        let (tx, rx) = if max_len == 0 {
            crossbeam::channel::unbounded()
        } else {
            crossbeam::channel::bounded(max_len)
        };
        Self { tx, rx }
    }

    /// Refuses (returning the value) if the queue is full; never blocks.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.tx.try_send(value).map_err(|err| match err {
            TrySendError::Full(rejected) | TrySendError::Disconnected(rejected) => rejected,
        })
    }

    /// Pushes unconditionally, evicting the oldest element when full.
    pub fn push(&self, value: T) {
        let mut value = value;
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    let _ = self.rx.try_recv();
                    value = rejected;
                }
                Err(TrySendError::Disconnected(_)) => {
                    unreachable!("the queue owns both endpoints");
                }
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocks up to `timeout` for an element.
    pub fn wait_pop(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drains all elements.
    pub fn reset(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded() {
        let queue = BoundedQueue::new(0);
        assert!(queue.is_empty());
        assert!(queue.try_pop().is_none());

        for i in 0..100 {
            assert!(queue.try_push(i).is_ok());
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.try_pop(), Some(0));

        queue.reset();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_bounded_try_push() {
        let queue = BoundedQueue::new(2);
        assert!(queue.try_push(1).is_ok());
        assert!(queue.try_push(2).is_ok());
        assert_eq!(queue.try_push(3), Err(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(1));
        assert!(queue.try_push(3).is_ok());
    }

    #[test]
    fn test_bounded_push_evicts_oldest() {
        let queue = BoundedQueue::new(3);
        for i in 0..10 {
            queue.push(i);
        }
        // The length stabilizes at the capacity and the oldest elements
        // are the ones lost.
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(7));
        assert_eq!(queue.try_pop(), Some(8));
        assert_eq!(queue.try_pop(), Some(9));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_wait_pop_timeout() {
        let queue = BoundedQueue::<i32>::new(1);
        let start = std::time::Instant::now();
        assert!(queue.wait_pop(Duration::from_millis(10)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(10));

        queue.push(7);
        assert_eq!(queue.wait_pop(Duration::from_millis(10)), Some(7));
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        let queue = std::sync::Arc::new(BoundedQueue::new(0));
        let n_per_producer = 1000;

        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = queue.clone();
            producers.push(std::thread::spawn(move || {
                for i in 0..n_per_producer {
                    queue.push(p * n_per_producer + i);
                }
            }));
        }

        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let mut got = Vec::new();
                while got.len() < 4 * n_per_producer {
                    if let Some(v) = queue.wait_pop(Duration::from_millis(100)) {
                        got.push(v);
                    }
                }
                got
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        let mut got = consumer.join().unwrap();
        got.sort_unstable();
        assert_eq!(got, (0..4 * n_per_producer).collect::<Vec<_>>());
    }
}
