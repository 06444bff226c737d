//! Fixed-capacity ring of recently accepted power samples.
//!
//! The ring is the only state shared between the acquisition loop (single
//! writer) and readers such as the query surface. It is a service object with
//! interior synchronization: construct it once, wrap it in an `Arc` and hand
//! clones to every consumer.
//!
//! # Features
//! - One mutex guards both append and read; it is held only for the copy
//! - Overwrite-on-wrap: when full, the oldest sample is silently replaced
//! - Reads walk backward from the write cursor and return copies, oldest first
//!
//! # Layout
//! ```text
//! slots:  [s3][s4][s5][s0][s1][s2]      capacity = 6, len = 6
//!                      ^cursor (next write, also the oldest entry when full)
//! ```

use crate::measurement::PowerSample;
use parking_lot::Mutex;

/// One day of samples at 1 Hz.
pub const DEFAULT_CAPACITY: usize = 24 * 3600;

struct RingState {
    slots: Vec<PowerSample>,
    /// Next write position.
    cursor: usize,
    /// Number of valid entries (<= capacity).
    len: usize,
}

impl RingState {
    fn index_back(&self, back: usize, capacity: usize) -> usize {
        // back = 0 is the newest entry
        (self.cursor + capacity - 1 - back) % capacity
    }

    fn append(&mut self, sample: PowerSample, capacity: usize) {
        if self.cursor < self.slots.len() {
            self.slots[self.cursor] = sample;
        } else {
            self.slots.push(sample);
        }

        self.cursor = (self.cursor + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }
}

/// Mutex-guarded circular store of [`PowerSample`]s.
pub struct SampleRing {
    state: Mutex<RingState>,
    capacity: usize,
}

impl SampleRing {
    /// Create an empty ring holding at most `capacity` samples.
    ///
    /// A capacity of zero is bumped to one so the ring always keeps the latest sample.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                slots: Vec::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                cursor: 0,
                len: 0,
            }),
            capacity,
        }
    }

    /// Append a sample, overwriting the oldest entry once the ring is full.
    pub fn push(&self, sample: PowerSample) {
        self.state.lock().append(sample, self.capacity);
    }

    /// Append only if `sample` is strictly newer than the newest stored sample.
    ///
    /// Returns whether the sample was stored. The check and the append happen
    /// under one lock acquisition.
    pub fn push_if_newer(&self, sample: PowerSample) -> bool {
        let mut state = self.state.lock();

        if state.len > 0 {
            let newest = state.index_back(0, self.capacity);
            if sample.timestamp <= state.slots[newest].timestamp {
                return false;
            }
        }

        state.append(sample, self.capacity);
        true
    }

    /// Most recently appended sample.
    pub fn latest(&self) -> Option<PowerSample> {
        let state = self.state.lock();
        if state.len == 0 {
            return None;
        }
        Some(state.slots[state.index_back(0, self.capacity)])
    }

    /// Timestamp of the most recent sample, if any.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.latest().map(|s| s.timestamp)
    }

    /// Copy of the `n` most recent samples, oldest first.
    ///
    /// Returns fewer than `n` samples when the ring holds fewer.
    pub fn latest_n(&self, n: usize) -> Vec<PowerSample> {
        let state = self.state.lock();
        let count = n.min(state.len);

        let mut out: Vec<PowerSample> = (0..count)
            .map(|back| state.slots[state.index_back(back, self.capacity)])
            .collect();
        drop(state);

        out.reverse();
        out
    }

    /// Copy of every stored sample, oldest first.
    pub fn snapshot(&self) -> Vec<PowerSample> {
        self.latest_n(self.capacity)
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    /// Whether no sample has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of samples kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn sample(ts: i64) -> PowerSample {
        PowerSample::new(ts, [230.0; 3], [1.0; 3], [200.0; 3])
    }

    fn timestamps(samples: &[PowerSample]) -> Vec<i64> {
        samples.iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = SampleRing::new(4);
        assert!(ring.is_empty());
        assert_eq!(ring.latest(), None);
        assert!(ring.latest_n(3).is_empty());
        assert_eq!(ring.capacity(), 4);
    }

    #[test]
    fn test_push_and_read_back() {
        let ring = SampleRing::new(4);
        for ts in 1..=3 {
            ring.push(sample(ts));
        }

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.last_timestamp(), Some(3));
        assert_eq!(timestamps(&ring.latest_n(2)), vec![2, 3]);
        assert_eq!(timestamps(&ring.latest_n(10)), vec![1, 2, 3]);
    }

    #[test]
    fn test_circular_wrap_keeps_last_capacity() {
        let ring = SampleRing::new(5);
        for ts in 1..=13 {
            ring.push(sample(ts));
        }

        assert_eq!(ring.len(), 5);
        assert_eq!(timestamps(&ring.snapshot()), vec![9, 10, 11, 12, 13]);
        assert_eq!(ring.latest().map(|s| s.timestamp), Some(13));
    }

    #[test]
    fn test_wrap_at_exact_capacity() {
        let ring = SampleRing::new(3);
        for ts in 1..=3 {
            ring.push(sample(ts));
        }
        assert_eq!(timestamps(&ring.snapshot()), vec![1, 2, 3]);

        ring.push(sample(4));
        assert_eq!(timestamps(&ring.snapshot()), vec![2, 3, 4]);
    }

    #[test]
    fn test_push_if_newer_rejects_stale() {
        let ring = SampleRing::new(8);
        assert!(ring.push_if_newer(sample(10)));
        assert!(!ring.push_if_newer(sample(10)));
        assert!(!ring.push_if_newer(sample(9)));
        assert!(ring.push_if_newer(sample(11)));

        assert_eq!(timestamps(&ring.snapshot()), vec![10, 11]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let ring = SampleRing::new(0);
        ring.push(sample(1));
        ring.push(sample(2));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.last_timestamp(), Some(2));
    }

    #[test]
    fn test_concurrent_write_read() {
        let ring = Arc::new(SampleRing::new(100));

        let writer_ring = Arc::clone(&ring);
        let writer = thread::spawn(move || {
            for ts in 0..1000 {
                writer_ring.push(sample(ts));
            }
        });

        let reader_ring = Arc::clone(&ring);
        let reader = thread::spawn(move || {
            for _ in 0..200 {
                let snapshot = reader_ring.latest_n(50);
                // Every snapshot is strictly increasing regardless of interleaving
                assert!(snapshot.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();

        assert_eq!(ring.len(), 100);
        assert_eq!(ring.last_timestamp(), Some(999));
    }
}
