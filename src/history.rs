//! ==============================================================================
//! history.rs - rolling sparkline window for one (device, metric) pair
//! ==============================================================================
//!
//! purpose:
//!     keeps the most recent N readings of a metric (default 60) in arrival
//!     order and answers min/max over exactly that window.
//!
//! how min/max stay O(1):
//!     next to the ring we keep two monotonic deques of (seq, value):
//!     - `lows`:  values strictly increasing front to back, front = window min
//!     - `highs`: values strictly decreasing front to back, front = window max
//!     a push pops dominated tails; an eviction pops the front only if its
//!     seq is the one leaving the window. each value enters and leaves each
//!     deque once, so pushes are amortized O(1).
//!
//! relationships:
//!     - used by: state.rs (one buffer per metric inside DeviceState)
//!
//! ==============================================================================

use crate::error::HistoryError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub at: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    capacity: usize,
    /// next sequence number to hand out
    next_seq: u64,
    points: VecDeque<(u64, HistoryPoint)>,
    lows: VecDeque<(u64, f64)>,
    highs: VecDeque<(u64, f64)>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Result<Self, HistoryError> {
        if capacity == 0 {
            return Err(HistoryError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            next_seq: 0,
            points: VecDeque::with_capacity(capacity),
            lows: VecDeque::new(),
            highs: VecDeque::new(),
        })
    }

    /// append a reading, evicting the oldest one when full
    pub fn push(&mut self, at: DateTime<Utc>, value: f64) {
        if self.points.len() == self.capacity {
            if let Some((old_seq, _)) = self.points.pop_front() {
                if self.lows.front().map(|(s, _)| *s) == Some(old_seq) {
                    self.lows.pop_front();
                }
                if self.highs.front().map(|(s, _)| *s) == Some(old_seq) {
                    self.highs.pop_front();
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        while self.lows.back().is_some_and(|(_, v)| *v >= value) {
            self.lows.pop_back();
        }
        self.lows.push_back((seq, value));

        while self.highs.back().is_some_and(|(_, v)| *v <= value) {
            self.highs.pop_back();
        }
        self.highs.push_back((seq, value));

        self.points.push_back((seq, HistoryPoint { at, value }));
    }

    /// retained values, oldest first
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|(_, p)| p.value).collect()
    }

    pub fn points(&self) -> Vec<HistoryPoint> {
        self.points.iter().map(|(_, p)| *p).collect()
    }

    pub fn latest(&self) -> Option<f64> {
        self.points.back().map(|(_, p)| p.value)
    }

    pub fn min(&self) -> Option<f64> {
        self.lows.front().map(|(_, v)| *v)
    }

    pub fn max(&self) -> Option<f64> {
        self.highs.front().map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn filled(capacity: usize, values: &[f64]) -> HistoryBuffer {
        let start = Utc::now();
        let mut buffer = HistoryBuffer::new(capacity).unwrap();
        for (i, v) in values.iter().enumerate() {
            buffer.push(start + Duration::seconds(i as i64), *v);
        }
        buffer
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(HistoryBuffer::new(0).unwrap_err(), HistoryError::ZeroCapacity);
    }

    #[test]
    fn empty_buffer_has_no_stats() {
        let buffer = HistoryBuffer::new(DEFAULT_CAPACITY).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.min(), None);
        assert_eq!(buffer.max(), None);
        assert_eq!(buffer.latest(), None);
    }

    #[test]
    fn below_capacity_keeps_everything_in_order() {
        let values: Vec<f64> = (0..45).map(|i| (i * 7 % 13) as f64).collect();
        let buffer = filled(DEFAULT_CAPACITY, &values);

        assert_eq!(buffer.len(), 45);
        assert_eq!(buffer.values(), values);
        let points = buffer.points();
        assert!(points.windows(2).all(|w| w[0].at < w[1].at));
    }

    #[test]
    fn overflow_keeps_most_recent_window() {
        let values: Vec<f64> = (0..150).map(|i| ((i * 37) % 101) as f64).collect();
        let buffer = filled(DEFAULT_CAPACITY, &values);

        let window = &values[values.len() - DEFAULT_CAPACITY..];
        assert_eq!(buffer.len(), DEFAULT_CAPACITY);
        assert_eq!(buffer.values(), window);
        assert_eq!(buffer.latest(), Some(149.0 * 37.0 % 101.0));

        let lo = window.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(buffer.min(), Some(lo));
        assert_eq!(buffer.max(), Some(hi));
    }

    #[test]
    fn evicted_extremes_do_not_linger() {
        // 100 and -100 scroll out after three more pushes
        let buffer = filled(3, &[100.0, -100.0, 5.0, 6.0, 7.0]);
        assert_eq!(buffer.values(), vec![5.0, 6.0, 7.0]);
        assert_eq!(buffer.min(), Some(5.0));
        assert_eq!(buffer.max(), Some(7.0));
    }

    #[test]
    fn stats_track_every_step_of_a_sliding_window() {
        let values = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0, 5.0, 3.0, 5.0, 8.0, 9.0, 7.0];
        let start = Utc::now();
        let mut buffer = HistoryBuffer::new(4).unwrap();
        for (i, v) in values.iter().enumerate() {
            buffer.push(start + Duration::seconds(i as i64), *v);
            let window = buffer.values();
            let lo = window.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            assert_eq!(buffer.min(), Some(lo), "min after push {}", i);
            assert_eq!(buffer.max(), Some(hi), "max after push {}", i);
        }
    }

    #[test]
    fn repeated_values_survive_partial_eviction() {
        let buffer = filled(2, &[4.0, 4.0, 4.0]);
        assert_eq!(buffer.min(), Some(4.0));
        assert_eq!(buffer.max(), Some(4.0));
    }
}
