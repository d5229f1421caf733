use super::types::ClosedCycle;
use std::collections::VecDeque;

/// Fixed-size rolling window over the most recent closed cycles.
#[derive(Debug, Clone)]
pub struct ElementWindow {
    capacity: usize,
    buffer: VecDeque<ClosedCycle>,
}

impl ElementWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, cycle: ClosedCycle) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(cycle);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClosedCycle> {
        self.buffer.iter()
    }

    pub fn mean_duration_secs(&self) -> Option<f64> {
        if self.buffer.is_empty() {
            return None;
        }
        let total: f64 = self.buffer.iter().map(|cycle| cycle.duration_secs).sum();
        Some(total / self.buffer.len() as f64)
    }

    pub fn median_duration_secs(&self) -> Option<f64> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = self.buffer.iter().map(|cycle| cycle.duration_secs).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            Some((values[mid - 1] + values[mid]) / 2.0)
        } else {
            Some(values[mid])
        }
    }

    /// Smoothed cycles per minute over the window.
    pub fn actual_rate_lpm(&self) -> Option<f64> {
        self.mean_duration_secs()
            .filter(|secs| *secs > 0.0)
            .map(|secs| 60.0 / secs)
    }

    /// Ideal time over actual time across the window. Each cycle is measured
    /// against the target it was opened with.
    pub fn performance(&self) -> Option<f64> {
        let actual: f64 = self.buffer.iter().map(|cycle| cycle.duration_secs).sum();
        if actual <= 0.0 {
            return None;
        }
        let ideal: f64 = self
            .buffer
            .iter()
            .map(|cycle| cycle.target.ideal_cycle_seconds())
            .sum();
        Some(ideal / actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classification;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn cycle(duration_secs: f64, cycle_lpm: f64) -> ClosedCycle {
        let started_at = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        ClosedCycle {
            started_at,
            ended_at: started_at + ChronoDuration::milliseconds((duration_secs * 1000.0) as i64),
            duration_secs,
            impulses: 8,
            target: Classification {
                cycle_lpm,
                rule_index: Some(0),
                fallback: false,
            },
        }
    }

    #[test]
    fn window_evicts_oldest_beyond_capacity() {
        let mut window = ElementWindow::new(3);
        for secs in [1.0, 2.0, 3.0, 4.0] {
            window.push(cycle(secs, 15.0));
        }
        assert_eq!(window.len(), 3);
        let durations: Vec<f64> = window.iter().map(|c| c.duration_secs).collect();
        assert_eq!(durations, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn mean_and_median_smooth_outliers_differently() {
        let mut window = ElementWindow::new(10);
        for secs in [4.0, 4.0, 4.0, 16.0] {
            window.push(cycle(secs, 15.0));
        }
        assert_eq!(window.mean_duration_secs(), Some(7.0));
        assert_eq!(window.median_duration_secs(), Some(4.0));
    }

    #[test]
    fn performance_compares_against_each_cycle_target() {
        let mut window = ElementWindow::new(10);
        // 15/min → 4 s ideal; 12/min → 5 s ideal.
        window.push(cycle(4.0, 15.0));
        window.push(cycle(10.0, 12.0));
        let perf = window.performance().unwrap();
        assert!((perf - 9.0 / 14.0).abs() < 1e-9);
        assert!((window.actual_rate_lpm().unwrap() - 60.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_has_no_statistics() {
        let window = ElementWindow::new(0);
        assert_eq!(window.capacity(), 1);
        assert!(window.is_empty());
        assert!(window.mean_duration_secs().is_none());
        assert!(window.performance().is_none());
    }
}
