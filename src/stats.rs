/*! Statistical estimators.

The AMC loop estimates packet error rate with windowed means sized in
packets, and receiver quality (EVM, RSSI) and ACK delay with estimators
windowed in time.
*/

use std::collections::VecDeque;

use crate::time::{TimeDelta, TimePoint};

/// A running mean.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    value: f64,
    nsamples: usize,
}

impl Mean {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn value(&self) -> Option<f64> {
        if self.nsamples == 0 {
            None
        } else {
            Some(self.value)
        }
    }

    pub fn size(&self) -> usize {
        self.nsamples
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.nsamples = 0;
    }

    pub fn update(&mut self, x: f64) {
        if self.nsamples == 0 {
            self.value = x;
            self.nsamples = 1;
        } else {
            self.value = (self.value * self.nsamples as f64 + x) / (self.nsamples + 1) as f64;
            self.nsamples += 1;
        }
    }
}

/// A mean over a fixed-size window of samples.
///
/// The estimator has no value until the window has filled once; until then
/// a short burst of losses would otherwise read as a catastrophic rate.
#[derive(Debug, Clone)]
pub struct WindowedMean {
    window: Vec<f64>,
    i: usize,
    sum: f64,
}

impl WindowedMean {
    pub fn new(n: usize) -> Self {
        assert!(n > 0);
        WindowedMean {
            window: vec![0.0; n],
            i: 0,
            sum: 0.0,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window.len()
    }

    pub fn set_window_size(&mut self, n: usize) {
        assert!(n > 0);
        self.window.clear();
        self.window.resize(n, 0.0);
        self.i = 0;
        self.sum = 0.0;
    }

    pub fn value(&self) -> Option<f64> {
        if self.i >= self.window.len() {
            Some(self.sum / self.window.len() as f64)
        } else {
            None
        }
    }

    pub fn size(&self) -> usize {
        self.i.min(self.window.len())
    }

    pub fn reset(&mut self) {
        self.window.fill(0.0);
        self.i = 0;
        self.sum = 0.0;
    }

    pub fn update(&mut self, x: f64) {
        if self.i == 0 {
            self.sum = x;
        } else {
            self.sum = self.sum - self.window[self.i % self.window.len()] + x;
        }

        let idx = self.i % self.window.len();
        self.window[idx] = x;
        self.i += 1;
    }
}

/// A mean over samples that arrived within a trailing time window.
#[derive(Debug, Clone)]
pub struct TimeWindowMean {
    twindow: TimeDelta,
    window: VecDeque<(TimePoint, f64)>,
    sum: f64,
}

impl TimeWindowMean {
    pub fn new(twindow: TimeDelta) -> Self {
        TimeWindowMean {
            twindow,
            window: VecDeque::new(),
            sum: 0.0,
        }
    }

    pub fn time_window(&self) -> TimeDelta {
        self.twindow
    }

    pub fn set_time_window(&mut self, twindow: TimeDelta) {
        self.twindow = twindow;
    }

    pub fn size(&self) -> usize {
        self.window.len()
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }

    fn purge(&mut self, t: TimePoint) {
        while let Some(&(t0, x)) = self.window.front() {
            if t0 + self.twindow < t {
                self.sum -= x;
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn update(&mut self, t: TimePoint, x: f64) {
        self.purge(t);
        self.sum += x;
        self.window.push_back((t, x));
    }

    pub fn value_at(&mut self, t: TimePoint) -> Option<f64> {
        self.purge(t);

        if self.window.is_empty() {
            None
        } else {
            Some(self.sum / self.window.len() as f64)
        }
    }

    pub fn value(&mut self) -> Option<f64> {
        self.value_at(crate::time::MonoClock::now())
    }
}

/// The maximum over samples that arrived within a trailing time window.
///
/// Samples dominated by a newer, larger sample are discarded eagerly, so the
/// deque stays sorted in descending order and the front is always the max.
#[derive(Debug, Clone)]
pub struct TimeWindowMax {
    twindow: TimeDelta,
    window: VecDeque<(TimePoint, f64)>,
}

impl TimeWindowMax {
    pub fn new(twindow: TimeDelta) -> Self {
        TimeWindowMax {
            twindow,
            window: VecDeque::new(),
        }
    }

    pub fn time_window(&self) -> TimeDelta {
        self.twindow
    }

    pub fn set_time_window(&mut self, twindow: TimeDelta) {
        self.twindow = twindow;
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }

    fn purge(&mut self, t: TimePoint) {
        while let Some(&(t0, _)) = self.window.front() {
            if t0 + self.twindow < t {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn update(&mut self, t: TimePoint, x: f64) {
        self.purge(t);

        while let Some(&(_, back)) = self.window.back() {
            if back <= x {
                self.window.pop_back();
            } else {
                break;
            }
        }

        self.window.push_back((t, x));
    }

    pub fn value_at(&mut self, t: TimePoint) -> Option<f64> {
        self.purge(t);
        self.window.front().map(|&(_, x)| x)
    }

    pub fn value(&mut self) -> Option<f64> {
        self.value_at(crate::time::MonoClock::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windowed_mean_needs_full_window() {
        let mut m = WindowedMean::new(4);

        m.update(1.0);
        m.update(1.0);
        m.update(0.0);
        assert_eq!(m.value(), None);

        m.update(0.0);
        assert_eq!(m.value(), Some(0.5));

        // Oldest sample slides out
        m.update(0.0);
        assert_eq!(m.value(), Some(0.25));
    }

    #[test]
    fn windowed_mean_resize_resets() {
        let mut m = WindowedMean::new(2);

        m.update(1.0);
        m.update(1.0);
        assert_eq!(m.value(), Some(1.0));

        m.set_window_size(3);
        assert_eq!(m.value(), None);
    }

    #[test]
    fn time_window_mean_purges() {
        let mut m = TimeWindowMean::new(TimeDelta::from_secs_f64(1.0));
        let t0 = TimePoint::ZERO;

        m.update(t0, 4.0);
        m.update(t0 + TimeDelta::from_secs_f64(0.5), 2.0);
        assert_eq!(m.value_at(t0 + TimeDelta::from_secs_f64(0.9)), Some(3.0));

        // First sample ages out
        assert_eq!(m.value_at(t0 + TimeDelta::from_secs_f64(1.25)), Some(2.0));

        // Everything ages out
        assert_eq!(m.value_at(t0 + TimeDelta::from_secs_f64(3.0)), None);
    }

    #[test]
    fn time_window_max_tracks_max() {
        let mut m = TimeWindowMax::new(TimeDelta::from_secs_f64(1.0));
        let t0 = TimePoint::ZERO;

        m.update(t0, 3.0);
        m.update(t0 + TimeDelta::from_secs_f64(0.2), 1.0);
        m.update(t0 + TimeDelta::from_secs_f64(0.4), 2.0);
        assert_eq!(m.value_at(t0 + TimeDelta::from_secs_f64(0.5)), Some(3.0));

        // The 3.0 sample ages out; the max falls back to 2.0
        assert_eq!(m.value_at(t0 + TimeDelta::from_secs_f64(1.1)), Some(2.0));
    }
}
