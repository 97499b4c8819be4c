//! Timers
//!
//! Timing helpers for streaming diagnostics.

use std::time::{Duration, Instant};

/// Scoped timer that reports its duration on drop
pub struct ScopedTimer<'a> {
    name: &'a str,
    start: Instant,
    callback: Option<Box<dyn FnMut(&str, Duration) + 'a>>,
}

impl<'a> ScopedTimer<'a> {
    /// Create a new scoped timer with a callback
    pub fn new<F>(name: &'a str, callback: F) -> Self
    where
        F: FnMut(&str, Duration) + 'a,
    {
        Self {
            name,
            start: Instant::now(),
            callback: Some(Box::new(callback)),
        }
    }

    /// Create a scoped timer that emits a tracing event
    pub fn traced(name: &'a str) -> Self {
        Self {
            name,
            start: Instant::now(),
            callback: None,
        }
    }

    /// Get elapsed time so far
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.callback.as_mut() {
            Some(callback) => callback(self.name, duration),
            None => tracing::debug!(
                target: "timing",
                name = self.name,
                duration_us = duration.as_micros() as u64,
                "Timer completed"
            ),
        }
    }
}

/// Rolling window of millisecond samples
#[derive(Debug, Clone)]
pub struct RollingTimer {
    samples: Vec<f64>,
    index: usize,
    count: usize,
}

impl RollingTimer {
    /// Create a new rolling timer with the given window size
    pub fn new(window: usize) -> Self {
        Self {
            samples: vec![0.0; window.max(1)],
            index: 0,
            count: 0,
        }
    }

    /// Record a sample in milliseconds
    pub fn record_ms(&mut self, sample: f64) {
        self.samples[self.index] = sample;
        self.index = (self.index + 1) % self.samples.len();
        self.count = (self.count + 1).min(self.samples.len());
    }

    /// Record a duration
    pub fn record(&mut self, duration: Duration) {
        self.record_ms(duration.as_secs_f64() * 1000.0);
    }

    fn window(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().take(self.count).copied()
    }

    /// Average of the window in milliseconds
    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.window().sum::<f64>() / self.count as f64
    }

    /// Most recent sample
    pub fn last_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let len = self.samples.len();
        self.samples[(self.index + len - 1) % len]
    }

    /// Largest sample in the window
    pub fn max_ms(&self) -> f64 {
        self.window().max_by(f64::total_cmp).unwrap_or(0.0)
    }

    /// Number of samples in the window
    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_timer() {
        let mut timer = RollingTimer::new(3);
        assert_eq!(timer.average_ms(), 0.0);

        timer.record_ms(2.0);
        timer.record_ms(4.0);
        assert_eq!(timer.count(), 2);
        assert!((timer.average_ms() - 3.0).abs() < 1e-9);

        timer.record_ms(6.0);
        timer.record_ms(8.0);
        assert_eq!(timer.count(), 3);
        assert!((timer.average_ms() - 6.0).abs() < 1e-9);
        assert_eq!(timer.max_ms(), 8.0);
        assert_eq!(timer.last_ms(), 8.0);
    }

    #[test]
    fn test_record_duration() {
        let mut timer = RollingTimer::new(4);
        timer.record(Duration::from_micros(1500));
        assert!((timer.average_ms() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_scoped_timer() {
        let mut recorded = Duration::ZERO;
        {
            let _timer = ScopedTimer::new("update", |_name, duration| {
                recorded = duration;
            });
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorded >= Duration::from_millis(5));
    }
}
