//! Pausable run stopwatch.

use std::time::{Duration, Instant};

/// Logical stopwatch for elapsed and cumulative-time accounting.
///
/// No background task; an accumulator plus an optional running-since
/// instant, driven by explicit `start`/`pause`/`reset` calls on a monotonic
/// time source.
#[derive(Debug, Default)]
pub struct RunTimer {
    accum: Duration,
    running_since: Option<Instant>,
}

impl RunTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or resume) the stopwatch. No-op while already running.
    pub fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    /// Pause the stopwatch, folding the running span into the accumulator.
    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accum += since.elapsed();
        }
    }

    /// Stop and zero the stopwatch.
    pub fn reset(&mut self) {
        self.accum = Duration::ZERO;
        self.running_since = None;
    }

    /// Overwrite the accumulated time, keeping the running state.
    ///
    /// Used at finalization to cap the displayed cumulative time to the
    /// task-wide total.
    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.accum = elapsed;
        if self.running_since.is_some() {
            self.running_since = Some(Instant::now());
        }
    }

    /// Total accumulated time, including the currently running span.
    pub fn elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => self.accum + since.elapsed(),
            None => self.accum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_timer_accumulates_across_pause() {
        let mut timer = RunTimer::new();
        timer.start();
        sleep(Duration::from_millis(30));
        timer.pause();
        let after_pause = timer.elapsed();
        assert!(after_pause >= Duration::from_millis(30));

        // Paused: elapsed must not advance.
        sleep(Duration::from_millis(20));
        assert_eq!(timer.elapsed(), after_pause);

        timer.start();
        sleep(Duration::from_millis(20));
        assert!(timer.elapsed() >= after_pause + Duration::from_millis(20));
    }

    #[test]
    fn test_reset_zeroes() {
        let mut timer = RunTimer::new();
        timer.start();
        sleep(Duration::from_millis(10));
        timer.reset();
        assert_eq!(timer.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_set_elapsed_overwrites_accumulator() {
        let mut timer = RunTimer::new();
        timer.start();
        sleep(Duration::from_millis(10));
        timer.pause();
        timer.set_elapsed(Duration::from_secs(42));
        assert_eq!(timer.elapsed(), Duration::from_secs(42));
    }

    #[test]
    fn test_double_start_is_noop() {
        let mut timer = RunTimer::new();
        timer.start();
        sleep(Duration::from_millis(10));
        timer.start();
        assert!(timer.elapsed() >= Duration::from_millis(10));
    }
}
