//! Time-related utilities

use std::time::Instant;

/// Monotonic clock measuring seconds since the profiler started
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::start()
    }
}

impl Clock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Seconds elapsed since [`Clock::start`]
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = Clock::start();
        let a = clock.elapsed();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.elapsed();

        assert!(a >= 0.0);
        assert!(b > a);
    }
}
