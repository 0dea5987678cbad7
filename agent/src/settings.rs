//! Runtime-adjustable sampler settings
//!
//! Plain atomics: the control listener stores, sampler threads load on every
//! tick. No locking is needed for single scalar values.

use crate::config::{Config, MIN_INTERVAL_MICROS};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct Settings {
    interval_micros: AtomicU64,
    arginfo: AtomicBool,
    limit: AtomicUsize,
    active: AtomicUsize,
}

impl Settings {
    pub fn new(interval_micros: u64, arginfo: bool, limit: usize) -> Self {
        Self {
            interval_micros: AtomicU64::new(interval_micros.max(MIN_INTERVAL_MICROS)),
            arginfo: AtomicBool::new(arginfo),
            limit: AtomicUsize::new(limit),
            active: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let interval = config.sampling_interval().as_micros() as u64;
        Self::new(interval, config.arginfo, config.samplers)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_micros.load(Ordering::Acquire))
    }

    pub fn set_interval_micros(&self, micros: u64) {
        self.interval_micros
            .store(micros.max(MIN_INTERVAL_MICROS), Ordering::Release);
    }

    pub fn arginfo(&self) -> bool {
        self.arginfo.load(Ordering::Acquire)
    }

    pub fn set_arginfo(&self, enabled: bool) {
        self.arginfo.store(enabled, Ordering::Release);
    }

    /// Reserve a sampler slot; `false` when the limit is reached
    pub fn try_add_sampler(&self) -> bool {
        let limit = self.limit.load(Ordering::Acquire);
        let previous = self.active.fetch_add(1, Ordering::AcqRel);

        if limit == 0 || previous < limit {
            return true;
        }

        self.active.fetch_sub(1, Ordering::AcqRel);
        false
    }

    pub fn remove_sampler(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active_samplers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn sampler_limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_is_floored() {
        let settings = Settings::new(100, false, 0);
        assert_eq!(settings.interval(), Duration::from_micros(100));

        settings.set_interval_micros(1);
        assert_eq!(settings.interval(), Duration::from_micros(MIN_INTERVAL_MICROS));
    }

    #[test]
    fn test_sampler_limit() {
        let settings = Settings::new(100, false, 2);

        assert!(settings.try_add_sampler());
        assert!(settings.try_add_sampler());
        assert!(!settings.try_add_sampler());
        assert_eq!(settings.active_samplers(), 2);

        settings.remove_sampler();
        assert!(settings.try_add_sampler());
    }

    #[test]
    fn test_unlimited_samplers() {
        let settings = Settings::new(100, false, 0);
        for _ in 0..100 {
            assert!(settings.try_add_sampler());
        }
    }
}
