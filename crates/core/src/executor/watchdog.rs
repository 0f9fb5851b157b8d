//! Stall detection for in-flight forwards.
//!
//! The caller of `forward()` wakes periodically and feeds the current step
//! index to a [`StallTracker`]. A step that stops advancing first produces a
//! diagnostic after the log interval, then an abort after the timeout.
//!
//! Thresholds come from the environment:
//! - `DLLAMA_EXEC_STALL_LOG_MS` (default 2000)
//! - `DLLAMA_EXEC_STALL_TIMEOUT_MS` (default 10000, floored at the log
//!   interval)

use std::time::{Duration, Instant};

const STALL_LOG_MS_VAR: &str = "DLLAMA_EXEC_STALL_LOG_MS";
const STALL_TIMEOUT_MS_VAR: &str = "DLLAMA_EXEC_STALL_TIMEOUT_MS";

pub const DEFAULT_STALL_LOG_MS: u64 = 2_000;
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 10_000;

/// Stall thresholds for one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub stall_log: Duration,
    pub stall_timeout: Duration,
}

impl WatchdogConfig {
    /// Explicit thresholds; the timeout is floored at the log interval.
    pub fn new(stall_log_ms: u64, stall_timeout_ms: u64) -> Self {
        let stall_log_ms = stall_log_ms.max(1);
        Self {
            stall_log: Duration::from_millis(stall_log_ms),
            stall_timeout: Duration::from_millis(stall_timeout_ms.max(stall_log_ms)),
        }
    }

    /// Read thresholds from the environment, falling back to defaults on
    /// missing or unparsable values.
    pub fn from_env() -> Self {
        let read = |var: &str, default: u64| {
            std::env::var(var)
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|&ms| ms > 0)
                .unwrap_or(default)
        };
        Self::new(
            read(STALL_LOG_MS_VAR, DEFAULT_STALL_LOG_MS),
            read(STALL_TIMEOUT_MS_VAR, DEFAULT_STALL_TIMEOUT_MS),
        )
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// What the caller should do after an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    None,
    /// Emit a diagnostic; the forward keeps waiting.
    Log { stalled: Duration },
    /// Give up on the forward.
    Abort { stalled: Duration },
}

/// Progress tracker for one forward.
pub(crate) struct StallTracker {
    config: WatchdogConfig,
    last_step: usize,
    since: Instant,
    next_log: Duration,
}

impl StallTracker {
    pub(crate) fn new(config: WatchdogConfig, now: Instant) -> Self {
        Self {
            config,
            last_step: usize::MAX,
            since: now,
            next_log: config.stall_log,
        }
    }

    pub(crate) fn observe(&mut self, current_step: usize, now: Instant) -> StallAction {
        if current_step != self.last_step {
            self.last_step = current_step;
            self.since = now;
            self.next_log = self.config.stall_log;
            return StallAction::None;
        }
        let stalled = now.duration_since(self.since);
        if stalled >= self.config.stall_timeout {
            return StallAction::Abort { stalled };
        }
        if stalled >= self.next_log {
            self.next_log += self.config.stall_log;
            return StallAction::Log { stalled };
        }
        StallAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_floored_at_log_interval() {
        let config = WatchdogConfig::new(5_000, 1_000);
        assert_eq!(config.stall_timeout, config.stall_log);
    }

    #[test]
    fn progress_resets_the_clock() {
        let config = WatchdogConfig::new(100, 300);
        let start = Instant::now();
        let mut tracker = StallTracker::new(config, start);
        assert_eq!(tracker.observe(0, start), StallAction::None);
        // Step advances right before the log threshold would hit.
        let later = start + Duration::from_millis(90);
        assert_eq!(tracker.observe(1, later), StallAction::None);
        let after = later + Duration::from_millis(90);
        assert_eq!(tracker.observe(1, after), StallAction::None);
    }

    #[test]
    fn stall_logs_then_aborts() {
        let config = WatchdogConfig::new(100, 300);
        let start = Instant::now();
        let mut tracker = StallTracker::new(config, start);
        tracker.observe(0, start);
        assert!(matches!(
            tracker.observe(0, start + Duration::from_millis(150)),
            StallAction::Log { .. }
        ));
        // Second log only after another full interval.
        assert_eq!(
            tracker.observe(0, start + Duration::from_millis(180)),
            StallAction::None
        );
        assert!(matches!(
            tracker.observe(0, start + Duration::from_millis(250)),
            StallAction::Log { .. }
        ));
        assert!(matches!(
            tracker.observe(0, start + Duration::from_millis(320)),
            StallAction::Abort { .. }
        ));
    }
}
