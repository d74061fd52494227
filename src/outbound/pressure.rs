// ABOUTME: Queue fill-ratio pressure tracking for one outbound partition
// ABOUTME: Levels derive from sanitized thresholds; transitions emit telemetry

use serde::Serialize;

use switchboard_core::config::PressureConfig;

/// Pressure bands derived from a partition's fill ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Warn,
    Degraded,
    Shed,
}

/// Tracks the current level for one partition and reports transitions.
#[derive(Debug)]
pub struct PressureTracker {
    config: PressureConfig,
    level: PressureLevel,
}

impl PressureTracker {
    /// Thresholds are sanitized on construction: a config violating
    /// `warn < degraded < shed` falls back to the defaults.
    pub fn new(config: PressureConfig) -> Self {
        Self { config: config.sanitize(), level: PressureLevel::Normal }
    }

    pub fn config(&self) -> &PressureConfig {
        &self.config
    }

    pub fn level(&self) -> PressureLevel {
        self.level
    }

    pub fn level_for(&self, fill_ratio: f64) -> PressureLevel {
        if fill_ratio >= self.config.shed {
            PressureLevel::Shed
        } else if fill_ratio >= self.config.degraded {
            PressureLevel::Degraded
        } else if fill_ratio >= self.config.warn {
            PressureLevel::Warn
        } else {
            PressureLevel::Normal
        }
    }

    /// Update the tracked level from a fill ratio. Returns
    /// `Some((from, to))` when a threshold was crossed.
    pub fn observe(&mut self, fill_ratio: f64) -> Option<(PressureLevel, PressureLevel)> {
        let next = self.level_for(fill_ratio);
        if next != self.level {
            let transition = (self.level, next);
            self.level = next;
            Some(transition)
        } else {
            None
        }
    }
}
