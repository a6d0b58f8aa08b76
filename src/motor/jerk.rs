// Jerk limiter: bounds the per-cycle change in motor power
//
// Unlike the slew limiter this operates in fixed steps, not wall-clock
// time: each call may move the power by at most a constant increment
// derived from the motor's power limit.

use tracing::debug;

use crate::motor::MotorError;

// Stepping past the tolerance by a little converges faster without
// reintroducing the lurch the tolerance exists to prevent.
const STEP_MULTIPLIER: f64 = 1.3;

pub struct JerkLimiter {
    label: String,
    max_output: f64,
    tolerance: f64,
    limit: f64,
    enabled: bool,
}

impl JerkLimiter {
    /// `tolerance_percent` is the allowed per-cycle change as a percentage
    /// of `max_output`, the motor's absolute power limit.
    pub fn new(label: &str, tolerance_percent: f64, max_output: f64) -> Result<Self, MotorError> {
        if !(0.0..=100.0).contains(&tolerance_percent) {
            return Err(MotorError::Config(format!(
                "jerk tolerance for {} must be a percentage (0-100), got {}",
                label, tolerance_percent
            )));
        }
        let tolerance = (tolerance_percent / 100.0) * max_output;
        Ok(Self {
            label: label.to_string(),
            max_output,
            tolerance,
            limit: tolerance * STEP_MULTIPLIER,
            enabled: true,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Step `current` toward `target`, moving at most one increment per
    /// call. The absolute output range is enforced even when disabled.
    pub fn limit(&self, current: f64, target: f64) -> f64 {
        if !self.enabled {
            return self.clip(target);
        }
        let delta = current - target;
        if delta.abs() <= self.tolerance {
            return self.clip(target);
        }
        let stepped = if current > target {
            current - self.limit
        } else {
            current + self.limit
        };
        debug!(
            "jerk limiter {}: {:.4} -> {:.4} (target {:.4})",
            self.label, current, stepped, target
        );
        self.clip(stepped)
    }

    fn clip(&self, value: f64) -> f64 {
        if value < 0.0 {
            -(-value).clamp(0.0, self.max_output)
        } else {
            value.clamp(0.0, self.max_output)
        }
    }
}
