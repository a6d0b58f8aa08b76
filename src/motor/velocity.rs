// Velocity estimation from encoder step counts
//
// Converts the step delta between two ticks into cm/s using the wheel
// geometry, correcting for loop timing error: if a tick arrives late the
// raw delta covers more than one nominal period and is scaled back down
// (and up for an early tick).

use std::f64::consts::PI;
use std::time::Instant;

use tracing::debug;

use crate::config::GeometryConfig;
use crate::motor::MotorError;

pub struct VelocityEstimator {
    label: String,
    freq_hz: f64,
    period_ms: f64,
    steps_per_cm: f64,
    last_steps: Option<i64>,
    last_time: Option<Instant>,
    velocity_cm_sec: f64,
}

impl VelocityEstimator {
    pub fn new(label: &str, freq_hz: u32, geometry: &GeometryConfig) -> Result<Self, MotorError> {
        if freq_hz == 0 {
            return Err(MotorError::Config(format!(
                "velocity estimator for {} needs a positive sample rate",
                label
            )));
        }
        // Circumference in cm from a diameter in mm.
        let circumference_cm = geometry.wheel_diameter_mm * PI / 10.0;
        if circumference_cm <= 0.0 || geometry.steps_per_rotation <= 0.0 {
            return Err(MotorError::Config(format!(
                "degenerate wheel geometry for {}",
                label
            )));
        }
        let steps_per_cm = geometry.steps_per_rotation / circumference_cm;
        let estimator = Self {
            label: label.to_string(),
            freq_hz: freq_hz as f64,
            period_ms: 1000.0 / freq_hz as f64,
            steps_per_cm,
            last_steps: None,
            last_time: None,
            velocity_cm_sec: 0.0,
        };
        // One full rotation of steps must convert back to exactly one
        // circumference.
        let roundtrip = estimator.steps_to_cm(geometry.steps_per_rotation);
        if (roundtrip - circumference_cm).abs() > 1e-9 {
            return Err(MotorError::Config(format!(
                "geometry conversion for {} is inconsistent: {} cm vs {} cm",
                label, roundtrip, circumference_cm
            )));
        }
        Ok(estimator)
    }

    /// Distance in cm covered by `steps` encoder steps.
    pub fn steps_to_cm(&self, steps: f64) -> f64 {
        steps / self.steps_per_cm
    }

    /// Most recent estimate, cm/s.
    pub fn velocity_cm_sec(&self) -> f64 {
        self.velocity_cm_sec
    }

    /// Discard the baseline so the next tick reports zero.
    pub fn reset(&mut self) {
        self.last_steps = None;
        self.last_time = None;
        self.velocity_cm_sec = 0.0;
    }

    /// Feed the current cumulative step count; returns the velocity in cm/s.
    pub fn tick(&mut self, steps: i64) -> f64 {
        self.tick_at(steps, Instant::now())
    }

    /// As [`tick`](Self::tick), with the clock injected.
    pub fn tick_at(&mut self, steps: i64, now: Instant) -> f64 {
        let (last_steps, last_time) = match (self.last_steps, self.last_time) {
            (Some(s), Some(t)) => (s, t),
            // First tick after construction or reset establishes the
            // baseline only.
            _ => {
                self.last_steps = Some(steps);
                self.last_time = Some(now);
                self.velocity_cm_sec = 0.0;
                return 0.0;
            }
        };
        let elapsed_ms = now.duration_since(last_time).as_secs_f64() * 1000.0;
        self.last_steps = Some(steps);
        self.last_time = Some(now);

        let diff_steps = (steps - last_steps) as f64;
        if diff_steps == 0.0 {
            self.velocity_cm_sec = 0.0;
            return 0.0;
        }
        if elapsed_ms <= 0.0 {
            // Duplicate timestamp; keep the previous estimate.
            return self.velocity_cm_sec;
        }
        // A late tick has negative time_error and shrinks the delta back
        // to one nominal period's worth; an early tick inflates it.
        let time_error = (self.period_ms - elapsed_ms) / self.period_ms;
        let corrected = diff_steps + diff_steps * time_error;
        let steps_per_sec = corrected * self.freq_hz;
        self.velocity_cm_sec = self.steps_to_cm(steps_per_sec);
        debug!(
            "velocity {}: {} steps over {:.2} ms -> {:.3} cm/s",
            self.label, diff_steps, elapsed_ms, self.velocity_cm_sec
        );
        self.velocity_cm_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn estimator() -> VelocityEstimator {
        VelocityEstimator::new("test", 20, &GeometryConfig::default()).unwrap()
    }

    #[test]
    fn test_geometry_roundtrip() {
        let est = estimator();
        let circumference = 68.0 * PI / 10.0;
        assert!((est.steps_to_cm(494.0) - circumference).abs() < 1e-9);
    }

    #[test]
    fn test_first_tick_is_zero() {
        let mut est = estimator();
        assert_eq!(est.tick_at(1000, Instant::now()), 0.0);
    }

    #[test]
    fn test_no_steps_means_stopped() {
        let mut est = estimator();
        let t0 = Instant::now();
        est.tick_at(1000, t0);
        let v = est.tick_at(1000, t0 + Duration::from_millis(50));
        assert_eq!(v, 0.0);
    }

    #[test]
    fn test_on_time_tick_needs_no_correction() {
        let mut est = estimator();
        let t0 = Instant::now();
        est.tick_at(0, t0);
        // 494 steps in exactly one 50 ms period: one rotation per second.
        let circumference = 68.0 * PI / 10.0;
        let v = est.tick_at(494 / 20, t0 + Duration::from_millis(50));
        let expected = est.steps_to_cm((494 / 20) as f64) * 20.0;
        assert!((v - expected).abs() < 1e-9);
        assert!(expected < circumference);
    }

    #[test]
    fn test_late_tick_scales_delta_down() {
        let mut est = estimator();
        let t0 = Instant::now();
        est.tick_at(0, t0);
        // Twice the nominal period: time_error = -1, corrected delta = 0.
        let v = est.tick_at(100, t0 + Duration::from_millis(100));
        assert!(v.abs() < 1e-9, "expected 0, got {v}");
    }

    #[test]
    fn test_reverse_motion_is_negative() {
        let mut est = estimator();
        let t0 = Instant::now();
        est.tick_at(500, t0);
        let v = est.tick_at(450, t0 + Duration::from_millis(50));
        assert!(v < 0.0);
    }

    #[test]
    fn test_reset_requires_new_baseline() {
        let mut est = estimator();
        let t0 = Instant::now();
        est.tick_at(0, t0);
        est.tick_at(100, t0 + Duration::from_millis(50));
        est.reset();
        assert_eq!(est.velocity_cm_sec(), 0.0);
        assert_eq!(est.tick_at(200, t0 + Duration::from_millis(100)), 0.0);
    }

    #[test]
    fn test_rejects_zero_rate() {
        assert!(VelocityEstimator::new("bad", 0, &GeometryConfig::default()).is_err());
    }
}
