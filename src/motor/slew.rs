// Slew limiter: bounds how fast a commanded speed may change
//
// Each call clamps the requested target into a window around the current
// value whose width grows with wall-clock time since the previous call, so
// the allowed change per second is constant regardless of call rate.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Named rate profiles, in maximum value-change per millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlewRate {
    Slowest,
    Slower,
    Slow,
    Normal,
    Fast,
    Faster,
    Fastest,
}

impl SlewRate {
    /// Maximum change in output value per millisecond.
    pub fn per_ms(&self) -> f64 {
        match self {
            SlewRate::Slowest => 0.01,
            SlewRate::Slower => 0.02,
            SlewRate::Slow => 0.05,
            SlewRate::Normal => 0.1,
            SlewRate::Fast => 0.25,
            SlewRate::Faster => 0.5,
            SlewRate::Fastest => 1.0,
        }
    }
}

/// Rate limiter over a single scalar output.
///
/// The limiter is stateless with respect to the value itself; callers pass
/// both the current and the requested value on every call. Only the time of
/// the previous call is retained.
pub struct SlewLimiter {
    label: String,
    minimum_output: f64,
    maximum_output: f64,
    default_rate: SlewRate,
    rate: SlewRate,
    last_call: Option<Instant>,
    enabled: bool,
}

impl SlewLimiter {
    pub fn new(label: &str, minimum_output: f64, maximum_output: f64, rate: SlewRate) -> Self {
        Self {
            label: label.to_string(),
            minimum_output,
            maximum_output,
            default_rate: rate,
            rate,
            last_call: None,
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable the limiter, discarding the stale inter-call timestamp so the
    /// first window after re-enabling is not inflated by the idle period.
    pub fn enable(&mut self) {
        self.last_call = None;
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn rate(&self) -> SlewRate {
        self.rate
    }

    /// Swap the active rate profile. Takes effect on the next call.
    pub fn set_rate(&mut self, rate: SlewRate) {
        if rate != self.rate {
            info!("slew limiter {}: rate {:?} -> {:?}", self.label, self.rate, rate);
        }
        self.rate = rate;
    }

    /// Restore the default profile and forget the previous call time.
    pub fn reset(&mut self) {
        self.rate = self.default_rate;
        self.last_call = None;
    }

    /// Clamp `target` to within the reachable window around `current`.
    pub fn limit(&mut self, current: f64, target: f64) -> f64 {
        self.limit_at(current, target, Instant::now())
    }

    /// As [`limit`](Self::limit), with the clock injected.
    pub fn limit_at(&mut self, current: f64, target: f64, now: Instant) -> f64 {
        // Inactive means inactive: the target passes through untouched,
        // range clipping included.
        if !self.enabled {
            return target;
        }
        let elapsed_ms = match self.last_call {
            Some(prev) => now.duration_since(prev).as_secs_f64() * 1000.0,
            // First call since (re)enable: zero-width window, hold the
            // current value.
            None => {
                self.last_call = Some(now);
                return self.clip(current);
            }
        };
        self.last_call = Some(now);
        let window = self.rate.per_ms() * elapsed_ms;
        let limited = target.clamp(current - window, current + window);
        self.clip(limited)
    }

    // Symmetric clip: the configured range bounds the magnitude, reverse
    // values mirror it.
    fn clip(&self, value: f64) -> f64 {
        if value < 0.0 {
            -(-value).clamp(self.minimum_output, self.maximum_output)
        } else {
            value.clamp(self.minimum_output, self.maximum_output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter() -> SlewLimiter {
        SlewLimiter::new("test", 0.0, 100.0, SlewRate::Normal)
    }

    #[test]
    fn test_first_call_holds_current_value() {
        let mut slew = limiter();
        assert_eq!(slew.limit_at(10.0, 80.0, Instant::now()), 10.0);
    }

    #[test]
    fn test_window_scales_with_elapsed_time() {
        let mut slew = limiter();
        let t0 = Instant::now();
        slew.limit_at(0.0, 0.0, t0);
        // Normal rate is 0.1/ms, so 50 ms allows a change of 5.0.
        let out = slew.limit_at(0.0, 80.0, t0 + Duration::from_millis(50));
        assert!((out - 5.0).abs() < 1e-9, "expected 5.0, got {out}");
    }

    #[test]
    fn test_window_is_symmetric() {
        let mut slew = limiter();
        let t0 = Instant::now();
        slew.limit_at(0.0, 0.0, t0);
        let out = slew.limit_at(0.0, -80.0, t0 + Duration::from_millis(50));
        assert!((out + 5.0).abs() < 1e-9, "expected -5.0, got {out}");
    }

    #[test]
    fn test_target_within_window_is_untouched() {
        let mut slew = limiter();
        let t0 = Instant::now();
        slew.limit_at(10.0, 10.0, t0);
        let out = slew.limit_at(10.0, 12.0, t0 + Duration::from_millis(50));
        assert_eq!(out, 12.0);
    }

    #[test]
    fn test_disabled_passes_target_unchanged() {
        let mut slew = limiter();
        slew.disable();
        assert_eq!(slew.limit(0.0, 80.0), 80.0);
        // No windowing and no range clip while inactive.
        assert_eq!(slew.limit(0.0, 150.0), 150.0);
        assert_eq!(slew.limit(0.0, -150.0), -150.0);
    }

    #[test]
    fn test_reset_restores_default_rate() {
        let mut slew = limiter();
        slew.set_rate(SlewRate::Fastest);
        assert_eq!(slew.rate(), SlewRate::Fastest);
        slew.reset();
        assert_eq!(slew.rate(), SlewRate::Normal);
    }

    #[test]
    fn test_enable_discards_idle_window() {
        let mut slew = limiter();
        let t0 = Instant::now();
        slew.limit_at(0.0, 0.0, t0);
        slew.disable();
        slew.enable();
        // The idle hour does not open a huge window; the first post-enable
        // call holds the current value and restarts the clock.
        let out = slew.limit_at(5.0, 60.0, t0 + Duration::from_secs(3600));
        assert_eq!(out, 5.0);
        let out = slew.limit_at(5.0, 60.0, t0 + Duration::from_secs(3600) + Duration::from_millis(50));
        assert!((out - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_profiles_are_ordered() {
        let rates = [
            SlewRate::Slowest,
            SlewRate::Slower,
            SlewRate::Slow,
            SlewRate::Normal,
            SlewRate::Fast,
            SlewRate::Faster,
            SlewRate::Fastest,
        ];
        for pair in rates.windows(2) {
            assert!(pair[0].per_ms() < pair[1].per_ms());
        }
    }
}
