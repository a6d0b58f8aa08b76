// Velocity PID
//
// `Pid` is the discrete PID core; `PidController` pairs it with a
// velocity estimator and accumulates the PID output into a motor power
// level, so the loop drives the power's rate of change rather than the
// power itself.

use std::time::Instant;

use tracing::debug;

use crate::config::{GeometryConfig, PidConfig};
use crate::motor::MotorError;
use crate::motor::velocity::VelocityEstimator;

pub struct Pid {
    label: String,
    kp: f64,
    ki: f64,
    kd: f64,
    min_output: Option<f64>,
    max_output: Option<f64>,
    setpoint_limit: Option<f64>,
    period_s: f64,
    setpoint: f64,
    integral: f64,
    last_input: Option<f64>,
    last_output: Option<f64>,
    last_time: Option<Instant>,
}

impl Pid {
    pub fn new(label: &str, config: &PidConfig) -> Result<Self, MotorError> {
        if config.sample_freq_hz == 0 {
            return Err(MotorError::Config(format!(
                "pid for {} needs a positive sample rate",
                label
            )));
        }
        if let (Some(min), Some(max)) = (config.min_output, config.max_output)
            && min >= max
        {
            return Err(MotorError::Config(format!(
                "pid for {}: min_output {} must be below max_output {}",
                label, min, max
            )));
        }
        Ok(Self {
            label: label.to_string(),
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
            min_output: config.min_output,
            max_output: config.max_output,
            setpoint_limit: config.setpoint_limit,
            period_s: 1.0 / config.sample_freq_hz as f64,
            setpoint: 0.0,
            integral: 0.0,
            last_input: None,
            last_output: None,
            last_time: None,
        })
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Set the target value, clamped symmetrically if a limit is configured.
    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = match self.setpoint_limit {
            Some(limit) => setpoint.clamp(-limit, limit),
            None => setpoint,
        };
    }

    /// Evaluate against the wall clock. Calls arriving faster than the
    /// configured sample rate return the previous output unchanged.
    pub fn compute(&mut self, measured: f64) -> f64 {
        self.compute_at(measured, Instant::now())
    }

    /// As [`compute`](Self::compute), with the clock injected.
    pub fn compute_at(&mut self, measured: f64, now: Instant) -> f64 {
        let dt = match self.last_time {
            Some(prev) => now.duration_since(prev).as_secs_f64(),
            None => self.period_s,
        };
        // Too early to re-evaluate; hold the previous output.
        if dt < self.period_s * 0.95
            && let Some(last) = self.last_output
        {
            return last;
        }
        self.last_time = Some(now);
        // A baseline call has dt == 0; evaluate over one nominal period.
        let dt = if dt > 0.0 { dt } else { self.period_s };
        self.step(measured, dt)
    }

    /// Evaluate over an explicit timestep. A non-positive `dt` is a caller
    /// bug and fails loudly instead of corrupting the integral.
    pub fn compute_with_dt(&mut self, measured: f64, dt: f64) -> Result<f64, MotorError> {
        if dt <= 0.0 {
            return Err(MotorError::Contract(format!(
                "pid for {}: dt must be positive, got {}",
                self.label, dt
            )));
        }
        Ok(self.step(measured, dt))
    }

    fn step(&mut self, measured: f64, dt: f64) -> f64 {
        let error = self.setpoint - measured;
        let p = self.kp * error;

        self.integral += self.ki * error * dt;
        self.integral = self.clip(self.integral);

        // Derivative on measurement, immune to setpoint steps.
        let d = match self.last_input {
            Some(last) => -self.kd * (measured - last) / dt,
            None => 0.0,
        };

        let output = self.clip(p + self.integral + d);
        debug!(
            "pid {}: sp {:.3} pv {:.3} p {:.4} i {:.4} d {:.4} -> {:.4}",
            self.label, self.setpoint, measured, p, self.integral, d, output
        );
        self.last_input = Some(measured);
        self.last_output = Some(output);
        output
    }

    /// Clear all accumulated state. The setpoint is preserved.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_input = None;
        self.last_output = None;
        self.last_time = None;
    }

    fn clip(&self, value: f64) -> f64 {
        let value = match self.max_output {
            Some(max) => value.min(max),
            None => value,
        };
        match self.min_output {
            Some(min) => value.max(min),
            None => value,
        }
    }
}

/// Closed-loop velocity controller for one motor.
///
/// Each update estimates the wheel velocity from the encoder count, runs
/// the PID against the velocity setpoint, and folds the output into an
/// accumulated power level.
pub struct PidController {
    pid: Pid,
    estimator: VelocityEstimator,
    accumulated: f64,
    accumulated_limit: f64,
    divisor: f64,
}

impl PidController {
    pub fn new(
        label: &str,
        config: &PidConfig,
        geometry: &GeometryConfig,
        power_limit: f64,
    ) -> Result<Self, MotorError> {
        if config.output_to_power_divisor <= 0.0 {
            return Err(MotorError::Config(format!(
                "pid for {}: output divisor must be positive, got {}",
                label, config.output_to_power_divisor
            )));
        }
        if power_limit <= 0.0 {
            return Err(MotorError::Config(format!(
                "pid for {}: power limit must be positive, got {}",
                label, power_limit
            )));
        }
        Ok(Self {
            pid: Pid::new(label, config)?,
            estimator: VelocityEstimator::new(label, config.sample_freq_hz, geometry)?,
            accumulated: 0.0,
            // Anti-windup on the power accumulator: once the motor power
            // saturates, stop accumulating past it.
            accumulated_limit: power_limit * config.output_to_power_divisor,
            divisor: config.output_to_power_divisor,
        })
    }

    /// Target velocity in cm/s.
    pub fn set_setpoint(&mut self, velocity_cm_sec: f64) {
        self.pid.set_setpoint(velocity_cm_sec);
    }

    pub fn setpoint(&self) -> f64 {
        self.pid.setpoint()
    }

    /// Latest velocity estimate, cm/s.
    pub fn velocity_cm_sec(&self) -> f64 {
        self.estimator.velocity_cm_sec()
    }

    /// Feed one encoder sample and return the new motor power.
    pub fn update(&mut self, steps: i64) -> f64 {
        self.update_at(steps, Instant::now())
    }

    pub fn update_at(&mut self, steps: i64, now: Instant) -> f64 {
        let velocity = self.estimator.tick_at(steps, now);
        self.accumulated += self.pid.compute_at(velocity, now);
        self.accumulated = self
            .accumulated
            .clamp(-self.accumulated_limit, self.accumulated_limit);
        self.accumulated / self.divisor
    }

    /// Clear PID state, the velocity baseline, and the power accumulator.
    pub fn reset(&mut self) {
        self.pid.reset();
        self.estimator.reset();
        self.accumulated = 0.0;
    }

    /// Discard the velocity baseline only; the next sample reports zero.
    pub fn reset_velocity(&mut self) {
        self.estimator.reset();
    }
}
