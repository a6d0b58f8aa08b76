// Per-wheel state machine
//
// Each update runs the full speed-to-power pipeline:
//
//   callbacks -> slew limit -> modifier pipeline -> PID setpoint
//             -> closed-loop power -> jerk limit -> driving power
//
// The motor never touches hardware itself; update() returns the driving
// power and the controller fans it out to the driver.

use std::time::Instant;

use tracing::{info, warn};

use crate::config::{GeometryConfig, MotorConfig};
use crate::motor::MotorError;
use crate::motor::jerk::JerkLimiter;
use crate::motor::modifier::{Modifier, ModifierResult};
use crate::motor::orientation::Orientation;
use crate::motor::pid::PidController;
use crate::motor::slew::{SlewLimiter, SlewRate};

pub struct Motor {
    orientation: Orientation,
    enabled: bool,
    max_speed: f64,
    power_limit: f64,
    power_scale: f64,
    speed_to_cm_sec: f64,
    target_speed: f64,
    slewed_speed: f64,
    modified_speed: f64,
    power: f64,
    max_applied_power: f64,
    slew: SlewLimiter,
    jerk: JerkLimiter,
    pid: PidController,
    modifiers: Vec<(String, Modifier)>,
    callbacks: Vec<Box<dyn FnMut() + Send>>,
}

impl Motor {
    pub fn new(
        orientation: Orientation,
        config: &MotorConfig,
        geometry: &GeometryConfig,
    ) -> Result<Self, MotorError> {
        let label = orientation.label();
        let mut slew = SlewLimiter::new(
            label,
            config.slew.minimum_output,
            config.slew.maximum_output,
            config.slew.default_rate,
        );
        if !config.enable_slew_limiter {
            slew.disable();
        }
        let mut jerk = JerkLimiter::new(label, config.jerk.tolerance_percent, config.power_limit)?;
        if !config.enable_jerk_limiter {
            jerk.disable();
        }
        Ok(Self {
            orientation,
            enabled: true,
            max_speed: config.max_speed,
            power_limit: config.power_limit,
            power_scale: config.power_scale,
            speed_to_cm_sec: config.speed_to_cm_sec,
            target_speed: 0.0,
            slewed_speed: 0.0,
            modified_speed: 0.0,
            power: 0.0,
            max_applied_power: 0.0,
            slew,
            jerk,
            pid: PidController::new(label, &config.pid, geometry, config.power_limit)?,
            modifiers: Vec::new(),
            callbacks: Vec::new(),
        })
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.slew.enable();
        self.pid.reset();
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        // Drop the velocity baseline so no stale estimate survives the
        // disabled period.
        self.pid.reset_velocity();
        self.enabled = false;
    }

    pub fn target_speed(&self) -> f64 {
        self.target_speed
    }

    pub fn modified_speed(&self) -> f64 {
        self.modified_speed
    }

    /// Last commanded power, before supply-voltage scaling.
    pub fn power(&self) -> f64 {
        self.power
    }

    /// Largest absolute driving power seen since construction.
    pub fn max_applied_power(&self) -> f64 {
        self.max_applied_power
    }

    /// Latest velocity estimate. A disabled or stopped motor reports
    /// exactly zero rather than the last computed value.
    pub fn velocity_cm_sec(&self) -> f64 {
        if !self.enabled || self.is_stopped(0.0) {
            return 0.0;
        }
        self.pid.velocity_cm_sec()
    }

    /// Power within `tolerance` of zero counts as stopped.
    pub fn is_stopped(&self, tolerance: f64) -> bool {
        self.power.abs() <= tolerance
    }

    pub fn set_slew_rate(&mut self, rate: SlewRate) {
        self.slew.set_rate(rate);
    }

    /// Request a new speed, in speed units. The value is clamped to the
    /// motor's range; the slew limiter meters out the actual change over
    /// the following updates.
    pub fn set_target_speed(&mut self, speed: f64) -> Result<(), MotorError> {
        if !speed.is_finite() {
            return Err(MotorError::Contract(format!(
                "non-finite target speed {} for {}",
                speed, self.orientation
            )));
        }
        if !self.enabled && speed != 0.0 {
            return Err(MotorError::Contract(format!(
                "cannot command {} while disabled",
                self.orientation
            )));
        }
        self.target_speed = speed.clamp(-self.max_speed, self.max_speed);
        Ok(())
    }

    /// Install a named modifier. Installing under a name that already
    /// exists is a no-op with a warning; callers that want to swap a
    /// modifier remove the old one first.
    pub fn add_modifier(&mut self, name: &str, modifier: Modifier) {
        if self.has_modifier(name) {
            warn!(
                "motor {}: modifier '{}' already installed, ignoring",
                self.orientation, name
            );
            return;
        }
        self.modifiers.push((name.to_string(), modifier));
    }

    pub fn remove_modifier(&mut self, name: &str) -> bool {
        let before = self.modifiers.len();
        self.modifiers.retain(|(n, _)| n != name);
        self.modifiers.len() != before
    }

    pub fn has_modifier(&self, name: &str) -> bool {
        self.modifiers.iter().any(|(n, _)| n == name)
    }

    pub fn modifier_count(&self) -> usize {
        self.modifiers.len()
    }

    pub fn clear_modifiers(&mut self) {
        self.modifiers.clear();
    }

    /// Register a hook run at the top of every update.
    pub fn add_update_callback(&mut self, callback: Box<dyn FnMut() + Send>) {
        self.callbacks.push(callback);
    }

    /// Command the motor power directly, bypassing the speed pipeline.
    /// Returns the driving power to hand to the driver. Zero is always
    /// acceptable; a disabled motor rejects any other value.
    pub fn set_power(&mut self, power: f64) -> Result<f64, MotorError> {
        if !power.is_finite() {
            return Err(MotorError::Contract(format!(
                "non-finite power {} for {}",
                power, self.orientation
            )));
        }
        if !self.enabled && power != 0.0 {
            return Err(MotorError::Contract(format!(
                "cannot power {} while disabled",
                self.orientation
            )));
        }
        self.power = self.clip_power(power);
        let driving = round4(self.clip_power(self.power * self.power_scale));
        if driving.abs() > self.max_applied_power {
            self.max_applied_power = driving.abs();
        }
        Ok(driving)
    }

    /// Zero everything that produces power. The modifier pipeline is left
    /// untouched so an in-flight stop protocol keeps its modifier.
    pub fn stop(&mut self) {
        self.target_speed = 0.0;
        self.slewed_speed = 0.0;
        self.modified_speed = 0.0;
        self.power = 0.0;
        self.pid.reset();
    }

    /// Run one control cycle against the current encoder count and return
    /// the driving power to hand to the driver.
    pub fn update(&mut self, steps: i64) -> f64 {
        self.update_at(steps, Instant::now())
    }

    pub fn update_at(&mut self, steps: i64, now: Instant) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        for callback in &mut self.callbacks {
            callback();
        }

        // The slew limiter tracks its own pre-modifier value; modifiers
        // downstream must not widen or narrow the ramp.
        self.slewed_speed = self
            .slew
            .limit_at(self.slewed_speed, self.target_speed, now);
        let mut speed = self.slewed_speed;

        // Modifiers run in insertion order. A completion signal removes
        // its modifier, settles the motor at zero, and ends the pipeline
        // for this cycle.
        let mut finished: Option<usize> = None;
        for (index, (_, modifier)) in self.modifiers.iter_mut().enumerate() {
            match modifier.apply(speed) {
                ModifierResult::Continue(v) => speed = v,
                ModifierResult::Done => {
                    finished = Some(index);
                    speed = 0.0;
                    break;
                }
            }
        }
        if let Some(index) = finished {
            let (name, _) = self.modifiers.remove(index);
            info!("motor {}: modifier '{}' completed", self.orientation, name);
            self.target_speed = 0.0;
            self.slewed_speed = 0.0;
            // The next manual command starts from the default ramp, not
            // whatever profile was active while stopping.
            self.slew.reset();
        }

        // Modifiers cannot push the setpoint past the speed range.
        self.modified_speed = speed.clamp(-self.max_speed, self.max_speed);
        self.pid.set_setpoint(self.modified_speed * self.speed_to_cm_sec);

        let raw_power = self.pid.update_at(steps, now);
        self.power = self.jerk.limit(self.power, self.clip_power(raw_power));

        let driving = round4(self.clip_power(self.power * self.power_scale));
        if driving.abs() > self.max_applied_power {
            self.max_applied_power = driving.abs();
        }
        driving
    }

    fn clip_power(&self, value: f64) -> f64 {
        value.clamp(-self.power_limit, self.power_limit)
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
