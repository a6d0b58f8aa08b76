// Runtime and motor configuration
//
// Loaded once at startup from an optional JSON file; every field has a
// default matching the rover's tuned values. The magic numbers here (stop
// ratios, jerk tolerance, slew rates) are tuned against the physical robot.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::motor::MotorError;
use crate::motor::slew::SlewRate;

// Zenoh topics
pub const TOPIC_CMD_MOTION: &str = "rover/cmd/motion"; // inbound commands
pub const TOPIC_TELEMETRY: &str = "rover/state/motion"; // telemetry
pub const TOPIC_HEALTH: &str = "rover/state/health"; // health status

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control loop frequency in Hz.
    pub loop_freq_hz: u32,
    /// Watchdog: halt if no command arrives within this window (ms).
    pub cmd_timeout_ms: u64,
    /// Run against the simulated motor bank instead of hardware.
    pub simulate: bool,
    pub motor: MotorConfig,
    pub geometry: GeometryConfig,
    pub stop: StopConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loop_freq_hz: 20,
            cmd_timeout_ms: 5000,
            simulate: true,
            motor: MotorConfig::default(),
            geometry: GeometryConfig::default(),
            stop: StopConfig::default(),
        }
    }
}

/// Per-motor configuration shared by all four motors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// Speed clamp in speed units (commands span -max_speed..max_speed).
    pub max_speed: f64,
    /// Absolute power limit sent to the driver (0.0..=1.0).
    pub power_limit: f64,
    /// Battery-voltage-to-motor-voltage scaling applied to every
    /// driver write.
    pub power_scale: f64,
    /// Conversion from speed units to the PID's velocity setpoint
    /// (cm/s per speed unit).
    pub speed_to_cm_sec: f64,
    pub enable_slew_limiter: bool,
    pub enable_jerk_limiter: bool,
    pub pid: PidConfig,
    pub slew: SlewConfig,
    pub jerk: JerkConfig,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            max_speed: 100.0,
            power_limit: 0.8,
            power_scale: 0.75,
            speed_to_cm_sec: 0.45,
            enable_slew_limiter: true,
            enable_jerk_limiter: true,
            pid: PidConfig::default(),
            slew: SlewConfig::default(),
            jerk: JerkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub min_output: Option<f64>,
    pub max_output: Option<f64>,
    /// Optional symmetric clamp on the velocity setpoint.
    pub setpoint_limit: Option<f64>,
    /// PID sample frequency; also the velocity estimator's nominal rate.
    pub sample_freq_hz: u32,
    /// Accumulated PID output is divided by this to yield motor power.
    pub output_to_power_divisor: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.09500,
            ki: 0.00000,
            kd: 0.00030,
            min_output: Some(-10.0),
            max_output: Some(10.0),
            setpoint_limit: None,
            sample_freq_hz: 20,
            output_to_power_divisor: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlewConfig {
    pub minimum_output: f64,
    pub maximum_output: f64,
    pub default_rate: SlewRate,
}

impl Default for SlewConfig {
    fn default() -> Self {
        Self {
            minimum_output: 0.0,
            maximum_output: 100.0,
            default_rate: SlewRate::Normal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JerkConfig {
    /// Tolerance as a percentage (0-100) of the motor power limit.
    pub tolerance_percent: f64,
}

impl Default for JerkConfig {
    fn default() -> Self {
        Self {
            tolerance_percent: 10.0,
        }
    }
}

/// Wheel and encoder geometry, used by the velocity estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Wheel diameter in millimeters.
    pub wheel_diameter_mm: f64,
    /// Encoder steps per full wheel rotation.
    pub steps_per_rotation: f64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            wheel_diameter_mm: 68.0,
            steps_per_rotation: 494.0,
        }
    }
}

/// Stop protocol tuning: decay ratios and convergence timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    pub brake_ratio: f64,
    pub halt_ratio: f64,
    pub stop_ratio: f64,
    pub brake_timeout_ms: u64,
    pub halt_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    /// A decayed speed within this absolute tolerance of zero holds at
    /// exactly zero.
    pub speed_tolerance: f64,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            brake_ratio: 0.93,
            halt_ratio: 0.78,
            stop_ratio: 0.50,
            brake_timeout_ms: 6000,
            halt_timeout_ms: 2500,
            stop_timeout_ms: 1000,
            speed_tolerance: 1e-2,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file and validate it.
    pub fn load(path: &Path) -> Result<Self, MotorError> {
        let text = fs::read_to_string(path)
            .map_err(|e| MotorError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| MotorError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints. Construction-time failures are
    /// fatal; nothing here is silently defaulted.
    pub fn validate(&self) -> Result<(), MotorError> {
        if self.loop_freq_hz == 0 {
            return Err(MotorError::Config("loop_freq_hz must be positive".into()));
        }
        if self.motor.pid.sample_freq_hz == 0 {
            return Err(MotorError::Config("sample_freq_hz must be positive".into()));
        }
        if !(self.motor.power_limit > 0.0 && self.motor.power_limit <= 1.0) {
            return Err(MotorError::Config(format!(
                "power_limit must be in (0.0, 1.0], got {}",
                self.motor.power_limit
            )));
        }
        if self.motor.max_speed <= 0.0 {
            return Err(MotorError::Config("max_speed must be positive".into()));
        }
        if !(0.0..=100.0).contains(&self.motor.jerk.tolerance_percent) {
            return Err(MotorError::Config(format!(
                "jerk tolerance must be a percentage (0-100), got {}",
                self.motor.jerk.tolerance_percent
            )));
        }
        if let (Some(min), Some(max)) = (self.motor.pid.min_output, self.motor.pid.max_output)
            && min >= max
        {
            return Err(MotorError::Config(format!(
                "pid min_output {} must be below max_output {}",
                min, max
            )));
        }
        if self.geometry.wheel_diameter_mm <= 0.0 || self.geometry.steps_per_rotation <= 0.0 {
            return Err(MotorError::Config("degenerate wheel geometry".into()));
        }
        for (name, ratio) in [
            ("brake_ratio", self.stop.brake_ratio),
            ("halt_ratio", self.stop.halt_ratio),
            ("stop_ratio", self.stop.stop_ratio),
        ] {
            if !(0.0 < ratio && ratio < 1.0) {
                return Err(MotorError::Config(format!(
                    "{} must be in (0.0, 1.0), got {}",
                    name, ratio
                )));
            }
        }
        Ok(())
    }

    /// Nominal control period in milliseconds.
    pub fn loop_period_ms(&self) -> f64 {
        1000.0 / self.loop_freq_hz as f64
    }
}
