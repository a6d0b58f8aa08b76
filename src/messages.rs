// Message types for the runtime's zenoh surface

use serde::{Deserialize, Serialize};

use crate::motor::orientation::{Orientation, Rotation, Side};
use crate::motor::slew::SlewRate;

/// Command from teleop/scripts -> runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum MotionCommand {
    /// Command one side of the base, in speed units.
    SetSpeed { side: Side, value: f64 },
    /// Command both sides at once.
    SetSpeeds { port: f64, stbd: f64 },
    /// Spin in place.
    Rotate { rotation: Rotation, speed: f64 },
    /// Scale each side's speed while cornering (1.0 clears a side).
    SetDifferentialRatio { port: f64, stbd: f64 },
    /// Swap the slew rate profile.
    SetSlewRate { rate: SlewRate },
    /// Graded stops, gentlest first.
    Brake,
    Halt,
    Stop,
    /// Immediate zero power, no deceleration curve.
    EmergencyStop,
    /// Drop every installed speed modifier.
    ClearModifiers,
}

/// Per-motor state in a telemetry frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorTelemetry {
    pub motor: Orientation,
    pub target_speed: f64,
    pub modified_speed: f64,
    pub power: f64,
    pub velocity_cm_sec: f64,
    pub max_applied_power: f64,
}

/// Periodic state published by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub port_mean_speed: f64,
    pub stbd_mean_speed: f64,
    pub stopped: bool,
    pub motors: Vec<MotorTelemetry>,
}

/// Health status published by the runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
}
