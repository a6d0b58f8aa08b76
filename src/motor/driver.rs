// Hardware boundary
//
// Everything above this file works in abstract power levels and encoder
// step counts. A driver implementation owns the actual bus.

use thiserror::Error;

use crate::motor::orientation::Orientation;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("driver write failed for {motor}: {reason}")]
    Write { motor: Orientation, reason: String },
    #[error("driver is not connected: {0}")]
    NotConnected(String),
}

/// Sink for motor power commands.
///
/// `power` is a signed fraction of full scale. Implementations receive
/// values already clipped to the configured power limit and scaled for
/// the supply voltage.
pub trait MotorDriver: Send {
    fn set_motor_power(&mut self, motor: Orientation, power: f64) -> Result<(), DriverError>;
}

/// Source of cumulative encoder step counts, one per motor. Counts
/// increase while driving forward and decrease in reverse.
pub trait Encoder: Send + Sync {
    fn steps(&self, motor: Orientation) -> i64;
}
