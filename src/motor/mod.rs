// Motion control core for the rover base
//
// Provides:
// - Per-wheel closed-loop speed control (PID over encoder velocity)
// - Slew and jerk limiting on the speed-to-power pipeline
// - A named speed-modifier pipeline and the graded stop protocol
// - A fixed-rate controller over the four wheel motors

pub mod controller;
pub mod driver;
pub mod jerk;
pub mod modifier;
pub mod motor;
pub mod orientation;
pub mod pid;
pub mod scheduler;
pub mod sim;
pub mod slew;
pub mod stop;
pub mod velocity;

use thiserror::Error;

pub use controller::MotorController;
pub use driver::{DriverError, Encoder, MotorDriver};
pub use modifier::{Modifier, ModifierResult};
pub use motor::Motor;
pub use orientation::{ALL_ORIENTATIONS, Orientation, Rotation, Side};
pub use sim::SimMotorBank;
pub use slew::SlewRate;
pub use stop::{StopCallback, StopMode};

#[derive(Error, Debug)]
pub enum MotorError {
    /// Invalid configuration or an impossible controller setup.
    #[error("configuration error: {0}")]
    Config(String),
    /// A caller violated an API contract (bad argument, wrong state).
    #[error("contract violation: {0}")]
    Contract(String),
    /// The hardware driver rejected a command.
    #[error(transparent)]
    Driver(#[from] DriverError),
}
