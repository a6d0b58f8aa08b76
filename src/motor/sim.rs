// Simulated motor bank
//
// A first-order plant for running the runtime without hardware: wheel
// velocity is proportional to the commanded power, and the encoder count
// is its integral. One bank serves all four motors; cloning shares state,
// so the same bank can be handed out as both driver and encoder.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::motor::driver::{DriverError, Encoder, MotorDriver};
use crate::motor::orientation::{ALL_ORIENTATIONS, Orientation};

#[derive(Clone)]
pub struct SimMotorBank {
    state: Arc<Mutex<SimState>>,
    /// Encoder steps per second at full power.
    steps_per_sec_full: f64,
}

struct SimState {
    power: HashMap<Orientation, f64>,
    steps: HashMap<Orientation, f64>,
}

impl SimMotorBank {
    pub fn new(steps_per_sec_full: f64) -> Self {
        let mut power = HashMap::new();
        let mut steps = HashMap::new();
        for motor in ALL_ORIENTATIONS {
            power.insert(motor, 0.0);
            steps.insert(motor, 0.0);
        }
        Self {
            state: Arc::new(Mutex::new(SimState { power, steps })),
            steps_per_sec_full,
        }
    }

    /// Advance the plant: integrate each motor's velocity over `dt`.
    pub fn advance(&self, dt: Duration) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let dt_s = dt.as_secs_f64();
        for motor in ALL_ORIENTATIONS {
            let power = state.power[&motor];
            if let Some(steps) = state.steps.get_mut(&motor) {
                *steps += power * self.steps_per_sec_full * dt_s;
            }
        }
    }

    /// Current commanded power for one motor.
    pub fn power(&self, motor: Orientation) -> f64 {
        let state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.power[&motor]
    }
}

impl MotorDriver for SimMotorBank {
    fn set_motor_power(&mut self, motor: Orientation, power: f64) -> Result<(), DriverError> {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!("sim motor {}: power {:.4}", motor, power);
        state.power.insert(motor, power);
        Ok(())
    }
}

impl Encoder for SimMotorBank {
    fn steps(&self, motor: Orientation) -> i64 {
        let state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.steps[&motor].round() as i64
    }
}
