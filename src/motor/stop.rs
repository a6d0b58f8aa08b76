// Stop protocol
//
// Three graded stop modes plus an emergency stop. The graded modes work
// through the modifier pipeline: a decay modifier multiplies the motor's
// speed toward zero every cycle and the control loop winds the power down
// under closed-loop control. Emergency stop bypasses the pipeline and
// zeroes power outright.
//
// A stop command also spawns a poller that watches for the whole motor
// group to converge within the mode's timeout. A timeout is reported and
// logged, never escalated: deciding to hit the big red button is the
// operator's call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::StopConfig;
use crate::motor::MotorError;
use crate::motor::modifier::{Modifier, STOP_MODIFIER_NAME};
use crate::motor::motor::Motor;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Graded stop modes, gentlest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Gentle deceleration, e.g. approaching a waypoint.
    Brake,
    /// Firm deceleration, the default reaction to trouble.
    Halt,
    /// Hardest pipeline-based stop; forces power to zero on convergence.
    Stop,
}

impl StopMode {
    pub fn label(&self) -> &'static str {
        match self {
            StopMode::Brake => "brake",
            StopMode::Halt => "halt",
            StopMode::Stop => "stop",
        }
    }

    pub fn ratio(&self, config: &StopConfig) -> f64 {
        match self {
            StopMode::Brake => config.brake_ratio,
            StopMode::Halt => config.halt_ratio,
            StopMode::Stop => config.stop_ratio,
        }
    }

    pub fn timeout(&self, config: &StopConfig) -> Duration {
        Duration::from_millis(match self {
            StopMode::Brake => config.brake_timeout_ms,
            StopMode::Halt => config.halt_timeout_ms,
            StopMode::Stop => config.stop_timeout_ms,
        })
    }
}

/// Invoked exactly once when the stop attempt resolves, with `true` if
/// every motor converged before the mode's timeout.
pub type StopCallback = Box<dyn FnOnce(bool) + Send>;

/// Install the decay modifier on every motor and watch for convergence.
///
/// Installing over a previous stop's modifier replaces it, so the most
/// recent stop command always owns the decay ratio.
pub fn begin(
    mode: StopMode,
    motors: Vec<Arc<Mutex<Motor>>>,
    all_stopped: Arc<AtomicBool>,
    config: &StopConfig,
    callback: Option<StopCallback>,
) -> Result<(), MotorError> {
    info!(
        "{}: decaying at {} per cycle, timeout {:?}",
        mode.label(),
        mode.ratio(config),
        mode.timeout(config)
    );
    for motor in &motors {
        let mut motor = lock(motor);
        motor.set_target_speed(0.0)?;
        // Last writer wins within the stop class: a halt issued during a
        // brake replaces the brake's decay.
        motor.remove_modifier(STOP_MODIFIER_NAME);
        motor.add_modifier(
            STOP_MODIFIER_NAME,
            Modifier::Decay {
                ratio: mode.ratio(config),
                tolerance: config.speed_tolerance,
                all_stopped: all_stopped.clone(),
            },
        );
    }

    let timeout = mode.timeout(config);
    thread::Builder::new()
        .name(format!("{}-poller", mode.label()))
        .spawn(move || {
            let converged = poll(&all_stopped, timeout);
            if converged {
                info!("{}: all motors stopped", mode.label());
                if mode == StopMode::Stop {
                    // Belt and braces: the pipeline has converged, now
                    // pin the power at zero.
                    for motor in &motors {
                        lock(motor).stop();
                    }
                }
            } else {
                warn!(
                    "{}: motors still moving after {:?}",
                    mode.label(),
                    timeout
                );
            }
            if let Some(callback) = callback {
                callback(converged);
            }
        })
        .map_err(|e| MotorError::Config(format!("cannot spawn stop poller: {e}")))?;
    Ok(())
}

fn poll(all_stopped: &AtomicBool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if all_stopped.load(Ordering::Relaxed) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

fn lock(motor: &Arc<Mutex<Motor>>) -> std::sync::MutexGuard<'_, Motor> {
    match motor.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
