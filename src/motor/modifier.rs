// Speed modifier pipeline
//
// Modifiers rewrite a motor's speed on every update, between the slew
// limiter and the PID setpoint. They are installed by name and applied in
// insertion order; a modifier that reports completion is removed from the
// pipeline by the motor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Reserved name for the stop-protocol modifier. At most one stop-class
/// modifier is installed per motor; a new one replaces the old.
pub const STOP_MODIFIER_NAME: &str = "stop";

/// Outcome of applying a modifier to a speed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModifierResult {
    /// Keep going with this (possibly rewritten) speed.
    Continue(f64),
    /// The modifier's job is finished; remove it and settle at zero.
    Done,
}

pub enum Modifier {
    /// Multiplies the speed by a ratio below one each cycle, used by the
    /// stop protocol. Signals completion once every motor in the group has
    /// converged to zero power.
    Decay {
        ratio: f64,
        tolerance: f64,
        all_stopped: Arc<AtomicBool>,
    },
    /// Arbitrary speed rewrite, e.g. a steering differential ratio.
    Custom(Box<dyn FnMut(f64) -> ModifierResult + Send>),
}

impl Modifier {
    pub fn apply(&mut self, speed: f64) -> ModifierResult {
        match self {
            Modifier::Decay {
                ratio,
                tolerance,
                all_stopped,
            } => {
                if all_stopped.load(Ordering::Relaxed) {
                    return ModifierResult::Done;
                }
                let decayed = speed * *ratio;
                if decayed.abs() <= *tolerance {
                    // Close enough: settle at exactly zero, but keep the
                    // modifier installed until the whole group converges.
                    ModifierResult::Continue(0.0)
                } else {
                    ModifierResult::Continue(decayed)
                }
            }
            Modifier::Custom(f) => f(speed),
        }
    }

    /// Whether this is the stop protocol's decay modifier.
    pub fn is_decay(&self) -> bool {
        matches!(self, Modifier::Decay { .. })
    }
}

impl std::fmt::Debug for Modifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modifier::Decay { ratio, tolerance, .. } => f
                .debug_struct("Decay")
                .field("ratio", ratio)
                .field("tolerance", tolerance)
                .finish(),
            Modifier::Custom(_) => f.write_str("Custom"),
        }
    }
}
