// Motor placement identifiers for the rover base
//
// Four wheel motors, two per side:
//
//     pfwd: Port-Forward        sfwd: Starboard-Forward
//     paft: Port-Aft            saft: Starboard-Aft

use serde::{Deserialize, Serialize};

/// Logical side of the robot. Motors are commanded per side, not
/// individually, by the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Port,
    Stbd,
}

impl Side {
    /// Short label used for log messages.
    pub fn label(&self) -> &'static str {
        match self {
            Side::Port => "port",
            Side::Stbd => "stbd",
        }
    }
}

/// Physical position of a motor, assigned once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Pfwd,
    Sfwd,
    Paft,
    Saft,
}

/// All motor positions, in registration (and therefore update) order.
pub const ALL_ORIENTATIONS: [Orientation; 4] = [
    Orientation::Pfwd,
    Orientation::Sfwd,
    Orientation::Paft,
    Orientation::Saft,
];

impl Orientation {
    /// The logical side this motor belongs to.
    pub fn side(&self) -> Side {
        match self {
            Orientation::Pfwd | Orientation::Paft => Side::Port,
            Orientation::Sfwd | Orientation::Saft => Side::Stbd,
        }
    }

    /// Short label used for log messages.
    pub fn label(&self) -> &'static str {
        match self {
            Orientation::Pfwd => "pfwd",
            Orientation::Sfwd => "sfwd",
            Orientation::Paft => "paft",
            Orientation::Saft => "saft",
        }
    }
}

impl std::fmt::Display for Orientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Direction of an in-place rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    Clockwise,
    CounterClockwise,
}
