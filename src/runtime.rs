// Command ingress and fixed-rate control loop with watchdog
//
// Commands arrive over zenoh and are applied between control ticks; the
// tick itself drives the motor controller externally, so the zenoh loop
// is the single tick source. If the command stream goes stale the
// watchdog halts the base: without it, a crashed teleop would leave the
// robot driving at its last commanded speed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tracing::{info, warn};

use crate::config::{Config, TOPIC_CMD_MOTION, TOPIC_HEALTH, TOPIC_TELEMETRY};
use crate::messages::{MotionCommand, RuntimeHealth};
use crate::motor::{MotorController, MotorError, SimMotorBank};

struct Watchdog {
    timeout: Duration,
    cmd_received_at: Instant,
    health: RuntimeHealth,
}

impl Watchdog {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cmd_received_at: Instant::now(),
            // Start stale until the first command arrives.
            health: RuntimeHealth::CmdStale,
        }
    }

    fn feed(&mut self) {
        self.cmd_received_at = Instant::now();
        self.health = RuntimeHealth::Ok;
    }

    /// Returns true exactly once per stale transition.
    fn check(&mut self) -> bool {
        let cmd_age = self.cmd_received_at.elapsed();
        if cmd_age > self.timeout && self.health == RuntimeHealth::Ok {
            warn!("command stale ({:?} old), halting the base", cmd_age);
            self.health = RuntimeHealth::CmdStale;
            return true;
        }
        false
    }
}

fn apply_command(controller: &MotorController, cmd: MotionCommand) -> Result<(), MotorError> {
    match cmd {
        MotionCommand::SetSpeed { side, value } => controller.set_speed(side, value),
        MotionCommand::SetSpeeds { port, stbd } => controller.set_speeds(port, stbd),
        MotionCommand::Rotate { rotation, speed } => controller.rotate(rotation, speed),
        MotionCommand::SetDifferentialRatio { port, stbd } => {
            controller.set_differential_ratio(port, stbd)
        }
        MotionCommand::SetSlewRate { rate } => {
            controller.set_slew_rate(rate);
            Ok(())
        }
        MotionCommand::Brake => controller.brake(None),
        MotionCommand::Halt => controller.halt(None),
        MotionCommand::Stop => controller.stop(None),
        MotionCommand::EmergencyStop => {
            controller.emergency_stop(None);
            Ok(())
        }
        MotionCommand::ClearModifiers => {
            controller.clear_speed_modifiers();
            Ok(())
        }
    }
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    config.validate()?;
    if !config.simulate {
        return Err(Box::new(MotorError::Config(
            "no hardware driver is compiled in; run with simulate = true".into(),
        )));
    }
    // Simulated plant: roughly one wheel rotation per second at half power.
    let bank = SimMotorBank::new(1000.0);
    let controller = MotorController::new(
        &config,
        Box::new(bank.clone()),
        Arc::new(bank.clone()),
    )?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_MOTION).await?;
    let pub_telemetry = session.declare_publisher(TOPIC_TELEMETRY).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let period = Duration::from_secs_f64(1.0 / config.loop_freq_hz as f64);
    let mut tick = interval(period);
    let mut watchdog = Watchdog::new(Duration::from_millis(config.cmd_timeout_ms));

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        config.loop_freq_hz, config.cmd_timeout_ms
    );
    info!("Subscribed to: {}", TOPIC_CMD_MOTION);
    info!("Publishing to: {}, {}", TOPIC_TELEMETRY, TOPIC_HEALTH);

    loop {
        tick.tick().await;

        // 1. Drain all pending commands (non-blocking), applying in order
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<MotionCommand>(&payload) {
                Ok(cmd) => {
                    info!("Received command: {:?}", &cmd);
                    watchdog.feed();
                    if let Err(e) = apply_command(&controller, cmd) {
                        warn!("Command rejected: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Failed to parse command: {}", e);
                }
            }
        }

        // 2. Watchdog: a stale command stream halts the base once
        if watchdog.check()
            && let Err(e) = controller.halt(None)
        {
            warn!("Watchdog halt failed: {}", e);
        }

        // 3. Advance the simulated plant and run one control cycle
        bank.advance(period);
        controller.tick()?;

        // 4. Publish telemetry and health
        let telemetry_json = serde_json::to_string(&controller.telemetry())?;
        pub_telemetry.put(telemetry_json).await?;
        let health_json = serde_json::to_string(&watchdog.health)?;
        pub_health.put(health_json).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{Orientation, Side};

    fn controller() -> (MotorController, SimMotorBank) {
        let bank = SimMotorBank::new(1000.0);
        let controller = MotorController::new(
            &Config::default(),
            Box::new(bank.clone()),
            Arc::new(bank.clone()),
        )
        .unwrap();
        (controller, bank)
    }

    #[test]
    fn test_apply_set_speed() {
        let (controller, _bank) = controller();
        apply_command(
            &controller,
            MotionCommand::SetSpeed {
                side: Side::Port,
                value: 30.0,
            },
        )
        .unwrap();
        let motor = controller.motor(Orientation::Pfwd);
        assert_eq!(motor.lock().unwrap().target_speed(), 30.0);
    }

    #[test]
    fn test_apply_emergency_stop() {
        let (controller, _bank) = controller();
        apply_command(&controller, MotionCommand::EmergencyStop).unwrap();
        assert!(controller.all_motors_are_stopped());
    }

    #[test]
    fn test_watchdog_fires_once_per_stale_transition() {
        let mut watchdog = Watchdog::new(Duration::from_millis(0));
        watchdog.feed();
        std::thread::sleep(Duration::from_millis(5));
        assert!(watchdog.check());
        assert!(!watchdog.check());
        assert_eq!(watchdog.health, RuntimeHealth::CmdStale);
        watchdog.feed();
        assert_eq!(watchdog.health, RuntimeHealth::Ok);
    }

    #[test]
    fn test_hardware_mode_is_rejected() {
        let mut config = Config::default();
        config.simulate = false;
        let result = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(run(config));
        assert!(result.is_err());
    }
}
