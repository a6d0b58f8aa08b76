// Motor controller
//
// Owns the four wheel motors, the hardware driver, and the control
// schedule. Speeds are commanded per side and fanned out; each tick runs
// every motor's pipeline against the latest encoder counts and writes the
// resulting powers to the driver.
//
// Exactly one tick source drives the loop: either the controller's own
// thread (start_loop) or an external caller (tick). Mixing the two is a
// configuration error, not a fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::Config;
use crate::messages::{MotorTelemetry, Telemetry};
use crate::motor::MotorError;
use crate::motor::driver::{Encoder, MotorDriver};
use crate::motor::modifier::{Modifier, ModifierResult};
use crate::motor::motor::Motor;
use crate::motor::orientation::{ALL_ORIENTATIONS, Orientation, Rotation, Side};
use crate::motor::scheduler::TickLoop;
use crate::motor::slew::SlewRate;
use crate::motor::stop::{self, StopCallback, StopMode};

const STEERING_MODIFIER_NAME: &str = "steering";

pub struct MotorController {
    config: Config,
    context: TickContext,
    side_speeds: Mutex<(f64, f64)>,
    external_tick: AtomicBool,
    tick_loop: Option<TickLoop>,
}

/// Everything one control tick touches, clonable into the loop thread.
#[derive(Clone)]
struct TickContext {
    motors: Vec<Arc<Mutex<Motor>>>,
    driver: Arc<Mutex<Box<dyn MotorDriver>>>,
    encoder: Arc<dyn Encoder>,
    all_stopped: Arc<AtomicBool>,
    power_tolerance: f64,
    period: Duration,
    last_tick: Arc<Mutex<Option<Instant>>>,
}

impl TickContext {
    fn run(&self, now: Instant) {
        {
            let mut last = lock(&self.last_tick);
            if let Some(prev) = *last {
                let elapsed = now.duration_since(prev);
                // A late tick still runs; the velocity estimator corrects
                // for the longer interval.
                if elapsed > self.period * 3 / 2 {
                    warn!(
                        "control tick late: {:?} elapsed, period {:?}",
                        elapsed, self.period
                    );
                }
            }
            *last = Some(now);
        }

        let mut all_stopped = true;
        for motor in &self.motors {
            let (orientation, driving, stopped) = {
                let mut motor = lock(motor);
                let steps = self.encoder.steps(motor.orientation());
                let driving = motor.update_at(steps, now);
                (
                    motor.orientation(),
                    driving,
                    motor.is_stopped(self.power_tolerance),
                )
            };
            all_stopped &= stopped;
            // A failed write is logged and skipped; the remaining motors
            // still get their commands.
            if let Err(e) = lock(&self.driver).set_motor_power(orientation, driving) {
                error!("driver write failed for {}: {}", orientation, e);
            }
        }
        self.all_stopped.store(all_stopped, Ordering::Relaxed);
    }
}

impl MotorController {
    pub fn new(
        config: &Config,
        driver: Box<dyn MotorDriver>,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self, MotorError> {
        config.validate()?;
        let mut motors = Vec::with_capacity(ALL_ORIENTATIONS.len());
        for orientation in ALL_ORIENTATIONS {
            motors.push(Arc::new(Mutex::new(Motor::new(
                orientation,
                &config.motor,
                &config.geometry,
            )?)));
        }
        info!("motor controller ready, {} motors registered", motors.len());
        Ok(Self {
            config: config.clone(),
            context: TickContext {
                motors,
                driver: Arc::new(Mutex::new(driver)),
                encoder,
                all_stopped: Arc::new(AtomicBool::new(true)),
                power_tolerance: config.stop.speed_tolerance,
                period: Duration::from_secs_f64(1.0 / config.loop_freq_hz as f64),
                last_tick: Arc::new(Mutex::new(None)),
            },
            side_speeds: Mutex::new((0.0, 0.0)),
            external_tick: AtomicBool::new(false),
            tick_loop: None,
        })
    }

    pub fn motor(&self, orientation: Orientation) -> Arc<Mutex<Motor>> {
        let index = ALL_ORIENTATIONS
            .iter()
            .position(|&o| o == orientation)
            .unwrap_or(0);
        self.context.motors[index].clone()
    }

    /// Command one side of the robot. The value is clamped to the speed
    /// range before fanning out to that side's motors.
    pub fn set_speed(&self, side: Side, value: f64) -> Result<(), MotorError> {
        if !value.is_finite() {
            return Err(MotorError::Contract(format!(
                "non-finite speed {} for {} side",
                value,
                side.label()
            )));
        }
        let max = self.config.motor.max_speed;
        let clamped = value.clamp(-max, max);
        if clamped != value {
            warn!(
                "speed {} for {} side clamped to {}",
                value,
                side.label(),
                clamped
            );
        }
        {
            let mut speeds = lock(&self.side_speeds);
            match side {
                Side::Port => speeds.0 = clamped,
                Side::Stbd => speeds.1 = clamped,
            }
        }
        for motor in &self.context.motors {
            let mut motor = lock(motor);
            if motor.orientation().side() == side {
                motor.set_target_speed(clamped)?;
            }
        }
        Ok(())
    }

    pub fn set_speeds(&self, port: f64, stbd: f64) -> Result<(), MotorError> {
        self.set_speed(Side::Port, port)?;
        self.set_speed(Side::Stbd, stbd)
    }

    /// Spin in place by driving the sides in opposition.
    pub fn rotate(&self, rotation: Rotation, speed: f64) -> Result<(), MotorError> {
        let speed = speed.abs();
        match rotation {
            Rotation::Clockwise => self.set_speeds(speed, -speed),
            Rotation::CounterClockwise => self.set_speeds(-speed, speed),
        }
    }

    /// Scale each side's speed while cornering. A ratio of 1.0 removes
    /// the shaper for that side.
    pub fn set_differential_ratio(&self, port: f64, stbd: f64) -> Result<(), MotorError> {
        for (ratio, side) in [(port, Side::Port), (stbd, Side::Stbd)] {
            if !(ratio.is_finite() && (0.0..=1.0).contains(&ratio)) {
                return Err(MotorError::Contract(format!(
                    "differential ratio for {} side must be in 0.0..=1.0, got {}",
                    side.label(),
                    ratio
                )));
            }
            for motor in &self.context.motors {
                let mut motor = lock(motor);
                if motor.orientation().side() != side {
                    continue;
                }
                motor.remove_modifier(STEERING_MODIFIER_NAME);
                if ratio != 1.0 {
                    motor.add_modifier(
                        STEERING_MODIFIER_NAME,
                        Modifier::Custom(Box::new(move |v| ModifierResult::Continue(v * ratio))),
                    );
                }
            }
        }
        Ok(())
    }

    pub fn set_slew_rate(&self, rate: SlewRate) {
        for motor in &self.context.motors {
            lock(motor).set_slew_rate(rate);
        }
    }

    /// Force-clear every motor's modifier pipeline.
    pub fn clear_speed_modifiers(&self) {
        for motor in &self.context.motors {
            lock(motor).clear_modifiers();
        }
    }

    // Tick sources

    /// Run the control loop on an owned thread at the configured rate.
    pub fn start_loop(&mut self) -> Result<(), MotorError> {
        if self.external_tick.load(Ordering::Relaxed) {
            return Err(MotorError::Config(
                "cannot start the owned loop: an external tick source is registered".into(),
            ));
        }
        if self.tick_loop.is_some() {
            return Err(MotorError::Config("control loop already running".into()));
        }
        let context = self.context.clone();
        let period = context.period;
        self.tick_loop = Some(
            TickLoop::start("motor-control", period, move || {
                context.run(Instant::now());
            })
            .map_err(|e| MotorError::Config(format!("cannot start control loop: {e}")))?,
        );
        Ok(())
    }

    pub fn stop_loop(&mut self) {
        if let Some(mut tick_loop) = self.tick_loop.take() {
            tick_loop.stop();
        }
    }

    /// Run one control cycle from an external scheduler.
    pub fn tick(&self) -> Result<(), MotorError> {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&self, now: Instant) -> Result<(), MotorError> {
        if self.tick_loop.is_some() {
            return Err(MotorError::Config(
                "cannot tick externally: the owned loop is running".into(),
            ));
        }
        self.external_tick.store(true, Ordering::Relaxed);
        self.context.run(now);
        Ok(())
    }

    // Stop protocol

    /// Gentle deceleration.
    pub fn brake(&self, callback: Option<StopCallback>) -> Result<(), MotorError> {
        self.begin_stop(StopMode::Brake, callback)
    }

    /// Firm deceleration.
    pub fn halt(&self, callback: Option<StopCallback>) -> Result<(), MotorError> {
        self.begin_stop(StopMode::Halt, callback)
    }

    /// Hardest pipeline-based stop.
    pub fn stop(&self, callback: Option<StopCallback>) -> Result<(), MotorError> {
        self.begin_stop(StopMode::Stop, callback)
    }

    fn begin_stop(&self, mode: StopMode, callback: Option<StopCallback>) -> Result<(), MotorError> {
        {
            let mut speeds = lock(&self.side_speeds);
            *speeds = (0.0, 0.0);
        }
        stop::begin(
            mode,
            self.context.motors.clone(),
            self.context.all_stopped.clone(),
            &self.config.stop,
            callback,
        )
    }

    /// Zero power on every motor immediately, bypassing the pipeline.
    /// Installed modifiers are left in place. There is nothing to wait
    /// for, so the callback fires synchronously, converged.
    pub fn emergency_stop(&self, callback: Option<StopCallback>) {
        warn!("emergency stop");
        {
            let mut speeds = lock(&self.side_speeds);
            *speeds = (0.0, 0.0);
        }
        for motor in &self.context.motors {
            let (orientation, driving) = {
                let mut motor = lock(motor);
                motor.stop();
                // Zero power is valid in every motor state.
                let driving = motor.set_power(0.0).unwrap_or(0.0);
                (motor.orientation(), driving)
            };
            if let Err(e) = lock(&self.context.driver).set_motor_power(orientation, driving) {
                error!("driver write failed for {}: {}", orientation, e);
            }
        }
        self.context.all_stopped.store(true, Ordering::Relaxed);
        if let Some(callback) = callback {
            callback(true);
        }
    }

    // Introspection

    pub fn is_stopped(&self, orientation: Orientation) -> bool {
        lock(&self.motor(orientation)).is_stopped(self.context.power_tolerance)
    }

    pub fn all_motors_are_stopped(&self) -> bool {
        self.context.all_stopped.load(Ordering::Relaxed)
    }

    /// Last commanded (clamped) speed for one side.
    pub fn side_speed(&self, side: Side) -> f64 {
        let speeds = lock(&self.side_speeds);
        match side {
            Side::Port => speeds.0,
            Side::Stbd => speeds.1,
        }
    }

    /// Mean of the modified speeds, over one side or the whole base.
    pub fn get_mean_speed(&self, side: Option<Side>) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for motor in &self.context.motors {
            let motor = lock(motor);
            if side.is_none_or(|s| motor.orientation().side() == s) {
                sum += motor.modified_speed();
                count += 1;
            }
        }
        if count == 0 { 0.0 } else { sum / count as f64 }
    }

    pub fn telemetry(&self) -> Telemetry {
        let motors = self
            .context
            .motors
            .iter()
            .map(|motor| {
                let motor = lock(motor);
                MotorTelemetry {
                    motor: motor.orientation(),
                    target_speed: motor.target_speed(),
                    modified_speed: motor.modified_speed(),
                    power: motor.power(),
                    velocity_cm_sec: motor.velocity_cm_sec(),
                    max_applied_power: motor.max_applied_power(),
                }
            })
            .collect();
        Telemetry {
            port_mean_speed: self.get_mean_speed(Some(Side::Port)),
            stbd_mean_speed: self.get_mean_speed(Some(Side::Stbd)),
            stopped: self.all_motors_are_stopped(),
            motors,
        }
    }
}

impl Drop for MotorController {
    fn drop(&mut self) {
        self.stop_loop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::modifier::STOP_MODIFIER_NAME;
    use crate::motor::sim::SimMotorBank;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    // Plant gain: at full power the encoder advances 2000 steps/s, about
    // 86 cm/s of wheel speed.
    const SIM_STEPS_PER_SEC: f64 = 2000.0;

    fn make_controller_with(config: Config) -> (MotorController, SimMotorBank) {
        let bank = SimMotorBank::new(SIM_STEPS_PER_SEC);
        let controller = MotorController::new(
            &config,
            Box::new(bank.clone()),
            Arc::new(bank.clone()),
        )
        .unwrap();
        (controller, bank)
    }

    fn make_controller() -> (MotorController, SimMotorBank) {
        make_controller_with(Config::default())
    }

    /// Proportional-only gains that contract quickly against the sim
    /// plant without oscillating.
    fn snappy_config() -> Config {
        let mut config = Config::default();
        config.motor.pid.kp = 0.5;
        config.motor.pid.ki = 0.0;
        config.motor.pid.kd = 0.0;
        config
    }

    fn run_ticks(controller: &MotorController, bank: &SimMotorBank, t0: Instant, ticks: u64) {
        for i in 0..ticks {
            bank.advance(Duration::from_millis(50));
            controller
                .tick_at(t0 + Duration::from_millis(50 * (i + 1)))
                .unwrap();
        }
    }

    #[test]
    fn test_set_speed_clamps_and_fans_out() {
        let (controller, _bank) = make_controller();
        controller.set_speed(Side::Port, 250.0).unwrap();
        assert_eq!(controller.side_speed(Side::Port), 100.0);
        assert_eq!(controller.side_speed(Side::Stbd), 0.0);
        assert_eq!(
            lock(&controller.motor(Orientation::Pfwd)).target_speed(),
            100.0
        );
        assert_eq!(
            lock(&controller.motor(Orientation::Paft)).target_speed(),
            100.0
        );
        assert_eq!(
            lock(&controller.motor(Orientation::Sfwd)).target_speed(),
            0.0
        );
    }

    #[test]
    fn test_non_finite_speed_is_rejected() {
        let (controller, _bank) = make_controller();
        assert!(controller.set_speed(Side::Port, f64::NAN).is_err());
    }

    #[test]
    fn test_rotate_opposes_sides() {
        let (controller, _bank) = make_controller();
        controller.rotate(Rotation::Clockwise, 30.0).unwrap();
        assert_eq!(
            lock(&controller.motor(Orientation::Pfwd)).target_speed(),
            30.0
        );
        assert_eq!(
            lock(&controller.motor(Orientation::Sfwd)).target_speed(),
            -30.0
        );
    }

    #[test]
    fn test_ramp_reaches_target_without_overshoot() {
        let (controller, bank) = make_controller();
        controller.set_speed(Side::Port, 50.0).unwrap();
        let t0 = Instant::now();
        controller.tick_at(t0).unwrap();
        for i in 1..40 {
            bank.advance(Duration::from_millis(50));
            controller.tick_at(t0 + Duration::from_millis(50 * i)).unwrap();
            let speed = lock(&controller.motor(Orientation::Pfwd)).modified_speed();
            assert!(speed <= 50.0 + 1e-9, "overshoot at tick {i}: {speed}");
        }
        assert_eq!(
            lock(&controller.motor(Orientation::Pfwd)).modified_speed(),
            50.0
        );
    }

    #[test]
    fn test_mean_speed_over_modified_speeds() {
        let (controller, bank) = make_controller();
        controller.set_speed(Side::Port, 40.0).unwrap();
        controller.set_speed(Side::Stbd, 20.0).unwrap();
        let t0 = Instant::now();
        controller.tick_at(t0).unwrap();
        run_ticks(&controller, &bank, t0, 60);
        assert!((controller.get_mean_speed(Some(Side::Port)) - 40.0).abs() < 1e-9);
        assert!((controller.get_mean_speed(Some(Side::Stbd)) - 20.0).abs() < 1e-9);
        assert!((controller.get_mean_speed(None) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_differential_ratio_scales_one_side() {
        let (controller, bank) = make_controller();
        controller.set_speeds(40.0, 40.0).unwrap();
        controller.set_differential_ratio(1.0, 0.5).unwrap();
        let t0 = Instant::now();
        controller.tick_at(t0).unwrap();
        run_ticks(&controller, &bank, t0, 60);
        assert!((controller.get_mean_speed(Some(Side::Port)) - 40.0).abs() < 1e-9);
        assert!((controller.get_mean_speed(Some(Side::Stbd)) - 20.0).abs() < 1e-9);
        // Ratio 1.0 removes the shaper again.
        controller.set_differential_ratio(1.0, 1.0).unwrap();
        assert!(!lock(&controller.motor(Orientation::Sfwd)).has_modifier(STEERING_MODIFIER_NAME));
    }

    #[test]
    fn test_emergency_stop_zeroes_power_keeps_pipeline() {
        let (controller, bank) = make_controller();
        controller.set_differential_ratio(0.5, 0.5).unwrap();
        controller.set_speeds(50.0, 50.0).unwrap();
        let t0 = Instant::now();
        controller.tick_at(t0).unwrap();
        run_ticks(&controller, &bank, t0, 20);
        assert!(bank.power(Orientation::Pfwd) != 0.0);
        controller.emergency_stop(None);
        for orientation in ALL_ORIENTATIONS {
            assert_eq!(bank.power(orientation), 0.0);
            assert!(controller.is_stopped(orientation));
            assert!(lock(&controller.motor(orientation)).has_modifier(STEERING_MODIFIER_NAME));
        }
        assert!(controller.all_motors_are_stopped());
    }

    #[test]
    fn test_halt_converges_and_reports() {
        let config = snappy_config();
        let (controller, bank) = make_controller_with(config);
        controller.set_speeds(50.0, 50.0).unwrap();
        let t0 = Instant::now();
        controller.tick_at(t0).unwrap();
        run_ticks(&controller, &bank, t0, 60);
        assert!(!controller.all_motors_are_stopped());

        let (tx, rx) = mpsc::channel();
        controller
            .halt(Some(Box::new(move |converged| {
                tx.send(converged).ok();
            })))
            .unwrap();
        // Keep ticking while the decay modifier winds the speed down and
        // the loop unwinds the power.
        let mut now = Duration::from_millis(50 * 61);
        for i in 0..200 {
            bank.advance(Duration::from_millis(50));
            now += Duration::from_millis(50);
            controller.tick_at(t0 + now).unwrap();
            if controller.all_motors_are_stopped() {
                break;
            }
            assert!(i < 199, "never converged");
            thread::sleep(Duration::from_millis(1));
        }
        let converged = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(converged, "halt poller reported a timeout");
        // The decay modifier removed itself on the tick after convergence.
        bank.advance(Duration::from_millis(50));
        controller.tick_at(t0 + now + Duration::from_millis(50)).unwrap();
        assert!(!lock(&controller.motor(Orientation::Pfwd)).has_modifier(STOP_MODIFIER_NAME));
    }

    #[test]
    fn test_stop_forces_zero_power() {
        let config = snappy_config();
        let (controller, bank) = make_controller_with(config);
        controller.set_speeds(50.0, 50.0).unwrap();
        let t0 = Instant::now();
        controller.tick_at(t0).unwrap();
        run_ticks(&controller, &bank, t0, 60);

        let (tx, rx) = mpsc::channel();
        controller
            .stop(Some(Box::new(move |converged| {
                tx.send(converged).ok();
            })))
            .unwrap();
        let mut now = Duration::from_millis(50 * 61);
        for _ in 0..200 {
            bank.advance(Duration::from_millis(50));
            now += Duration::from_millis(50);
            controller.tick_at(t0 + now).unwrap();
            if controller.all_motors_are_stopped() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(rx.recv_timeout(Duration::from_secs(3)).unwrap());
        for orientation in ALL_ORIENTATIONS {
            assert_eq!(lock(&controller.motor(orientation)).power(), 0.0);
        }
    }

    #[test]
    fn test_tick_sources_are_mutually_exclusive() {
        let (mut controller, _bank) = make_controller();
        controller.tick().unwrap();
        assert!(matches!(
            controller.start_loop(),
            Err(MotorError::Config(_))
        ));

        let (mut controller, _bank) = make_controller();
        controller.start_loop().unwrap();
        assert!(matches!(controller.tick(), Err(MotorError::Config(_))));
        controller.stop_loop();
    }

    #[test]
    fn test_owned_loop_drives_the_motors() {
        let (mut controller, bank) = make_controller();
        controller.set_speeds(50.0, 50.0).unwrap();
        controller.start_loop().unwrap();
        thread::sleep(Duration::from_millis(400));
        controller.stop_loop();
        assert!(bank.power(Orientation::Pfwd) > 0.0);
        controller.emergency_stop(None);
        assert_eq!(bank.power(Orientation::Pfwd), 0.0);
    }

    #[test]
    fn test_emergency_stop_callback_fires_once_synchronously() {
        let (controller, bank) = make_controller();
        controller.set_speeds(50.0, 50.0).unwrap();
        let t0 = Instant::now();
        controller.tick_at(t0).unwrap();
        run_ticks(&controller, &bank, t0, 20);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        controller.emergency_stop(Some(Box::new(move |converged| {
            assert!(converged);
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        // Fired on the calling thread before the stop returned.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(controller.all_motors_are_stopped());
    }

    #[test]
    fn test_clear_speed_modifiers() {
        let (controller, _bank) = make_controller();
        controller.set_differential_ratio(0.5, 0.5).unwrap();
        controller.halt(None).unwrap();
        controller.clear_speed_modifiers();
        for orientation in ALL_ORIENTATIONS {
            let motor = controller.motor(orientation);
            let motor = lock(&motor);
            assert!(!motor.has_modifier(STEERING_MODIFIER_NAME));
            assert!(!motor.has_modifier(STOP_MODIFIER_NAME));
        }
    }

    #[test]
    fn test_telemetry_snapshot() {
        let (controller, bank) = make_controller();
        controller.set_speed(Side::Port, 40.0).unwrap();
        let t0 = Instant::now();
        controller.tick_at(t0).unwrap();
        run_ticks(&controller, &bank, t0, 20);
        let telemetry = controller.telemetry();
        assert_eq!(telemetry.motors.len(), 4);
        assert!((telemetry.port_mean_speed - 40.0).abs() < 1e-9);
        assert_eq!(telemetry.stbd_mean_speed, 0.0);
        assert!(!telemetry.stopped);
    }
}
