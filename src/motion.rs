use std::sync::{Arc, MutexGuard};

use serde::Serialize;
use thiserror::Error;

use crate::clock::SharedClock;
use crate::command::{Command, CommandHandler, Rejection};
use crate::config::DriveConfig;
use crate::motor::{CurrentMonitor, Direction, DirectionPins, MotorState};
use crate::motor_pwm::{self, PwmArbiter, SharedArbiter};
use crate::store::{Calibration, CalibrationKeys, ConfigStore, SharedStore};

#[derive(Error, Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Fault {
    #[error("overcurrent ({milliamps:.0}mA)")]
    Overcurrent { milliamps: f32 },
    #[error("maximum runtime exceeded after {elapsed_ms}ms")]
    RuntimeExceeded { elapsed_ms: u64 },
}

#[derive(Clone)]
pub struct SharedResources {
    pub arbiter: SharedArbiter,
    pub store: SharedStore,
    pub clock: SharedClock,
    pub config: DriveConfig,
}

pub struct MotorController {
    id: u8,
    pins: Box<dyn DirectionPins>,
    sensor: Box<dyn CurrentMonitor>,
    arbiter: SharedArbiter,
    store: SharedStore,
    clock: SharedClock,
    keys: CalibrationKeys,

    state: MotorState,
    direction: Direction,
    position: u8,
    target_position: u8,
    start_position: u8,

    open_duration_ms: u32,
    close_duration_ms: u32,
    calibrated: bool,

    move_start: u64,
    position_origin_ms: u64,
    last_position_update: u64,

    max_current_seen: f32,
    overcurrent_threshold_ma: f32,
    max_runtime_ms: u32,
    position_update_interval_ms: u32,

    sensor_degraded: bool,
    last_fault: Option<Fault>,
}

impl MotorController {
    pub fn new(
        id: u8,
        pins: Box<dyn DirectionPins>,
        sensor: Box<dyn CurrentMonitor>,
        shared: &SharedResources,
    ) -> Self {
        let config = shared.config.sanitized();
        Self {
            id,
            pins,
            sensor,
            arbiter: shared.arbiter.clone(),
            store: shared.store.clone(),
            clock: shared.clock.clone(),
            keys: CalibrationKeys::for_motor(id),
            state: MotorState::Stopped,
            direction: Direction::Stop,
            position: 0,
            target_position: 0,
            start_position: 0,
            open_duration_ms: 0,
            close_duration_ms: 0,
            calibrated: false,
            move_start: 0,
            position_origin_ms: 0,
            last_position_update: 0,
            max_current_seen: 0.0,
            overcurrent_threshold_ma: config.overcurrent_threshold_ma,
            max_runtime_ms: config.max_runtime_ms,
            position_update_interval_ms: config.position_update_interval_ms,
            sensor_degraded: false,
            last_fault: None,
        }
    }

    pub fn begin(&mut self) {
        if let Err(e) = self.pins.init() {
            log::error!("Motor {}: failed to configure enable pins: {}", self.id, e);
        }

        match self.sensor.init() {
            Ok(()) => log::info!("Motor {}: current sensor ready", self.id),
            Err(e) => {
                self.sensor_degraded = true;
                log::warn!(
                    "Motor {}: current sensor unavailable ({}), overcurrent protection disabled",
                    self.id,
                    e
                );
            }
        }

        self.load_calibration();
    }

    // ===== Cooperative tick =====

    pub fn tick(&mut self) {
        if self.state == MotorState::Stopped {
            return;
        }

        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_position_update) >= self.position_update_interval_ms as u64 {
            self.update_position(now);
            self.last_position_update = now;
        }

        self.check_current();
        if self.state == MotorState::Stopped {
            return;
        }

        if self.target_reached() {
            log::info!("Motor {}: reached {}%", self.id, self.position);
            self.stop();
            return;
        }

        let elapsed = now.saturating_sub(self.move_start);
        if elapsed > self.max_runtime_ms as u64 {
            log::warn!(
                "Motor {}: maximum runtime exceeded ({}ms), forcing stop",
                self.id,
                elapsed
            );
            self.last_fault = Some(Fault::RuntimeExceeded { elapsed_ms: elapsed });
            self.stop();
        }
    }

    fn update_position(&mut self, now: u64) {
        let total = match self.direction {
            Direction::Open => self.open_duration_ms,
            Direction::Close => self.close_duration_ms,
            Direction::Stop => return,
        };
        if total == 0 {
            return;
        }

        let elapsed = now.saturating_sub(self.position_origin_ms);
        let travelled = (elapsed * 100 / total as u64).min(100) as u8;
        self.position = match self.direction {
            Direction::Open => self.start_position.saturating_add(travelled).min(100),
            _ => self.start_position.saturating_sub(travelled),
        };
    }

    // Without a learned duration the position never moves, so only the
    // current limit or the watchdog can end the run.
    fn target_reached(&self) -> bool {
        match self.state {
            MotorState::Opening if self.open_duration_ms > 0 => {
                self.position >= self.target_position
            }
            MotorState::Closing if self.close_duration_ms > 0 => {
                self.position <= self.target_position
            }
            _ => false,
        }
    }

    fn check_current(&mut self) {
        if self.sensor_degraded {
            return;
        }

        let current = match self.sensor.read_milliamps() {
            Ok(current) => current,
            Err(e) => {
                log::warn!("Motor {}: current read failed: {}", self.id, e);
                return;
            }
        };
        if current > self.max_current_seen {
            self.max_current_seen = current;
        }

        if current > self.overcurrent_threshold_ma {
            if self.state.is_learning() {
                // End of travel: the actuator stalled against its stop.
                self.finish_learn();
            } else {
                log::warn!("Motor {}: current limit reached ({:.2}mA)", self.id, current);
                self.last_fault = Some(Fault::Overcurrent { milliamps: current });
                self.stop();
            }
        }
    }

    // ===== Movement commands =====

    pub fn open(&mut self) -> Result<(), Rejection> {
        self.start_move(Direction::Open, 100)
    }

    pub fn close(&mut self) -> Result<(), Rejection> {
        self.start_move(Direction::Close, 0)
    }

    pub fn move_to_position(&mut self, position: u8) -> Result<(), Rejection> {
        if !self.calibrated {
            log::warn!("Motor {}: not calibrated, ignoring move to {}%", self.id, position);
            return Err(Rejection::NotCalibrated);
        }
        if self.state.is_learning() {
            return Err(Rejection::LearnInProgress);
        }

        let target = position.min(100);
        if target > self.position {
            self.start_move(Direction::Open, target)
        } else if target < self.position {
            self.start_move(Direction::Close, target)
        } else {
            Ok(())
        }
    }

    pub fn stop(&mut self) {
        let arbiter = Arc::clone(&self.arbiter);
        let mut bus = motor_pwm::lock(&arbiter);
        self.release(&mut bus);
    }

    fn start_move(&mut self, direction: Direction, target: u8) -> Result<(), Rejection> {
        if self.state.is_learning() {
            log::warn!("Motor {}: learn run in progress, ignoring {:?}", self.id, direction);
            return Err(Rejection::LearnInProgress);
        }
        if self.direction == direction {
            self.target_position = target;
            return Ok(());
        }

        let arbiter = Arc::clone(&self.arbiter);
        let mut bus = motor_pwm::lock(&arbiter);
        if bus.would_conflict(direction) {
            log::warn!(
                "Motor {}: conflict, {:?} is active on the bus",
                self.id,
                direction.opposite()
            );
            return Err(Rejection::Conflict);
        }

        let state = match direction {
            Direction::Open => MotorState::Opening,
            _ => MotorState::Closing,
        };
        log::info!("Motor {}: {:?} towards {}%", self.id, state, target);
        self.target_position = target;
        self.engage(&mut bus, state);
        Ok(())
    }

    fn engage(&mut self, bus: &mut PwmArbiter, state: MotorState) {
        let now = self.clock.now_ms();
        self.state = state;
        self.direction = state.direction();
        self.start_position = self.position;
        self.move_start = now;
        self.position_origin_ms = now;
        self.last_position_update = now;
        self.max_current_seen = 0.0;
        self.last_fault = None;

        if let Err(e) = self.pins.drive(self.direction) {
            log::error!("Motor {}: failed to drive enable pins: {}", self.id, e);
        }
        bus.motor_started(self.direction);
    }

    fn release(&mut self, bus: &mut PwmArbiter) {
        let previous = self.direction;
        if previous != Direction::Stop {
            log::info!("Motor {}: stopping at {}%", self.id, self.position);
        }

        self.state = MotorState::Stopped;
        self.direction = Direction::Stop;

        if let Err(e) = self.pins.drive(Direction::Stop) {
            log::error!("Motor {}: failed to release enable pins: {}", self.id, e);
        }
        bus.motor_stopped(previous);
    }

    // ===== Learn mode =====

    pub fn start_learn_open(&mut self) -> Result<(), Rejection> {
        self.start_learn(Direction::Open)
    }

    pub fn start_learn_close(&mut self) -> Result<(), Rejection> {
        self.start_learn(Direction::Close)
    }

    fn start_learn(&mut self, direction: Direction) -> Result<(), Rejection> {
        let arbiter = Arc::clone(&self.arbiter);
        let mut bus = motor_pwm::lock(&arbiter);

        // A learn always ends the motor's own movement, even when refused.
        if self.state != MotorState::Stopped {
            self.release(&mut bus);
        }

        if bus.would_conflict(direction) {
            log::warn!("Motor {}: conflict, cannot learn {:?}", self.id, direction);
            return Err(Rejection::Conflict);
        }

        let (state, start, target) = match direction {
            Direction::Open => (MotorState::LearningOpen, 0, 100),
            _ => (MotorState::LearningClose, 100, 0),
        };
        log::info!("Motor {}: learning {:?} travel time", self.id, direction);
        self.position = start;
        self.target_position = target;
        self.engage(&mut bus, state);
        bus.reset_soft_start();
        Ok(())
    }

    /// Records the elapsed learn time as the full-travel duration for the
    /// learned direction, persists once both directions are known, and stops.
    pub fn finish_learn(&mut self) {
        let elapsed = self.clock.now_ms().saturating_sub(self.move_start);
        let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);

        match self.state {
            MotorState::LearningOpen => {
                self.open_duration_ms = elapsed;
                self.position = 100;
                log::info!(
                    "Motor {}: open time {}ms ({:.1}s)",
                    self.id,
                    elapsed,
                    elapsed as f32 / 1000.0
                );
            }
            MotorState::LearningClose => {
                self.close_duration_ms = elapsed;
                self.position = 0;
                log::info!(
                    "Motor {}: close time {}ms ({:.1}s)",
                    self.id,
                    elapsed,
                    elapsed as f32 / 1000.0
                );
            }
            _ => {
                log::warn!("Motor {}: finish_learn called while not learning", self.id);
                return;
            }
        }

        self.calibrated = self.open_duration_ms > 0 && self.close_duration_ms > 0;
        if self.calibrated {
            self.save_calibration();
        }

        self.stop();
    }

    pub fn cancel_learn(&mut self) {
        if self.state.is_learning() {
            log::info!("Motor {}: learn run cancelled", self.id);
        }
        self.stop();
    }

    // ===== Persistence =====

    fn store(&self) -> MutexGuard<'_, dyn ConfigStore + 'static> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_calibration(&mut self) {
        let loaded = Calibration::load(&*self.store(), &self.keys);
        match loaded {
            Ok(calibration) => {
                self.open_duration_ms = calibration.open_duration_ms;
                self.close_duration_ms = calibration.close_duration_ms;
                self.position = calibration.position;
                self.calibrated = calibration.calibrated
                    && calibration.open_duration_ms > 0
                    && calibration.close_duration_ms > 0;
                log::info!(
                    "Motor {}: config loaded (open:{}ms close:{}ms pos:{}% cal:{})",
                    self.id,
                    self.open_duration_ms,
                    self.close_duration_ms,
                    self.position,
                    self.calibrated
                );
            }
            Err(e) => log::error!("Motor {}: failed to load calibration: {}", self.id, e),
        }
    }

    fn save_calibration(&mut self) {
        let calibration = self.calibration();
        let saved = calibration.save(&mut *self.store(), &self.keys);
        match saved {
            Ok(()) => log::info!("Motor {}: calibration saved", self.id),
            Err(e) => log::error!("Motor {}: failed to save calibration: {}", self.id, e),
        }
    }

    pub fn reset_calibration(&mut self) {
        self.stop();
        self.open_duration_ms = 0;
        self.close_duration_ms = 0;
        self.position = 0;
        self.calibrated = false;
        self.save_calibration();
    }

    // ===== Operator helpers =====

    pub fn set_position(&mut self, position: u8) {
        self.position = position.min(100);
        if self.state != MotorState::Stopped {
            self.start_position = self.position;
            self.position_origin_ms = self.clock.now_ms();
        }
    }

    pub fn set_overcurrent_threshold(&mut self, milliamps: f32) {
        self.overcurrent_threshold_ma = milliamps;
    }

    // ===== Queries =====

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn position(&self) -> u8 {
        self.position
    }

    pub fn target_position(&self) -> u8 {
        self.target_position
    }

    pub fn state(&self) -> MotorState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn open_duration(&self) -> u32 {
        self.open_duration_ms
    }

    pub fn close_duration(&self) -> u32 {
        self.close_duration_ms
    }

    pub fn calibration(&self) -> Calibration {
        Calibration {
            open_duration_ms: self.open_duration_ms,
            close_duration_ms: self.close_duration_ms,
            position: self.position,
            calibrated: self.calibrated,
        }
    }

    pub fn current_reading(&mut self) -> Option<f32> {
        if self.sensor_degraded {
            return None;
        }
        self.sensor.read_milliamps().ok()
    }

    pub fn max_current_seen(&self) -> f32 {
        self.max_current_seen
    }

    pub fn overcurrent_threshold(&self) -> f32 {
        self.overcurrent_threshold_ma
    }

    pub fn is_moving(&self) -> bool {
        self.state != MotorState::Stopped
    }

    pub fn sensor_degraded(&self) -> bool {
        self.sensor_degraded
    }

    pub fn last_fault(&self) -> Option<Fault> {
        self.last_fault
    }
}

impl CommandHandler for MotorController {
    fn handle(&mut self, command: Command) -> Result<(), Rejection> {
        match command {
            Command::Open => self.open(),
            Command::Close => self.close(),
            Command::Stop => {
                self.stop();
                Ok(())
            }
            Command::MoveTo(position) => self.move_to_position(position),
            Command::LearnOpen => self.start_learn_open(),
            Command::LearnClose => self.start_learn_close(),
            Command::CancelLearn => {
                self.cancel_learn();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use rstest::rstest;

    use crate::clock::ManualClock;
    use crate::sim::{MemoryStore, RecordingBus, RecordingPins, SimulatedCurrent};

    const TICK_MS: u64 = 10;

    struct Rig {
        motor: MotorController,
        pins: RecordingPins,
        sensor: SimulatedCurrent,
        bus: RecordingBus,
        clock: ManualClock,
        store: Arc<Mutex<MemoryStore>>,
        arbiter: SharedArbiter,
    }

    impl Rig {
        fn new(store: MemoryStore, sensor: SimulatedCurrent) -> Self {
            let config = DriveConfig::default();
            let clock = ManualClock::new();
            let bus = RecordingBus::new();
            let arbiter =
                PwmArbiter::new(Box::new(bus.clone()), Arc::new(clock.clone()), &config).into_shared();
            motor_pwm::lock(&arbiter).begin();
            let store = Arc::new(Mutex::new(store));
            let shared = SharedResources {
                arbiter: arbiter.clone(),
                store: store.clone(),
                clock: Arc::new(clock.clone()),
                config,
            };
            let pins = RecordingPins::new();
            let mut motor =
                MotorController::new(1, Box::new(pins.clone()), Box::new(sensor.clone()), &shared);
            motor.begin();
            Self { motor, pins, sensor, bus, clock, store, arbiter }
        }

        fn blank() -> Self {
            Self::new(MemoryStore::new(), SimulatedCurrent::new())
        }

        fn calibrated(open_ms: u32, close_ms: u32, position: u8) -> Self {
            let mut store = MemoryStore::new();
            Calibration {
                open_duration_ms: open_ms,
                close_duration_ms: close_ms,
                position,
                calibrated: true,
            }
            .save(&mut store, &CalibrationKeys::for_motor(1))
            .unwrap();
            Self::new(store, SimulatedCurrent::new())
        }

        fn run(&mut self, ms: u64) {
            for _ in 0..ms / TICK_MS {
                self.clock.advance(TICK_MS);
                motor_pwm::lock(&self.arbiter).tick();
                self.motor.tick();
            }
        }

        fn active(&self) -> (u32, u32) {
            let bus = motor_pwm::lock(&self.arbiter);
            (bus.active_open(), bus.active_close())
        }
    }

    #[test]
    fn begin_deenergizes_pins_and_loads_calibration() {
        let rig = Rig::calibrated(20_000, 18_000, 45);
        assert_eq!(rig.pins.history(), vec![Direction::Stop]);
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.motor.direction(), Direction::Stop);
        assert!(rig.motor.is_calibrated());
        assert_eq!(rig.motor.open_duration(), 20_000);
        assert_eq!(rig.motor.close_duration(), 18_000);
        assert_eq!(rig.motor.position(), 45);
        assert!(!rig.motor.sensor_degraded());
    }

    #[test]
    fn stale_calibrated_flag_is_not_trusted() {
        let mut store = MemoryStore::new();
        Calibration { open_duration_ms: 20_000, close_duration_ms: 0, position: 0, calibrated: true }
            .save(&mut store, &CalibrationKeys::for_motor(1))
            .unwrap();
        let rig = Rig::new(store, SimulatedCurrent::new());
        assert!(!rig.motor.is_calibrated());
    }

    #[test]
    fn open_drives_pins_and_registers_with_bus() {
        let mut rig = Rig::blank();
        assert_eq!(rig.motor.open(), Ok(()));
        assert_eq!(rig.motor.state(), MotorState::Opening);
        assert_eq!(rig.motor.direction(), Direction::Open);
        assert_eq!(rig.pins.last(), Some(Direction::Open));
        assert_eq!(rig.active(), (1, 0));
        assert_eq!(rig.bus.duties(), (100, 0));

        rig.motor.stop();
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.pins.last(), Some(Direction::Stop));
        assert_eq!(rig.active(), (0, 0));
        assert_eq!(rig.bus.duties(), (0, 0));
    }

    #[test]
    fn repeated_open_registers_once() {
        let mut rig = Rig::blank();
        rig.motor.open().unwrap();
        rig.run(500);
        rig.motor.open().unwrap();
        assert_eq!(rig.active(), (1, 0));
        rig.motor.stop();
        rig.motor.stop();
        assert_eq!(rig.active(), (0, 0));
    }

    #[test]
    fn reversing_without_stop_is_rejected() {
        let mut rig = Rig::blank();
        rig.motor.close().unwrap();
        let history = rig.pins.history().len();
        assert_eq!(rig.motor.open(), Err(Rejection::Conflict));
        assert_eq!(rig.motor.state(), MotorState::Closing);
        assert_eq!(rig.pins.history().len(), history);
        assert_eq!(rig.active(), (0, 1));
    }

    #[test]
    fn position_interpolates_while_opening() {
        let mut rig = Rig::calibrated(10_000, 10_000, 0);
        rig.motor.open().unwrap();
        let mut last = 0;
        for _ in 0..50 {
            rig.run(100);
            let position = rig.motor.position();
            assert!(position >= last);
            assert!(position <= 100);
            last = position;
        }
        assert_eq!(rig.motor.position(), 50);
    }

    #[test]
    fn position_counts_down_from_start_while_closing() {
        let mut rig = Rig::calibrated(10_000, 8_000, 80);
        rig.motor.close().unwrap();
        rig.run(2_000);
        // 2000ms of 8000ms is 25% of travel
        assert_eq!(rig.motor.position(), 55);
    }

    #[test]
    fn plain_open_stops_at_full_travel() {
        let mut rig = Rig::calibrated(3_000, 3_000, 0);
        rig.motor.open().unwrap();
        rig.run(3_200);
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.motor.position(), 100);
        assert_eq!(rig.bus.duties(), (0, 0));
    }

    #[test]
    fn plain_close_without_learned_time_runs_until_current_limit() {
        let mut rig = Rig::blank();
        assert_eq!(rig.motor.position(), 0);
        rig.motor.close().unwrap();
        rig.run(5_000);
        assert_eq!(rig.motor.state(), MotorState::Closing);
        assert_eq!(rig.active(), (0, 1));

        rig.sensor.set_milliamps(3_500.0);
        rig.run(TICK_MS);
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.motor.position(), 0);
    }

    #[test]
    fn calibrated_close_at_end_stop_ends_on_first_tick() {
        let mut rig = Rig::calibrated(10_000, 10_000, 0);
        rig.motor.close().unwrap();
        rig.run(TICK_MS);
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.active(), (0, 0));
    }

    #[test]
    fn move_to_requires_calibration() {
        let mut rig = Rig::blank();
        assert_eq!(rig.motor.move_to_position(50), Err(Rejection::NotCalibrated));
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.pins.history(), vec![Direction::Stop]);
        assert_eq!(rig.active(), (0, 0));
    }

    #[rstest]
    #[case(30, MotorState::Opening)]
    #[case(70, MotorState::Closing)]
    #[case(60, MotorState::Stopped)]
    fn move_to_picks_direction_from_current_position(
        #[case] start: u8,
        #[case] expected: MotorState,
    ) {
        let mut rig = Rig::calibrated(10_000, 10_000, start);
        assert_eq!(rig.motor.move_to_position(60), Ok(()));
        assert_eq!(rig.motor.state(), expected);
        if expected == MotorState::Stopped {
            assert_eq!(rig.pins.history(), vec![Direction::Stop]);
        } else {
            assert_eq!(rig.motor.target_position(), 60);
        }
    }

    #[test]
    fn move_to_stops_at_target() {
        let mut rig = Rig::calibrated(10_000, 10_000, 30);
        rig.motor.move_to_position(60).unwrap();
        rig.run(2_900);
        assert_eq!(rig.motor.state(), MotorState::Opening);
        rig.run(200);
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.motor.position(), 60);
        assert_eq!(rig.active(), (0, 0));
    }

    #[test]
    fn move_to_clamps_target() {
        let mut rig = Rig::calibrated(10_000, 10_000, 30);
        rig.motor.move_to_position(250).unwrap();
        assert_eq!(rig.motor.target_position(), 100);
    }

    #[test]
    fn overcurrent_during_move_is_a_fault() {
        let mut rig = Rig::calibrated(10_000, 10_000, 0);
        rig.motor.open().unwrap();
        rig.run(1_000);
        rig.sensor.set_milliamps(3_500.0);
        rig.run(TICK_MS);

        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.motor.last_fault(), Some(Fault::Overcurrent { milliamps: 3_500.0 }));
        assert_eq!(rig.motor.open_duration(), 10_000);
        assert_eq!(rig.motor.max_current_seen(), 3_500.0);
        assert_eq!(rig.active(), (0, 0));
    }

    #[test]
    fn current_at_threshold_is_not_overcurrent() {
        let mut rig = Rig::blank();
        rig.sensor.set_milliamps(3_000.0);
        rig.motor.open().unwrap();
        rig.run(100);
        assert_eq!(rig.motor.state(), MotorState::Opening);
    }

    #[test]
    fn learn_open_measures_travel_time() {
        let mut rig = Rig::blank();
        rig.motor.start_learn_open().unwrap();
        assert_eq!(rig.motor.state(), MotorState::LearningOpen);
        assert_eq!(rig.motor.position(), 0);
        assert_eq!(rig.motor.target_position(), 100);

        rig.run(4_990);
        rig.sensor.set_milliamps(4_000.0);
        rig.run(TICK_MS);

        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.motor.open_duration(), 5_000);
        assert_eq!(rig.motor.position(), 100);
        assert!(!rig.motor.is_calibrated());
        assert_eq!(rig.motor.last_fault(), None);
        assert_eq!(rig.store.lock().unwrap().write_count(), 0);
    }

    #[test]
    fn second_learn_calibrates_and_persists() {
        let mut rig = Rig::blank();
        rig.motor.start_learn_open().unwrap();
        rig.run(5_000);
        rig.sensor.set_milliamps(4_000.0);
        rig.run(TICK_MS);
        rig.sensor.set_milliamps(800.0);

        rig.motor.start_learn_close().unwrap();
        assert_eq!(rig.motor.position(), 100);
        rig.run(4_000);
        rig.sensor.set_milliamps(4_000.0);
        rig.run(TICK_MS);

        assert!(rig.motor.is_calibrated());
        assert_eq!(rig.motor.close_duration(), 4_010);
        assert_eq!(rig.motor.position(), 0);

        let stored =
            Calibration::load(&*rig.store.lock().unwrap(), &CalibrationKeys::for_motor(1)).unwrap();
        assert_eq!(
            stored,
            Calibration {
                open_duration_ms: 5_010,
                close_duration_ms: 4_010,
                position: 0,
                calibrated: true,
            }
        );
    }

    #[test]
    fn learn_runs_at_full_duty() {
        let mut rig = Rig::blank();
        rig.motor.start_learn_close().unwrap();
        assert_eq!(rig.bus.duties(), (0, 255));
        assert!(!motor_pwm::lock(&rig.arbiter).is_soft_start_active());
    }

    #[test]
    fn cancel_learn_keeps_durations() {
        let mut rig = Rig::calibrated(10_000, 9_000, 50);
        rig.motor.start_learn_open().unwrap();
        rig.run(2_000);
        rig.motor.cancel_learn();
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.motor.open_duration(), 10_000);
        assert_eq!(rig.motor.close_duration(), 9_000);
        assert_eq!(rig.active(), (0, 0));
    }

    #[test]
    fn movement_commands_are_refused_while_learning() {
        let mut rig = Rig::calibrated(10_000, 9_000, 50);
        rig.motor.start_learn_open().unwrap();
        assert_eq!(rig.motor.open(), Err(Rejection::LearnInProgress));
        assert_eq!(rig.motor.close(), Err(Rejection::LearnInProgress));
        assert_eq!(rig.motor.move_to_position(10), Err(Rejection::LearnInProgress));
        assert_eq!(rig.motor.state(), MotorState::LearningOpen);
        assert_eq!(rig.active(), (1, 0));
    }

    #[test]
    fn learn_preempts_own_movement() {
        let mut rig = Rig::blank();
        rig.motor.close().unwrap();
        assert_eq!(rig.motor.start_learn_open(), Ok(()));
        assert_eq!(rig.motor.state(), MotorState::LearningOpen);
        assert_eq!(rig.active(), (1, 0));
    }

    #[test]
    fn runtime_watchdog_fires_once() {
        let mut rig = Rig::blank();
        rig.motor.open().unwrap();
        rig.run(120_000);
        assert_eq!(rig.motor.state(), MotorState::Opening);
        rig.run(TICK_MS);
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert!(matches!(rig.motor.last_fault(), Some(Fault::RuntimeExceeded { .. })));
        assert_eq!(rig.active(), (0, 0));

        let writes = rig.pins.history().len();
        rig.run(1_000);
        assert_eq!(rig.pins.history().len(), writes);
    }

    #[test]
    fn position_override_does_not_postpone_watchdog() {
        let mut rig = Rig::blank();
        rig.motor.open().unwrap();
        rig.run(60_000);
        rig.motor.set_position(10);
        rig.run(60_000);
        rig.motor.set_position(20);
        assert_eq!(rig.motor.state(), MotorState::Opening);

        rig.run(TICK_MS);
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert!(matches!(rig.motor.last_fault(), Some(Fault::RuntimeExceeded { .. })));
    }

    #[test]
    fn position_override_restarts_interpolation() {
        let mut rig = Rig::calibrated(10_000, 10_000, 0);
        rig.motor.open().unwrap();
        rig.run(2_000);
        assert_eq!(rig.motor.position(), 20);
        rig.motor.set_position(50);
        rig.run(1_000);
        assert_eq!(rig.motor.position(), 60);
        assert_eq!(rig.motor.state(), MotorState::Opening);
    }

    #[test]
    fn degraded_sensor_disables_overcurrent() {
        let mut rig = Rig::new(MemoryStore::new(), SimulatedCurrent::missing());
        assert!(rig.motor.sensor_degraded());
        assert_eq!(rig.motor.current_reading(), None);

        rig.sensor.set_milliamps(10_000.0);
        rig.motor.open().unwrap();
        rig.run(1_000);
        assert_eq!(rig.motor.state(), MotorState::Opening);
        assert_eq!(rig.sensor.reads(), 0);
    }

    #[test]
    fn failed_persist_still_stops() {
        let mut rig = Rig::calibrated(10_000, 9_000, 50);
        rig.store.lock().unwrap().set_fail_writes(true);
        rig.motor.start_learn_open().unwrap();
        rig.run(1_000);
        rig.sensor.set_milliamps(4_000.0);
        rig.run(TICK_MS);
        assert_eq!(rig.motor.state(), MotorState::Stopped);
        assert_eq!(rig.motor.open_duration(), 1_010);
    }

    #[test]
    fn reset_calibration_persists_blank_record() {
        let mut rig = Rig::calibrated(10_000, 9_000, 50);
        rig.motor.reset_calibration();
        assert!(!rig.motor.is_calibrated());
        let stored =
            Calibration::load(&*rig.store.lock().unwrap(), &CalibrationKeys::for_motor(1)).unwrap();
        assert_eq!(stored, Calibration::default());
    }

    #[test]
    fn handler_routes_commands() {
        let mut rig = Rig::calibrated(10_000, 9_000, 50);
        assert_eq!(rig.motor.handle(Command::MoveTo(20)), Ok(()));
        assert_eq!(rig.motor.state(), MotorState::Closing);
        assert_eq!(rig.motor.handle(Command::Stop), Ok(()));
        assert_eq!(rig.motor.handle(Command::LearnClose), Ok(()));
        assert_eq!(rig.motor.state(), MotorState::LearningClose);
        assert_eq!(rig.motor.handle(Command::CancelLearn), Ok(()));
        assert_eq!(rig.motor.state(), MotorState::Stopped);
    }
}
