use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::clock::SharedClock;
use crate::command::{Command, CommandHandler, Rejection, Target};
use crate::config::{DriveConfig, MOTOR_COUNT};
use crate::motion::{Fault, MotorController, SharedResources};
use crate::motor::{CurrentMonitor, Direction, DirectionPins, MotorState};
use crate::motor_pwm::{self, PwmArbiter, PwmBus, SharedArbiter};
use crate::store::SharedStore;

pub struct MotorBinding {
    pub pins: Box<dyn DirectionPins>,
    pub sensor: Box<dyn CurrentMonitor>,
}

pub struct Fleet {
    arbiter: SharedArbiter,
    motors: Vec<MotorController>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MotorStatus {
    pub id: u8,
    pub state: MotorState,
    pub direction: Direction,
    pub position: u8,
    pub target_position: u8,
    pub calibrated: bool,
    pub open_duration_ms: u32,
    pub close_duration_ms: u32,
    pub current_ma: Option<f32>,
    pub max_current_ma: f32,
    pub sensor_degraded: bool,
    pub last_fault: Option<Fault>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BusStatus {
    pub duty: u32,
    pub active_open: u32,
    pub active_close: u32,
    pub soft_start_active: bool,
    pub conflict_events: u32,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub motors: Vec<MotorStatus>,
    pub bus: BusStatus,
}

impl Fleet {
    pub fn build(
        bus: Box<dyn PwmBus>,
        clock: SharedClock,
        store: SharedStore,
        config: &DriveConfig,
        bindings: Vec<MotorBinding>,
    ) -> Result<Self> {
        anyhow::ensure!(
            !bindings.is_empty() && bindings.len() <= MOTOR_COUNT,
            "Expected 1..={} motors, got {}",
            MOTOR_COUNT,
            bindings.len()
        );

        let config = config.sanitized();
        let arbiter = PwmArbiter::new(bus, Arc::clone(&clock), &config).into_shared();
        let shared = SharedResources {
            arbiter: arbiter.clone(),
            store,
            clock,
            config,
        };
        let motors = bindings
            .into_iter()
            .enumerate()
            .map(|(i, binding)| {
                MotorController::new(i as u8 + 1, binding.pins, binding.sensor, &shared)
            })
            .collect();

        Ok(Self { arbiter, motors })
    }

    pub fn begin(&mut self) {
        motor_pwm::lock(&self.arbiter).begin();
        for motor in &mut self.motors {
            motor.begin();
        }
    }

    pub fn tick(&mut self) {
        motor_pwm::lock(&self.arbiter).tick();
        for motor in &mut self.motors {
            motor.tick();
        }
    }

    pub fn dispatch(&mut self, target: Target, command: Command) -> Vec<(u8, Result<(), Rejection>)> {
        match target {
            Target::All => self
                .motors
                .iter_mut()
                .map(|motor| (motor.id(), motor.handle(command)))
                .collect(),
            Target::Motor(id) => {
                let result = match self.motor_mut(id) {
                    Some(motor) => motor.handle(command),
                    None => {
                        log::warn!("No motor {}, ignoring {:?}", id, command);
                        Err(Rejection::UnknownMotor(id))
                    }
                };
                vec![(id, result)]
            }
        }
    }

    pub fn motor(&self, id: u8) -> Option<&MotorController> {
        self.motors.iter().find(|m| m.id() == id)
    }

    pub fn motor_mut(&mut self, id: u8) -> Option<&mut MotorController> {
        self.motors.iter_mut().find(|m| m.id() == id)
    }

    pub fn motors(&self) -> &[MotorController] {
        &self.motors
    }

    pub fn arbiter(&self) -> &SharedArbiter {
        &self.arbiter
    }

    pub fn status(&mut self) -> StatusReport {
        let motors = self
            .motors
            .iter_mut()
            .map(|motor| MotorStatus {
                id: motor.id(),
                state: motor.state(),
                direction: motor.direction(),
                position: motor.position(),
                target_position: motor.target_position(),
                calibrated: motor.is_calibrated(),
                open_duration_ms: motor.open_duration(),
                close_duration_ms: motor.close_duration(),
                current_ma: motor.current_reading(),
                max_current_ma: motor.max_current_seen(),
                sensor_degraded: motor.sensor_degraded(),
                last_fault: motor.last_fault(),
            })
            .collect();

        let bus = motor_pwm::lock(&self.arbiter);
        StatusReport {
            motors,
            bus: BusStatus {
                duty: bus.current_duty(),
                active_open: bus.active_open(),
                active_close: bus.active_close(),
                soft_start_active: bus.is_soft_start_active(),
                conflict_events: bus.conflict_events(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::clock::ManualClock;
    use crate::sim::{MemoryStore, RecordingBus, RecordingPins, SimulatedCurrent};

    fn bindings(n: usize) -> Vec<MotorBinding> {
        (0..n)
            .map(|_| MotorBinding {
                pins: Box::new(RecordingPins::new()),
                sensor: Box::new(SimulatedCurrent::new()),
            })
            .collect()
    }

    fn fleet(n: usize) -> Result<Fleet> {
        Fleet::build(
            Box::new(RecordingBus::new()),
            Arc::new(ManualClock::new()),
            Arc::new(Mutex::new(MemoryStore::new())),
            &DriveConfig::default(),
            bindings(n),
        )
    }

    #[test]
    fn motor_count_is_bounded() {
        assert!(fleet(0).is_err());
        assert!(fleet(5).is_err());
        let fleet = fleet(4).unwrap();
        let ids: Vec<u8> = fleet.motors().iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_motor_is_rejected() {
        let mut fleet = fleet(2).unwrap();
        fleet.begin();
        assert_eq!(
            fleet.dispatch(Target::Motor(7), Command::Open),
            vec![(7, Err(Rejection::UnknownMotor(7)))]
        );
    }

    #[test]
    fn broadcast_reaches_every_motor() {
        let mut fleet = fleet(3).unwrap();
        fleet.begin();
        let outcomes = fleet.dispatch(Target::All, Command::Close);
        assert_eq!(outcomes, vec![(1, Ok(())), (2, Ok(())), (3, Ok(()))]);
        assert_eq!(motor_pwm::lock(fleet.arbiter()).active_close(), 3);

        fleet.dispatch(Target::All, Command::Stop);
        assert_eq!(motor_pwm::lock(fleet.arbiter()).active_count(), 0);
    }

    #[test]
    fn status_serializes() {
        let mut fleet = fleet(1).unwrap();
        fleet.begin();
        fleet.dispatch(Target::Motor(1), Command::Open);
        let status = fleet.status();
        assert_eq!(status.motors[0].state, MotorState::Opening);
        assert_eq!(status.bus.active_open, 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["motors"][0]["state"], "Opening");
        assert_eq!(json["motors"][0]["current_ma"], 0.0);
        assert_eq!(json["bus"]["duty"], 100);
    }
}
