use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use crate::clock::SharedClock;
use crate::config::{DriveConfig, SoftStartConfig};
use crate::motor::{Direction, PwmChannel};

pub trait PwmBus: Send {
    fn set_duty(&mut self, channel: PwmChannel, duty: u32) -> Result<()>;
}

pub type SharedArbiter = Arc<Mutex<PwmArbiter>>;

pub fn lock(arbiter: &SharedArbiter) -> MutexGuard<'_, PwmArbiter> {
    arbiter.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns the shared bus: counts active motors per direction, runs the
/// soft-start ramp and suppresses direction conflicts.
///
/// Every counter change is followed, within the same call, by a recompute
/// and write of both channels.
pub struct PwmArbiter {
    bus: Box<dyn PwmBus>,
    clock: SharedClock,
    soft_start: SoftStartConfig,
    duty_limit: u32,

    active_open: u32,
    active_close: u32,
    current_duty: u32,

    soft_start_active: bool,
    soft_start_begin: u64,
    last_step: u64,

    in_conflict: bool,
    conflict_events: u32,
}

impl PwmArbiter {
    pub fn new(bus: Box<dyn PwmBus>, clock: SharedClock, config: &DriveConfig) -> Self {
        let config = config.sanitized();
        Self {
            bus,
            clock,
            soft_start: config.soft_start.clone(),
            duty_limit: config.duty_limit(),
            active_open: 0,
            active_close: 0,
            current_duty: 0,
            soft_start_active: false,
            soft_start_begin: 0,
            last_step: 0,
            in_conflict: false,
            conflict_events: 0,
        }
    }

    pub fn into_shared(self) -> SharedArbiter {
        Arc::new(Mutex::new(self))
    }

    pub fn begin(&mut self) {
        self.write(0, 0);
        log::info!(
            "PWM bus ready (soft start {}: {}->{} over {}ms)",
            if self.soft_start.enabled { "on" } else { "off" },
            self.soft_start.min_duty,
            self.soft_start.max_duty,
            self.soft_start.duration_ms
        );
    }

    pub fn motor_started(&mut self, direction: Direction) {
        match direction {
            Direction::Open => self.active_open += 1,
            Direction::Close => self.active_close += 1,
            Direction::Stop => return,
        }

        if self.active_count() == 1 {
            self.start_drive();
        } else if !self.soft_start_active {
            self.current_duty = self.soft_start.max_duty;
        }

        self.apply_output();
    }

    pub fn motor_stopped(&mut self, direction: Direction) {
        match direction {
            Direction::Open => self.active_open = self.active_open.saturating_sub(1),
            Direction::Close => self.active_close = self.active_close.saturating_sub(1),
            Direction::Stop => return,
        }

        if self.active_count() == 0 {
            self.write(0, 0);
            self.current_duty = 0;
            self.soft_start_active = false;
            self.in_conflict = false;
            return;
        }

        if self.in_conflict && !self.has_conflict() {
            // The conflict forced the duty to zero; the survivors restart cleanly.
            log::info!("PWM bus conflict cleared, restarting drive");
            self.in_conflict = false;
            self.start_drive();
        }
        self.apply_output();
    }

    pub fn tick(&mut self) {
        if !self.soft_start_active {
            return;
        }

        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_step) < self.soft_start.step_interval_ms as u64 {
            return;
        }
        self.last_step = now;

        let elapsed = now.saturating_sub(self.soft_start_begin);
        let duration = self.soft_start.duration_ms as u64;
        if elapsed >= duration {
            self.soft_start_active = false;
            self.current_duty = self.soft_start.max_duty;
            log::info!("Soft start finished (duty={})", self.current_duty);
        } else {
            let span = (self.soft_start.max_duty - self.soft_start.min_duty) as u64;
            self.current_duty = self.soft_start.min_duty + (span * elapsed / duration) as u32;
        }

        self.apply_output();
    }

    /// Writes `duty` straight to the channel for `direction`, bypassing the
    /// ramp and the counters. For bench testing only.
    pub fn set_duty_direct(&mut self, direction: Direction, duty: u32) {
        let duty = duty.min(self.duty_limit);
        self.soft_start_active = false;
        self.current_duty = duty;
        match direction {
            Direction::Open => self.write(duty, 0),
            Direction::Close => self.write(0, duty),
            Direction::Stop => {
                self.current_duty = 0;
                self.write(0, 0);
            }
        }
    }

    pub fn reset_soft_start(&mut self) {
        self.soft_start_active = false;
        self.current_duty = self.soft_start.max_duty;
        self.apply_output();
    }

    pub fn active_count(&self) -> u32 {
        self.active_open + self.active_close
    }

    pub fn active_open(&self) -> u32 {
        self.active_open
    }

    pub fn active_close(&self) -> u32 {
        self.active_close
    }

    pub fn has_conflict(&self) -> bool {
        self.active_open > 0 && self.active_close > 0
    }

    pub fn would_conflict(&self, direction: Direction) -> bool {
        match direction {
            Direction::Open => self.active_close > 0,
            Direction::Close => self.active_open > 0,
            Direction::Stop => false,
        }
    }

    pub fn current_duty(&self) -> u32 {
        self.current_duty
    }

    pub fn is_soft_start_active(&self) -> bool {
        self.soft_start_active
    }

    pub fn conflict_events(&self) -> u32 {
        self.conflict_events
    }

    fn start_drive(&mut self) {
        if self.soft_start.enabled {
            let now = self.clock.now_ms();
            self.soft_start_active = true;
            self.soft_start_begin = now;
            self.last_step = now;
            self.current_duty = self.soft_start.min_duty;
            log::info!(
                "Soft start begun ({}->{} over {}ms)",
                self.soft_start.min_duty,
                self.soft_start.max_duty,
                self.soft_start.duration_ms
            );
        } else {
            self.current_duty = self.soft_start.max_duty;
        }
    }

    fn apply_output(&mut self) {
        let open = self.active_open > 0;
        let close = self.active_close > 0;
        match (open, close) {
            (true, false) => self.write(self.current_duty, 0),
            (false, true) => self.write(0, self.current_duty),
            (true, true) => {
                if !self.in_conflict {
                    self.in_conflict = true;
                    self.conflict_events += 1;
                    log::warn!(
                        "PWM bus conflict: {} opening, {} closing, forcing duty to 0",
                        self.active_open,
                        self.active_close
                    );
                }
                self.current_duty = 0;
                self.write(0, 0);
            }
            (false, false) => {
                self.current_duty = 0;
                self.write(0, 0);
            }
        }
    }

    fn write(&mut self, open: u32, close: u32) {
        // Lower the channel going to zero first so both are never high together.
        let order = if open == 0 {
            [(PwmChannel::Open, open), (PwmChannel::Close, close)]
        } else {
            [(PwmChannel::Close, close), (PwmChannel::Open, open)]
        };
        for (channel, duty) in order {
            if let Err(e) = self.bus.set_duty(channel, duty) {
                log::error!("Failed to write {:?} duty {}: {}", channel, duty, e);
            }
        }
    }
}
