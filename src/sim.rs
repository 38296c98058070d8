//! In-memory stand-ins for the hardware capabilities.
//!
//! Every type is a cheap handle around shared state: keep a clone to inspect
//! or steer the "hardware" after handing the other clone to the engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use crate::motor::{CurrentMonitor, Direction, DirectionPins, PwmChannel};
use crate::motor_pwm::PwmBus;
use crate::store::ConfigStore;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Debug, PartialEq)]
enum Value {
    U32(u32),
    U8(u8),
    Bool(bool),
}

#[derive(Default)]
pub struct MemoryStore {
    values: HashMap<String, Value>,
    writes: usize,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        if self.fail_writes {
            anyhow::bail!("Simulated write failure for key {}", key);
        }
        self.values.insert(key.to_string(), value);
        self.writes += 1;
        Ok(())
    }
}

impl ConfigStore for MemoryStore {
    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.values.get(key) {
            Some(Value::U32(v)) => Ok(Some(*v)),
            Some(other) => Err(anyhow::anyhow!("Key {} holds {:?}, not u32", key, other)),
            None => Ok(None),
        }
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.put(key, Value::U32(value))
    }

    fn get_u8(&self, key: &str) -> Result<Option<u8>> {
        match self.values.get(key) {
            Some(Value::U8(v)) => Ok(Some(*v)),
            Some(other) => Err(anyhow::anyhow!("Key {} holds {:?}, not u8", key, other)),
            None => Ok(None),
        }
    }

    fn put_u8(&mut self, key: &str, value: u8) -> Result<()> {
        self.put(key, Value::U8(value))
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.values.get(key) {
            Some(Value::Bool(v)) => Ok(Some(*v)),
            Some(other) => Err(anyhow::anyhow!("Key {} holds {:?}, not bool", key, other)),
            None => Ok(None),
        }
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.put(key, Value::Bool(value))
    }
}

#[derive(Default)]
struct CurrentState {
    milliamps: f32,
    init_fails: bool,
    reads: usize,
}

#[derive(Clone, Default)]
pub struct SimulatedCurrent {
    state: Arc<Mutex<CurrentState>>,
}

impl SimulatedCurrent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing() -> Self {
        let sensor = Self::default();
        guard(&sensor.state).init_fails = true;
        sensor
    }

    pub fn set_milliamps(&self, milliamps: f32) {
        guard(&self.state).milliamps = milliamps;
    }

    pub fn reads(&self) -> usize {
        guard(&self.state).reads
    }
}

impl CurrentMonitor for SimulatedCurrent {
    fn init(&mut self) -> Result<()> {
        if guard(&self.state).init_fails {
            anyhow::bail!("Simulated sensor not responding");
        }
        Ok(())
    }

    fn read_milliamps(&mut self) -> Result<f32> {
        let mut state = guard(&self.state);
        state.reads += 1;
        Ok(state.milliamps)
    }
}

#[derive(Clone, Default)]
pub struct RecordingPins {
    history: Arc<Mutex<Vec<Direction>>>,
}

impl RecordingPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<Direction> {
        guard(&self.history).last().copied()
    }

    pub fn history(&self) -> Vec<Direction> {
        guard(&self.history).clone()
    }
}

impl DirectionPins for RecordingPins {
    fn drive(&mut self, direction: Direction) -> Result<()> {
        guard(&self.history).push(direction);
        Ok(())
    }
}

#[derive(Default)]
struct BusState {
    open: u32,
    close: u32,
    writes: Vec<(PwmChannel, u32)>,
}

#[derive(Clone, Default)]
pub struct RecordingBus {
    state: Arc<Mutex<BusState>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duties(&self) -> (u32, u32) {
        let state = guard(&self.state);
        (state.open, state.close)
    }

    pub fn writes(&self) -> Vec<(PwmChannel, u32)> {
        guard(&self.state).writes.clone()
    }

    pub fn clear_writes(&self) {
        guard(&self.state).writes.clear();
    }
}

impl PwmBus for RecordingBus {
    fn set_duty(&mut self, channel: PwmChannel, duty: u32) -> Result<()> {
        let mut state = guard(&self.state);
        match channel {
            PwmChannel::Open => state.open = duty,
            PwmChannel::Close => state.close = duty,
        }
        state.writes.push((channel, duty));
        Ok(())
    }
}
