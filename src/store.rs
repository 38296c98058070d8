use std::sync::{Arc, Mutex};

use anyhow::Result;

/// Key-value persistence that survives power loss.
///
/// `get_*` returns `Ok(None)` for keys that were never written.
pub trait ConfigStore: Send {
    fn get_u32(&self, key: &str) -> Result<Option<u32>>;
    fn put_u32(&mut self, key: &str, value: u32) -> Result<()>;
    fn get_u8(&self, key: &str) -> Result<Option<u8>>;
    fn put_u8(&mut self, key: &str, value: u8) -> Result<()>;
    fn get_bool(&self, key: &str) -> Result<Option<bool>>;
    fn put_bool(&mut self, key: &str, value: bool) -> Result<()>;
}

pub type SharedStore = Arc<Mutex<dyn ConfigStore>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalibrationKeys {
    pub open: String,
    pub close: String,
    pub position: String,
    pub calibrated: String,
}

impl CalibrationKeys {
    pub fn for_motor(id: u8) -> Self {
        Self {
            open: format!("motor{id}_open"),
            close: format!("motor{id}_close"),
            position: format!("motor{id}_pos"),
            calibrated: format!("motor{id}_cal"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Calibration {
    pub open_duration_ms: u32,
    pub close_duration_ms: u32,
    pub position: u8,
    pub calibrated: bool,
}

impl Calibration {
    pub fn load(store: &dyn ConfigStore, keys: &CalibrationKeys) -> Result<Self> {
        Ok(Self {
            open_duration_ms: store.get_u32(&keys.open)?.unwrap_or(0),
            close_duration_ms: store.get_u32(&keys.close)?.unwrap_or(0),
            position: store.get_u8(&keys.position)?.unwrap_or(0).min(100),
            calibrated: store.get_bool(&keys.calibrated)?.unwrap_or(false),
        })
    }

    pub fn save(&self, store: &mut dyn ConfigStore, keys: &CalibrationKeys) -> Result<()> {
        store.put_u32(&keys.open, self.open_duration_ms)?;
        store.put_u32(&keys.close, self.close_duration_ms)?;
        store.put_u8(&keys.position, self.position)?;
        store.put_bool(&keys.calibrated, self.calibrated)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryStore;

    #[test]
    fn keys_are_namespaced_per_motor() {
        let keys = CalibrationKeys::for_motor(2);
        assert_eq!(keys.open, "motor2_open");
        assert_eq!(keys.close, "motor2_close");
        assert_eq!(keys.position, "motor2_pos");
        assert_eq!(keys.calibrated, "motor2_cal");
    }

    #[test]
    fn load_from_empty_store_is_unlearned() {
        let store = MemoryStore::new();
        let calibration = Calibration::load(&store, &CalibrationKeys::for_motor(1)).unwrap();
        assert_eq!(calibration, Calibration::default());
    }

    #[test]
    fn save_then_load_keeps_motors_apart() {
        let mut store = MemoryStore::new();
        let stored = Calibration {
            open_duration_ms: 21_000,
            close_duration_ms: 19_500,
            position: 40,
            calibrated: true,
        };
        stored.save(&mut store, &CalibrationKeys::for_motor(1)).unwrap();

        assert_eq!(Calibration::load(&store, &CalibrationKeys::for_motor(1)).unwrap(), stored);
        assert_eq!(
            Calibration::load(&store, &CalibrationKeys::for_motor(2)).unwrap(),
            Calibration::default()
        );
    }
}
