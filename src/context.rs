use crate::storage::StorageManager;
use std::sync::{Arc, Mutex, MutexGuard};
use velux_shutter::fleet::Fleet;

#[derive(Clone)]
pub struct AppContext {
    pub storage_manager: Arc<Mutex<StorageManager>>,
    pub fleet: Arc<Mutex<Fleet>>,
}

impl AppContext {
    pub fn fleet(&self) -> MutexGuard<'_, Fleet> {
        self.fleet.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn storage(&self) -> MutexGuard<'_, StorageManager> {
        self.storage_manager.lock().unwrap_or_else(|e| e.into_inner())
    }
}
