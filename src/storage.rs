use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use anyhow::Result;

use velux_shutter::config::{DriveConfig, MOTOR_COUNT};
use velux_shutter::store::ConfigStore;

const NAMESPACE: &str = "velux";

pub struct StorageManager {
    nvs: EspNvs<NvsDefault>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PinConfiguration {
    pub pwm_open: u32,
    pub pwm_close: u32,
    pub motor_enable: [(u32, u32); MOTOR_COUNT],
    pub i2c_sda: u32,
    pub i2c_scl: u32,
    pub ina219_addresses: [u8; MOTOR_COUNT],
}

impl Default for PinConfiguration {
    fn default() -> Self {
        Self {
            pwm_open: 25,
            pwm_close: 26,
            motor_enable: [(27, 14), (32, 33), (16, 17), (19, 21)],
            i2c_sda: 13,
            i2c_scl: 12,
            ina219_addresses: [0x40, 0x41, 0x44, 0x45],
        }
    }
}

impl StorageManager {
    pub fn new(nvs_partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(nvs_partition, NAMESPACE, true)
            .map_err(|e| anyhow::anyhow!("Failed to open NVS namespace {}: {}", NAMESPACE, e))?;
        Ok(Self { nvs })
    }

    fn get_string(&self, key: &str) -> Result<String> {
        let mut buf = vec![0u8; 1024];
        let str_value = self.nvs.get_str(key, &mut buf).map_err(|e| anyhow::anyhow!("Failed to get string by key {}: {}", key, e))?;
        match str_value {
            Some(s) => {
                Ok(s.to_string())
            }
            None => {
                Err(anyhow::anyhow!("String value not found by key: {}", key))
            }
        }
    }

    fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.nvs.set_str(key, &json)?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let string = self.get_string(key)?;
        serde_json::from_str(&string).map_err(|e| anyhow::anyhow!("Failed to get JSON by key {}: {}", key, e))
    }

    pub fn set_ssid(&mut self, ssid: &str) -> Result<()> {
        self.nvs.set_str("ssid", ssid)?;
        Ok(())
    }

    pub fn get_ssid(&self) -> Result<String> {
        self.get_string("ssid")
    }

    pub fn set_password(&mut self, password: &str) -> Result<()> {
        self.nvs.set_str("password", password)?;
        Ok(())
    }

    pub fn get_password(&self) -> Result<String> {
        self.get_string("password")
    }

    pub fn set_drive_config(&mut self, config: &DriveConfig) -> Result<()> {
        self.set_json("drive_config", &config.sanitized())
    }

    pub fn get_drive_config(&self) -> Result<DriveConfig> {
        self.get_json("drive_config")
    }

    pub fn set_pin_configuration(&mut self, config: &PinConfiguration) -> Result<()> {
        self.set_json("pin_config", config)
    }

    pub fn get_pin_configuration(&self) -> Result<PinConfiguration> {
        self.get_json("pin_config")
    }
}

impl ConfigStore for StorageManager {
    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        Ok(self.nvs.get_u32(key)?)
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.nvs.set_u32(key, value)?;
        Ok(())
    }

    fn get_u8(&self, key: &str) -> Result<Option<u8>> {
        Ok(self.nvs.get_u8(key)?)
    }

    fn put_u8(&mut self, key: &str, value: u8) -> Result<()> {
        self.nvs.set_u8(key, value)?;
        Ok(())
    }

    // NVS has no boolean type; stored as 0/1.
    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.nvs.get_u8(key)?.map(|v| v != 0))
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.nvs.set_u8(key, value as u8)?;
        Ok(())
    }
}
