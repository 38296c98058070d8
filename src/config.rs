use serde::{Deserialize, Serialize};

pub const MOTOR_COUNT: usize = 4;

// LEDC timer resolutions the board driver can configure.
pub const PWM_RESOLUTIONS: [u8; 5] = [8, 10, 12, 13, 14];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SoftStartConfig {
    pub enabled: bool,
    pub min_duty: u32,
    pub max_duty: u32,
    pub duration_ms: u32,
    pub step_interval_ms: u32,
}

impl Default for SoftStartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_duty: 100,
            max_duty: 255,
            duration_ms: 2000,
            step_interval_ms: 50,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DriveConfig {
    pub overcurrent_threshold_ma: f32,
    pub max_runtime_ms: u32,
    pub position_update_interval_ms: u32,
    #[serde(default)]
    pub soft_start: SoftStartConfig,
    pub pwm_frequency_hz: u32,
    pub pwm_resolution_bits: u8,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            overcurrent_threshold_ma: 3000.0,
            max_runtime_ms: 120_000,
            position_update_interval_ms: 100,
            soft_start: SoftStartConfig::default(),
            pwm_frequency_hz: 1000,
            pwm_resolution_bits: 8,
        }
    }
}

impl DriveConfig {
    pub fn duty_limit(&self) -> u32 {
        (1u32 << self.pwm_resolution_bits.clamp(1, 20)) - 1
    }

    pub fn sanitized(&self) -> Self {
        let mut config = self.clone();
        let requested = config.pwm_resolution_bits;
        config.pwm_resolution_bits = PWM_RESOLUTIONS
            .iter()
            .copied()
            .filter(|&bits| bits <= requested)
            .max()
            .unwrap_or(PWM_RESOLUTIONS[0]);
        config.pwm_frequency_hz = config.pwm_frequency_hz.clamp(100, 40_000);
        config.overcurrent_threshold_ma = config.overcurrent_threshold_ma.clamp(100.0, 20_000.0);
        config.max_runtime_ms = config.max_runtime_ms.clamp(1_000, 600_000);
        config.position_update_interval_ms = config.position_update_interval_ms.clamp(10, 1_000);

        let limit = config.duty_limit();
        let soft = &mut config.soft_start;
        soft.max_duty = soft.max_duty.clamp(1, limit);
        soft.min_duty = soft.min_duty.min(soft.max_duty);
        soft.duration_ms = soft.duration_ms.clamp(1, 10_000);
        soft.step_interval_ms = soft.step_interval_ms.clamp(1, soft.duration_ms);
        config
    }
}
