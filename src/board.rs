//! Peripheral bindings for the reference board: one LEDC timer with two
//! channels feeding the shared BTS7960 PWM inputs, an enable pair per motor
//! and one INA219 per motor on a shared I2C bus.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use esp_idf_svc::hal::delay::{TickType_t, TICK_RATE_HZ};
use esp_idf_svc::hal::gpio::{AnyIOPin, AnyOutputPin, Output, PinDriver};
use esp_idf_svc::hal::i2c::{I2cConfig, I2cDriver, I2C0};
use esp_idf_svc::hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, LEDC};
use esp_idf_svc::hal::prelude::*;

use velux_shutter::config::DriveConfig;
use velux_shutter::motor::{CurrentMonitor, Direction, DirectionPins, PwmChannel};
use velux_shutter::motor_pwm::PwmBus;

const I2C_BAUD_RATE: u32 = 100_000;
const I2C_TIMEOUT: TickType_t = TICK_RATE_HZ / 100;

// Matches `config::PWM_RESOLUTIONS`.
fn resolution(bits: u8) -> Result<Resolution> {
    match bits {
        8 => Ok(Resolution::Bits8),
        10 => Ok(Resolution::Bits10),
        12 => Ok(Resolution::Bits12),
        13 => Ok(Resolution::Bits13),
        14 => Ok(Resolution::Bits14),
        _ => Err(anyhow::anyhow!("Unsupported PWM resolution: {} bits", bits)),
    }
}

pub struct LedcBus {
    open: LedcDriver<'static>,
    close: LedcDriver<'static>,
}

impl LedcBus {
    pub fn new(
        ledc: LEDC,
        open_pin: AnyOutputPin,
        close_pin: AnyOutputPin,
        config: &DriveConfig,
    ) -> Result<Self> {
        let timer_config = TimerConfig::default()
            .frequency(Hertz(config.pwm_frequency_hz))
            .resolution(resolution(config.pwm_resolution_bits)?);
        // The bus lives as long as the firmware, and both channels borrow the timer.
        let timer = Box::leak(Box::new(LedcTimerDriver::new(ledc.timer0, &timer_config)?));

        let mut open = LedcDriver::new(ledc.channel0, &*timer, open_pin)?;
        let mut close = LedcDriver::new(ledc.channel1, &*timer, close_pin)?;
        open.set_duty(0)?;
        close.set_duty(0)?;

        log::info!(
            "LEDC bus configured: {}Hz, {} bit, max duty {}",
            config.pwm_frequency_hz,
            config.pwm_resolution_bits,
            open.get_max_duty()
        );
        Ok(Self { open, close })
    }
}

impl PwmBus for LedcBus {
    fn set_duty(&mut self, channel: PwmChannel, duty: u32) -> Result<()> {
        match channel {
            PwmChannel::Open => self.open.set_duty(duty)?,
            PwmChannel::Close => self.close.set_duty(duty)?,
        }
        Ok(())
    }
}

pub struct HBridgeEnable {
    open: PinDriver<'static, AnyOutputPin, Output>,
    close: PinDriver<'static, AnyOutputPin, Output>,
}

impl HBridgeEnable {
    pub fn new(open_pin: AnyOutputPin, close_pin: AnyOutputPin) -> Result<Self> {
        Ok(Self {
            open: PinDriver::output(open_pin)?,
            close: PinDriver::output(close_pin)?,
        })
    }
}

impl DirectionPins for HBridgeEnable {
    fn drive(&mut self, direction: Direction) -> Result<()> {
        match direction {
            Direction::Open => {
                self.close.set_low()?;
                self.open.set_high()?;
            }
            Direction::Close => {
                self.open.set_low()?;
                self.close.set_high()?;
            }
            Direction::Stop => {
                self.open.set_low()?;
                self.close.set_low()?;
            }
        }
        Ok(())
    }
}

pub type SharedI2c = Arc<Mutex<I2cDriver<'static>>>;

pub fn shared_i2c(i2c: I2C0, sda: AnyIOPin, scl: AnyIOPin) -> Result<SharedI2c> {
    let config = I2cConfig::new().baudrate(Hertz(I2C_BAUD_RATE));
    let driver = I2cDriver::new(i2c, sda, scl, &config)?;
    Ok(Arc::new(Mutex::new(driver)))
}

const REG_CONFIG: u8 = 0x00;
const REG_CURRENT: u8 = 0x04;
const REG_CALIBRATION: u8 = 0x05;

// 32V bus range, /8 gain (320mV), 12 bit ADCs, continuous shunt and bus.
const CONFIG_32V_2A: u16 = 0x399F;
// 0.1 ohm shunt with a 100uA current LSB.
const CALIBRATION_32V_2A: u16 = 4096;
const CURRENT_LSB_MA: f32 = 0.1;

pub struct Ina219Monitor {
    i2c: SharedI2c,
    address: u8,
}

impl Ina219Monitor {
    pub fn new(i2c: SharedI2c, address: u8) -> Self {
        Self { i2c, address }
    }

    fn write_register(&self, register: u8, value: u16) -> Result<()> {
        let [hi, lo] = value.to_be_bytes();
        let mut i2c = self.i2c.lock().unwrap_or_else(|e| e.into_inner());
        i2c.write(self.address, &[register, hi, lo], I2C_TIMEOUT)?;
        Ok(())
    }

    fn read_register(&self, register: u8) -> Result<u16> {
        let mut buf = [0u8; 2];
        let mut i2c = self.i2c.lock().unwrap_or_else(|e| e.into_inner());
        i2c.write_read(self.address, &[register], &mut buf, I2C_TIMEOUT)?;
        Ok(u16::from_be_bytes(buf))
    }
}

impl CurrentMonitor for Ina219Monitor {
    fn init(&mut self) -> Result<()> {
        self.write_register(REG_CALIBRATION, CALIBRATION_32V_2A)
            .map_err(|e| anyhow::anyhow!("INA219 at 0x{:02x} not found: {}", self.address, e))?;
        self.write_register(REG_CONFIG, CONFIG_32V_2A)?;
        let config = self.read_register(REG_CONFIG)?;
        anyhow::ensure!(
            config == CONFIG_32V_2A,
            "INA219 at 0x{:02x} returned config 0x{:04x}",
            self.address,
            config
        );
        Ok(())
    }

    fn read_milliamps(&mut self) -> Result<f32> {
        // A brown-out resets the calibration register; rewrite it before each read.
        self.write_register(REG_CALIBRATION, CALIBRATION_32V_2A)?;
        let raw = self.read_register(REG_CURRENT)? as i16;
        Ok(raw as f32 * CURRENT_LSB_MA)
    }
}
