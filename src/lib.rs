//! Drive coordination for up to four roller-shutter actuators sharing one
//! dual-channel PWM bus.
//!
//! The [`motor_pwm::PwmArbiter`] owns the bus and its soft-start ramp; each
//! [`motion::MotorController`] runs a cooperative state machine, estimates
//! position from learned travel times and asks the arbiter before committing
//! to a direction. Hardware is reached only through the traits in [`motor`],
//! [`motor_pwm`] and [`store`], so everything here runs on the host against
//! the doubles in [`sim`].

pub mod clock;
pub mod command;
pub mod config;
pub mod fleet;
pub mod motion;
pub mod motor;
pub mod motor_pwm;
pub mod sim;
pub mod store;
