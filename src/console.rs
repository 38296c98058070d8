use std::io::{self, BufRead};

use esp_idf_svc::hal::delay::FreeRtos;

use velux_shutter::command::{Command, Target};
use velux_shutter::config::DriveConfig;
use velux_shutter::motor::Direction;
use velux_shutter::motor_pwm;

use crate::context::AppContext;
use crate::storage::PinConfiguration;

const HELP: &str = "Available commands:\r
  help\r
  set_wifi_ssid <ssid>\r
  set_wifi_password <password>\r
  get_pin_configuration\r
  set_pin_configuration <json>\r
  get_drive_config\r
  set_drive_config <json>\r
  status\r
  control <all|N> <OPEN|CLOSE|STOP|0-100>\r
  learn <N> <open|close|cancel>\r
  reset_calibration <N>\r
  set_position <N> <0-100>\r
  set_threshold <N> <mA>\r
  duty <open|close|stop> <duty>   (bench test, bypasses the ramp; the duty\r
                                   stays on the bus until `duty stop` or the next\r
                                   motor run)";

pub fn handle_stdin_command(app_context: AppContext) {
    let stdin = io::stdin();
    loop {
        let mut handle = stdin.lock();
        let mut cmdline = String::new();
        match handle.read_line(&mut cmdline) {
            Ok(0) => {
                FreeRtos::delay_ms(10);
                continue;
            }
            Ok(_) => {}
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    FreeRtos::delay_ms(10);
                    continue;
                }
                _ => {
                    log::info!("handle_stdin_command: read from stdin failed: {e}");
                    continue;
                }
            },
        }
        drop(handle);

        let cmdline = cmdline.trim();
        if cmdline.is_empty() {
            continue;
        }
        log::info!("Command: {}", cmdline);

        let (command, args) = cmdline.split_once(' ').unwrap_or((cmdline, ""));
        if let Err(e) = execute(&app_context, command, args.trim()) {
            log::error!("{}: {}", command, e);
        }
    }
}

fn execute(app_context: &AppContext, command: &str, args: &str) -> anyhow::Result<()> {
    match command {
        "help" => log::info!("{}", HELP),
        "set_wifi_ssid" => {
            app_context.storage().set_ssid(args)?;
            log::info!("SSID saved: {}, restart to apply", args);
        }
        "set_wifi_password" => {
            app_context.storage().set_password(args)?;
            log::info!("Password saved, restart to apply");
        }
        "get_pin_configuration" => {
            let config = app_context.storage().get_pin_configuration().unwrap_or_default();
            log::info!("{}", serde_json::to_string(&config)?);
        }
        "set_pin_configuration" => {
            let config: PinConfiguration = serde_json::from_str(args)?;
            app_context.storage().set_pin_configuration(&config)?;
            log::info!("Pin configuration saved, restart to apply");
        }
        "get_drive_config" => {
            let config = app_context.storage().get_drive_config().unwrap_or_default();
            log::info!("{}", serde_json::to_string(&config)?);
        }
        "set_drive_config" => {
            let config: DriveConfig = serde_json::from_str(args)?;
            app_context.storage().set_drive_config(&config)?;
            log::info!("Drive config saved, restart to apply");
        }
        "status" => {
            let report = app_context.fleet().status();
            log::info!("{}", serde_json::to_string(&report)?);
        }
        "control" => {
            let (target, text) = two_args(args)?;
            let target = parse_target(target)?;
            let command = Command::parse_control(text)?;
            report(app_context.fleet().dispatch(target, command));
        }
        "learn" => {
            let (target, text) = two_args(args)?;
            let target = parse_target(target)?;
            let command = Command::parse_learn(text)?;
            report(app_context.fleet().dispatch(target, command));
        }
        "reset_calibration" => {
            let id = args.parse::<u8>()?;
            with_motor(app_context, id, |motor| motor.reset_calibration())?;
            log::info!("Motor {} calibration cleared", id);
        }
        "set_position" => {
            let (id, position) = two_args(args)?;
            let id = id.parse::<u8>()?;
            let position = position.parse::<u8>()?;
            anyhow::ensure!(position <= 100, "position must be 0-100");
            with_motor(app_context, id, |motor| motor.set_position(position))?;
            log::info!("Motor {} position set to {}%", id, position);
        }
        "set_threshold" => {
            let (id, milliamps) = two_args(args)?;
            let id = id.parse::<u8>()?;
            let milliamps = milliamps.parse::<f32>()?;
            anyhow::ensure!(milliamps > 0.0, "threshold must be positive");
            with_motor(app_context, id, |motor| motor.set_overcurrent_threshold(milliamps))?;
            log::info!("Motor {} overcurrent threshold set to {}mA", id, milliamps);
        }
        "duty" => {
            let (channel, duty) = two_args(args)?;
            let direction = match channel {
                "open" => Direction::Open,
                "close" => Direction::Close,
                "stop" => Direction::Stop,
                _ => anyhow::bail!("Invalid channel: {}", channel),
            };
            let duty = duty.parse::<u32>()?;
            let fleet = app_context.fleet();
            let mut bus = motor_pwm::lock(fleet.arbiter());
            if bus.active_count() > 0 {
                anyhow::bail!("motors are running, stop them first");
            }
            bus.set_duty_direct(direction, duty);
            log::info!("Duty {:?} set to {}", direction, bus.current_duty());
        }
        _ => log::info!("Unknown command: {}. Type 'help' for a list.", command),
    }
    Ok(())
}

fn two_args(args: &str) -> anyhow::Result<(&str, &str)> {
    args.split_once(' ')
        .map(|(a, b)| (a.trim(), b.trim()))
        .ok_or_else(|| anyhow::anyhow!("expected two arguments, got '{}'", args))
}

fn parse_target(text: &str) -> anyhow::Result<Target> {
    Target::parse(text).ok_or_else(|| anyhow::anyhow!("Invalid target: {}", text))
}

fn with_motor(
    app_context: &AppContext,
    id: u8,
    f: impl FnOnce(&mut velux_shutter::motion::MotorController),
) -> anyhow::Result<()> {
    let mut fleet = app_context.fleet();
    let motor = fleet
        .motor_mut(id)
        .ok_or_else(|| anyhow::anyhow!("No motor {}", id))?;
    f(motor);
    Ok(())
}

fn report(results: Vec<(u8, Result<(), velux_shutter::command::Rejection>)>) {
    for (id, result) in results {
        match result {
            Ok(()) => log::info!("Motor {}: OK", id),
            Err(rejection) => log::info!("Motor {}: rejected, {}", id, rejection),
        }
    }
}
