use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Open,
    Close,
    Stop,
    MoveTo(u8),
    LearnOpen,
    LearnClose,
    CancelLearn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Motor(u8),
    All,
}

/// Documented preconditions under which a command is ignored.
///
/// A rejected command never changes controller or bus state, except a refused
/// learn: it has already stopped the motor's own movement.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("opposite direction is active on the shared bus")]
    Conflict,
    #[error("motor is not calibrated")]
    NotCalibrated,
    #[error("learn run in progress")]
    LearnInProgress,
    #[error("no motor with id {0}")]
    UnknownMotor(u8),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("position out of range: {0}")]
    OutOfRange(i64),
}

pub trait CommandHandler {
    fn handle(&mut self, command: Command) -> Result<(), Rejection>;
}

impl Command {
    pub fn parse_control(text: &str) -> Result<Self, ParseError> {
        let text = text.trim();
        match text.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(Command::Open),
            "CLOSE" => Ok(Command::Close),
            "STOP" => Ok(Command::Stop),
            _ => {
                let pos = text
                    .parse::<i64>()
                    .map_err(|_| ParseError::Unknown(text.to_string()))?;
                if (0..=100).contains(&pos) {
                    Ok(Command::MoveTo(pos as u8))
                } else {
                    Err(ParseError::OutOfRange(pos))
                }
            }
        }
    }

    pub fn parse_learn(text: &str) -> Result<Self, ParseError> {
        let text = text.trim();
        match text.to_ascii_lowercase().as_str() {
            "open" => Ok(Command::LearnOpen),
            "close" => Ok(Command::LearnClose),
            "cancel" => Ok(Command::CancelLearn),
            _ => Err(ParseError::Unknown(text.to_string())),
        }
    }
}

impl Target {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().to_ascii_lowercase();
        if text == "all" {
            return Some(Target::All);
        }
        let digits = text.strip_prefix("motor").unwrap_or(&text);
        digits.parse::<u8>().ok().map(Target::Motor)
    }
}
