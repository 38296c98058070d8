use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorState {
    Stopped,
    Opening,
    Closing,
    LearningOpen,
    LearningClose,
}

impl MotorState {
    pub fn is_learning(self) -> bool {
        matches!(self, MotorState::LearningOpen | MotorState::LearningClose)
    }

    pub fn direction(self) -> Direction {
        match self {
            MotorState::Stopped => Direction::Stop,
            MotorState::Opening | MotorState::LearningOpen => Direction::Open,
            MotorState::Closing | MotorState::LearningClose => Direction::Close,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Stop,
    Open,
    Close,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Stop => Direction::Stop,
            Direction::Open => Direction::Close,
            Direction::Close => Direction::Open,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PwmChannel {
    Open,
    Close,
}

pub trait DirectionPins: Send {
    fn init(&mut self) -> Result<()> {
        self.drive(Direction::Stop)
    }

    /// `Open` raises the open-side enable, `Close` the close-side enable,
    /// `Stop` lowers both. Never raises both at once.
    fn drive(&mut self, direction: Direction) -> Result<()>;
}

pub trait CurrentMonitor: Send {
    fn init(&mut self) -> Result<()>;

    fn read_milliamps(&mut self) -> Result<f32>;
}
