// Device boundary for the control core
//
// Provides:
// - Actuator / ActuatorResolver: one tacho motor, and how to find it by port and class
// - SensorReader: latest scalar value of a gyro or ultrasonic sensor
// - sim: in-memory rig used by `--simulate` and the tests
// - ev3: ev3dev sysfs backend (feature `ev3`)

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messages::{MotorClass, Port};

#[cfg(feature = "ev3")]
pub mod ev3;
pub mod sim;

/// Commands understood by a tacho motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCommand {
    Run,
    Stop,
    ResetPosition,
    RunToAbsolutePosition,
}

impl MotorCommand {
    /// Commands after which the motor is expected to report running
    pub fn is_start(self) -> bool {
        matches!(self, MotorCommand::Run | MotorCommand::RunToAbsolutePosition)
    }
}

/// State reported by a motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorState {
    Idle,
    Running,
    Stalled,
}

/// Input port on the brick
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SensorPort {
    In1,
    In2,
    In3,
    In4,
}

impl fmt::Display for SensorPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorPort::In1 => "in1",
            SensorPort::In2 => "in2",
            SensorPort::In3 => "in3",
            SensorPort::In4 => "in4",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// Heading in degrees since the last calibration
    Gyro,
    /// Raw distance in millimeters
    Ultrasonic,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Gyro => f.write_str("gyro"),
            SensorKind::Ultrasonic => f.write_str("ultrasonic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GyroMode {
    Angle,
    Calibrate,
}

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("No {class} motor on port {port}")]
    NotFound { port: Port, class: MotorClass },

    #[error("Motor on port {port} failed: {reason}")]
    Device { port: Port, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("No {kind} sensor on port {port}")]
    NotFound { port: SensorPort, kind: SensorKind },

    #[error("Reading {kind} sensor on port {port} failed: {reason}")]
    Read {
        port: SensorPort,
        kind: SensorKind,
        reason: String,
    },
}

/// Handle to one live motor.
///
/// Calls are synchronous and short (a sysfs write or read); pacing and
/// timeouts belong to the caller.
pub trait Actuator: Send {
    fn port(&self) -> Port;

    fn command(&mut self, command: MotorCommand) -> Result<(), ActuatorError>;

    fn set_speed_setpoint(&mut self, speed: i32) -> Result<(), ActuatorError>;

    fn set_position_setpoint(&mut self, position: i32) -> Result<(), ActuatorError>;

    fn set_ramp(&mut self, up: Duration, down: Duration) -> Result<(), ActuatorError>;

    fn state(&mut self) -> Result<MotorState, ActuatorError>;

    fn is_running(&mut self) -> Result<bool, ActuatorError>;
}

/// Maps a logical port and motor class to a live actuator
pub trait ActuatorResolver: Send + Sync {
    fn resolve(&self, port: Port, class: MotorClass) -> Result<Box<dyn Actuator>, ActuatorError>;
}

/// Latest value of a sensor, no buffering
pub trait SensorReader: Send + Sync {
    fn read(&self, port: SensorPort, kind: SensorKind) -> Result<f64, SensorError>;

    fn set_gyro_mode(&self, port: SensorPort, mode: GyroMode) -> Result<(), SensorError>;
}
