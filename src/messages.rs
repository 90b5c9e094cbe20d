// Wire types shared by the runtime, the control core and the client
//
// Everything here is plain data: requests arrive as JSON over zenoh and are
// deserialized straight into these types, replies go back the same way.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::control::ControlError;

/// Output port on the brick
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Port {
    A,
    B,
    C,
    D,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Port::A => "A",
            Port::B => "B",
            Port::C => "C",
            Port::D => "D",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorClass {
    Large,
    Medium,
}

impl fmt::Display for MotorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotorClass::Large => f.write_str("large"),
            MotorClass::Medium => f.write_str("medium"),
        }
    }
}

/// One actuator request: which motor, and what the caller asked of it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorSpec {
    pub port: Port,
    pub class: MotorClass,
    #[serde(default)]
    pub speed: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
}

impl MotorSpec {
    pub fn new(port: Port, class: MotorClass, speed: i32) -> Self {
        Self {
            port,
            class,
            speed,
            position: None,
        }
    }

    pub fn large(port: Port, speed: i32) -> Self {
        Self::new(port, MotorClass::Large, speed)
    }

    pub fn medium(port: Port, speed: i32) -> Self {
        Self::new(port, MotorClass::Medium, speed)
    }
}

/// Per-request gain overrides, layered over the configured defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GainOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ki: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kd: Option<f64>,
}

/// Straight-line drive. Distance is in centimeters, negative drives backwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveRequest {
    pub motors: Vec<MotorSpec>,
    pub distance: f64,
    pub speed: i32,
    #[serde(default)]
    pub gains: GainOverrides,
}

/// In-place rotation. Positive degrees turn counter-clockwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotateRequest {
    pub motors: Vec<MotorSpec>,
    pub degrees: f64,
    pub speed: i32,
    #[serde(default)]
    pub gains: GainOverrides,
}

/// Request from a client -> runtime (one per zenoh query)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RunMotor { motor: MotorSpec },
    StopMotor { motor: MotorSpec },
    RunMotors { motors: Vec<MotorSpec> },
    StopMotors { motors: Vec<MotorSpec> },
    Drive(DriveRequest),
    DriveWithGyro(DriveRequest),
    Rotate(RotateRequest),
    RotateWithGyro(RotateRequest),
    CollectRelease { motors: Vec<MotorSpec> },
    ReleaseOneBall { motors: Vec<MotorSpec> },
    RecalibrateGyro,
    Distance,
}

impl Request {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Request::RunMotor { .. } => "run_motor",
            Request::StopMotor { .. } => "stop_motor",
            Request::RunMotors { .. } => "run_motors",
            Request::StopMotors { .. } => "stop_motors",
            Request::Drive(_) => "drive",
            Request::DriveWithGyro(_) => "drive_with_gyro",
            Request::Rotate(_) => "rotate",
            Request::RotateWithGyro(_) => "rotate_with_gyro",
            Request::CollectRelease { .. } => "collect_release",
            Request::ReleaseOneBall { .. } => "release_one_ball",
            Request::RecalibrateGyro => "recalibrate_gyro",
            Request::Distance => "distance",
        }
    }
}

/// One message of a streamed drive session.
///
/// The first message of a stream fixes the motor set, base speed and gains.
/// Later messages only move the remaining distance (and the speed, when non-zero).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriveUpdate {
    pub distance: f64,
    #[serde(default)]
    pub speed: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub motors: Vec<MotorSpec>,
    #[serde(default)]
    pub gains: GainOverrides,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub close: bool,
}

impl DriveUpdate {
    /// Whether this update finishes the session it is sent to
    pub fn ends_stream(&self) -> bool {
        self.close || self.distance <= 0.0
    }
}

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Port>,
}

impl StatusResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            port: None,
        }
    }

    pub fn failure(err: &ControlError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            port: err.port(),
        }
    }
}

impl From<Result<StatusResult, ControlError>> for StatusResult {
    fn from(result: Result<StatusResult, ControlError>) -> Self {
        match result {
            Ok(status) => status,
            Err(e) => StatusResult::failure(&e),
        }
    }
}

/// Reply sent back to an RPC query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Distance { success: bool, distance_cm: f64 },
    Status(StatusResult),
}

impl Reply {
    pub fn success(&self) -> bool {
        match self {
            Reply::Distance { success, .. } => *success,
            Reply::Status(status) => status.success,
        }
    }
}
