// Key expressions, timing defaults and the control configuration
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hardware::SensorPort;
use crate::messages::{GainOverrides, Port};

// Zenoh key expressions
pub const KEY_RPC: &str = "diffbot/rpc"; // request/reply commands
pub const KEY_DRIVE_STREAM: &str = "diffbot/drive/stream"; // streamed drive updates, one chunk per session id
pub const STATUS_SUFFIX: &str = "status"; // final reply of a streamed session

// Streamed drive watchdog: a session that hears nothing for this long is closed
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

// Capacity of the per-session update channel
pub const STREAM_CHANNEL_CAPACITY: usize = 16;

/// PID gain triple
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Gains {
    pub const fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }

    /// Layer per-request overrides over these gains
    pub fn with_overrides(self, overrides: &GainOverrides) -> Self {
        Self {
            kp: overrides.kp.unwrap_or(self.kp),
            ki: overrides.ki.unwrap_or(self.ki),
            kd: overrides.kd.unwrap_or(self.kd),
        }
    }
}

/// Durations used by the coordinator and the control loops
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Pause between drive ticks
    pub drive_tick: Duration,
    /// Ticks run by a unary gyro drive
    pub drive_tick_budget: u32,
    /// Pause between rotate ticks
    pub rotate_tick: Duration,
    /// How long a started motor gets to report running or stalled
    pub start_timeout: Duration,
    /// How long stop-all polls a motor before giving up
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
    /// Ramp-up and ramp-down applied to drive motors
    pub ramp: Duration,
    /// Settle delay around a gyro recalibration
    pub gyro_settle: Duration,
    /// Delay between motor starts in the release sequence
    pub release_stagger: Duration,
    /// How long the release motors run before stop-all
    pub release_hold: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            drive_tick: Duration::from_millis(400),
            drive_tick_budget: 20,
            rotate_tick: Duration::from_millis(10),
            start_timeout: Duration::from_millis(500),
            stop_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(10),
            ramp: Duration::from_secs(3),
            gyro_settle: Duration::from_millis(500),
            release_stagger: Duration::from_millis(300),
            release_hold: Duration::from_secs(1),
        }
    }
}

/// Power shaping applied to the rotate controller's raw output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerShaping {
    /// Error (degrees) above which the boost applies
    pub boost_threshold: f64,
    pub boost_factor: f64,
    /// Output is clamped to [-cap, cap]
    pub cap: i32,
}

impl Default for PowerShaping {
    fn default() -> Self {
        Self {
            boost_threshold: 5.0,
            boost_factor: 4.0,
            cap: 50,
        }
    }
}

/// Wheel configuration, in centimeters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelGeometry {
    pub wheel_radius: f64,
    /// Distance between the two drive wheels
    pub track_width: f64,
}

impl Default for WheelGeometry {
    fn default() -> Self {
        Self {
            wheel_radius: 2.8,
            track_width: 12.0,
        }
    }
}

/// Everything a control session needs that is not part of the request.
///
/// Built once at startup (defaults, optionally overlaid by a JSON file) and handed
/// to each session by reference. Nothing here changes at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub drive_gains: Gains,
    pub rotate_gains: Gains,
    pub timing: Timing,
    pub shaping: PowerShaping,
    pub geometry: WheelGeometry,
    /// Sign of the PID turn on each drive wheel
    pub drive_steering: BTreeMap<Port, i32>,
    /// Drive motors are mounted reversed
    pub drive_forward_sign: i32,
    /// Sign of the rotate power on each drive wheel
    pub rotate_signs: BTreeMap<Port, i32>,
    /// Sign of the requested speed on each collector motor
    pub collect_signs: BTreeMap<Port, i32>,
    pub gyro_port: SensorPort,
    pub ultrasonic_port: SensorPort,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            drive_gains: Gains::new(2.0, 1.0, 1.0),
            rotate_gains: Gains::new(0.125, 0.0, 0.5),
            timing: Timing::default(),
            shaping: PowerShaping::default(),
            geometry: WheelGeometry::default(),
            drive_steering: BTreeMap::from([(Port::A, 1), (Port::D, -1)]),
            drive_forward_sign: -1,
            rotate_signs: BTreeMap::from([(Port::A, 1), (Port::D, -1)]),
            collect_signs: BTreeMap::from([(Port::B, 1), (Port::C, -1)]),
            gyro_port: SensorPort::In2,
            ultrasonic_port: SensorPort::In1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ControlConfig {
    /// Load a config file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
