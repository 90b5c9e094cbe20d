// Closed-loop motor control core
//
// Provides:
// - PID correction math (pid)
// - Motor group coordination: leases, start-verify-else-abort, bounded stop-all (coordinator)
// - Straight-line drive and in-place rotation controllers (drive, rotate)
// - Streamed drive sessions (session)

pub mod coordinator;
pub mod drive;
pub mod geometry;
pub mod pid;
pub mod rotate;
pub mod session;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::ControlConfig;
use crate::hardware::{
    ActuatorError, ActuatorResolver, GyroMode, SensorError, SensorKind, SensorPort, SensorReader,
};
use crate::messages::{MotorClass, MotorSpec, Port};
use coordinator::{MotorGroup, PortLease, PortLeases};

pub use coordinator::Setpoint;
pub use pid::{ControlState, Pid};

/// Faults a control session can end with.
///
/// Whatever the variant, the session has already left its motors stopped
/// by the time the error reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Cannot resolve {class} motor on port {port}: {reason}")]
    ActuatorResolution {
        port: Port,
        class: MotorClass,
        reason: String,
    },

    #[error("Port {port} is held by another session")]
    PortBusy { port: Port },

    #[error("Sensor {port} is held by another session")]
    SensorBusy { port: SensorPort },

    #[error("Motor {port} is not running")]
    StartVerification { port: Port },

    #[error("Motor {port} did not report stopped in time")]
    StopTimeout { port: Port },

    #[error("Motor {port} failed: {source}")]
    Actuator {
        port: Port,
        #[source]
        source: ActuatorError,
    },

    #[error("Sensor read failed: {0}")]
    SensorRead(#[from] SensorError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Stream terminated: {0}")]
    StreamTerminated(String),
}

impl ControlError {
    /// The motor this fault is attributed to, if any
    pub fn port(&self) -> Option<Port> {
        match self {
            ControlError::ActuatorResolution { port, .. }
            | ControlError::PortBusy { port }
            | ControlError::StartVerification { port }
            | ControlError::StopTimeout { port }
            | ControlError::Actuator { port, .. } => Some(*port),
            _ => None,
        }
    }
}

/// Borrowed view of everything a session needs to run
#[derive(Clone, Copy)]
pub struct ControlContext<'a> {
    pub resolver: &'a dyn ActuatorResolver,
    pub sensors: &'a dyn SensorReader,
    pub leases: &'a PortLeases,
    pub config: &'a ControlConfig,
}

impl<'a> ControlContext<'a> {
    /// Lease and resolve a motor set for one session
    pub fn acquire(&self, specs: &[MotorSpec]) -> Result<MotorGroup, ControlError> {
        MotorGroup::acquire(self.resolver, self.leases, specs, self.config.timing)
    }

    /// Hold the gyro for a session that reads or recalibrates it
    pub fn acquire_gyro(&self) -> Result<PortLease, ControlError> {
        self.leases.acquire_sensor(self.config.gyro_port)
    }

    /// Current gyro heading; a failed read ends the session
    pub fn read_gyro(&self) -> Result<f64, ControlError> {
        Ok(self.sensors.read(self.config.gyro_port, SensorKind::Gyro)?)
    }

    /// Ultrasonic distance in centimeters
    pub fn read_distance_cm(&self) -> Result<f64, ControlError> {
        let mm = self
            .sensors
            .read(self.config.ultrasonic_port, SensorKind::Ultrasonic)?;
        Ok(mm / 10.0)
    }

    /// Switch the gyro through calibration mode and back to angle mode.
    ///
    /// Settles before, between and after the mode switches; the heading reads
    /// zero once this returns.
    pub async fn recalibrate_gyro(&self) -> Result<(), ControlError> {
        let port = self.config.gyro_port;
        let settle = self.config.timing.gyro_settle;
        info!("Recalibrating gyro on {}", port);

        sleep(settle).await;
        self.sensors.set_gyro_mode(port, GyroMode::Calibrate)?;
        sleep(settle).await;
        self.sensors.set_gyro_mode(port, GyroMode::Angle).inspect_err(|e| {
            warn!("Gyro left in calibration mode: {}", e);
        })?;
        sleep(settle).await;
        Ok(())
    }
}
