// ev3dev backend: tacho motors and sensors through the ev3dev sysfs classes
//
// Device handles from ev3dev-lang-rust are looked up again on every call.
// Lookups are cheap directory scans, and holding only the port keeps the
// handles Send so sessions can run on the tokio pool.

use std::time::Duration;

use ev3dev_lang_rust::motors::{LargeMotor, MediumMotor, MotorPort};
use ev3dev_lang_rust::sensors::{GyroSensor, SensorPort as Ev3SensorPort, UltrasonicSensor};
use tracing::debug;

use super::{
    Actuator, ActuatorError, ActuatorResolver, GyroMode, MotorCommand, MotorState, SensorError,
    SensorKind, SensorPort, SensorReader,
};
use crate::messages::{MotorClass, Port};

fn motor_port(port: Port) -> MotorPort {
    match port {
        Port::A => MotorPort::OutA,
        Port::B => MotorPort::OutB,
        Port::C => MotorPort::OutC,
        Port::D => MotorPort::OutD,
    }
}

fn sensor_port(port: SensorPort) -> Ev3SensorPort {
    match port {
        SensorPort::In1 => Ev3SensorPort::In1,
        SensorPort::In2 => Ev3SensorPort::In2,
        SensorPort::In3 => Ev3SensorPort::In3,
        SensorPort::In4 => Ev3SensorPort::In4,
    }
}

enum TachoMotor {
    Large(LargeMotor),
    Medium(MediumMotor),
}

// Both motor classes expose the same generated tacho-motor API
macro_rules! on_motor {
    ($motor:expr, $m:ident => $body:expr) => {
        match $motor {
            TachoMotor::Large($m) => $body,
            TachoMotor::Medium($m) => $body,
        }
    };
}

/// Resolves motors on the local brick
#[derive(Debug, Clone, Copy, Default)]
pub struct Ev3Resolver;

impl ActuatorResolver for Ev3Resolver {
    fn resolve(&self, port: Port, class: MotorClass) -> Result<Box<dyn Actuator>, ActuatorError> {
        let handle = Ev3Motor { port, class };
        // Fail here rather than on the first command
        handle.lookup().map_err(|_| ActuatorError::NotFound { port, class })?;
        Ok(Box::new(handle))
    }
}

pub struct Ev3Motor {
    port: Port,
    class: MotorClass,
}

impl Ev3Motor {
    fn lookup(&self) -> Result<TachoMotor, ActuatorError> {
        let port = motor_port(self.port);
        let motor = match self.class {
            MotorClass::Large => LargeMotor::get(port).map(TachoMotor::Large),
            MotorClass::Medium => MediumMotor::get(port).map(TachoMotor::Medium),
        };
        motor.map_err(|e| self.device_error(e))
    }

    fn device_error(&self, e: impl std::fmt::Debug) -> ActuatorError {
        ActuatorError::Device {
            port: self.port,
            reason: format!("{:?}", e),
        }
    }
}

impl Actuator for Ev3Motor {
    fn port(&self) -> Port {
        self.port
    }

    fn command(&mut self, command: MotorCommand) -> Result<(), ActuatorError> {
        debug!("Motor {}: {:?}", self.port, command);
        let motor = self.lookup()?;
        let result = on_motor!(&motor, m => match command {
            MotorCommand::Run => m.run_forever(),
            MotorCommand::Stop => m.stop(),
            MotorCommand::ResetPosition => m.reset(),
            MotorCommand::RunToAbsolutePosition => m.run_to_abs_pos(None),
        });
        result.map_err(|e| self.device_error(e))
    }

    fn set_speed_setpoint(&mut self, speed: i32) -> Result<(), ActuatorError> {
        let motor = self.lookup()?;
        on_motor!(&motor, m => m.set_speed_sp(speed)).map_err(|e| self.device_error(e))
    }

    fn set_position_setpoint(&mut self, position: i32) -> Result<(), ActuatorError> {
        let motor = self.lookup()?;
        on_motor!(&motor, m => m.set_position_sp(position)).map_err(|e| self.device_error(e))
    }

    fn set_ramp(&mut self, up: Duration, down: Duration) -> Result<(), ActuatorError> {
        let motor = self.lookup()?;
        on_motor!(&motor, m => {
            m.set_ramp_up_sp(up.as_millis() as i32)
                .and_then(|_| m.set_ramp_down_sp(down.as_millis() as i32))
        })
        .map_err(|e| self.device_error(e))
    }

    fn state(&mut self) -> Result<MotorState, ActuatorError> {
        let motor = self.lookup()?;
        let (running, stalled) = on_motor!(&motor, m => m.is_running().and_then(|r| m.is_stalled().map(|s| (r, s))))
            .map_err(|e| self.device_error(e))?;
        Ok(match (running, stalled) {
            (_, true) => MotorState::Stalled,
            (true, false) => MotorState::Running,
            (false, false) => MotorState::Idle,
        })
    }

    fn is_running(&mut self) -> Result<bool, ActuatorError> {
        let motor = self.lookup()?;
        on_motor!(&motor, m => m.is_running()).map_err(|e| self.device_error(e))
    }
}

/// Reads the brick's sensors
#[derive(Debug, Clone, Copy, Default)]
pub struct Ev3Sensors;

impl Ev3Sensors {
    fn read_error(port: SensorPort, kind: SensorKind, e: impl std::fmt::Debug) -> SensorError {
        SensorError::Read {
            port,
            kind,
            reason: format!("{:?}", e),
        }
    }

    fn gyro(port: SensorPort) -> Result<GyroSensor, SensorError> {
        GyroSensor::get(sensor_port(port)).map_err(|_| SensorError::NotFound {
            port,
            kind: SensorKind::Gyro,
        })
    }
}

impl SensorReader for Ev3Sensors {
    fn read(&self, port: SensorPort, kind: SensorKind) -> Result<f64, SensorError> {
        match kind {
            SensorKind::Gyro => Self::gyro(port)?
                .get_angle()
                .map(f64::from)
                .map_err(|e| Self::read_error(port, kind, e)),
            SensorKind::Ultrasonic => UltrasonicSensor::get(sensor_port(port))
                .map_err(|_| SensorError::NotFound { port, kind })?
                .get_distance()
                .map(f64::from)
                .map_err(|e| Self::read_error(port, kind, e)),
        }
    }

    fn set_gyro_mode(&self, port: SensorPort, mode: GyroMode) -> Result<(), SensorError> {
        let gyro = Self::gyro(port)?;
        let result = match mode {
            GyroMode::Angle => gyro.set_mode_gyro_ang(),
            GyroMode::Calibrate => gyro.set_mode_gyro_cal(),
        };
        result.map_err(|e| Self::read_error(port, SensorKind::Gyro, e))
    }
}
