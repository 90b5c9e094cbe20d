// Simulated rig: motors, gyro and ultrasonic sensor kept in memory
//
// Used when the runtime is started with `--simulate`, and as the fake hardware
// in tests. Faults can be injected per motor, gyro readings can be scripted,
// and every actuator call lands in a journal the tests can inspect.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use super::{
    Actuator, ActuatorError, ActuatorResolver, GyroMode, MotorCommand, MotorState, SensorError,
    SensorKind, SensorPort, SensorReader,
};
use crate::messages::{MotorClass, Port};

/// Injected misbehaviour of a simulated motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Accepts commands but never reports running
    WontStart,
    /// Reports stalled once started
    Stalls,
    /// Keeps reporting running after stop
    WontStop,
    /// Rejects every stop command and keeps running
    StopFails,
}

/// One actuator call, as recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Command(MotorCommand),
    Speed(i32),
    Position(i32),
    Ramp,
}

#[derive(Debug, Clone)]
struct SimMotor {
    class: MotorClass,
    speed_sp: i32,
    position_sp: i32,
    running: bool,
    fault: Option<SimFault>,
}

#[derive(Debug, Default)]
struct SimState {
    motors: BTreeMap<Port, SimMotor>,
    journal: Vec<(Port, SimEvent)>,
    gyro_script: VecDeque<f64>,
    gyro_angle: f64,
    gyro_reads: usize,
    gyro_failing: bool,
    gyro_modes: Vec<GyroMode>,
    yaw_per_read: f64,
    ultrasonic_mm: f64,
}

impl SimState {
    fn speed_if_running(&self, port: Port) -> f64 {
        match self.motors.get(&port) {
            Some(motor) if motor.running => motor.speed_sp as f64,
            _ => 0.0,
        }
    }
}

/// Shared handle to the simulated hardware; clones see the same state
#[derive(Debug, Clone, Default)]
pub struct SimRig {
    state: Arc<Mutex<SimState>>,
}

impl SimRig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Large drive motors on A and D, medium collector motors on B and C
    pub fn differential() -> Self {
        Self::new()
            .with_motor(Port::A, MotorClass::Large)
            .with_motor(Port::D, MotorClass::Large)
            .with_motor(Port::B, MotorClass::Medium)
            .with_motor(Port::C, MotorClass::Medium)
    }

    pub fn with_motor(self, port: Port, class: MotorClass) -> Self {
        self.lock().motors.insert(
            port,
            SimMotor {
                class,
                speed_sp: 0,
                position_sp: 0,
                running: false,
                fault: None,
            },
        );
        self
    }

    /// Heading change per gyro read, per unit of differential speed on A and D.
    /// Zero (the default) keeps the heading where the script left it.
    pub fn with_yaw_rate(self, yaw_per_read: f64) -> Self {
        self.lock().yaw_per_read = yaw_per_read;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_fault(&self, port: Port, fault: SimFault) {
        if let Some(motor) = self.lock().motors.get_mut(&port) {
            motor.fault = Some(fault);
        }
    }

    /// Queue gyro readings; once drained the last value (plus yaw) is held
    pub fn script_gyro(&self, readings: impl IntoIterator<Item = f64>) {
        self.lock().gyro_script.extend(readings);
    }

    pub fn set_gyro_failing(&self, failing: bool) {
        self.lock().gyro_failing = failing;
    }

    pub fn set_distance_mm(&self, mm: f64) {
        self.lock().ultrasonic_mm = mm;
    }

    pub fn journal(&self) -> Vec<(Port, SimEvent)> {
        self.lock().journal.clone()
    }

    /// Number of times `command` was issued to `port`
    pub fn command_count(&self, port: Port, command: MotorCommand) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|(p, event)| *p == port && *event == SimEvent::Command(command))
            .count()
    }

    /// Speed setpoints written to `port`, in order
    pub fn speed_history(&self, port: Port) -> Vec<i32> {
        self.lock()
            .journal
            .iter()
            .filter_map(|(p, event)| match event {
                SimEvent::Speed(speed) if *p == port => Some(*speed),
                _ => None,
            })
            .collect()
    }

    pub fn position_setpoint(&self, port: Port) -> Option<i32> {
        self.lock().motors.get(&port).map(|motor| motor.position_sp)
    }

    pub fn is_running(&self, port: Port) -> bool {
        self.lock()
            .motors
            .get(&port)
            .is_some_and(|motor| motor.running)
    }

    pub fn gyro_reads(&self) -> usize {
        self.lock().gyro_reads
    }

    pub fn gyro_modes(&self) -> Vec<GyroMode> {
        self.lock().gyro_modes.clone()
    }
}

impl ActuatorResolver for SimRig {
    fn resolve(&self, port: Port, class: MotorClass) -> Result<Box<dyn Actuator>, ActuatorError> {
        match self.lock().motors.get(&port) {
            Some(motor) if motor.class == class => Ok(Box::new(SimMotorHandle {
                port,
                rig: self.clone(),
            })),
            _ => Err(ActuatorError::NotFound { port, class }),
        }
    }
}

impl SensorReader for SimRig {
    fn read(&self, port: SensorPort, kind: SensorKind) -> Result<f64, SensorError> {
        let mut state = self.lock();
        match kind {
            SensorKind::Gyro => {
                if state.gyro_failing {
                    return Err(SensorError::Read {
                        port,
                        kind,
                        reason: "simulated read failure".to_string(),
                    });
                }
                state.gyro_reads += 1;
                if let Some(reading) = state.gyro_script.pop_front() {
                    state.gyro_angle = reading;
                } else {
                    // Yaw follows the wheel speed difference across the drive pair
                    let spin = (state.speed_if_running(Port::A) - state.speed_if_running(Port::D)) / 2.0;
                    state.gyro_angle -= state.yaw_per_read * spin;
                }
                Ok(state.gyro_angle)
            }
            SensorKind::Ultrasonic => Ok(state.ultrasonic_mm),
        }
    }

    fn set_gyro_mode(&self, _port: SensorPort, mode: GyroMode) -> Result<(), SensorError> {
        let mut state = self.lock();
        if mode == GyroMode::Calibrate {
            state.gyro_angle = 0.0;
        }
        state.gyro_modes.push(mode);
        Ok(())
    }
}

/// Actuator handle into the rig
pub struct SimMotorHandle {
    port: Port,
    rig: SimRig,
}

impl SimMotorHandle {
    fn with_motor<T>(
        &self,
        event: Option<SimEvent>,
        f: impl FnOnce(&mut SimMotor) -> T,
    ) -> Result<T, ActuatorError> {
        let mut state = self.rig.lock();
        if let Some(event) = event {
            state.journal.push((self.port, event));
        }
        let motor = state
            .motors
            .get_mut(&self.port)
            .ok_or_else(|| ActuatorError::Device {
                port: self.port,
                reason: "motor disconnected".to_string(),
            })?;
        Ok(f(motor))
    }
}

impl Actuator for SimMotorHandle {
    fn port(&self) -> Port {
        self.port
    }

    fn command(&mut self, command: MotorCommand) -> Result<(), ActuatorError> {
        debug!("sim motor {}: {:?}", self.port, command);
        let rejected = self.with_motor(Some(SimEvent::Command(command)), |motor| {
            command == MotorCommand::Stop && motor.fault == Some(SimFault::StopFails)
        })?;
        if rejected {
            return Err(ActuatorError::Device {
                port: self.port,
                reason: "stop rejected".to_string(),
            });
        }
        self.with_motor(None, |motor| match command {
            MotorCommand::Run | MotorCommand::RunToAbsolutePosition => {
                motor.running = motor.fault != Some(SimFault::WontStart);
            }
            MotorCommand::Stop => {
                motor.running = motor.fault == Some(SimFault::WontStop);
            }
            MotorCommand::ResetPosition => {
                motor.speed_sp = 0;
                motor.position_sp = 0;
                motor.running = motor.running && motor.fault == Some(SimFault::WontStop);
            }
        })
    }

    fn set_speed_setpoint(&mut self, speed: i32) -> Result<(), ActuatorError> {
        self.with_motor(Some(SimEvent::Speed(speed)), |motor| motor.speed_sp = speed)
    }

    fn set_position_setpoint(&mut self, position: i32) -> Result<(), ActuatorError> {
        self.with_motor(Some(SimEvent::Position(position)), |motor| {
            motor.position_sp = position
        })
    }

    fn set_ramp(&mut self, _up: Duration, _down: Duration) -> Result<(), ActuatorError> {
        self.with_motor(Some(SimEvent::Ramp), |_| ())
    }

    fn state(&mut self) -> Result<MotorState, ActuatorError> {
        self.with_motor(None, |motor| match (motor.running, motor.fault) {
            (true, Some(SimFault::Stalls)) => MotorState::Stalled,
            (true, _) => MotorState::Running,
            (false, _) => MotorState::Idle,
        })
    }

    fn is_running(&mut self) -> Result<bool, ActuatorError> {
        self.with_motor(None, |motor| motor.running)
    }
}
