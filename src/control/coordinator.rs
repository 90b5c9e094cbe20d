// Motor group coordination
//
// A MotorGroup is the set of motors one session drives. It is built by leasing
// every port (no two sessions may hold the same port) and resolving every
// handle before any motor is touched, so a bad port aborts with nothing moving.
//
// Start commands are verified: every motor must report running or stalled
// within the start timeout, otherwise the whole group is stopped. Stopping
// polls each motor until it reports idle, bounded by the stop timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::ControlError;
use crate::config::Timing;
use crate::hardware::{Actuator, ActuatorResolver, MotorCommand, MotorState, SensorPort};
use crate::messages::{MotorSpec, Port};

/// A device a session can hold exclusively
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Resource {
    Motor(Port),
    Sensor(SensorPort),
}

impl Resource {
    fn busy(self) -> ControlError {
        match self {
            Resource::Motor(port) => ControlError::PortBusy { port },
            Resource::Sensor(port) => ControlError::SensorBusy { port },
        }
    }
}

/// Motor ports and sensors currently held by a session
#[derive(Debug, Clone, Default)]
pub struct PortLeases {
    held: Arc<Mutex<BTreeSet<Resource>>>,
}

impl PortLeases {
    fn lock(&self) -> MutexGuard<'_, BTreeSet<Resource>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self, resources: BTreeSet<Resource>) -> Result<PortLease, ControlError> {
        let mut held = self.lock();
        if let Some(&resource) = resources.iter().find(|resource| held.contains(resource)) {
            return Err(resource.busy());
        }
        held.extend(resources.iter().copied());
        Ok(PortLease {
            resources,
            held: Arc::clone(&self.held),
        })
    }

    /// Take every port or none of them
    pub fn acquire(&self, ports: &BTreeSet<Port>) -> Result<PortLease, ControlError> {
        self.take(ports.iter().map(|&port| Resource::Motor(port)).collect())
    }

    /// Take a sensor for the length of a session, e.g. the gyro of a corrected drive
    pub fn acquire_sensor(&self, port: SensorPort) -> Result<PortLease, ControlError> {
        self.take(BTreeSet::from([Resource::Sensor(port)]))
    }

    pub fn is_held(&self, port: Port) -> bool {
        self.lock().contains(&Resource::Motor(port))
    }

    pub fn is_sensor_held(&self, port: SensorPort) -> bool {
        self.lock().contains(&Resource::Sensor(port))
    }
}

/// Released when dropped
#[derive(Debug)]
pub struct PortLease {
    resources: BTreeSet<Resource>,
    held: Arc<Mutex<BTreeSet<Resource>>>,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for resource in &self.resources {
            held.remove(resource);
        }
    }
}

/// Port -> sign table, checked against a motor set up front
#[derive(Debug, Clone, PartialEq)]
pub struct PortSigns(BTreeMap<Port, i32>);

impl PortSigns {
    /// Reject any requested port the table does not cover
    pub fn for_motors(table: &BTreeMap<Port, i32>, specs: &[MotorSpec]) -> Result<Self, ControlError> {
        let mut signs = BTreeMap::new();
        for spec in specs {
            match table.get(&spec.port) {
                Some(&sign) if sign == 1 || sign == -1 => {
                    signs.insert(spec.port, sign);
                }
                Some(&sign) => {
                    return Err(ControlError::InvalidRequest(format!(
                        "sign {} configured for port {} is not +1 or -1",
                        sign, spec.port
                    )));
                }
                None => {
                    return Err(ControlError::InvalidRequest(format!(
                        "port {} is not valid here, expected one of {:?}",
                        spec.port,
                        table.keys().collect::<Vec<_>>()
                    )));
                }
            }
        }
        Ok(Self(signs))
    }

    pub fn sign(&self, port: Port) -> i32 {
        self.0.get(&port).copied().unwrap_or(0)
    }
}

/// What to write to one motor before issuing a command
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Setpoint {
    pub speed: Option<i32>,
    pub position: Option<i32>,
    pub ramp: Option<Duration>,
}

impl Setpoint {
    pub fn speed(speed: i32) -> Self {
        Self {
            speed: Some(speed),
            ..Self::default()
        }
    }

    pub fn position(speed: i32, position: i32) -> Self {
        Self {
            speed: Some(speed),
            position: Some(position),
            ramp: None,
        }
    }

    pub fn with_ramp(self, ramp: Duration) -> Self {
        Self {
            ramp: Some(ramp),
            ..self
        }
    }
}

struct GroupMotor {
    spec: MotorSpec,
    handle: Box<dyn Actuator>,
}

/// The motors held by one session
pub struct MotorGroup {
    motors: Vec<GroupMotor>,
    timing: Timing,
    // Motors may be moving; dropping the group stops them
    armed: bool,
    _lease: PortLease,
}

impl MotorGroup {
    /// Lease the ports and resolve every handle. Nothing is commanded here.
    pub fn acquire(
        resolver: &dyn ActuatorResolver,
        leases: &PortLeases,
        specs: &[MotorSpec],
        timing: Timing,
    ) -> Result<Self, ControlError> {
        if specs.is_empty() {
            return Err(ControlError::InvalidRequest("no motors given".to_string()));
        }
        let ports: BTreeSet<Port> = specs.iter().map(|spec| spec.port).collect();
        if ports.len() != specs.len() {
            return Err(ControlError::InvalidRequest(
                "a port appears more than once".to_string(),
            ));
        }

        let lease = leases.acquire(&ports)?;

        let motors = specs
            .iter()
            .map(|spec| {
                resolver
                    .resolve(spec.port, spec.class)
                    .map(|handle| GroupMotor {
                        spec: *spec,
                        handle,
                    })
                    .map_err(|e| ControlError::ActuatorResolution {
                        port: spec.port,
                        class: spec.class,
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Acquired motors {:?}", ports);
        Ok(Self {
            motors,
            timing,
            armed: false,
            _lease: lease,
        })
    }

    pub fn specs(&self) -> impl Iterator<Item = &MotorSpec> {
        self.motors.iter().map(|motor| &motor.spec)
    }

    pub fn ports(&self) -> Vec<Port> {
        self.specs().map(|spec| spec.port).collect()
    }

    /// Write each motor's setpoint and issue `command` to all of them.
    ///
    /// Start commands are verified; if any motor fails to come up, or any
    /// write fails, every motor in the group is stopped before the error
    /// is returned.
    pub async fn apply<F>(&mut self, command: MotorCommand, setpoint: F) -> Result<(), ControlError>
    where
        F: FnMut(&MotorSpec) -> Setpoint,
    {
        self.apply_staggered(command, setpoint, Duration::ZERO).await
    }

    /// Like `apply`, pausing `stagger` between consecutive motor starts
    pub async fn apply_staggered<F>(
        &mut self,
        command: MotorCommand,
        mut setpoint: F,
        stagger: Duration,
    ) -> Result<(), ControlError>
    where
        F: FnMut(&MotorSpec) -> Setpoint,
    {
        if command.is_start() {
            self.armed = true;
        }

        let mut result = Ok(());
        for (i, motor) in self.motors.iter_mut().enumerate() {
            if i > 0 && !stagger.is_zero() {
                sleep(stagger).await;
            }
            let target = setpoint(&motor.spec);
            debug!("Motor {}: {:?} {:?}", motor.spec.port, command, target);
            result = write_setpoint(motor, &target).and_then(|_| {
                motor
                    .handle
                    .command(command)
                    .map_err(|source| ControlError::Actuator {
                        port: motor.spec.port,
                        source,
                    })
            });
            if result.is_err() {
                break;
            }
        }

        if result.is_ok() && command.is_start() {
            result = self.verify_started().await;
        }

        if let Err(e) = result {
            warn!("Aborting motor group {:?}: {}", self.ports(), e);
            if let Err(stop_err) = self.stop_all().await {
                warn!("Stop after abort incomplete: {}", stop_err);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Issue a command that does not start the motors (e.g. reset), unverified
    pub fn command_all(&mut self, command: MotorCommand) -> Result<(), ControlError> {
        for motor in &mut self.motors {
            motor
                .handle
                .command(command)
                .map_err(|source| ControlError::Actuator {
                    port: motor.spec.port,
                    source,
                })?;
        }
        Ok(())
    }

    /// Wait until every motor reports running or stalled.
    /// Fails with the first motor that does not within the start timeout.
    async fn verify_started(&mut self) -> Result<(), ControlError> {
        let deadline = Instant::now() + self.timing.start_timeout;
        for motor in &mut self.motors {
            let port = motor.spec.port;
            let started = wait_for_state(
                motor.handle.as_mut(),
                &[MotorState::Running, MotorState::Stalled],
                deadline,
                self.timing.poll_interval,
            )
            .await
            .map_err(|source| ControlError::Actuator { port, source })?;
            if !started {
                return Err(ControlError::StartVerification { port });
            }
        }
        Ok(())
    }

    /// Stop every motor and wait for each to report not running.
    ///
    /// Stop is re-issued on every poll that still sees the motor running.
    /// Each motor gets at most the stop timeout; the first one that overruns
    /// (or fails outright) is reported, after the rest have been stopped too.
    pub async fn stop_all(&mut self) -> Result<(), ControlError> {
        let mut first_error = None;

        for motor in &mut self.motors {
            if let Err(source) = motor.handle.command(MotorCommand::Stop) {
                warn!("Stop command to motor {} failed: {}", motor.spec.port, source);
                first_error.get_or_insert(ControlError::Actuator {
                    port: motor.spec.port,
                    source,
                });
            }
        }

        for motor in &mut self.motors {
            let port = motor.spec.port;
            let deadline = Instant::now() + self.timing.stop_timeout;
            loop {
                match motor.handle.is_running() {
                    Ok(false) => break,
                    Ok(true) if Instant::now() >= deadline => {
                        warn!(
                            "Motor {} still running after {}ms, giving up",
                            port,
                            self.timing.stop_timeout.as_millis()
                        );
                        first_error.get_or_insert(ControlError::StopTimeout { port });
                        break;
                    }
                    Ok(true) => {
                        if let Err(e) = motor.handle.command(MotorCommand::Stop) {
                            warn!("Re-issued stop to motor {} failed: {}", port, e);
                        }
                        sleep(self.timing.poll_interval).await;
                    }
                    Err(source) => {
                        warn!("Cannot read state of motor {}: {}", port, source);
                        first_error.get_or_insert(ControlError::Actuator { port, source });
                        break;
                    }
                }
            }
        }

        self.armed = false;
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Motors {:?} stopped", self.ports());
                Ok(())
            }
        }
    }

    /// Give up the lease and leave the motors doing what they were told.
    /// Used by fire-and-forget commands (run, position moves).
    pub fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for MotorGroup {
    fn drop(&mut self) {
        // Session abandoned mid-motion (task cancelled, early return): best-effort stop
        if self.armed {
            warn!("Motor group {:?} dropped while running, stopping", self.ports());
            for motor in &mut self.motors {
                if let Err(e) = motor.handle.command(MotorCommand::Stop) {
                    warn!("Failed to stop motor {} on drop: {}", motor.spec.port, e);
                }
            }
        }
    }
}

fn write_setpoint(motor: &mut GroupMotor, target: &Setpoint) -> Result<(), ControlError> {
    let port = motor.spec.port;
    let wrap = |source| ControlError::Actuator { port, source };
    if let Some(ramp) = target.ramp {
        motor.handle.set_ramp(ramp, ramp).map_err(wrap)?;
    }
    if let Some(speed) = target.speed {
        motor.handle.set_speed_setpoint(speed).map_err(wrap)?;
    }
    if let Some(position) = target.position {
        motor.handle.set_position_setpoint(position).map_err(wrap)?;
    }
    Ok(())
}

/// Poll a motor until it reports one of `targets` or the deadline passes
pub async fn wait_for_state(
    handle: &mut dyn Actuator,
    targets: &[MotorState],
    deadline: Instant,
    poll_interval: Duration,
) -> Result<bool, crate::hardware::ActuatorError> {
    loop {
        if targets.contains(&handle.state()?) {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimFault, SimRig};
    use crate::messages::MotorClass;

    fn drive_pair() -> Vec<MotorSpec> {
        vec![MotorSpec::large(Port::A, 100), MotorSpec::large(Port::D, 100)]
    }

    #[test]
    fn test_unknown_motor_aborts_before_any_command() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let specs = vec![
            MotorSpec::large(Port::A, 100),
            MotorSpec::large(Port::B, 100), // B is a medium motor
        ];
        let err = MotorGroup::acquire(&rig, &leases, &specs, Timing::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ControlError::ActuatorResolution { port: Port::B, class: MotorClass::Large, .. }
        ));
        assert!(rig.journal().is_empty());
        // Lease released with the failed group
        assert!(!leases.is_held(Port::A));
    }

    #[test]
    fn test_leases_are_exclusive() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let group = MotorGroup::acquire(&rig, &leases, &drive_pair(), Timing::default()).unwrap();

        let overlapping = vec![MotorSpec::large(Port::D, 50), MotorSpec::medium(Port::B, 50)];
        let err = MotorGroup::acquire(&rig, &leases, &overlapping, Timing::default())
            .err()
            .unwrap();
        assert!(matches!(err, ControlError::PortBusy { port: Port::D }));
        // All-or-nothing: B was not taken by the failed attempt
        assert!(!leases.is_held(Port::B));

        drop(group);
        assert!(MotorGroup::acquire(&rig, &leases, &overlapping, Timing::default()).is_ok());
    }

    #[test]
    fn test_sensor_lease_is_exclusive() {
        let leases = PortLeases::default();
        let gyro = leases.acquire_sensor(SensorPort::In2).unwrap();
        assert!(leases.is_sensor_held(SensorPort::In2));
        assert!(matches!(
            leases.acquire_sensor(SensorPort::In2),
            Err(ControlError::SensorBusy { port: SensorPort::In2 })
        ));
        // Motor ports and other sensors are independent of the gyro
        assert!(leases.acquire_sensor(SensorPort::In1).is_ok());
        assert!(leases.acquire(&BTreeSet::from([Port::A])).is_ok());

        drop(gyro);
        assert!(!leases.is_sensor_held(SensorPort::In2));
        assert!(leases.acquire_sensor(SensorPort::In2).is_ok());
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let specs = vec![MotorSpec::large(Port::A, 1), MotorSpec::large(Port::A, 2)];
        assert!(matches!(
            MotorGroup::acquire(&rig, &leases, &specs, Timing::default()),
            Err(ControlError::InvalidRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_writes_setpoints_and_verifies() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let mut group = MotorGroup::acquire(&rig, &leases, &drive_pair(), Timing::default()).unwrap();

        group
            .apply(MotorCommand::Run, |spec| Setpoint::speed(spec.speed * 2))
            .await
            .unwrap();
        assert!(rig.is_running(Port::A));
        assert!(rig.is_running(Port::D));
        assert_eq!(rig.speed_history(Port::D), vec![200]);

        group.stop_all().await.unwrap();
        assert!(!rig.is_running(Port::A));
        assert!(!rig.is_running(Port::D));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_motor_counts_as_started() {
        let rig = SimRig::differential();
        rig.set_fault(Port::A, SimFault::Stalls);
        let leases = PortLeases::default();
        let mut group = MotorGroup::acquire(&rig, &leases, &drive_pair(), Timing::default()).unwrap();
        assert!(group.apply(MotorCommand::Run, |_| Setpoint::speed(10)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_stops_whole_group() {
        let rig = SimRig::differential();
        rig.set_fault(Port::D, SimFault::WontStart);
        let leases = PortLeases::default();
        let mut group = MotorGroup::acquire(&rig, &leases, &drive_pair(), Timing::default()).unwrap();

        let err = group
            .apply(MotorCommand::Run, |_| Setpoint::speed(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::StartVerification { port: Port::D }));

        // Every motor got a stop before the failure came back, A is not left running
        assert!(rig.command_count(Port::A, MotorCommand::Stop) >= 1);
        assert!(rig.command_count(Port::D, MotorCommand::Stop) >= 1);
        assert!(!rig.is_running(Port::A));

        let journal = rig.journal();
        let last_run = journal
            .iter()
            .rposition(|(_, event)| *event == crate::hardware::sim::SimEvent::Command(MotorCommand::Run))
            .unwrap();
        let first_stop = journal
            .iter()
            .position(|(_, event)| *event == crate::hardware::sim::SimEvent::Command(MotorCommand::Stop))
            .unwrap();
        assert!(first_stop > last_run);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_verification_is_bounded() {
        let rig = SimRig::differential();
        rig.set_fault(Port::A, SimFault::WontStart);
        let leases = PortLeases::default();
        let timing = Timing::default();
        let mut group = MotorGroup::acquire(&rig, &leases, &drive_pair(), timing).unwrap();

        let started = Instant::now();
        let err = group.apply(MotorCommand::Run, |_| Setpoint::speed(100)).await;
        assert!(matches!(err, Err(ControlError::StartVerification { port: Port::A })));
        assert!(started.elapsed() <= timing.start_timeout + timing.poll_interval + timing.stop_timeout * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_gives_up_on_motor_that_never_stops() {
        let rig = SimRig::differential();
        rig.set_fault(Port::A, SimFault::WontStop);
        let leases = PortLeases::default();
        let timing = Timing::default();
        let mut group = MotorGroup::acquire(&rig, &leases, &drive_pair(), timing).unwrap();
        group.apply(MotorCommand::Run, |_| Setpoint::speed(100)).await.unwrap();

        let started = Instant::now();
        let err = group.stop_all().await.unwrap_err();
        assert!(matches!(err, ControlError::StopTimeout { port: Port::A }));
        assert!(started.elapsed() <= timing.stop_timeout * 2 + timing.poll_interval);

        // Stop was re-issued while polling, and D was still stopped
        assert!(rig.command_count(Port::A, MotorCommand::Stop) > 1);
        assert!(!rig.is_running(Port::D));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_survives_rejected_stops() {
        let rig = SimRig::differential();
        rig.set_fault(Port::A, SimFault::StopFails);
        let leases = PortLeases::default();
        let timing = Timing::default();
        let mut group = MotorGroup::acquire(&rig, &leases, &drive_pair(), timing).unwrap();
        group.apply(MotorCommand::Run, |_| Setpoint::speed(100)).await.unwrap();

        let started = Instant::now();
        let err = group.stop_all().await.unwrap_err();
        assert!(matches!(err, ControlError::Actuator { port: Port::A, .. }));
        assert!(started.elapsed() <= timing.stop_timeout * 2 + timing.poll_interval);
        // Stop kept being re-issued while polling, D still stopped
        assert!(rig.command_count(Port::A, MotorCommand::Stop) > 1);
        assert!(!rig.is_running(Port::D));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staggered_start_spaces_motors() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let specs = vec![MotorSpec::medium(Port::C, 1200), MotorSpec::medium(Port::B, 300)];
        let mut group = MotorGroup::acquire(&rig, &leases, &specs, Timing::default()).unwrap();

        let started = Instant::now();
        group
            .apply_staggered(MotorCommand::Run, |spec| Setpoint::speed(spec.speed), Duration::from_millis(250))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));

        let order: Vec<Port> = rig
            .journal()
            .into_iter()
            .filter(|(_, event)| *event == crate::hardware::sim::SimEvent::Command(MotorCommand::Run))
            .map(|(port, _)| port)
            .collect();
        assert_eq!(order, vec![Port::C, Port::B]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_running_group_stops_motors() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let mut group = MotorGroup::acquire(&rig, &leases, &drive_pair(), Timing::default()).unwrap();
        group.apply(MotorCommand::Run, |_| Setpoint::speed(100)).await.unwrap();
        drop(group);
        assert!(!rig.is_running(Port::A));
        assert!(!leases.is_held(Port::A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_leaves_motors_running() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let mut group = MotorGroup::acquire(&rig, &leases, &drive_pair(), Timing::default()).unwrap();
        group.apply(MotorCommand::Run, |_| Setpoint::speed(100)).await.unwrap();
        group.release();
        assert!(rig.is_running(Port::A));
        assert!(!leases.is_held(Port::A));
    }

    #[test]
    fn test_port_signs_reject_unknown_port() {
        let table = BTreeMap::from([(Port::A, 1), (Port::D, -1)]);
        let signs = PortSigns::for_motors(&table, &drive_pair()).unwrap();
        assert_eq!(signs.sign(Port::A), 1);
        assert_eq!(signs.sign(Port::D), -1);

        let specs = vec![MotorSpec::large(Port::A, 1), MotorSpec::large(Port::C, 1)];
        assert!(matches!(
            PortSigns::for_motors(&table, &specs),
            Err(ControlError::InvalidRequest(_))
        ));

        let bad = BTreeMap::from([(Port::A, 2)]);
        assert!(PortSigns::for_motors(&bad, &[MotorSpec::large(Port::A, 1)]).is_err());
    }
}
