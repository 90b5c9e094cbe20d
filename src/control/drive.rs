// Straight-line drive
//
// Two flavours:
// - `drive`: position mode, no feedback. Distance becomes a wheel rotation target.
// - `drive_with_gyro`: speed mode with a PID on the gyro heading. Each tick
//   steers the wheels apart by the PID turn, with opposite signs per wheel.
//
// `DriveController` owns the per-tick logic and is shared with streamed sessions.

use tokio::time::sleep;
use tracing::{debug, info};

use super::coordinator::{MotorGroup, PortLease, PortSigns, Setpoint};
use super::geometry::wheel_rotation_degrees;
use super::pid::Pid;
use super::{ControlContext, ControlError};
use crate::hardware::MotorCommand;
use crate::messages::{DriveRequest, GainOverrides, StatusResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Idle,
    Running,
    Stopping,
    Terminated,
}

/// One gyro-corrected drive session
pub struct DriveController<'a> {
    ctx: ControlContext<'a>,
    group: MotorGroup,
    steering: PortSigns,
    pid: Pid,
    speed: i32,
    state: DriveState,
    _gyro: PortLease,
}

impl<'a> DriveController<'a> {
    /// The steering table is checked against the motor set here, before any tick.
    /// The gyro is held until the controller is finished or dropped.
    pub fn new(
        ctx: ControlContext<'a>,
        group: MotorGroup,
        speed: i32,
        overrides: &GainOverrides,
    ) -> Result<Self, ControlError> {
        let specs: Vec<_> = group.specs().copied().collect();
        let steering = PortSigns::for_motors(&ctx.config.drive_steering, &specs)?;
        let gyro = ctx.acquire_gyro()?;
        let gains = ctx.config.drive_gains.with_overrides(overrides);
        info!("Drive session on {:?}: speed={}, gains={:?}", group.ports(), speed, gains);
        Ok(Self {
            ctx,
            group,
            steering,
            pid: Pid::new(gains),
            speed,
            state: DriveState::Idle,
            _gyro: gyro,
        })
    }

    pub fn state(&self) -> DriveState {
        self.state
    }

    pub fn ticks(&self) -> u64 {
        self.pid.state().ticks
    }

    /// Base speed for the following ticks; its sign sets the direction
    pub fn set_speed(&mut self, speed: i32) {
        self.speed = speed;
    }

    fn transition(&mut self, next: DriveState) {
        if self.state != next {
            debug!("Drive {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Read the heading, compute the turn and push new setpoints to the wheels
    pub async fn tick(&mut self) -> Result<(), ControlError> {
        self.transition(DriveState::Running);

        let error = match self.ctx.read_gyro() {
            Ok(error) => error,
            Err(e) => {
                self.transition(DriveState::Stopping);
                return Err(e);
            }
        };
        let turn = self.pid.update(error) as i32;
        let base = self.ctx.config.drive_forward_sign.saturating_mul(self.speed);
        let ramp = self.ctx.config.timing.ramp;
        debug!("Drive tick {}: error={}, turn={}, base={}", self.ticks(), error, turn, base);

        let steering = &self.steering;
        let applied = self
            .group
            .apply(MotorCommand::Run, |spec| {
                let speed = base.saturating_add(steering.sign(spec.port).saturating_mul(turn));
                Setpoint::speed(speed).with_ramp(ramp)
            })
            .await;
        if applied.is_err() {
            self.transition(DriveState::Stopping);
        }
        applied
    }

    /// Stop every motor and fold the stop result into the session outcome
    pub async fn finish(mut self, outcome: Result<StatusResult, ControlError>) -> StatusResult {
        self.transition(DriveState::Stopping);
        let stopped = self.group.stop_all().await;
        self.transition(DriveState::Terminated);
        info!("Drive session ended after {} ticks", self.ticks());

        match (outcome, stopped) {
            (Err(e), _) => StatusResult::failure(&e),
            (Ok(_), Err(e)) => StatusResult::failure(&e),
            (Ok(status), Ok(())) => status,
        }
    }
}

/// Position-mode drive: one run-to-position command per motor, no correction
pub async fn drive(ctx: ControlContext<'_>, request: &DriveRequest) -> Result<StatusResult, ControlError> {
    let mut group = ctx.acquire(&request.motors)?;

    let rotation = ctx
        .config
        .drive_forward_sign
        .saturating_mul(wheel_rotation_degrees(request.distance, ctx.config.geometry.wheel_radius));
    let speed = request.speed.saturating_abs();
    info!("Drive {}cm: {} degrees of wheel rotation at {}", request.distance, rotation, speed);

    group.command_all(MotorCommand::ResetPosition)?;
    group
        .apply(MotorCommand::RunToAbsolutePosition, |spec| {
            Setpoint::position(speed, spec.position.unwrap_or(rotation))
        })
        .await?;
    group.release();
    Ok(StatusResult::ok(format!("driving {}cm", request.distance)))
}

/// Gyro-corrected drive for a fixed tick budget
pub async fn drive_with_gyro(ctx: ControlContext<'_>, request: &DriveRequest) -> StatusResult {
    let group = match ctx.acquire(&request.motors) {
        Ok(group) => group,
        Err(e) => return StatusResult::failure(&e),
    };
    let mut drive = match DriveController::new(ctx, group, request.speed, &request.gains) {
        Ok(drive) => drive,
        Err(e) => return StatusResult::failure(&e),
    };

    let outcome = run_tick_budget(&ctx, &mut drive).await;
    drive.finish(outcome).await
}

async fn run_tick_budget(
    ctx: &ControlContext<'_>,
    drive: &mut DriveController<'_>,
) -> Result<StatusResult, ControlError> {
    ctx.recalibrate_gyro().await?;
    let timing = ctx.config.timing;
    for _ in 0..timing.drive_tick_budget {
        drive.tick().await?;
        sleep(timing.drive_tick).await;
    }
    Ok(StatusResult::ok(format!("drove {} ticks", timing.drive_tick_budget)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlConfig, Timing};
    use crate::control::coordinator::PortLeases;
    use crate::hardware::sim::{SimFault, SimRig};
    use crate::messages::{MotorSpec, Port};

    fn request(distance: f64, speed: i32) -> DriveRequest {
        DriveRequest {
            motors: vec![MotorSpec::large(Port::A, speed), MotorSpec::large(Port::D, speed)],
            distance,
            speed,
            gains: GainOverrides::default(),
        }
    }

    fn short_config() -> ControlConfig {
        ControlConfig {
            timing: Timing {
                drive_tick_budget: 3,
                ..Timing::default()
            },
            ..ControlConfig::default()
        }
    }

    macro_rules! context {
        ($rig:expr, $leases:expr, $config:expr) => {
            ControlContext {
                resolver: &$rig,
                sensors: &$rig,
                leases: &$leases,
                config: &$config,
            }
        };
    }

    #[tokio::test(start_paused = true)]
    async fn test_gyro_drive_steers_against_drift() {
        let rig = SimRig::differential();
        rig.script_gyro([0.0, 2.0, -1.0]);
        let leases = PortLeases::default();
        let config = short_config();
        let ctx = context!(rig, leases, config);

        let status = drive_with_gyro(ctx, &request(50.0, 100)).await;
        assert!(status.success, "{:?}", status);

        // turns with kp=2, ki=1, kd=1:
        //   e=0  -> 0
        //   e=2  -> 4 + 2 + 2 = 8
        //   e=-1 -> -2 + 1 - 3 = -4
        // base = -100 (motors mounted reversed); A gets +turn, D gets -turn
        assert_eq!(rig.speed_history(Port::A), vec![-100, -92, -104]);
        assert_eq!(rig.speed_history(Port::D), vec![-100, -108, -96]);
        assert!(!rig.is_running(Port::A));
        assert!(!rig.is_running(Port::D));
        assert!(!leases.is_held(Port::A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gain_overrides_apply() {
        let rig = SimRig::differential();
        rig.script_gyro([3.0]);
        let leases = PortLeases::default();
        let config = ControlConfig {
            timing: Timing {
                drive_tick_budget: 1,
                ..Timing::default()
            },
            ..ControlConfig::default()
        };
        let ctx = context!(rig, leases, config);

        let mut req = request(10.0, -50);
        req.gains = GainOverrides {
            kp: Some(1.0),
            ki: Some(0.0),
            kd: Some(0.0),
        };
        assert!(drive_with_gyro(ctx, &req).await.success);
        // Reverse: base = -1 * -50 = 50, turn = 3
        assert_eq!(rig.speed_history(Port::A), vec![53]);
        assert_eq!(rig.speed_history(Port::D), vec![47]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gyro_failure_ends_session_stopped() {
        let rig = SimRig::differential();
        rig.set_gyro_failing(true);
        let leases = PortLeases::default();
        let config = short_config();
        let ctx = context!(rig, leases, config);

        let status = drive_with_gyro(ctx, &request(50.0, 100)).await;
        assert!(!status.success);
        assert!(status.message.contains("Sensor read failed"));
        assert_eq!(rig.command_count(Port::A, MotorCommand::Run), 0);
        assert!(rig.command_count(Port::A, MotorCommand::Stop) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_motor_reports_port() {
        let rig = SimRig::differential();
        rig.set_fault(Port::A, SimFault::WontStart);
        let leases = PortLeases::default();
        let config = short_config();
        let ctx = context!(rig, leases, config);

        let status = drive_with_gyro(ctx, &request(50.0, 100)).await;
        assert!(!status.success);
        assert_eq!(status.port, Some(Port::A));
        assert_eq!(rig.command_count(Port::A, MotorCommand::Run), 1);
        assert!(!rig.is_running(Port::D));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_steering_port_rejected_before_motion() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let config = short_config();
        let ctx = context!(rig, leases, config);

        let mut req = request(50.0, 100);
        req.motors = vec![MotorSpec::large(Port::A, 100), MotorSpec::medium(Port::B, 100)];
        let status = drive_with_gyro(ctx, &req).await;
        assert!(!status.success);
        assert!(rig.journal().is_empty());
        assert!(rig.gyro_modes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_gain_saturates_setpoints() {
        let rig = SimRig::differential();
        rig.script_gyro([5.0]);
        let leases = PortLeases::default();
        let config = ControlConfig {
            timing: Timing {
                drive_tick_budget: 1,
                ..Timing::default()
            },
            ..ControlConfig::default()
        };
        let ctx = context!(rig, leases, config);

        let mut req = request(50.0, 100);
        req.gains.kp = Some(1e10);
        let status = drive_with_gyro(ctx, &req).await;
        assert!(status.success, "{:?}", status);
        // turn saturates at i32::MAX; each wheel saturates instead of wrapping
        assert_eq!(rig.speed_history(Port::A), vec![i32::MAX - 100]);
        assert_eq!(rig.speed_history(Port::D), vec![i32::MIN]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extreme_speed_does_not_overflow() {
        let rig = SimRig::differential();
        rig.script_gyro([0.0]);
        let leases = PortLeases::default();
        let config = ControlConfig {
            timing: Timing {
                drive_tick_budget: 1,
                ..Timing::default()
            },
            ..ControlConfig::default()
        };
        let ctx = context!(rig, leases, config);

        assert!(drive_with_gyro(ctx, &request(50.0, i32::MIN)).await.success);
        // -1 * i32::MIN saturates to i32::MAX
        assert_eq!(rig.speed_history(Port::A), vec![i32::MAX]);

        let status = drive(ctx, &request(10.0, i32::MIN)).await.unwrap();
        assert!(status.success);
        assert_eq!(rig.speed_history(Port::D), vec![i32::MAX, i32::MAX]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gyro_held_for_the_session() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let config = short_config();
        let ctx = context!(rig, leases, config);

        let gyro = ctx.acquire_gyro().unwrap();
        let status = drive_with_gyro(ctx, &request(50.0, 100)).await;
        assert!(!status.success);
        assert!(status.message.contains("held by another session"));
        assert!(rig.journal().is_empty());
        assert!(!leases.is_held(Port::A));

        drop(gyro);
        let group = ctx.acquire(&request(50.0, 100).motors).unwrap();
        let drive = DriveController::new(ctx, group, 100, &GainOverrides::default()).unwrap();
        assert!(leases.is_sensor_held(config.gyro_port));
        drive.finish(Ok(StatusResult::ok("done"))).await;
        assert!(!leases.is_sensor_held(config.gyro_port));
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_states() {
        let rig = SimRig::differential();
        rig.script_gyro([1.0]);
        let leases = PortLeases::default();
        let config = short_config();
        let ctx = context!(rig, leases, config);

        let group = ctx.acquire(&request(50.0, 100).motors).unwrap();
        let mut drive = DriveController::new(ctx, group, 100, &GainOverrides::default()).unwrap();
        assert_eq!(drive.state(), DriveState::Idle);
        drive.tick().await.unwrap();
        assert_eq!(drive.state(), DriveState::Running);
        assert_eq!(drive.ticks(), 1);

        let status = drive.finish(Ok(StatusResult::ok("done"))).await;
        assert!(status.success);
        assert!(!rig.is_running(Port::A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_drive() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let config = ControlConfig::default();
        let ctx = context!(rig, leases, config);

        let status = drive(ctx, &request(10.0, -200)).await.unwrap();
        assert!(status.success);
        // 10cm on a 2.8cm wheel is 204 degrees, negated for the reversed mounting
        assert_eq!(rig.position_setpoint(Port::A), Some(-204));
        assert_eq!(rig.position_setpoint(Port::D), Some(-204));
        assert_eq!(rig.speed_history(Port::A), vec![200]);
        assert_eq!(rig.command_count(Port::A, MotorCommand::ResetPosition), 1);
        assert_eq!(rig.command_count(Port::D, MotorCommand::RunToAbsolutePosition), 1);
        // Position moves run on after the reply, the ports are free again
        assert!(rig.is_running(Port::A));
        assert!(!leases.is_held(Port::A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_drive_honours_motor_position() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let config = ControlConfig::default();
        let ctx = context!(rig, leases, config);

        let mut req = request(10.0, 200);
        req.motors[0].position = Some(90);
        assert!(drive(ctx, &req).await.unwrap().success);
        assert_eq!(rig.position_setpoint(Port::A), Some(90));
        assert_eq!(rig.position_setpoint(Port::D), Some(-204));
    }
}
