// In-place rotation
//
// - `rotate_with_gyro`: PD loop on the heading error with power shaping,
//   until the heading magnitude reaches the target magnitude.
// - `rotate`: constant speed, position mode, wheel rotation from the turn arc.
//
// Positive degrees turn counter-clockwise. The base rotate speed is flipped
// for positive targets so the wheels spin towards the target.

use tokio::time::sleep;
use tracing::{debug, info};

use super::coordinator::{MotorGroup, PortLease, PortSigns, Setpoint};
use super::geometry::turn_wheel_rotation;
use super::pid::Pid;
use super::{ControlContext, ControlError};
use crate::config::{Gains, PowerShaping};
use crate::hardware::MotorCommand;
use crate::messages::{RotateRequest, StatusResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateState {
    Idle,
    Running,
    Stopping,
    Terminated,
}

/// Direction sign applied to the base rotate speed
pub fn rotation_direction(degrees: f64) -> i32 {
    if degrees > 0.0 { -1 } else { 1 }
}

/// Turn a raw PD output into the power sent to the wheels.
///
/// Overshoot (error and direction of opposite sign) reverses the power, far
/// from the target (> threshold) the power is boosted, and the result is
/// always clamped to the cap.
pub fn shape_power(raw: f64, error: f64, direction: i32, shaping: &PowerShaping) -> i32 {
    let mut power = raw;
    if error * f64::from(direction) < 0.0 {
        power = -power;
    }
    if error.abs() > shaping.boost_threshold {
        power *= shaping.boost_factor;
    }
    let cap = f64::from(shaping.cap.abs());
    // NaN gains collapse to no power rather than escaping the clamp
    if power.is_nan() {
        return 0;
    }
    power.clamp(-cap, cap) as i32
}

/// One gyro-corrected rotation
pub struct RotateController<'a> {
    ctx: ControlContext<'a>,
    group: MotorGroup,
    signs: PortSigns,
    pid: Pid,
    target: f64,
    direction: i32,
    base_speed: i32,
    state: RotateState,
    _gyro: PortLease,
}

impl<'a> RotateController<'a> {
    pub fn new(ctx: ControlContext<'a>, group: MotorGroup, request: &RotateRequest) -> Result<Self, ControlError> {
        let specs: Vec<_> = group.specs().copied().collect();
        let signs = PortSigns::for_motors(&ctx.config.rotate_signs, &specs)?;
        let gyro = ctx.acquire_gyro()?;
        // P and D only: the integral term is not used for rotation
        let gains = ctx.config.rotate_gains.with_overrides(&request.gains);
        let gains = Gains::new(gains.kp, 0.0, gains.kd);
        let direction = rotation_direction(request.degrees);
        info!(
            "Rotate session on {:?}: target={}, speed={}, gains={:?}",
            group.ports(),
            request.degrees,
            request.speed,
            gains
        );
        Ok(Self {
            ctx,
            group,
            signs,
            pid: Pid::new(gains),
            target: request.degrees,
            direction,
            base_speed: direction.saturating_mul(request.speed),
            state: RotateState::Idle,
            _gyro: gyro,
        })
    }

    pub fn state(&self) -> RotateState {
        self.state
    }

    fn transition(&mut self, next: RotateState) {
        if self.state != next {
            debug!("Rotate {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Whether the heading has reached the target magnitude
    fn reached(&self, heading: f64) -> bool {
        heading.abs() >= self.target.abs()
    }

    /// Tick until the target heading is reached
    async fn run(&mut self) -> Result<StatusResult, ControlError> {
        self.transition(RotateState::Running);
        let tick = self.ctx.config.timing.rotate_tick;
        loop {
            let heading = self.ctx.read_gyro()?;
            if self.reached(heading) {
                return Ok(StatusResult::ok(format!("rotated to {} degrees", heading)));
            }

            let error = heading - self.target;
            let turn = self.pid.update(error);
            let raw = f64::from(self.base_speed) + turn;
            let power = shape_power(raw, error, self.direction, &self.ctx.config.shaping);
            debug!("Rotate tick: heading={}, error={}, raw={}, power={}", heading, error, raw, power);

            let signs = &self.signs;
            self.group
                .apply(MotorCommand::Run, |spec| {
                    Setpoint::speed(signs.sign(spec.port).saturating_mul(power))
                })
                .await?;
            sleep(tick).await;
        }
    }

    pub async fn finish(mut self, outcome: Result<StatusResult, ControlError>) -> StatusResult {
        self.transition(RotateState::Stopping);
        let stopped = self.group.stop_all().await;
        self.transition(RotateState::Terminated);

        match (outcome, stopped) {
            (Err(e), _) | (Ok(_), Err(e)) => StatusResult::failure(&e),
            (Ok(status), Ok(())) => status,
        }
    }
}

/// Gyro-corrected in-place rotation
pub async fn rotate_with_gyro(ctx: ControlContext<'_>, request: &RotateRequest) -> StatusResult {
    let group = match ctx.acquire(&request.motors) {
        Ok(group) => group,
        Err(e) => return StatusResult::failure(&e),
    };
    let mut rotation = match RotateController::new(ctx, group, request) {
        Ok(rotation) => rotation,
        Err(e) => return StatusResult::failure(&e),
    };

    let outcome = match ctx.recalibrate_gyro().await {
        Ok(()) => rotation.run().await,
        Err(e) => Err(e),
    };
    rotation.finish(outcome).await
}

/// Constant-speed rotation by a precomputed wheel rotation, no gyro
pub async fn rotate(ctx: ControlContext<'_>, request: &RotateRequest) -> Result<StatusResult, ControlError> {
    let mut group = ctx.acquire(&request.motors)?;
    let specs: Vec<_> = group.specs().copied().collect();
    let signs = PortSigns::for_motors(&ctx.config.rotate_signs, &specs)?;

    let direction = rotation_direction(request.degrees);
    let rotation = turn_wheel_rotation(request.degrees, &ctx.config.geometry);
    let speed = request.speed.saturating_abs();
    info!("Rotate {} degrees: {} degrees of wheel rotation at {}", request.degrees, rotation, speed);

    group.command_all(MotorCommand::ResetPosition)?;
    group
        .apply(MotorCommand::RunToAbsolutePosition, |spec| {
            let target = signs.sign(spec.port).saturating_mul(direction).saturating_mul(rotation);
            Setpoint::position(speed, spec.position.unwrap_or(target))
        })
        .await?;
    group.release();
    Ok(StatusResult::ok(format!("rotating {} degrees", request.degrees)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::control::coordinator::PortLeases;
    use crate::hardware::sim::SimRig;
    use crate::messages::{GainOverrides, MotorSpec, Port};

    fn request(degrees: f64, speed: i32) -> RotateRequest {
        RotateRequest {
            motors: vec![MotorSpec::large(Port::A, speed), MotorSpec::large(Port::D, speed)],
            degrees,
            speed,
            gains: GainOverrides::default(),
        }
    }

    #[test]
    fn test_shaped_power_never_exceeds_cap() {
        let shaping = PowerShaping::default();
        let raws = [-1e9, -5000.0, -51.0, -12.5, -0.4, 0.0, 0.4, 12.5, 13.0, 49.9, 5000.0, 1e9];
        let errors = [-720.0, -90.0, -5.0001, -5.0, -0.1, 0.0, 0.1, 5.0, 5.0001, 90.0, 720.0];
        for &raw in &raws {
            for &error in &errors {
                for direction in [-1, 1] {
                    let power = shape_power(raw, error, direction, &shaping);
                    assert!(power.abs() <= shaping.cap, "raw={} error={} -> {}", raw, error, power);
                }
            }
        }
        assert_eq!(shape_power(f64::INFINITY, 90.0, 1, &shaping), 50);
        assert_eq!(shape_power(f64::NAN, 90.0, 1, &shaping), 0);
    }

    #[test]
    fn test_shaping_rules() {
        let shaping = PowerShaping::default();
        // Close to target, same sign: passed through
        assert_eq!(shape_power(-10.0, -3.0, -1, &shaping), -10);
        // Overshoot: reversed
        assert_eq!(shape_power(-10.0, 3.0, -1, &shaping), 10);
        // Far from target: boosted x4
        assert_eq!(shape_power(-10.0, -30.0, -1, &shaping), -40);
        // Boosted past the cap: clamped
        assert_eq!(shape_power(-20.0, -30.0, -1, &shaping), -50);
        // Exactly at the threshold is not boosted
        assert_eq!(shape_power(10.0, 5.0, 1, &shaping), 10);
    }

    #[test]
    fn test_direction_follows_target_sign() {
        assert_eq!(rotation_direction(90.0), -1);
        assert_eq!(rotation_direction(-45.0), 1);
        assert_eq!(rotation_direction(0.0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_heading_meets_target() {
        let rig = SimRig::differential();
        rig.script_gyro([0.0, 30.0, 60.0, 90.0, 120.0]);
        let leases = PortLeases::default();
        let config = ControlConfig::default();
        let ctx = ControlContext {
            resolver: &rig,
            sensors: &rig,
            leases: &leases,
            config: &config,
        };

        let status = rotate_with_gyro(ctx, &request(90.0, 5)).await;
        assert!(status.success, "{:?}", status);

        // Readings 0, 30, 60 tick; 90 meets the target and ends the loop
        assert_eq!(rig.gyro_reads(), 4);
        assert_eq!(rig.command_count(Port::A, MotorCommand::Run), 3);
        assert_eq!(rig.command_count(Port::D, MotorCommand::Run), 3);
        assert!(!rig.is_running(Port::A));
        assert!(!rig.is_running(Port::D));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_power_shaped_and_mirrored() {
        let rig = SimRig::differential();
        rig.script_gyro([0.0, 88.0, 91.0]);
        let leases = PortLeases::default();
        let config = ControlConfig::default();
        let ctx = ControlContext {
            resolver: &rig,
            sensors: &rig,
            leases: &leases,
            config: &config,
        };

        assert!(rotate_with_gyro(ctx, &request(90.0, 5)).await.success);
        // tick 1: error=-90, turn = 0.125*-90 + 0.5*-90 = -56.25, raw = -5 - 56.25 -> boosted, capped at -50
        // tick 2: error=-2, turn = -0.25 + 0.5*88 = 43.75, raw = 38.75, not boosted
        assert_eq!(rig.speed_history(Port::A), vec![-50, 38]);
        assert_eq!(rig.speed_history(Port::D), vec![50, -38]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_target() {
        let rig = SimRig::differential();
        rig.script_gyro([-10.0, -44.0, -45.0]);
        let leases = PortLeases::default();
        let config = ControlConfig::default();
        let ctx = ControlContext {
            resolver: &rig,
            sensors: &rig,
            leases: &leases,
            config: &config,
        };

        assert!(rotate_with_gyro(ctx, &request(-45.0, 5)).await.success);
        assert_eq!(rig.command_count(Port::A, MotorCommand::Run), 2);
        // Positive base speed turns clockwise
        assert!(rig.speed_history(Port::A)[0] > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_failure_stops_rotation() {
        let rig = SimRig::differential();
        rig.set_gyro_failing(true);
        let leases = PortLeases::default();
        let config = ControlConfig::default();
        let ctx = ControlContext {
            resolver: &rig,
            sensors: &rig,
            leases: &leases,
            config: &config,
        };

        let status = rotate_with_gyro(ctx, &request(90.0, 5)).await;
        assert!(!status.success);
        assert_eq!(rig.command_count(Port::A, MotorCommand::Run), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_runs_to_terminated() {
        let rig = SimRig::differential();
        rig.script_gyro([0.0, 95.0]);
        let leases = PortLeases::default();
        let config = ControlConfig::default();
        let ctx = ControlContext {
            resolver: &rig,
            sensors: &rig,
            leases: &leases,
            config: &config,
        };

        let group = ctx.acquire(&request(90.0, 5).motors).unwrap();
        let mut rotation = RotateController::new(ctx, group, &request(90.0, 5)).unwrap();
        assert_eq!(rotation.state(), RotateState::Idle);
        let outcome = rotation.run().await;
        assert_eq!(rotation.state(), RotateState::Running);
        assert!(rotation.finish(outcome).await.success);
        assert!(!leases.is_held(Port::A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extreme_speed_does_not_overflow() {
        let rig = SimRig::differential();
        rig.script_gyro([0.0, 90.0]);
        let leases = PortLeases::default();
        let config = ControlConfig::default();
        let ctx = ControlContext {
            resolver: &rig,
            sensors: &rig,
            leases: &leases,
            config: &config,
        };

        assert!(rotate_with_gyro(ctx, &request(90.0, i32::MIN)).await.success);
        // Base speed saturates, shaping still caps the power
        assert_eq!(rig.speed_history(Port::A), vec![config.shaping.cap]);
        assert_eq!(rig.speed_history(Port::D), vec![-config.shaping.cap]);

        assert!(rotate(ctx, &request(90.0, i32::MIN)).await.unwrap().success);
        assert_eq!(rig.speed_history(Port::A).last(), Some(&i32::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gyro_held_while_rotating() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let config = ControlConfig::default();
        let ctx = ControlContext {
            resolver: &rig,
            sensors: &rig,
            leases: &leases,
            config: &config,
        };

        let _gyro = ctx.acquire_gyro().unwrap();
        let status = rotate_with_gyro(ctx, &request(90.0, 5)).await;
        assert!(!status.success);
        assert!(rig.gyro_modes().is_empty());
        assert!(!leases.is_held(Port::A));

        // Static rotation never reads the gyro and does not need it
        assert!(rotate(ctx, &request(90.0, 150)).await.unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_rotate_uses_geometry() {
        let rig = SimRig::differential();
        let leases = PortLeases::default();
        let config = ControlConfig::default();
        let ctx = ControlContext {
            resolver: &rig,
            sensors: &rig,
            leases: &leases,
            config: &config,
        };

        let status = rotate(ctx, &request(90.0, 150)).await.unwrap();
        assert!(status.success);
        let expected = turn_wheel_rotation(90.0, &config.geometry);
        assert!(expected > 0);
        // Positive target: direction -1, A has sign +1 and D sign -1
        assert_eq!(rig.position_setpoint(Port::A), Some(-expected));
        assert_eq!(rig.position_setpoint(Port::D), Some(expected));
        assert_eq!(rig.gyro_reads(), 0);
    }
}
