// Robot service: one async method per request kind
//
// Owns the hardware boundary, the port leases and the control configuration.
// Cheap to clone; every clone shares the same leases, so concurrent requests
// for the same motor are refused rather than interleaved.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::{ControlConfig, STREAM_IDLE_TIMEOUT};
use crate::control::coordinator::{PortLeases, PortSigns, Setpoint};
use crate::control::{drive, rotate, session, ControlContext, ControlError};
use crate::hardware::{ActuatorResolver, MotorCommand, SensorReader};
use crate::messages::{DriveUpdate, MotorSpec, Reply, Request, StatusResult};

#[derive(Clone)]
pub struct Robot {
    resolver: Arc<dyn ActuatorResolver>,
    sensors: Arc<dyn SensorReader>,
    leases: PortLeases,
    config: Arc<ControlConfig>,
}

impl Robot {
    pub fn new(
        resolver: Arc<dyn ActuatorResolver>,
        sensors: Arc<dyn SensorReader>,
        config: ControlConfig,
    ) -> Self {
        Self {
            resolver,
            sensors,
            leases: PortLeases::default(),
            config: Arc::new(config),
        }
    }

    pub fn context(&self) -> ControlContext<'_> {
        ControlContext {
            resolver: self.resolver.as_ref(),
            sensors: self.sensors.as_ref(),
            leases: &self.leases,
            config: &self.config,
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Serve one request to completion
    pub async fn handle(&self, request: Request) -> Reply {
        let name = request.name();
        info!("Handling {}", name);
        let ctx = self.context();
        let status = match request {
            Request::RunMotor { motor } => self.run_motors(&[motor]).await,
            Request::StopMotor { motor } => self.stop_motors(&[motor]).await,
            Request::RunMotors { motors } => self.run_motors(&motors).await,
            Request::StopMotors { motors } => self.stop_motors(&motors).await,
            Request::Drive(request) => drive::drive(ctx, &request).await.into(),
            Request::DriveWithGyro(request) => drive::drive_with_gyro(ctx, &request).await,
            Request::Rotate(request) => rotate::rotate(ctx, &request).await.into(),
            Request::RotateWithGyro(request) => rotate::rotate_with_gyro(ctx, &request).await,
            Request::CollectRelease { motors } => self.collect_release(&motors).await,
            Request::ReleaseOneBall { motors } => self.release_one_ball(&motors).await,
            Request::RecalibrateGyro => self.recalibrate_gyro().await,
            Request::Distance => return self.distance(),
        };
        if !status.success {
            warn!("{} failed: {}", name, status.message);
        }
        Reply::Status(status)
    }

    /// Run each motor forever at its requested speed
    pub async fn run_motors(&self, motors: &[MotorSpec]) -> StatusResult {
        let result: Result<_, ControlError> = async {
            let mut group = self.context().acquire(motors)?;
            group
                .apply(MotorCommand::Run, |spec| Setpoint::speed(spec.speed))
                .await?;
            group.release();
            Ok(StatusResult::ok(format!("running {} motors", motors.len())))
        }
        .await;
        result.into()
    }

    /// Zero the speed setpoints and stop, waiting (bounded) for each motor to halt
    pub async fn stop_motors(&self, motors: &[MotorSpec]) -> StatusResult {
        let result: Result<_, ControlError> = async {
            let mut group = self.context().acquire(motors)?;
            group.apply(MotorCommand::Stop, |_| Setpoint::speed(0)).await?;
            group.stop_all().await?;
            Ok(StatusResult::ok(format!("stopped {} motors", motors.len())))
        }
        .await;
        result.into()
    }

    /// Run the collector pair; the sign table mirrors the two sides
    pub async fn collect_release(&self, motors: &[MotorSpec]) -> StatusResult {
        let result: Result<_, ControlError> = async {
            let signs = PortSigns::for_motors(&self.config.collect_signs, motors)?;
            let mut group = self.context().acquire(motors)?;
            group
                .apply(MotorCommand::Run, |spec| {
                    Setpoint::speed(signs.sign(spec.port).saturating_mul(spec.speed))
                })
                .await?;
            group.release();
            Ok(StatusResult::ok("collector running"))
        }
        .await;
        result.into()
    }

    /// Start the release motors one after the other, hold, then stop them all
    pub async fn release_one_ball(&self, motors: &[MotorSpec]) -> StatusResult {
        let timing = self.config.timing;
        let result: Result<_, ControlError> = async {
            let signs = PortSigns::for_motors(&self.config.collect_signs, motors)?;
            let mut group = self.context().acquire(motors)?;
            group
                .apply_staggered(
                    MotorCommand::Run,
                    |spec| Setpoint::speed(signs.sign(spec.port).saturating_mul(spec.speed)),
                    timing.release_stagger,
                )
                .await?;
            sleep(timing.release_hold).await;
            group.stop_all().await?;
            Ok(StatusResult::ok("released one ball"))
        }
        .await;
        result.into()
    }

    /// Recalibrate outside a session; refused while a gyro session is running
    pub async fn recalibrate_gyro(&self) -> StatusResult {
        let ctx = self.context();
        let result: Result<_, ControlError> = async {
            let _gyro = ctx.acquire_gyro()?;
            ctx.recalibrate_gyro().await?;
            Ok(StatusResult::ok("gyro recalibrated"))
        }
        .await;
        result.into()
    }

    pub fn distance(&self) -> Reply {
        match self.context().read_distance_cm() {
            Ok(distance_cm) => Reply::Distance {
                success: true,
                distance_cm,
            },
            Err(e) => Reply::Status(StatusResult::failure(&e)),
        }
    }

    /// Run a streamed drive session fed by `updates`
    pub async fn drive_stream(&self, updates: mpsc::Receiver<DriveUpdate>) -> StatusResult {
        session::run_drive_stream(self.context(), updates, Some(STREAM_IDLE_TIMEOUT)).await
    }
}
