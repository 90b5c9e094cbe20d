// Streamed drive sessions
//
// A client streams DriveUpdates; each update moves the remaining distance.
// The session runs one drive tick per update while the distance is positive,
// and finalizes (stop-all, one status) when the distance runs out, the client
// closes the stream, or no update arrives within the idle timeout.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use super::drive::DriveController;
use super::{ControlContext, ControlError};
use crate::messages::{DriveUpdate, StatusResult};

fn stream_ended(reason: &str) -> Option<DriveUpdate> {
    info!("Drive stream ended: {}", reason);
    None
}

async fn next_update(
    updates: &mut mpsc::Receiver<DriveUpdate>,
    idle_timeout: Option<Duration>,
) -> Option<DriveUpdate> {
    let received = match idle_timeout {
        Some(limit) => match timeout(limit, updates.recv()).await {
            Ok(received) => received,
            Err(_) => {
                warn!("No drive update within {}ms", limit.as_millis());
                return stream_ended("idle timeout");
            }
        },
        None => updates.recv().await,
    };
    match received {
        Some(update) if update.close => stream_ended("closed by client"),
        Some(update) => Some(update),
        None => stream_ended("sender dropped"),
    }
}

/// Run one streamed drive session to completion.
///
/// Exactly one tick's motor commands are in flight at a time: the next update
/// is only read once the current tick has been applied and verified.
pub async fn run_drive_stream(
    ctx: ControlContext<'_>,
    mut updates: mpsc::Receiver<DriveUpdate>,
    idle_timeout: Option<Duration>,
) -> StatusResult {
    let Some(first) = next_update(&mut updates, idle_timeout).await else {
        return StatusResult::failure(&ControlError::StreamTerminated(
            "stream closed before the first update".to_string(),
        ));
    };

    let group = match ctx.acquire(&first.motors) {
        Ok(group) => group,
        Err(e) => return StatusResult::failure(&e),
    };
    let mut drive = match DriveController::new(ctx, group, first.speed, &first.gains) {
        Ok(drive) => drive,
        Err(e) => return StatusResult::failure(&e),
    };

    let outcome = stream_ticks(&ctx, &mut drive, first.distance, &mut updates, idle_timeout).await;
    drive.finish(outcome).await
}

async fn stream_ticks(
    ctx: &ControlContext<'_>,
    drive: &mut DriveController<'_>,
    mut distance: f64,
    updates: &mut mpsc::Receiver<DriveUpdate>,
    idle_timeout: Option<Duration>,
) -> Result<StatusResult, ControlError> {
    ctx.recalibrate_gyro().await?;

    while distance > 0.0 {
        drive.tick().await?;
        match next_update(updates, idle_timeout).await {
            Some(update) => {
                distance = update.distance;
                if update.speed != 0 {
                    drive.set_speed(update.speed);
                }
            }
            None => break,
        }
    }

    Ok(StatusResult::ok(format!(
        "drive stream finished after {} ticks, {}cm remaining",
        drive.ticks(),
        distance.max(0.0)
    )))
}
