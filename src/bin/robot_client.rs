// Command-line client: one subcommand per request, plus a streamed drive.
//
// Stream controls (--interactive): +/- add or remove distance, Q closes the stream.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tracing::{info, warn};
use zenoh::Session;

use diffbot_runtime::config::{KEY_DRIVE_STREAM, KEY_RPC, STATUS_SUFFIX};
use diffbot_runtime::messages::{
    DriveRequest, DriveUpdate, GainOverrides, MotorClass, MotorSpec, Port, Reply, Request, RotateRequest,
    StatusResult,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const QUERY_TIMEOUT: Duration = Duration::from_secs(60); // a gyro drive takes ~10s
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const TAPER_DISTANCE: f64 = 20.0; // cm left when the streamed speed starts to drop
const MIN_STREAM_SPEED: i32 = 50;
const RELEASE_SPEEDS: (i32, i32) = (300, 1200); // B, C

#[derive(Parser, Debug)]
#[command(about = "Send commands to the diffbot runtime")]
struct Cli {
    #[arg(long, default_value = KEY_RPC)]
    rpc_key: String,

    #[arg(long, default_value = KEY_DRIVE_STREAM)]
    stream_key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one motor forever, e.g. `run-motor A:large:300`
    RunMotor {
        #[arg(value_parser = parse_motor)]
        motor: MotorSpec,
    },
    StopMotor {
        #[arg(value_parser = parse_motor)]
        motor: MotorSpec,
    },
    RunMotors {
        #[arg(value_parser = parse_motor, required = true)]
        motors: Vec<MotorSpec>,
    },
    StopMotors {
        #[arg(value_parser = parse_motor, required = true)]
        motors: Vec<MotorSpec>,
    },
    /// Drive straight; distance in cm, negative backs up
    Drive {
        #[arg(allow_negative_numbers = true)]
        distance: f64,
        #[command(flatten)]
        motion: MotionArgs,
    },
    /// Turn in place; positive degrees turn counter-clockwise
    Rotate {
        #[arg(allow_negative_numbers = true)]
        degrees: f64,
        #[command(flatten)]
        motion: MotionArgs,
    },
    /// Run the collector pair (B, C)
    Collect {
        #[arg(long, default_value_t = 1200, allow_negative_numbers = true)]
        speed: i32,
    },
    ReleaseBall,
    RecalibrateGyro,
    /// Read the ultrasonic distance in cm
    Distance,
    /// Drive with a stream of updates, counting the distance down each interval
    Stream {
        distance: f64,
        #[arg(long, default_value_t = 200)]
        speed: i32,
        /// cm removed from the remaining distance per update
        #[arg(long, default_value_t = 5.0)]
        step: f64,
        #[arg(long, default_value_t = 400)]
        interval_ms: u64,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        interactive: bool,
        #[command(flatten)]
        gains: GainArgs,
    },
}

#[derive(Args, Debug)]
struct MotionArgs {
    #[arg(long, default_value_t = 200, allow_negative_numbers = true)]
    speed: i32,
    /// Correct with the gyro instead of running to a fixed position
    #[arg(long)]
    gyro: bool,
    #[command(flatten)]
    gains: GainArgs,
}

#[derive(Args, Debug, Clone, Copy)]
struct GainArgs {
    #[arg(long)]
    kp: Option<f64>,
    #[arg(long)]
    ki: Option<f64>,
    #[arg(long)]
    kd: Option<f64>,
}

impl From<GainArgs> for GainOverrides {
    fn from(args: GainArgs) -> Self {
        GainOverrides {
            kp: args.kp,
            ki: args.ki,
            kd: args.kd,
        }
    }
}

/// `PORT[:CLASS[:SPEED]]`, class defaults to large
fn parse_motor(s: &str) -> Result<MotorSpec, String> {
    let mut parts = s.split(':');
    let port = match parts.next().map(str::to_ascii_uppercase).as_deref() {
        Some("A") => Port::A,
        Some("B") => Port::B,
        Some("C") => Port::C,
        Some("D") => Port::D,
        _ => return Err(format!("bad port in '{}', expected A-D", s)),
    };
    let class = match parts.next() {
        None | Some("large") => MotorClass::Large,
        Some("medium") => MotorClass::Medium,
        Some(other) => return Err(format!("bad motor class '{}'", other)),
    };
    let speed = match parts.next() {
        None => 0,
        Some(speed) => speed.parse().map_err(|e| format!("bad speed '{}': {}", speed, e))?,
    };
    if parts.next().is_some() {
        return Err(format!("too many fields in '{}'", s));
    }
    Ok(MotorSpec::new(port, class, speed))
}

fn wheels(speed: i32) -> Vec<MotorSpec> {
    vec![MotorSpec::large(Port::A, speed), MotorSpec::large(Port::D, speed)]
}

fn collector(b_speed: i32, c_speed: i32) -> Vec<MotorSpec> {
    vec![MotorSpec::medium(Port::B, b_speed), MotorSpec::medium(Port::C, c_speed)]
}

fn request_for(command: Command) -> Option<Request> {
    let request = match command {
        Command::RunMotor { motor } => Request::RunMotor { motor },
        Command::StopMotor { motor } => Request::StopMotor { motor },
        Command::RunMotors { motors } => Request::RunMotors { motors },
        Command::StopMotors { motors } => Request::StopMotors { motors },
        Command::Drive { distance, motion } => {
            let drive = DriveRequest {
                motors: wheels(motion.speed),
                distance,
                speed: motion.speed,
                gains: motion.gains.into(),
            };
            if motion.gyro {
                Request::DriveWithGyro(drive)
            } else {
                Request::Drive(drive)
            }
        }
        Command::Rotate { degrees, motion } => {
            let rotate = RotateRequest {
                motors: wheels(motion.speed),
                degrees,
                speed: motion.speed,
                gains: motion.gains.into(),
            };
            if motion.gyro {
                Request::RotateWithGyro(rotate)
            } else {
                Request::Rotate(rotate)
            }
        }
        Command::Collect { speed } => Request::CollectRelease {
            motors: collector(speed, speed),
        },
        Command::ReleaseBall => Request::ReleaseOneBall {
            motors: collector(RELEASE_SPEEDS.0, RELEASE_SPEEDS.1),
        },
        Command::RecalibrateGyro => Request::RecalibrateGyro,
        Command::Distance => Request::Distance,
        Command::Stream { .. } => return None,
    };
    Some(request)
}

async fn call(session: &Session, key: &str, request: &Request) -> Result<Reply, BoxError> {
    let payload = serde_json::to_string(request)?;
    info!("Sending {} to {}", request.name(), key);
    let replies = session.get(key).payload(payload).timeout(QUERY_TIMEOUT).await?;

    while let Ok(reply) = replies.recv_async().await {
        match reply.result() {
            Ok(sample) => {
                let bytes = sample.payload().to_bytes();
                return Ok(serde_json::from_slice(&bytes)?);
            }
            Err(e) => warn!("Error reply: {:?}", e),
        }
    }
    Err(format!("no reply on {}", key).into())
}

/// Speed for the next update: full speed until the last TAPER_DISTANCE cm,
/// then proportional to what is left, never below MIN_STREAM_SPEED
fn tapered_speed(speed: i32, remaining: f64) -> i32 {
    if remaining >= TAPER_DISTANCE {
        return speed;
    }
    let scaled = (speed as f64 * remaining.max(0.0) / TAPER_DISTANCE) as i32;
    let floor = MIN_STREAM_SPEED.min(speed.abs());
    if scaled.abs() < floor {
        floor * speed.signum()
    } else {
        scaled
    }
}

struct StreamPlan {
    distance: f64,
    speed: i32,
    step: f64,
    interval: Duration,
    interactive: bool,
    gains: GainOverrides,
}

fn stream_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{}-{}", std::process::id(), millis)
}

async fn run_stream(
    session: &Session,
    stream_key: &str,
    id: &str,
    plan: StreamPlan,
) -> Result<Option<StatusResult>, BoxError> {
    let publisher = session.declare_publisher(format!("{}/{}", stream_key, id)).await?;
    let status = session
        .declare_subscriber(format!("{}/{}/{}", stream_key, id, STATUS_SUFFIX))
        .await?;

    let opening = DriveUpdate {
        distance: plan.distance,
        speed: plan.speed,
        motors: wheels(plan.speed),
        gains: plan.gains,
        close: false,
    };
    publisher.put(serde_json::to_string(&opening)?).await?;
    info!("Stream {} opened: {}cm at {}", id, plan.distance, plan.speed);

    let mut remaining = plan.distance;
    loop {
        let mut close = false;
        if plan.interactive {
            // Keys are read for one interval, then the update goes out
            if event::poll(plan.interval)? {
                if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                    let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                    match code {
                        KeyCode::Char('+') if pressed => remaining += plan.step,
                        KeyCode::Char('-') if pressed => remaining -= plan.step,
                        KeyCode::Char('q') | KeyCode::Esc if pressed => close = true,
                        _ => {}
                    }
                }
            }
        } else {
            tokio::time::sleep(plan.interval).await;
            remaining -= plan.step;
        }

        if let Some(sample) = status.try_recv()? {
            let bytes = sample.payload().to_bytes();
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }

        let update = DriveUpdate {
            distance: remaining,
            speed: tapered_speed(plan.speed, remaining),
            close,
            ..DriveUpdate::default()
        };
        publisher.put(serde_json::to_string(&update)?).await?;
        info!("Stream {}: {:.1}cm left, speed {}", id, remaining, update.speed);

        if close || remaining <= 0.0 {
            break;
        }
    }

    match tokio::time::timeout(STATUS_TIMEOUT, status.recv_async()).await {
        Ok(Ok(sample)) => {
            let bytes = sample.payload().to_bytes();
            Ok(Some(serde_json::from_slice(&bytes)?))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    match cli.command {
        Command::Stream {
            distance,
            speed,
            step,
            interval_ms,
            id,
            interactive,
            gains,
        } => {
            let id = id.unwrap_or_else(stream_id);
            let plan = StreamPlan {
                distance,
                speed,
                step,
                interval: Duration::from_millis(interval_ms),
                interactive,
                gains: gains.into(),
            };

            if interactive {
                info!("Controls: +/- distance, Q=close");
                enable_raw_mode()?;
            }
            let result = run_stream(&session, &cli.stream_key, &id, plan).await;
            if interactive {
                disable_raw_mode()?;
            }

            match result? {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                None => warn!("No final status from stream {}", id),
            }
        }
        command => {
            let Some(request) = request_for(command) else {
                return Ok(());
            };
            let reply = call(&session, &cli.rpc_key, &request).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            if !reply.success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
