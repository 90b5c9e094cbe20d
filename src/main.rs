use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use diffbot_runtime::config::{ControlConfig, KEY_DRIVE_STREAM, KEY_RPC};
use diffbot_runtime::hardware::sim::SimRig;
use diffbot_runtime::hardware::{ActuatorResolver, SensorReader};
use diffbot_runtime::robot::Robot;
use diffbot_runtime::runtime::{self, Keys};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Hardware = (Arc<dyn ActuatorResolver>, Arc<dyn SensorReader>);

// Heading change per gyro read per unit of wheel speed difference in simulation
const SIM_YAW_RATE: f64 = 0.002;

#[derive(Parser, Debug)]
#[command(about = "Gyro-corrected motor control runtime for a differential-drive robot")]
struct Args {
    /// JSON control config; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against simulated motors and sensors
    #[arg(long)]
    simulate: bool,

    #[arg(long, default_value = KEY_RPC)]
    rpc_key: String,

    #[arg(long, default_value = KEY_DRIVE_STREAM)]
    stream_key: String,
}

#[cfg(feature = "ev3")]
fn brick_hardware() -> Result<Hardware, BoxError> {
    use diffbot_runtime::hardware::ev3::{Ev3Resolver, Ev3Sensors};
    Ok((Arc::new(Ev3Resolver), Arc::new(Ev3Sensors)))
}

#[cfg(not(feature = "ev3"))]
fn brick_hardware() -> Result<Hardware, BoxError> {
    Err("built without the `ev3` feature, run with --simulate".into())
}

async fn start(args: Args) -> Result<(), BoxError> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading control config from {}", path.display());
            ControlConfig::from_file(path)?
        }
        None => ControlConfig::default(),
    };

    let (resolver, sensors) = if args.simulate {
        info!("Using simulated hardware");
        let rig = SimRig::differential().with_yaw_rate(SIM_YAW_RATE);
        (Arc::new(rig.clone()) as Arc<dyn ActuatorResolver>, Arc::new(rig) as Arc<dyn SensorReader>)
    } else {
        brick_hardware()?
    };

    let robot = Robot::new(resolver, sensors, config);
    let keys = Keys {
        rpc: args.rpc_key,
        drive_stream: args.stream_key,
    };
    runtime::run(robot, keys).await
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    if let Err(e) = start(Args::parse()).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
