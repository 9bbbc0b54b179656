use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use cardsim::process::{ProcessConfig, JAVA_LAUNCH_PATH};
use cardsim::simulation::config::{self, Preprocessor};
use cardsim::simulation::{ArtifactResolver, CommandArtifact, JavaArtifact, SimulationManager};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Error occurred on running the simulation: {0}")]
    Simulation(#[from] cardsim::Error),

    #[error("Could not serialize the simulation mode: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Launches a card simulator with a configuration file and keeps it running.
#[derive(Parser, Debug)]
#[command(name = "cardsim", version)]
struct Args {
    /// Simulator configuration file
    config_file: PathBuf,

    /// Directory holding the class path of the Java simulator
    #[arg(long, conflicts_with = "program")]
    class_path: Option<PathBuf>,

    /// Java executable launching the simulator
    #[arg(long, default_value = JAVA_LAUNCH_PATH)]
    java: PathBuf,

    /// Program to run as simulator instead of the Java one
    #[arg(long)]
    program: Option<PathBuf>,

    /// Arguments passed to the program before the configuration file
    #[arg(long = "arg", requires = "program", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Port of the TLV interface, 0 to pick an unused one
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Seconds to keep the simulation running, 0 to wait until it terminates
    #[arg(short, long, default_value_t = 2)]
    wait: u64,
}

impl Args {
    fn resolver(&self) -> Box<dyn ArtifactResolver> {
        match (&self.program, &self.class_path) {
            (Some(program), _) => Box::new(CommandArtifact::new(
                ProcessConfig::new(program).args(&self.args),
            )),
            (None, Some(class_path)) => {
                Box::new(JavaArtifact::new(class_path).launch_path(&self.java))
            }
            (None, None) => Box::new(JavaArtifact::new("dependency").launch_path(&self.java)),
        }
    }

    fn preprocessors(&self) -> Vec<Box<dyn Preprocessor>> {
        vec![
            Box::new(config::tlv_port(self.port)),
            Box::new(config::relative_to_config(config::CARD_IMAGE_FILE_PATH)),
            Box::new(config::relative_to_config(config::CHANNEL_CONTEXT_FILE_PATH)),
        ]
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    debug!("{:?}", args);

    let manager = SimulationManager::temporary()?;
    let runner = manager.create_simulation(
        &args.config_file,
        args.preprocessors(),
        args.resolver().as_ref(),
    )?;
    runner.start(true)?;

    println!("{}", serde_json::to_string(&runner.mode())?);

    if args.wait == 0 {
        info!("Waiting for {} to terminate", runner);
        runner.on_terminated().wait();
    } else {
        thread::sleep(Duration::from_secs(args.wait));
    }

    manager.stop_all(true)?;
    manager.clean();

    println!("{}", serde_json::to_string(&runner.mode())?);

    Ok(())
}
