//! Simulation lifecycle: launching simulator processes and tracking their mode.
//!
//! ## Usage
//! ```rust,no_run
//! use cardsim::simulation::{config, JavaArtifact, SimulationManager};
//!
//! let manager = SimulationManager::temporary().unwrap();
//! let runner = manager
//!     .create_simulation(
//!         "configuration.toml",
//!         vec![
//!             Box::new(config::tlv_port(0)),
//!             Box::new(config::relative_to_config(config::CARD_IMAGE_FILE_PATH)),
//!         ],
//!         &JavaArtifact::new("simulator/dependency"),
//!     )
//!     .unwrap();
//!
//! runner.start(true).unwrap();
//! println!("{}", runner.mode());
//! manager.stop(&runner, true).unwrap();
//! ```

pub mod artifact;
pub mod config;
mod manager;
mod mode;
mod runner;

pub use self::artifact::{Artifact, ArtifactResolver, CommandArtifact, JavaArtifact, ScriptResolver};
pub use self::manager::{SimulationManager, SimulationManagerDelegate};
pub use self::mode::SimulationMode;
pub use self::runner::{
    SimulationRunner, SimulationRunnerDelegate, DEFAULT_TLV_PORT, STARTED_LINE,
};
