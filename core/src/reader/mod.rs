//! Card readers backed by running simulations.
//!
//! ## Usage
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cardsim::reader::{SimulatorCardReaderController, SimulatorCardReaderControllerDelegate};
//! use cardsim::{SimulationManager, SimulatorCardReader};
//!
//! struct Log;
//!
//! impl SimulatorCardReaderControllerDelegate for Log {
//!     fn on_connect(&self, _: &SimulatorCardReaderController, reader: &Arc<SimulatorCardReader>) {
//!         println!("+ {}", reader.name());
//!     }
//!
//!     fn on_disconnect(&self, _: &SimulatorCardReaderController, reader: &Arc<SimulatorCardReader>) {
//!         println!("- {}", reader.name());
//!     }
//! }
//!
//! let manager = SimulationManager::temporary().unwrap();
//! let controller = SimulatorCardReaderController::new(&manager);
//! let log: Arc<dyn SimulatorCardReaderControllerDelegate> = Arc::new(Log);
//! controller.add(&log);
//! ```

mod card_reader;
mod controller;

pub use self::card_reader::SimulatorCardReader;
pub use self::controller::{SimulatorCardReaderController, SimulatorCardReaderControllerDelegate};

/// Name of the controller and prefix of the reader names.
pub const READER_PREFIX: &str = "cardsim";

/// Host the simulators listen on.
pub const DEFAULT_HOST: &str = "localhost";
