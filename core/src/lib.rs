//! A crate to run card simulator processes and expose them as smart card readers.
//!
//! A [`SimulationManager`] launches simulator processes as [`SimulationRunner`]s.
//! A [`SimulatorCardReaderController`] turns running simulations into card readers,
//! and a [`SimulatorCardChannel`] exchanges TLV-framed APDUs with the simulated card.
//!
//! ## Usage
//! ```rust,no_run
//! use std::sync::{mpsc, Arc};
//! use std::time::Duration;
//!
//! use cardsim::reader::SimulatorCardReaderControllerDelegate;
//! use cardsim::simulation::{config, JavaArtifact, SimulationManager};
//! use cardsim::{SimulatorCardReader, SimulatorCardReaderController};
//!
//! struct Connected(mpsc::Sender<Arc<SimulatorCardReader>>);
//!
//! impl SimulatorCardReaderControllerDelegate for Connected {
//!     fn on_connect(&self, _: &SimulatorCardReaderController, reader: &Arc<SimulatorCardReader>) {
//!         let _ = self.0.send(Arc::clone(reader));
//!     }
//!
//!     fn on_disconnect(&self, _: &SimulatorCardReaderController, _: &Arc<SimulatorCardReader>) {}
//! }
//!
//! let manager = SimulationManager::temporary().unwrap();
//! let controller = SimulatorCardReaderController::new(&manager);
//! let (sender, readers) = mpsc::channel();
//! let connected: Arc<dyn SimulatorCardReaderControllerDelegate> = Arc::new(Connected(sender));
//! controller.add(&connected);
//!
//! let runner = manager
//!     .create_simulation(
//!         "configuration.toml",
//!         vec![Box::new(config::tlv_port(0))],
//!         &JavaArtifact::new("simulator/dependency"),
//!     )
//!     .unwrap();
//! runner.start(true).unwrap();
//!
//! // Readers are announced on the manager's notification thread.
//! let reader = readers.recv_timeout(Duration::from_secs(5)).unwrap();
//! let card = reader.connect().unwrap();
//! let mut channel = card.open_basic_channel().unwrap();
//! let response = channel
//!     .transmit(&[0x00, 0xA4, 0x04, 0x00], Duration::ZERO, Duration::from_secs(5))
//!     .unwrap();
//!
//! manager.stop_all(true).unwrap();
//! manager.clean();
//! ```

#[cfg(not(feature = "tracing"))]
macro_rules! debug {
    ($($t: tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! info {
    ($($t: tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn {
    ($($t: tt)*) => {};
}

pub mod card;
pub mod error;
pub mod future;
pub mod process;
pub mod provider;
pub mod reader;
pub mod registry;
pub mod simulation;
pub mod sync;
pub mod tlv;

pub use card::{ResponseApdu, SimulatorCard, SimulatorCardChannel};
pub use error::{Error, Result};
pub use future::{Future, FutureEvent, Promise};
pub use reader::{SimulatorCardReader, SimulatorCardReaderController};
pub use simulation::{SimulationManager, SimulationMode, SimulationRunner};
