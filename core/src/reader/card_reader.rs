use std::fmt::{self, Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::card::SimulatorCard;
use crate::simulation::{SimulationMode, SimulationRunner};
use crate::{Error, Result};

use super::READER_PREFIX;

type PresenceCallback = Arc<dyn Fn(&SimulatorCardReader) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Presence {
    observed: bool,
    callback: Option<PresenceCallback>,
}

/// A card reader backed by one simulation.
///
/// Its state is read through from the runner's mode: the card is present exactly
/// while the simulation is running.
pub struct SimulatorCardReader {
    runner: SimulationRunner,
    host: String,
    presence: Mutex<Presence>,
}

impl SimulatorCardReader {
    pub(crate) fn new<H: Into<String>>(runner: SimulationRunner, host: H) -> Self {
        let observed = runner.mode().is_running();

        Self {
            runner,
            host: host.into(),
            presence: Mutex::new(Presence {
                observed,
                callback: None,
            }),
        }
    }

    /// `cardsim-<host>-<port>`, with `?` for the port until the simulation runs
    /// and `x` once it has terminated.
    pub fn name(&self) -> String {
        let suffix = match self.mode() {
            SimulationMode::Running { tlv_port } => tlv_port.to_string(),
            SimulationMode::Terminated { .. } => "x".to_string(),
            SimulationMode::NotStarted | SimulationMode::Initializing => "?".to_string(),
        };

        format!("{}-{}-{}", READER_PREFIX, self.host, suffix)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn card_present(&self) -> bool {
        self.mode().is_running()
    }

    pub fn mode(&self) -> SimulationMode {
        self.runner.mode()
    }

    pub fn runner(&self) -> &SimulationRunner {
        &self.runner
    }

    /// Sets the callback invoked when the card presence changes, replacing the previous one.
    ///
    /// The callback is invoked right away when a card is present.
    pub fn on_card_presence_changed<F>(&self, callback: F)
    where
        F: Fn(&SimulatorCardReader) + Send + Sync + 'static,
    {
        let callback: PresenceCallback = Arc::new(callback);
        let present = self.card_present();
        {
            let mut presence = lock(&self.presence);
            presence.observed = present;
            presence.callback = Some(Arc::clone(&callback));
        }

        if present {
            callback(self);
        }
    }

    /// Compares the card presence with the last observed one, invoking the callback on a change.
    pub fn refresh(&self) {
        let present = self.card_present();
        let callback = {
            let mut presence = lock(&self.presence);
            if presence.observed == present {
                return;
            }

            presence.observed = present;
            presence.callback.clone()
        };

        debug!("{}: card present = {}", self.name(), present);
        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// Creates a card talking to the running simulation.
    pub fn connect(&self) -> Result<SimulatorCard> {
        let port = self.mode().tlv_port().ok_or(Error::NotRunning)?;

        Ok(SimulatorCard::new(self.host.as_str(), port).bound_to(self.runner.clone()))
    }
}

impl Display for SimulatorCardReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SimulatorCardReader: {}", self.name())
    }
}

impl Debug for SimulatorCardReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatorCardReader")
            .field("runner", &self.runner)
            .field("host", &self.host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::process::ProcessConfig;

    #[test]
    fn test_not_started_reader() {
        let runner = SimulationRunner::new(ProcessConfig::new("simulator"));
        let reader = SimulatorCardReader::new(runner, "localhost");

        assert_eq!("cardsim-localhost-?", reader.name());
        assert!(!reader.card_present());
        assert!(matches!(reader.connect(), Err(Error::NotRunning)));
    }

    #[test]
    fn test_terminated_reader() {
        let runner = SimulationRunner::new(ProcessConfig::new("simulator"));
        runner.stop(false).unwrap();
        let reader = SimulatorCardReader::new(runner, "localhost");

        assert_eq!("cardsim-localhost-x", reader.name());
        assert_eq!("SimulatorCardReader: cardsim-localhost-x", reader.to_string());
        assert!(!reader.card_present());
    }

    #[test]
    fn test_presence_callback_ignores_repeated_absence() {
        let runner = SimulationRunner::new(ProcessConfig::new("simulator"));
        let reader = SimulatorCardReader::new(runner.clone(), "localhost");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        reader.on_card_presence_changed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        reader.refresh();
        assert_eq!(0, calls.load(Ordering::SeqCst));

        runner.stop(false).unwrap();
        reader.refresh();
        reader.refresh();

        assert_eq!(0, calls.load(Ordering::SeqCst));
    }
}
