use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(feature = "tracing")]
use tracing::{debug, info};

use crate::registry::DelegateRegistry;
use crate::simulation::{SimulationManager, SimulationManagerDelegate, SimulationRunner};

use super::{SimulatorCardReader, DEFAULT_HOST, READER_PREFIX};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observer of the readers appearing and disappearing on a controller.
pub trait SimulatorCardReaderControllerDelegate: Send + Sync {
    fn on_connect(
        &self,
        controller: &SimulatorCardReaderController,
        reader: &Arc<SimulatorCardReader>,
    );

    fn on_disconnect(
        &self,
        controller: &SimulatorCardReaderController,
        reader: &Arc<SimulatorCardReader>,
    );
}

/// Exposes every running simulation of a manager as a [`SimulatorCardReader`].
pub struct SimulatorCardReaderController {
    host: String,
    readers: Mutex<Vec<Arc<SimulatorCardReader>>>,
    delegates: DelegateRegistry<dyn SimulatorCardReaderControllerDelegate>,
    /// Held while notifying delegates, so a replay never interleaves with other events.
    delivery: Mutex<()>,
}

impl SimulatorCardReaderController {
    /// Creates a controller observing the manager.
    ///
    /// The manager holds the controller weakly, so it stops observing once the
    /// returned handle is dropped.
    pub fn new(manager: &SimulationManager) -> Arc<Self> {
        Self::with_host(manager, DEFAULT_HOST)
    }

    /// Like [`new`](Self::new), connecting readers to simulations on `host`.
    pub fn with_host<H: Into<String>>(manager: &SimulationManager, host: H) -> Arc<Self> {
        let controller = Arc::new(Self {
            host: host.into(),
            readers: Mutex::new(vec![]),
            delegates: DelegateRegistry::new(),
            delivery: Mutex::new(()),
        });

        let delegate: Arc<dyn SimulationManagerDelegate> = controller.clone();
        manager.register(&delegate);

        controller
    }

    pub fn name(&self) -> &'static str {
        READER_PREFIX
    }

    /// Readers of the simulations that are running.
    pub fn card_readers(&self) -> Vec<Arc<SimulatorCardReader>> {
        lock(&self.readers).clone()
    }

    /// Adds a delegate, held weakly, and tells it about every current reader.
    /// Adding a delegate twice has no effect.
    ///
    /// The replay is delivered before any later connect or disconnect, so delegates
    /// must not call `add` from their callbacks.
    pub fn add(&self, delegate: &Arc<dyn SimulatorCardReaderControllerDelegate>) {
        let _delivery = lock(&self.delivery);
        let readers = {
            let readers = lock(&self.readers);
            if !self.delegates.register(delegate) {
                return;
            }
            readers.clone()
        };

        for reader in &readers {
            if !self.delegates.contains(delegate) {
                break;
            }
            delegate.on_connect(self, reader);
        }
    }

    pub fn remove(&self, delegate: &Arc<dyn SimulatorCardReaderControllerDelegate>) {
        self.delegates.deregister(delegate);
    }

    fn refresh(&self, ended: Option<&SimulatorCardReader>) {
        for reader in self.card_readers() {
            reader.refresh();
        }
        if let Some(reader) = ended {
            reader.refresh();
        }
    }
}

impl SimulationManagerDelegate for SimulatorCardReaderController {
    fn did_start(&self, runner: &SimulationRunner) {
        let reader = Arc::new(SimulatorCardReader::new(runner.clone(), self.host.as_str()));
        info!("Connected {}", reader);

        let delivery = lock(&self.delivery);
        let delegates: Vec<_> = {
            let mut readers = lock(&self.readers);
            readers.push(Arc::clone(&reader));
            self.delegates.snapshot()
        };

        for delegate in delegates {
            if self.delegates.contains(&delegate) {
                delegate.on_connect(self, &reader);
            }
        }
        drop(delivery);
        self.refresh(None);
    }

    fn did_end(&self, runner: &SimulationRunner) {
        let delivery = lock(&self.delivery);
        let removed = {
            let mut readers = lock(&self.readers);
            readers
                .iter()
                .position(|reader| SimulationRunner::ptr_eq(reader.runner(), runner))
                .map(|index| (readers.remove(index), self.delegates.snapshot()))
        };

        let Some((reader, delegates)) = removed else {
            debug!("No reader for {}", runner);
            drop(delivery);
            self.refresh(None);
            return;
        };

        info!("Disconnected {}", reader);
        for delegate in delegates {
            if self.delegates.contains(&delegate) {
                delegate.on_disconnect(self, &reader);
            }
        }
        drop(delivery);
        self.refresh(Some(&reader));
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::process::ProcessConfig;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SimulatorCardReaderControllerDelegate for Recorder {
        fn on_connect(&self, _: &SimulatorCardReaderController, reader: &Arc<SimulatorCardReader>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("connect #{}", reader.runner().id()));
        }

        fn on_disconnect(
            &self,
            _: &SimulatorCardReaderController,
            reader: &Arc<SimulatorCardReader>,
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("disconnect #{}", reader.runner().id()));
        }
    }

    fn controller() -> (SimulationManager, Arc<SimulatorCardReaderController>) {
        let manager = SimulationManager::temporary().unwrap();
        let controller = SimulatorCardReaderController::new(&manager);

        (manager, controller)
    }

    #[test]
    fn test_readers_follow_manager_events() {
        let (_manager, controller) = controller();
        let recorder = Arc::new(Recorder::default());
        let delegate: Arc<dyn SimulatorCardReaderControllerDelegate> = recorder.clone();
        controller.add(&delegate);
        let runner = SimulationRunner::new(ProcessConfig::new("simulator"));

        controller.did_start(&runner);
        assert_eq!(1, controller.card_readers().len());
        assert_eq!("cardsim", controller.name());

        controller.did_end(&runner);
        assert!(controller.card_readers().is_empty());

        let id = runner.id();
        assert_eq!(
            vec![format!("connect #{id}"), format!("disconnect #{id}")],
            *recorder.events.lock().unwrap()
        );
    }

    #[test]
    fn test_late_delegate_gets_current_readers() {
        let (_manager, controller) = controller();
        let first = SimulationRunner::new(ProcessConfig::new("simulator"));
        let second = SimulationRunner::new(ProcessConfig::new("simulator"));
        controller.did_start(&first);
        controller.did_start(&second);

        let recorder = Arc::new(Recorder::default());
        let delegate: Arc<dyn SimulatorCardReaderControllerDelegate> = recorder.clone();
        controller.add(&delegate);
        controller.add(&delegate);

        assert_eq!(
            vec![
                format!("connect #{}", first.id()),
                format!("connect #{}", second.id())
            ],
            *recorder.events.lock().unwrap()
        );
    }

    #[test]
    fn test_removed_delegate_is_not_notified() {
        let (_manager, controller) = controller();
        let recorder = Arc::new(Recorder::default());
        let delegate: Arc<dyn SimulatorCardReaderControllerDelegate> = recorder.clone();
        let runner = SimulationRunner::new(ProcessConfig::new("simulator"));

        controller.add(&delegate);
        controller.did_start(&runner);
        controller.remove(&delegate);
        controller.did_end(&runner);

        assert_eq!(1, recorder.events.lock().unwrap().len());
    }

    #[test]
    fn test_dropped_delegate_is_skipped() {
        let (_manager, controller) = controller();
        let delegate: Arc<dyn SimulatorCardReaderControllerDelegate> =
            Arc::new(Recorder::default());
        controller.add(&delegate);
        drop(delegate);

        controller.did_start(&SimulationRunner::new(ProcessConfig::new("simulator")));

        assert_eq!(1, controller.card_readers().len());
    }

    #[test]
    fn test_unknown_runner_end_is_ignored() {
        let (_manager, controller) = controller();
        let recorder = Arc::new(Recorder::default());
        let delegate: Arc<dyn SimulatorCardReaderControllerDelegate> = recorder.clone();
        controller.add(&delegate);

        controller.did_end(&SimulationRunner::new(ProcessConfig::new("simulator")));

        assert!(recorder.events.lock().unwrap().is_empty());
    }

    /// Ends a simulation from another thread while its connect is being replayed.
    struct EndsDuringReplay {
        controller: Arc<SimulatorCardReaderController>,
        runner: SimulationRunner,
        ender: Mutex<Option<thread::JoinHandle<()>>>,
        recorder: Recorder,
    }

    impl SimulatorCardReaderControllerDelegate for EndsDuringReplay {
        fn on_connect(&self, controller: &SimulatorCardReaderController, reader: &Arc<SimulatorCardReader>) {
            self.recorder.on_connect(controller, reader);

            let mut ender = self.ender.lock().unwrap();
            if ender.is_none() {
                let controller = Arc::clone(&self.controller);
                let runner = self.runner.clone();
                *ender = Some(thread::spawn(move || controller.did_end(&runner)));
                thread::sleep(Duration::from_millis(50));
            }
        }

        fn on_disconnect(
            &self,
            controller: &SimulatorCardReaderController,
            reader: &Arc<SimulatorCardReader>,
        ) {
            self.recorder.on_disconnect(controller, reader);
        }
    }

    #[test]
    fn test_replay_is_not_interleaved_with_disconnect() {
        let (_manager, controller) = controller();
        let first = SimulationRunner::new(ProcessConfig::new("simulator"));
        let second = SimulationRunner::new(ProcessConfig::new("simulator"));
        controller.did_start(&first);
        controller.did_start(&second);

        let ends = Arc::new(EndsDuringReplay {
            controller: Arc::clone(&controller),
            runner: second.clone(),
            ender: Mutex::new(None),
            recorder: Recorder::default(),
        });
        let delegate: Arc<dyn SimulatorCardReaderControllerDelegate> = ends.clone();
        controller.add(&delegate);
        let ender = ends.ender.lock().unwrap().take().unwrap();
        ender.join().unwrap();

        assert_eq!(
            vec![
                format!("connect #{}", first.id()),
                format!("connect #{}", second.id()),
                format!("disconnect #{}", second.id()),
            ],
            *ends.recorder.events.lock().unwrap()
        );
        assert_eq!(1, controller.card_readers().len());
    }
}
