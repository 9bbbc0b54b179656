use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tempfile::TempDir;
#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

use crate::registry::DelegateRegistry;
use crate::simulation::artifact::ArtifactResolver;
use crate::simulation::config::{self, ConfigContext, ConfigDocument, Preprocessor};
use crate::simulation::{SimulationMode, SimulationRunner, SimulationRunnerDelegate};
use crate::sync::BlockingCell;
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observer of the simulations of a [`SimulationManager`].
///
/// Notifications arrive sequentially on the manager's notification thread.
pub trait SimulationManagerDelegate: Send + Sync {
    /// A simulation is running and accepts connections.
    fn did_start(&self, runner: &SimulationRunner);

    /// A simulation has terminated. This may happen without a prior `did_start`.
    fn did_end(&self, runner: &SimulationRunner);
}

enum Event {
    Started(SimulationRunner),
    Ended(SimulationRunner),
    Register(Arc<dyn SimulationManagerDelegate>),
    Deregister(Arc<dyn SimulationManagerDelegate>),
    Flush(Arc<BlockingCell<()>>),
}

/// Forwards runner transitions to the notification thread.
struct ManagerLink {
    events: Mutex<Sender<Event>>,
}

impl ManagerLink {
    fn send(&self, event: Event) -> bool {
        lock(&self.events).send(event).is_ok()
    }
}

impl SimulationRunnerDelegate for ManagerLink {
    fn mode_changed(&self, runner: &SimulationRunner, mode: SimulationMode) {
        let event = match mode {
            SimulationMode::Running { .. } => Event::Started(runner.clone()),
            SimulationMode::Terminated { .. } => Event::Ended(runner.clone()),
            _ => return,
        };
        self.send(event);
    }
}

struct Dispatcher {
    events: Receiver<Event>,
    delegates: DelegateRegistry<dyn SimulationManagerDelegate>,
    announced: Vec<SimulationRunner>,
}

impl Dispatcher {
    fn run(mut self) {
        while let Ok(event) = self.events.recv() {
            match event {
                Event::Started(runner) => {
                    debug!("Announcing start of {}", runner);
                    self.announced.push(runner.clone());
                    for delegate in self.delegates.snapshot() {
                        delegate.did_start(&runner);
                    }
                }
                Event::Ended(runner) => {
                    debug!("Announcing end of {}", runner);
                    self.announced
                        .retain(|announced| !SimulationRunner::ptr_eq(announced, &runner));
                    for delegate in self.delegates.snapshot() {
                        delegate.did_end(&runner);
                    }
                }
                Event::Register(delegate) => {
                    if self.delegates.register(&delegate) {
                        for runner in &self.announced {
                            delegate.did_start(runner);
                        }
                    }
                }
                Event::Deregister(delegate) => {
                    self.delegates.deregister(&delegate);
                }
                Event::Flush(done) => done.set(()),
            }
        }
    }
}

struct Tracked {
    runner: SimulationRunner,
    scratch: TempDir,
}

/// Creates simulations and tells its delegates when they start and end.
///
/// Every simulation gets its own directory below the manager's temporary directory,
/// holding the preprocessed configuration file.
pub struct SimulationManager {
    temp_dir: PathBuf,
    owned: Mutex<Option<TempDir>>,
    runners: Mutex<Vec<Tracked>>,
    link: Arc<ManagerLink>,
    dispatcher: ThreadId,
}

impl SimulationManager {
    /// Creates a manager storing its files in `temp_dir`.
    pub fn new<P: Into<PathBuf>>(temp_dir: P) -> Result<Self> {
        let temp_dir = temp_dir.into();
        fs::create_dir_all(&temp_dir)?;

        Self::with_dir(temp_dir, None)
    }

    /// Creates a manager storing its files in a fresh temporary directory.
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("cardsim-").tempdir()?;

        Self::with_dir(dir.path().to_path_buf(), Some(dir))
    }

    fn with_dir(temp_dir: PathBuf, owned: Option<TempDir>) -> Result<Self> {
        info!("Simulation manager in {}", temp_dir.display());

        let (sender, receiver) = mpsc::channel();
        let dispatcher = Dispatcher {
            events: receiver,
            delegates: DelegateRegistry::new(),
            announced: vec![],
        };
        let handle = thread::Builder::new()
            .name("cardsim-notify".to_string())
            .spawn(move || dispatcher.run())?;

        Ok(Self {
            temp_dir,
            owned: Mutex::new(owned),
            runners: Mutex::new(vec![]),
            link: Arc::new(ManagerLink {
                events: Mutex::new(sender),
            }),
            dispatcher: handle.thread().id(),
        })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Prepares a simulation without starting it.
    ///
    /// The configuration file is loaded, run through the preprocessors left to right
    /// and written into the simulation's own directory, whose copy the simulator gets.
    pub fn create_simulation<P: AsRef<Path>>(
        &self,
        config_file: P,
        preprocessors: Vec<Box<dyn Preprocessor>>,
        resolver: &dyn ArtifactResolver,
    ) -> Result<SimulationRunner> {
        let config_file = config_file.as_ref();
        fs::create_dir_all(&self.temp_dir)?;

        let artifact = resolver.resolve(&self.temp_dir)?;
        let document = ConfigDocument::from_file(config_file)?;
        let context = ConfigContext::for_file(config_file)?;
        let document = config::preprocess(document, &preprocessors, &context)?;

        let scratch = tempfile::Builder::new()
            .prefix("simulation-")
            .tempdir_in(&self.temp_dir)?;
        let file_name = config_file.file_name().ok_or_else(|| {
            Error::Configuration(format!("{} is not a file", config_file.display()))
        })?;
        let prepared = scratch.path().join(file_name);
        document.write_to(&prepared)?;

        let mut template = artifact.into_config();
        if template.current_directory().is_none() {
            template = template.working_directory(context.working_dir());
        }
        check_launchable(template.program())?;

        let runner = SimulationRunner::for_config_file(template, &prepared);
        let link: Weak<ManagerLink> = Arc::downgrade(&self.link);
        runner.set_delegate(link);
        debug!("Created {} with {}", runner, prepared.display());

        lock(&self.runners).push(Tracked {
            runner: runner.clone(),
            scratch,
        });
        Ok(runner)
    }

    /// Tracked simulations that have not terminated yet.
    pub fn runners(&self) -> Vec<SimulationRunner> {
        lock(&self.runners)
            .iter()
            .map(|tracked| tracked.runner.clone())
            .filter(|runner| !runner.mode().is_terminated())
            .collect()
    }

    /// Stops the simulation. Stopping a terminated simulation does nothing.
    ///
    /// With `wait_until_done` the call returns once `did_end` has been delivered,
    /// unless it is made from the notification thread itself.
    pub fn stop(&self, runner: &SimulationRunner, wait_until_done: bool) -> Result<()> {
        if !runner.mode().is_terminated() {
            runner.stop(wait_until_done)?;
        }

        if wait_until_done {
            self.flush();
        }
        Ok(())
    }

    pub fn stop_all(&self, wait_until_done: bool) -> Result<()> {
        debug!("Stopping all simulations");
        for runner in self.runners() {
            self.stop(&runner, wait_until_done)?;
        }

        Ok(())
    }

    /// Waits until the notifications queued so far have been delivered.
    fn flush(&self) {
        if thread::current().id() == self.dispatcher {
            return;
        }

        let done = Arc::new(BlockingCell::new());
        if self.link.send(Event::Flush(Arc::clone(&done))) {
            done.get();
        }
    }

    /// Forgets terminated simulations and deletes their files.
    /// Without remaining simulations the whole temporary directory is removed.
    pub fn clean(&self) {
        let mut runners = lock(&self.runners);
        let (ended, active): (Vec<_>, Vec<_>) = runners
            .drain(..)
            .partition(|tracked| tracked.runner.mode().is_terminated());
        *runners = active;

        for tracked in ended {
            debug!("Cleaning {}", tracked.scratch.path().display());
            if let Err(e) = tracked.scratch.close() {
                warn!("Failed to clean the files of {}: {}", tracked.runner, e);
            }
        }

        if !runners.is_empty() {
            return;
        }

        match lock(&self.owned).take() {
            Some(dir) => {
                if let Err(e) = dir.close() {
                    warn!("Failed to clean {}: {}", self.temp_dir.display(), e);
                }
            }
            None => match fs::remove_dir_all(&self.temp_dir) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    warn!("Failed to clean {}: {}", self.temp_dir.display(), e);
                }
                _ => {}
            },
        }
    }

    /// Adds a delegate, held weakly. Registering twice has no effect.
    ///
    /// The delegate is told about the simulations that are currently running. Like
    /// [`deregister`](Self::deregister), this takes effect in order with the notifications
    /// queued so far.
    pub fn register(&self, delegate: &Arc<dyn SimulationManagerDelegate>) {
        self.link.send(Event::Register(Arc::clone(delegate)));
    }

    pub fn deregister(&self, delegate: &Arc<dyn SimulationManagerDelegate>) {
        self.link.send(Event::Deregister(Arc::clone(delegate)));
    }
}

/// Checks that the program exists, searching `PATH` for bare names.
fn check_launchable(program: &Path) -> Result<()> {
    let found = if program.components().count() > 1 {
        program.is_file()
    } else {
        env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
            .unwrap_or(false)
    };

    if found {
        Ok(())
    } else {
        Err(Error::ProcessSpawn(format!("{} cannot be found", program.display())))
    }
}
