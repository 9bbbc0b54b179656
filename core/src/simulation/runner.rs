use std::collections::VecDeque;
use std::fmt::{self, Debug, Display, Formatter};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

use regex::Regex;
#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

use crate::future::{Future, Promise};
use crate::process::{ProcessConfig, ProcessDelegate, ProcessMonitor, Redirect};
use crate::simulation::SimulationMode;
use crate::sync::{DispatchContext, TransactionalCell};
use crate::{Error, Result};

/// Port of the TLV interface when the simulator does not print one.
pub const DEFAULT_TLV_PORT: u16 = 12350;

/// Line printed by the simulator once it accepts connections.
pub const STARTED_LINE: &str = "Simulation started successfully.";

static PORT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"TCPIP: TLV Interface at Port (\d+)$").unwrap());

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observer of the mode transitions of a runner.
pub trait SimulationRunnerDelegate: Send + Sync {
    /// Called once per transition, in transition order and never concurrently for a runner.
    fn mode_changed(&self, runner: &SimulationRunner, mode: SimulationMode);
}

#[derive(Default)]
struct ModeState {
    mode: SimulationMode,
    pending: VecDeque<SimulationMode>,
    dispatching: bool,
}

struct Inner {
    id: u64,
    config: ProcessConfig,
    state: TransactionalCell<ModeState>,
    monitor: Mutex<Option<Arc<ProcessMonitor>>>,
    delegate: Mutex<Option<Weak<dyn SimulationRunnerDelegate>>>,
    launched: Promise<SimulationMode>,
    terminated: Promise<i32>,
}

impl Inner {
    /// Moves the mode forward. Returns `None` when the transition is not allowed,
    /// otherwise whether the caller has to dispatch the queued transitions.
    fn advance(&self, next: SimulationMode) -> Option<bool> {
        self.advance_from(next, |_| true)
    }

    fn advance_from<F>(&self, next: SimulationMode, allowed: F) -> Option<bool>
    where
        F: FnOnce(&SimulationMode) -> bool,
    {
        self.state.update(|state| {
            if !state.mode.can_become(&next) || !allowed(&state.mode) {
                return None;
            }

            state.mode = next;
            state.pending.push_back(next);

            Some(!std::mem::replace(&mut state.dispatching, true))
        })
    }

    fn transition(self: &Arc<Self>, next: SimulationMode) -> bool {
        match self.advance(next) {
            Some(dispatch) => {
                if dispatch {
                    self.dispatch();
                }
                true
            }
            None => false,
        }
    }

    /// Announces queued transitions until the queue is empty.
    fn dispatch(self: &Arc<Self>) {
        let _context = DispatchContext::enter();

        loop {
            let next = self.state.update(|state| {
                let next = state.pending.pop_front();
                state.dispatching = next.is_some();
                next
            });
            let Some(mode) = next else {
                return;
            };

            self.announce(mode);
        }
    }

    fn announce(self: &Arc<Self>, mode: SimulationMode) {
        info!("Simulation #{} -> {}", self.id, mode);

        // The delegate hears about a transition before any waiter is released.
        let delegate = lock(&self.delegate).as_ref().and_then(Weak::upgrade);
        if let Some(delegate) = delegate {
            let runner = SimulationRunner {
                inner: Arc::clone(self),
            };
            delegate.mode_changed(&runner, mode);
        }

        if mode.is_running() || mode.is_terminated() {
            self.launched.succeed(mode);
        }
        if let Some(status) = mode.termination_status() {
            self.terminated.succeed(status);
        }
    }
}

/// Launches a simulator process and tracks its [`SimulationMode`].
///
/// Handles are cheap to clone and compare by identity with [`SimulationRunner::ptr_eq`].
/// The process is killed when the last handle of a running runner is dropped.
#[derive(Clone)]
pub struct SimulationRunner {
    inner: Arc<Inner>,
}

impl SimulationRunner {
    /// Creates a runner that launches the process when started.
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: TransactionalCell::default(),
                monitor: Mutex::new(None),
                delegate: Mutex::new(None),
                launched: Promise::replaying(),
                terminated: Promise::replaying(),
            }),
        }
    }

    /// Creates a runner for a simulator artifact and its configuration file,
    /// passed as `-configFile <file>`.
    pub fn for_config_file<P: AsRef<Path>>(template: ProcessConfig, config_file: P) -> Self {
        Self::new(template.arg("-configFile").arg(config_file.as_ref()))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.inner.config
    }

    /// The latest observed mode.
    pub fn mode(&self) -> SimulationMode {
        self.inner.state.update(|state| state.mode)
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner.monitor)
            .as_ref()
            .and_then(|monitor| monitor.pid())
    }

    pub fn set_delegate(&self, delegate: Weak<dyn SimulationRunnerDelegate>) {
        *lock(&self.inner.delegate) = Some(delegate);
    }

    /// Replays the mode the runner reached when leaving `Initializing`.
    pub fn on_launched(&self) -> Future<SimulationMode> {
        self.inner.launched.future()
    }

    /// Replays the termination status.
    pub fn on_terminated(&self) -> Future<i32> {
        self.inner.terminated.future()
    }

    /// Launches the process. Only the first call has an effect.
    ///
    /// With `wait_until_launched` the call blocks until the mode has left `Initializing`
    /// and fails when the process could not be spawned.
    pub fn start(&self, wait_until_launched: bool) -> Result<()> {
        let monitor = {
            let mut slot = lock(&self.inner.monitor);
            let Some(dispatch) = self.inner.advance(SimulationMode::Initializing) else {
                warn!("Simulation #{} has already been started", self.id());
                return Ok(());
            };

            let detection = Arc::new(Mutex::new(Detection::default()));
            let monitor = Arc::new(
                ProcessMonitor::new(self.inner.config.clone())
                    .stdout(Redirect::Sink(Box::new(LineScanner::new(
                        Arc::downgrade(&self.inner),
                        Arc::clone(&detection),
                    ))))
                    .stderr(Redirect::Sink(Box::new(LineScanner::new(
                        Arc::downgrade(&self.inner),
                        detection,
                    )))),
            );
            *slot = Some(Arc::clone(&monitor));
            drop(slot);

            if dispatch {
                self.inner.dispatch();
            }
            monitor
        };

        debug!("Launching {:?}", self.inner.config.program());
        monitor.run(Arc::new(RunnerLink {
            inner: Arc::downgrade(&self.inner),
        }));

        if wait_until_launched {
            self.on_launched().wait();
            debug!("Simulation #{} left initialization", self.id());

            if let Some(Error::ProcessSpawn(reason)) = monitor.launched().wait().error() {
                return Err(Error::ProcessSpawn(reason.clone()));
            }
        }

        Ok(())
    }

    /// Stops the simulation. Stopping a runner that never reached `Running` moves it
    /// straight to `Terminated(0)`.
    ///
    /// With `wait_until_done` the call blocks until the mode is `Terminated`.
    pub fn stop(&self, wait_until_done: bool) -> Result<()> {
        info!("Stopping simulation #{} [wait: {}]", self.id(), wait_until_done);

        let monitor = {
            let slot = lock(&self.inner.monitor);
            let forced = self
                .inner
                .advance_from(SimulationMode::Terminated { status: 0 }, |mode| {
                    !mode.is_running()
                });
            let monitor = slot.clone();
            drop(slot);

            if forced == Some(true) {
                self.inner.dispatch();
            }
            monitor
        };

        if let Some(monitor) = monitor {
            monitor.terminate(wait_until_done);
        }

        if wait_until_done {
            self.on_terminated().wait();
        }

        Ok(())
    }
}

impl PartialEq for SimulationRunner {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl Eq for SimulationRunner {}

impl Debug for SimulationRunner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationRunner")
            .field("id", &self.id())
            .field("mode", &self.mode())
            .finish()
    }
}

impl Display for SimulationRunner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SimulationRunner #{}: {}", self.id(), self.mode())
    }
}

struct RunnerLink {
    inner: Weak<Inner>,
}

impl ProcessDelegate for RunnerLink {
    fn launched(&self, pid: u32) {
        debug!("Simulator process launched with PID {}", pid);
    }

    fn terminated(&self, status: i32) {
        if let Some(inner) = self.inner.upgrade() {
            inner.transition(SimulationMode::Terminated { status });
        }
    }
}

#[derive(Default)]
struct Detection {
    port: Option<u16>,
    started: bool,
}

/// Scans the simulator output for its startup lines.
struct LineScanner {
    inner: Weak<Inner>,
    detection: Arc<Mutex<Detection>>,
    buffer: Vec<u8>,
}

impl LineScanner {
    fn new(inner: Weak<Inner>, detection: Arc<Mutex<Detection>>) -> Self {
        Self {
            inner,
            detection,
            buffer: vec![],
        }
    }

    fn scan(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        debug!("Card simulator: [{}]", line);

        let port = {
            let mut detection = lock(&self.detection);
            if detection.started {
                return;
            }

            if detection.port.is_none() {
                detection.port = PORT_LINE
                    .captures(line)
                    .and_then(|captures| captures[1].parse().ok());
            }
            if line != STARTED_LINE {
                return;
            }

            detection.started = true;
            detection.port.unwrap_or(DEFAULT_TLV_PORT)
        };

        if let Some(inner) = self.inner.upgrade() {
            inner.transition(SimulationMode::Running { tlv_port: port });
        }
    }
}

impl Write for LineScanner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);

        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scan(&line[..end]);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.scan(&line);
        }

        Ok(())
    }
}
