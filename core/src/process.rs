//! Spawns and watches the external simulator process.
//!
//! A [`ProcessMonitor`] owns exactly one child process. [`ProcessMonitor::run`] returns
//! immediately; a watcher thread spawns the child, reaps it and delivers
//! [`ProcessDelegate::launched`] followed by [`ProcessDelegate::terminated`], each at
//! most once. The watcher is a [`DispatchContext`] while it notifies.

use std::ffi::{OsStr, OsString};
use std::io::{self, Read, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::future::{Future, Promise};
use crate::sync::{BlockingCell, DispatchContext};
use crate::Error;

/// Launch path used for Java based simulators.
pub const JAVA_LAUNCH_PATH: &str = "/usr/bin/java";

/// Entry point of the G2 card simulator.
pub const G2_MAIN_CLASS: &str = "com.achelos.egk.g2sim.application.Application";

/// Status reported when the process could not be spawned at all.
pub const SPAWN_FAILURE_STATUS: i32 = 127;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Program, arguments and working directory of a process to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    program: PathBuf,
    args: Vec<OsString>,
    working_directory: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            working_directory: None,
        }
    }

    /// Builds `java -cp <class_path> <main_class> args...` with the default launch path.
    pub fn java<C, M, I, S>(class_path: C, main_class: M, args: I) -> Self
    where
        C: AsRef<OsStr>,
        M: AsRef<OsStr>,
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self::new(JAVA_LAUNCH_PATH)
            .arg("-cp")
            .arg(class_path)
            .arg(main_class)
            .args(args)
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    pub fn working_directory<P: Into<PathBuf>>(mut self, directory: P) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    /// Replaces the program, keeping arguments and working directory.
    pub fn with_program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.program = program.into();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn current_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        if let Some(directory) = &self.working_directory {
            command.current_dir(directory);
        }

        command
    }
}

/// Destination of a standard stream of the child process.
#[derive(Default)]
pub enum Redirect {
    #[default]
    Null,
    Inherit,
    /// Pumps the stream into the writer on a dedicated thread.
    Sink(Box<dyn Write + Send>),
}

impl Redirect {
    fn split(self) -> (Stdio, Option<Box<dyn Write + Send>>) {
        match self {
            Self::Null => (Stdio::null(), None),
            Self::Inherit => (Stdio::inherit(), None),
            Self::Sink(sink) => (Stdio::piped(), Some(sink)),
        }
    }
}

/// Observer of the two lifecycle events of a process.
pub trait ProcessDelegate: Send + Sync {
    fn launched(&self, _pid: u32) {}

    fn terminated(&self, _status: i32) {}
}

/// Launches one process and watches it until it exits.
pub struct ProcessMonitor {
    config: ProcessConfig,
    stdout: Mutex<Redirect>,
    stderr: Mutex<Redirect>,
    started: AtomicBool,
    terminate_requested: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    pid: Arc<BlockingCell<u32>>,
    launched: Promise<u32>,
    terminated: Promise<i32>,
}

impl ProcessMonitor {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            stdout: Mutex::new(Redirect::Null),
            stderr: Mutex::new(Redirect::Null),
            started: AtomicBool::new(false),
            terminate_requested: Arc::new(AtomicBool::new(false)),
            child: Arc::new(Mutex::new(None)),
            pid: Arc::new(BlockingCell::new()),
            launched: Promise::replaying(),
            terminated: Promise::replaying(),
        }
    }

    pub fn stdout(mut self, redirect: Redirect) -> Self {
        *self.stdout.get_mut().unwrap_or_else(PoisonError::into_inner) = redirect;
        self
    }

    pub fn stderr(mut self, redirect: Redirect) -> Self {
        *self.stderr.get_mut().unwrap_or_else(PoisonError::into_inner) = redirect;
        self
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Starts the watcher thread without blocking. A second call is ignored.
    pub fn run(&self, delegate: Arc<dyn ProcessDelegate>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Process {:?} has already been started", self.config.program);
            return;
        }

        let watcher = Watcher {
            command: self.config.command(),
            stdout: mem::take(&mut *lock(&self.stdout)),
            stderr: mem::take(&mut *lock(&self.stderr)),
            terminate_requested: Arc::clone(&self.terminate_requested),
            child: Arc::clone(&self.child),
            pid: Arc::clone(&self.pid),
            launched: self.launched.clone(),
            terminated: self.terminated.clone(),
            delegate: Arc::clone(&delegate),
        };

        let spawned = thread::Builder::new()
            .name("cardsim-process".to_string())
            .spawn(move || watcher.watch());

        if let Err(e) = spawned {
            warn!("Failed to start the process watcher: {}", e);
            self.launched.fail(Error::ProcessSpawn(e.to_string()));
            delegate.terminated(SPAWN_FAILURE_STATUS);
            self.terminated.succeed(SPAWN_FAILURE_STATUS);
        }
    }

    /// Replays the process ID once the child exists.
    /// Fails with [`Error::ProcessSpawn`] when the child could not be spawned.
    pub fn launched(&self) -> Future<u32> {
        self.launched.future()
    }

    /// Replays the exit status once the child has been reaped.
    pub fn terminated(&self) -> Future<i32> {
        self.terminated.future()
    }

    /// Kills the child, also when it is spawned after this call.
    pub fn terminate(&self, wait_until_done: bool) {
        self.terminate_requested.store(true, Ordering::SeqCst);

        if let Some(child) = lock(&self.child).as_mut() {
            debug!("Killing process {}", child.id());
            if let Err(e) = child.kill() {
                debug!("Process could not be killed: {}", e);
            }
        }

        if wait_until_done && self.started.load(Ordering::SeqCst) {
            self.terminated().wait();
        }
    }

    /// Whether the child has been launched and not yet terminated.
    pub fn is_running(&self) -> bool {
        self.pid.is_fulfilled() && !self.terminated.is_done()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.try_get()
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        if self.is_running() {
            self.terminate(false);
        }
    }
}

struct Watcher {
    command: Command,
    stdout: Redirect,
    stderr: Redirect,
    terminate_requested: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    pid: Arc<BlockingCell<u32>>,
    launched: Promise<u32>,
    terminated: Promise<i32>,
    delegate: Arc<dyn ProcessDelegate>,
}

impl Watcher {
    fn watch(mut self) {
        let (stdout, stdout_sink) = mem::take(&mut self.stdout).split();
        let (stderr, stderr_sink) = mem::take(&mut self.stderr).split();
        self.command.stdout(stdout).stderr(stderr);

        let mut child = match self.command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {:?}: {}", self.command.get_program(), e);
                self.launched.fail(Error::ProcessSpawn(e.to_string()));
                self.notify_terminated(SPAWN_FAILURE_STATUS);
                return;
            }
        };

        let pid = child.id();
        let drained = Arc::new(BlockingCell::new());
        let pumps = [
            child.stdout.take().map(|out| pump(out, stdout_sink)),
            child.stderr.take().map(|err| pump(err, stderr_sink)),
        ];
        *lock(&self.child) = Some(child);

        if self.terminate_requested.load(Ordering::SeqCst) {
            if let Some(child) = lock(&self.child).as_mut() {
                let _ = child.kill();
            }
        }

        info!("Process launched with PID {}", pid);
        self.pid.set(pid);
        {
            let _context = DispatchContext::enter();
            self.delegate.launched(pid);
            self.launched.succeed(pid);
        }

        let status = self.reap();
        debug!("Process {} exited with status {}", pid, status);

        // Output written right before the exit still reaches the sinks first.
        let signal = Arc::clone(&drained);
        let waiter = thread::Builder::new()
            .name("cardsim-drain".to_string())
            .spawn(move || {
                for pump in pumps.into_iter().flatten() {
                    let _ = pump.join();
                }
                signal.set(());
            });
        if waiter.is_ok() {
            drained.get_timeout(DRAIN_TIMEOUT);
        }

        self.notify_terminated(status);
    }

    fn reap(&self) -> i32 {
        loop {
            let mut slot = lock(&self.child);
            let Some(child) = slot.as_mut() else {
                return SPAWN_FAILURE_STATUS;
            };

            match child.wait_timeout(POLL_INTERVAL) {
                Ok(Some(status)) => return exit_status(status),
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to wait for the process: {}", e);
                    return 1;
                }
            }
            drop(slot);
            thread::yield_now();
        }
    }

    fn notify_terminated(&self, status: i32) {
        let _context = DispatchContext::enter();
        self.delegate.terminated(status);
        self.terminated.succeed(status);
    }
}

fn pump<R>(mut source: R, sink: Option<Box<dyn Write + Send>>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let result = match sink {
            Some(mut sink) => io::copy(&mut source, &mut sink).and_then(|_| sink.flush()),
            None => io::copy(&mut source, &mut io::sink()).map(|_| ()),
        };
        if let Err(e) = result {
            debug!("Output pump stopped: {}", e);
        }
    })
}

/// Exit code, or `128 + signal` for processes killed by a signal.
fn exit_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}
