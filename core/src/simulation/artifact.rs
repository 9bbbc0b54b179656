//! Resolution of the runnable simulator artifact.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[cfg(feature = "tracing")]
use tracing::{debug, info};

use crate::process::{ProcessConfig, G2_MAIN_CLASS, JAVA_LAUNCH_PATH};
use crate::{Error, Result};

/// A runnable simulator: the process template the configuration file is appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    config: ProcessConfig,
}

impl Artifact {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn into_config(self) -> ProcessConfig {
        self.config
    }
}

/// Produces the simulator artifact, materializing it below `temp_dir` when needed.
pub trait ArtifactResolver {
    fn resolve(&self, temp_dir: &Path) -> Result<Artifact>;
}

/// A Java simulator whose dependencies are already present in one directory.
#[derive(Debug, Clone)]
pub struct JavaArtifact {
    class_path: PathBuf,
    main_class: String,
    launch_path: PathBuf,
}

impl JavaArtifact {
    /// Creates an artifact for the G2 simulator in the class path directory.
    pub fn new<P: Into<PathBuf>>(class_path: P) -> Self {
        Self {
            class_path: class_path.into(),
            main_class: G2_MAIN_CLASS.to_string(),
            launch_path: PathBuf::from(JAVA_LAUNCH_PATH),
        }
    }

    pub fn main_class<S: Into<String>>(mut self, main_class: S) -> Self {
        self.main_class = main_class.into();
        self
    }

    pub fn launch_path<P: Into<PathBuf>>(mut self, launch_path: P) -> Self {
        self.launch_path = launch_path.into();
        self
    }

    pub fn class_path(&self) -> &Path {
        &self.class_path
    }
}

impl ArtifactResolver for JavaArtifact {
    fn resolve(&self, _temp_dir: &Path) -> Result<Artifact> {
        if !self.class_path.is_dir() {
            return Err(Error::Configuration(format!(
                "Simulator class path {} does not exist",
                self.class_path.display()
            )));
        }

        let class_path = self.class_path.canonicalize()?.join("*");
        let config = ProcessConfig::java(class_path, &self.main_class, Vec::<OsString>::new())
            .with_program(&self.launch_path);

        Ok(Artifact::new(config))
    }
}

/// An arbitrary program used as simulator.
#[derive(Debug, Clone)]
pub struct CommandArtifact {
    config: ProcessConfig,
}

impl CommandArtifact {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }
}

impl ArtifactResolver for CommandArtifact {
    fn resolve(&self, _temp_dir: &Path) -> Result<Artifact> {
        Ok(Artifact::new(self.config.clone()))
    }
}

/// Runs a build command once to materialize the class path of a Java simulator.
///
/// The command receives the class path directory as its last argument. When that
/// directory already exists the build is skipped.
#[derive(Debug, Clone)]
pub struct ScriptResolver {
    program: PathBuf,
    args: Vec<OsString>,
    output: PathBuf,
    main_class: String,
}

impl ScriptResolver {
    /// `output` is resolved against the manager's temporary directory.
    pub fn new<P, O>(program: P, output: O) -> Self
    where
        P: Into<PathBuf>,
        O: Into<PathBuf>,
    {
        Self {
            program: program.into(),
            args: vec![],
            output: output.into(),
            main_class: G2_MAIN_CLASS.to_string(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn main_class<S: Into<String>>(mut self, main_class: S) -> Self {
        self.main_class = main_class.into();
        self
    }
}

impl ArtifactResolver for ScriptResolver {
    fn resolve(&self, temp_dir: &Path) -> Result<Artifact> {
        let class_path = temp_dir.join(&self.output);

        if class_path.is_dir() {
            debug!("Skip building the existing simulator at {}", class_path.display());
        } else {
            info!("Building the simulator into {}", class_path.display());
            let status = Command::new(&self.program)
                .args(&self.args)
                .arg(&class_path)
                .stdin(Stdio::null())
                .status()
                .map_err(|e| Error::Configuration(format!("{:?}: {}", self.program, e)))?;

            if !status.success() {
                return Err(Error::Configuration(format!(
                    "Simulator build exited with {}",
                    status
                )));
            }
        }

        JavaArtifact::new(class_path)
            .main_class(&self.main_class)
            .resolve(temp_dir)
    }
}
