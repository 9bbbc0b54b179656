//! Simulator configuration documents and the preprocessors applied before launch.
//!
//! A document is a TOML table addressed with dotted paths such as
//! `configuration.ioConfiguration.port`. Preprocessors run left to right, each
//! receiving the document produced by the previous one.

use std::env;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use toml::{Table, Value};
#[cfg(feature = "tracing")]
use tracing::debug;

use crate::{Error, Result};

/// Port of the simulator's TLV interface.
pub const TLV_PORT_PATH: &str = "configuration.ioConfiguration.port";

/// Card image file loaded by the simulator.
pub const CARD_IMAGE_FILE_PATH: &str = "configuration.general.cardImageFile";

/// Channel context file loaded by the simulator.
pub const CHANNEL_CONTEXT_FILE_PATH: &str = "configuration.general.channelContextFile";

/// A simulator configuration document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    root: Table,
}

impl FromStr for ConfigDocument {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let root = s
            .parse::<Table>()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        Ok(Self { root })
    }
}

impl ConfigDocument {
    pub fn new(root: Table) -> Self {
        Self { root }
    }

    /// Loads the document from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;

        content
            .parse()
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn table(&self) -> &Table {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let (parents, key) = split(path);
        let mut table = &self.root;
        for name in parents {
            table = table.get(name)?.as_table()?;
        }

        table.get(key)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Value> {
        let (parents, key) = split(path);
        let mut table = &mut self.root;
        for name in parents {
            table = table.get_mut(name)?.as_table_mut()?;
        }

        table.get_mut(key)
    }

    /// Sets the value at the path, creating missing tables on the way.
    pub fn set<V: Into<Value>>(&mut self, path: &str, value: V) -> Result<()> {
        let (parents, key) = split(path);
        let mut table = &mut self.root;
        for name in parents {
            table = table
                .entry(name)
                .or_insert(Value::Table(Table::new()))
                .as_table_mut()
                .ok_or_else(|| Error::Configuration(format!("{} is not a table", name)))?;
        }

        table.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Writes the document, creating the parent directory when missing.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_string())?;

        Ok(())
    }
}

impl Display for ConfigDocument {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let content = toml::to_string(&self.root).map_err(|_| fmt::Error)?;
        f.write_str(&content)
    }
}

fn split(path: &str) -> (impl Iterator<Item = &str>, &str) {
    let (parents, key) = path.rsplit_once('.').unwrap_or(("", path));

    (parents.split('.').filter(|name| !name.is_empty()), key)
}

/// Environment of the preprocessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigContext {
    config_dir: PathBuf,
    working_dir: PathBuf,
}

impl ConfigContext {
    pub fn new<C, W>(config_dir: C, working_dir: W) -> Self
    where
        C: Into<PathBuf>,
        W: Into<PathBuf>,
    {
        Self {
            config_dir: config_dir.into(),
            working_dir: working_dir.into(),
        }
    }

    /// Context for a configuration file, resolved against the current directory.
    pub fn for_file<P: AsRef<Path>>(config_file: P) -> Result<Self> {
        let working_dir = env::current_dir()?;
        let config_file = working_dir.join(config_file);
        let config_dir = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| working_dir.clone());

        Ok(Self::new(config_dir, working_dir))
    }

    /// Directory of the source configuration file.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

/// A transformation of the document applied before the simulator is launched.
pub trait Preprocessor: Send {
    fn apply(&self, document: ConfigDocument, context: &ConfigContext) -> Result<ConfigDocument>;
}

impl<F> Preprocessor for F
where
    F: Fn(ConfigDocument, &ConfigContext) -> Result<ConfigDocument> + Send,
{
    fn apply(&self, document: ConfigDocument, context: &ConfigContext) -> Result<ConfigDocument> {
        self(document, context)
    }
}

/// Applies the preprocessors left to right.
pub fn preprocess(
    document: ConfigDocument,
    preprocessors: &[Box<dyn Preprocessor>],
    context: &ConfigContext,
) -> Result<ConfigDocument> {
    preprocessors
        .iter()
        .try_fold(document, |document, preprocessor| {
            preprocessor.apply(document, context)
        })
}

/// Rewrites the value at one path. Missing paths are left alone.
pub struct PathManipulator<F> {
    path: String,
    manipulate: F,
}

impl<F> PathManipulator<F>
where
    F: Fn(&mut Value, &ConfigContext) -> Result<()> + Send,
{
    pub fn new<P: Into<String>>(path: P, manipulate: F) -> Self {
        Self {
            path: path.into(),
            manipulate,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<F> Preprocessor for PathManipulator<F>
where
    F: Fn(&mut Value, &ConfigContext) -> Result<()> + Send,
{
    fn apply(&self, mut document: ConfigDocument, context: &ConfigContext) -> Result<ConfigDocument> {
        match document.get_mut(&self.path) {
            Some(value) => (self.manipulate)(value, context)?,
            None => {
                debug!("{} is not present in the configuration", self.path);
            }
        }

        Ok(document)
    }
}

/// Sets the TLV port. Port `0` is replaced by a currently unused port.
pub fn tlv_port(port: u16) -> impl Preprocessor {
    move |mut document: ConfigDocument, _: &ConfigContext| -> Result<ConfigDocument> {
        let port = match port {
            0 => available_port()?,
            port => port,
        };
        document.set(TLV_PORT_PATH, i64::from(port))?;

        Ok(document)
    }
}

/// Prefixes relative file paths (starting with `./` or `../`) at `path` with `base`.
pub fn relative_to_absolute<P, B>(path: P, base: B) -> impl Preprocessor
where
    P: Into<String>,
    B: Into<PathBuf>,
{
    let base = base.into();
    PathManipulator::new(path, move |value: &mut Value, _: &ConfigContext| {
        absolutize(value, &base);
        Ok(())
    })
}

/// Like [`relative_to_absolute`], resolving against the directory of the configuration file.
pub fn relative_to_config<P: Into<String>>(path: P) -> impl Preprocessor {
    PathManipulator::new(path, |value: &mut Value, context: &ConfigContext| {
        absolutize(value, context.config_dir());
        Ok(())
    })
}

fn absolutize(value: &mut Value, base: &Path) {
    if let Value::String(path) = value {
        if path.starts_with("./") || path.starts_with("../") {
            *path = base.join(path.as_str()).to_string_lossy().into_owned();
        }
    }
}

/// Asks the OS for a currently unused TCP port on the loopback interface.
pub fn available_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;

    Ok(listener.local_addr()?.port())
}
