//! Tunnel config store
//!
//! One TOML file per tunnel, `<dir>/<name>.toml`. The file name is the
//! tunnel's identity; a `name` inside the file that disagrees with it is
//! overridden on load.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tw_net::{ConfigError, TunnelConfig, TunnelName, CONFIG_EXTENSION};

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No tunnel named {0}")]
    NotFound(String),

    #[error("Tunnel {0} already exists")]
    AlreadyExists(String),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize tunnel config: {0}")]
    Serialize(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Directory of stored tunnel configs
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where a tunnel's config lives
    pub fn path_for(&self, name: &TunnelName) -> PathBuf {
        self.dir.join(format!("{}.{}", name, CONFIG_EXTENSION))
    }

    pub fn exists(&self, name: &TunnelName) -> bool {
        self.path_for(name).is_file()
    }

    /// Names of every stored tunnel, sorted
    ///
    /// Files that are not tunnel configs are skipped.
    pub fn list(&self) -> Result<Vec<TunnelName>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir)(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_error(&self.dir))?.path();
            match TunnelName::from_path(&path) {
                Ok(name) => names.push(name),
                Err(_) => debug!("Skipping {}", path.display()),
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load a stored tunnel
    pub fn load(&self, name: &TunnelName) -> Result<TunnelConfig, StoreError> {
        let path = self.path_for(name);
        if !path.is_file() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Self::load_path(&path)
    }

    /// Load a config file, naming the tunnel after the file
    pub fn load_path(path: &Path) -> Result<TunnelConfig, StoreError> {
        let name = TunnelName::from_path(path)?;
        let text = fs::read_to_string(path).map_err(io_error(path))?;
        let mut config: TunnelConfig = toml::from_str(&text).map_err(|e| StoreError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if config.name != name {
            warn!(
                "{} names its tunnel {}, using {}",
                path.display(),
                config.name,
                name
            );
            config.name = name;
        }
        config.validate()?;
        Ok(config)
    }

    /// Store a new tunnel; fails if one with the same name exists
    pub fn create(&self, config: &TunnelConfig) -> Result<PathBuf, StoreError> {
        config.validate()?;
        let text =
            toml::to_string_pretty(config).map_err(|e| StoreError::Serialize(e.to_string()))?;
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let path = self.path_for(&config.name);
        // Private keys live in here
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(config.name.to_string()),
                _ => io_error(&path)(e),
            })?;
        file.write_all(text.as_bytes()).map_err(io_error(&path))?;
        info!("Stored tunnel {} at {}", config.name, path.display());
        Ok(path)
    }

    /// Remove a stored tunnel
    pub fn delete(&self, name: &TunnelName) -> Result<(), StoreError> {
        let path = self.path_for(name);
        fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
            _ => io_error(&path)(e),
        })?;
        info!("Removed tunnel {}", name);
        Ok(())
    }
}
