//! Configuration file handling for schemer.
//!
//! Looks for `.config/schemer.styx` in the current directory or any parent
//! directory. The directory holding `.config/` is the project root, and
//! relative paths in the file are resolved against it.

pub use schemer_config::Config;

use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_FILE: &str = ".config/schemer.styx";

/// A loaded configuration and the directory it applies to.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: Config,
    pub root: PathBuf,
    /// `None` when no config file was found and defaults are in use.
    pub path: Option<PathBuf>,
}

impl Loaded {
    /// The declaration file named by the config, resolved against the root.
    pub fn declaration_path(&self) -> PathBuf {
        self.root.join(self.config.declaration())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no .config/schemer.styx found in current directory or any parent")]
    NotFound,

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

/// Load configuration, searching up the directory tree from the current
/// directory. Falls back to defaults rooted at the current directory.
pub fn load() -> Result<Loaded, ConfigError> {
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
        path: PathBuf::from("."),
        source,
    })?;
    match load_from(&cwd) {
        Err(ConfigError::NotFound) => {
            tracing::debug!("no config file found, using defaults");
            Ok(Loaded {
                config: Config::default(),
                root: cwd,
                path: None,
            })
        }
        other => other,
    }
}

/// Load configuration starting from a specific directory.
pub fn load_from(start: &Path) -> Result<Loaded, ConfigError> {
    let config_path = find_config_file(start)?;
    let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
        path: config_path.clone(),
        source,
    })?;

    let config: Config = facet_styx::from_str(&content).map_err(|e| ConfigError::Parse {
        path: config_path.clone(),
        message: e.to_string(),
    })?;

    // `.config/schemer.styx` -> project root
    let root = config_path
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| start.to_path_buf());

    tracing::debug!(path = %config_path.display(), "loaded config");
    Ok(Loaded {
        config,
        root,
        path: Some(config_path),
    })
}

/// Find `.config/schemer.styx` by searching up the directory tree.
fn find_config_file(start: &Path) -> Result<PathBuf, ConfigError> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE);
        if config_path.exists() {
            return Ok(config_path);
        }

        if !current.pop() {
            return Err(ConfigError::NotFound);
        }
    }
}
