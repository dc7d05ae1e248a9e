//! Filesystem layout and JSON persistence helpers

use crate::ProxyError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory roots for the process: `config/` holds the seed and other
/// operator-managed files, `data/` holds persisted runtime documents.
#[derive(Debug, Clone)]
pub struct Env {
    config_root: PathBuf,
    data_root: PathBuf,
}

impl Env {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_root: root.join("config"),
            data_root: root.join("data"),
        }
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Load a persisted JSON document, falling back to the type's default
    /// when the file does not exist yet.
    pub fn load_data<T>(&self, name: &str) -> Result<T, ProxyError>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.data_root.join(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Persist a JSON document, creating the data directory on first use.
    pub fn save_data<T: Serialize>(&self, value: &T, name: &str) -> Result<(), ProxyError> {
        fs::create_dir_all(&self.data_root)?;
        let contents = serde_json::to_string_pretty(value)?;
        fs::write(self.data_root.join(name), contents)?;
        Ok(())
    }
}
