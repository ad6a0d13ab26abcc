use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const ENV_DATA_DIR: &str = "DOCSTORE_DATA_DIR";
pub const ENV_WRITE_MODE: &str = "DOCSTORE_WRITE_MODE";
pub const ENV_STRICT: &str = "DOCSTORE_STRICT";

/// How a collection's backing file is replaced on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Truncate the backing file and write the new contents in place.
    /// A crash mid-write leaves a truncated file behind.
    #[default]
    Overwrite,
    /// Write a sibling temp file, fsync it, then rename it over the
    /// backing file.
    AtomicRename,
}

impl WriteMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(WriteMode::Overwrite),
            "atomic" | "atomic-rename" | "rename" => Ok(WriteMode::AtomicRename),
            other => Err(Error::Config(format!(
                "unknown write mode '{other}' (expected 'overwrite' or 'atomic')"
            ))),
        }
    }
}

/// What to do with operators and stages the engine does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Unknown query operators are always-true, unknown update operators
    /// and pipeline stages are skipped.
    #[default]
    Lenient,
    /// Unknown operators and stages are reported as errors.
    Strict,
}

impl Strictness {
    pub fn is_strict(self) -> bool {
        self == Strictness::Strict
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub write_mode: WriteMode,
    pub strictness: Strictness,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            write_mode: WriteMode::default(),
            strictness: Strictness::default(),
        }
    }
}

impl StoreConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Build a config from `DOCSTORE_DATA_DIR`, `DOCSTORE_WRITE_MODE` and
    /// `DOCSTORE_STRICT`, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(dir) = env::var(ENV_DATA_DIR) {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(mode) = env::var(ENV_WRITE_MODE) {
            cfg.write_mode = WriteMode::parse(&mode)?;
        }
        if let Ok(strict) = env::var(ENV_STRICT) {
            if matches!(strict.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                cfg.strictness = Strictness::Strict;
            }
        }
        Ok(cfg)
    }

    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }
}
