use std::collections::HashMap;
use std::fs;
use std::sync::{PoisonError, RwLock};

use crate::collection::Collection;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::storage::{CollectionFile, FILE_EXTENSION};

/// A data directory holding one JSON file per collection.
pub struct Store {
    config: StoreConfig,
    collections: RwLock<HashMap<String, Collection>>,
}

impl Store {
    /// Open or create a store at `config.data_dir`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        log::debug!("opened store at {}", config.data_dir.display());
        Ok(Self {
            config,
            collections: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Handle to the named collection, creating its backing file on first
    /// access. Handles for the same name share one backing file.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        validate_name(name)?;

        // Fast path: read lock only
        {
            let cols = self.collections.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(col) = cols.get(name) {
                return Ok(col.clone());
            }
        }

        let mut cols = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(col) = cols.get(name) {
            return Ok(col.clone());
        }
        let file = CollectionFile::open(name, &self.config.data_dir, self.config.write_mode)?;
        let col = Collection::new(file, self.config.strictness);
        cols.insert(name.to_string(), col.clone());
        Ok(col)
    }

    /// Names of every collection with a backing file, sorted.
    pub fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.data_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(Error::InvalidCollectionName(name.to_string()));
    }
    Ok(())
}
