use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use crate::config::WriteMode;
use crate::document::{generate_id, Document, DocumentId};
use crate::error::{Error, Result};

pub const FILE_EXTENSION: &str = "json";

/// Whole-file backing store for one collection.
///
/// The file holds a single pretty-printed JSON array. Every read loads the
/// entire array and every write replaces it. The internal mutex only keeps
/// a single read or write from observing a half-written file within this
/// process; read-modify-write sequences are not serialized.
pub struct CollectionFile {
    name: String,
    path: PathBuf,
    write_mode: WriteMode,
    io: Mutex<()>,
}

impl CollectionFile {
    /// Open `<dir>/<name>.json`, creating it as `[]` if absent.
    pub fn open(name: &str, dir: &Path, write_mode: WriteMode) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.{FILE_EXTENSION}"));

        if !path.exists() {
            fs::write(&path, "[]")?;
            log::info!("created collection '{name}' at {}", path.display());
        }

        Ok(Self {
            name: name.to_string(),
            path,
            write_mode,
            io: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Load every document. A missing, unreadable or malformed file reads as
    /// an empty collection; array elements that are not objects are skipped.
    pub fn read_all(&self) -> Vec<Document> {
        let _guard = self.io.lock().unwrap_or_else(|e| e.into_inner());

        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("collection '{}': read failed, treating as empty: {e}", self.name);
                return Vec::new();
            }
        };

        let items = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => items,
            Ok(_) => {
                log::warn!("collection '{}': backing file is not an array, treating as empty", self.name);
                return Vec::new();
            }
            Err(e) => {
                log::warn!("collection '{}': unparsable backing file, treating as empty: {e}", self.name);
                return Vec::new();
            }
        };

        let total = items.len();
        let docs: Vec<Document> = items
            .into_iter()
            .filter_map(|item| Document::new(item).ok())
            .collect();
        if docs.len() != total {
            log::warn!(
                "collection '{}': skipped {} non-object entries",
                self.name,
                total - docs.len()
            );
        }
        log::debug!("collection '{}': read {} documents", self.name, docs.len());
        docs
    }

    /// Replace the backing file with `docs`. `op` names the calling
    /// operation for error reporting.
    pub fn write_all(&self, docs: &[Document], op: &'static str) -> Result<()> {
        let body = serde_json::to_string_pretty(docs)?;
        let _guard = self.io.lock().unwrap_or_else(|e| e.into_inner());

        let written = match self.write_mode {
            WriteMode::Overwrite => fs::write(&self.path, body.as_bytes()),
            WriteMode::AtomicRename => self.replace_atomically(body.as_bytes()),
        };

        match written {
            Ok(()) => {
                log::debug!("collection '{}': wrote {} documents ({op})", self.name, docs.len());
                Ok(())
            }
            Err(source) => {
                log::error!("collection '{}': {op} failed to write: {source}", self.name);
                Err(Error::Write {
                    collection: self.name.clone(),
                    op,
                    source,
                })
            }
        }
    }

    /// Write to `<name>.json.tmp`, fsync, then rename over the backing file.
    fn replace_atomically(&self, body: &[u8]) -> io::Result<()> {
        let tmp_path = self.path.with_extension(format!("{FILE_EXTENSION}.tmp"));
        let mut file = File::create(&tmp_path)?;
        file.write_all(body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &self.path)
    }

    pub fn new_id(&self) -> DocumentId {
        generate_id()
    }
}
