//! Persisted mapping from project name to [`Project`] record.
//!
//! The store lives in a single pretty-printed JSON document. Every mutation
//! re-reads the document, applies one record change, writes a uniquely named
//! temporary file and renames it over the store, so neither an interrupted
//! write nor a concurrent invocation leaves a truncated document behind. The
//! previous version is kept alongside as a backup, replaced the same way.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::project::Project;

/// File holding the store document.
pub const STORE_FILE_NAME: &str = "projects.json";
/// Copy of the previous store document.
pub const BACKUP_FILE_NAME: &str = "projects.json.backup";
/// Number of destroyed records retained for auditing.
pub const TOMBSTONE_LIMIT: usize = 50;

#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Errors raised while reading or writing the project store.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the store document is not valid JSON of the expected
    /// shape.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the document cannot be rendered.
    #[error("failed to serialise project store: {0}")]
    Serialise(String),
}

/// Audit record kept after a project has been destroyed.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Tombstone {
    /// Name the project was stored under.
    pub name: String,
    /// Instance the provider confirmed as deleted, if one existed.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Time the deletion was confirmed.
    pub destroyed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct StoreDocument {
    #[serde(default)]
    projects: BTreeMap<String, Project>,
    #[serde(default)]
    destroyed: Vec<Tombstone>,
}

/// File-backed project store rooted at a state directory.
#[derive(Clone, Debug)]
pub struct ProjectStore {
    root: Utf8PathBuf,
}

impl ProjectStore {
    /// Opens the store under `root`, creating the directory with owner-only
    /// permissions when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be created or its
    /// permissions cannot be tightened.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        Dir::create_ambient_dir_all(&store.root, ambient_authority())
            .map_err(|err| io_error(&store.root, &err))?;
        #[cfg(unix)]
        {
            let dir = store.open_dir()?;
            restrict_mode(&dir, ".", DIR_MODE).map_err(|err| io_error(&store.root, &err))?;
        }
        Ok(store)
    }

    /// Returns the state directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns the path of the store document.
    #[must_use]
    pub fn path(&self) -> Utf8PathBuf {
        self.root.join(STORE_FILE_NAME)
    }

    /// Looks up a live project by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document cannot be read.
    pub fn get(&self, name: &str) -> Result<Option<Project>, StoreError> {
        Ok(self.load()?.projects.remove(name))
    }

    /// Lists live projects sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document cannot be read.
    pub fn list(&self) -> Result<Vec<Project>, StoreError> {
        Ok(self.load()?.projects.into_values().collect())
    }

    /// Inserts or replaces the record keyed by `project.name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document cannot be read or written.
    pub fn upsert(&self, project: &Project) -> Result<(), StoreError> {
        let mut document = self.load()?;
        document
            .projects
            .insert(project.name.clone(), project.clone());
        self.save(&document)
    }

    /// Removes a live project after confirmed deletion and records a
    /// tombstone for it. Returns the removed record, if there was one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document cannot be read or written.
    pub fn remove(
        &self,
        name: &str,
        destroyed_at: DateTime<Utc>,
    ) -> Result<Option<Project>, StoreError> {
        let mut document = self.load()?;
        let Some(removed) = document.projects.remove(name) else {
            return Ok(None);
        };
        document.destroyed.push(Tombstone {
            name: removed.name.clone(),
            instance_id: removed.instance_id.clone(),
            destroyed_at,
        });
        let excess = document.destroyed.len().saturating_sub(TOMBSTONE_LIMIT);
        document.destroyed.drain(..excess);
        self.save(&document)?;
        Ok(Some(removed))
    }

    /// Returns the most recent tombstone recorded for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document cannot be read.
    pub fn tombstone(&self, name: &str) -> Result<Option<Tombstone>, StoreError> {
        Ok(self
            .load()?
            .destroyed
            .into_iter()
            .rev()
            .find(|entry| entry.name == name))
    }

    /// Returns all retained tombstones, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document cannot be read.
    pub fn tombstones(&self) -> Result<Vec<Tombstone>, StoreError> {
        Ok(self.load()?.destroyed)
    }

    fn load(&self) -> Result<StoreDocument, StoreError> {
        let dir = self.open_dir()?;
        let path = self.path();
        let exists = dir
            .try_exists(STORE_FILE_NAME)
            .map_err(|err| io_error(&path, &err))?;
        if !exists {
            return Ok(StoreDocument::default());
        }
        let contents = dir
            .read_to_string(STORE_FILE_NAME)
            .map_err(|err| io_error(&path, &err))?;
        if contents.trim().is_empty() {
            return Ok(StoreDocument::default());
        }
        serde_json::from_str(&contents).map_err(|err| StoreError::Parse {
            path,
            message: err.to_string(),
        })
    }

    fn save(&self, document: &StoreDocument) -> Result<(), StoreError> {
        let dir = self.open_dir()?;
        let mut rendered = serde_json::to_string_pretty(document)
            .map_err(|err| StoreError::Serialise(err.to_string()))?;
        rendered.push('\n');

        let path = self.path();
        if dir
            .try_exists(STORE_FILE_NAME)
            .map_err(|err| io_error(&path, &err))?
        {
            let previous = dir
                .read(STORE_FILE_NAME)
                .map_err(|err| io_error(&path, &err))?;
            self.replace(&dir, BACKUP_FILE_NAME, &previous)?;
        }
        self.replace(&dir, STORE_FILE_NAME, rendered.as_bytes())
    }

    /// Writes `contents` to a fresh temporary file and renames it over
    /// `target`. The temporary file is removed when any step fails.
    fn replace(&self, dir: &Dir, target: &str, contents: &[u8]) -> Result<(), StoreError> {
        let temp_name = format!("{target}.{}.tmp", Uuid::new_v4().simple());
        let temp_path = self.root.join(&temp_name);
        let written = dir
            .write(&temp_name, contents)
            .and_then(|()| restrict_file(dir, &temp_name))
            .map_err(|err| io_error(&temp_path, &err))
            .and_then(|()| {
                dir.rename(&temp_name, dir, target)
                    .map_err(|err| io_error(&self.root.join(target), &err))
            });
        if written.is_err() {
            dir.remove_file(&temp_name).ok();
        }
        written
    }

    fn open_dir(&self) -> Result<Dir, StoreError> {
        Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| io_error(&self.root, &err))
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(unix)]
fn restrict_mode(dir: &Dir, path: &str, mode: u32) -> io::Result<()> {
    use cap_std::fs::{Permissions, PermissionsExt};

    dir.set_permissions(path, Permissions::from_mode(mode))
}

#[cfg(unix)]
fn restrict_file(dir: &Dir, path: &str) -> io::Result<()> {
    restrict_mode(dir, path, FILE_MODE)
}

#[cfg(not(unix))]
const fn restrict_file(_dir: &Dir, _path: &str) -> io::Result<()> {
    Ok(())
}
