//! File-backed node store.
//!
//! Each pool is one JSON document `<root>/<pool>.json` holding the stored
//! version next to the state. Writes go to a temporary file that is renamed
//! over the document, so a crash leaves either the old or the new version.
//! Deleting a pool leaves `<root>/<pool>.retired` with its last version so a
//! recreated pool never reuses one.
//! Compare-and-swap is atomic within one process; several processes sharing a
//! directory are not coordinated.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{NodeStore, SchedulerError, Versioned};
use crate::util::serde::PoolId;

const EXTENSION: &str = "json";
const RETIRED: &str = "retired";

#[derive(Serialize, Deserialize)]
struct Document {
    version: u64,
    state: serde_json::Value,
}

/// Node store keeping one JSON file per pool under a root directory.
#[derive(Debug, Clone)]
pub struct FileNodeStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

fn backend(err: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Backend(err.to_string())
}

impl FileNodeStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(backend)?;
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Directory holding the pool documents.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, pool: &str) -> Result<PathBuf, SchedulerError> {
        let valid = !pool.is_empty()
            && !pool.starts_with('.')
            && pool
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(SchedulerError::InvalidRequest(format!(
                "pool id {pool:?} cannot be used as a file name"
            )));
        }
        Ok(self.root.join(format!("{pool}.{EXTENSION}")))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T, SchedulerError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(backend)?
    }
}

fn read_document(path: &Path) -> Result<Option<Versioned>, SchedulerError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(backend(err)),
    };
    let doc: Document = serde_json::from_slice(&bytes)?;
    Ok(Some(Versioned {
        version: doc.version,
        blob: serde_json::to_vec(&doc.state)?,
    }))
}

fn read_retired(path: &Path) -> Result<Option<u64>, SchedulerError> {
    match fs::read(path.with_extension(RETIRED)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(backend(err)),
    }
}

fn replace_file<T: Serialize>(path: &Path, value: &T) -> Result<(), SchedulerError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file = File::create(&tmp).map_err(backend)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.flush().map_err(backend)?;
    file.sync_all().map_err(backend)?;
    fs::rename(&tmp, path).map_err(backend)
}

fn write_document(path: &Path, version: u64, blob: &[u8]) -> Result<(), SchedulerError> {
    let doc = Document {
        version,
        state: serde_json::from_slice(blob)?,
    };
    replace_file(path, &doc)
}

#[async_trait]
impl NodeStore for FileNodeStore {
    async fn load(&self, pool: &str) -> Result<Option<Versioned>, SchedulerError> {
        let path = self.path_for(pool)?;
        self.blocking(move |_| read_document(&path)).await
    }

    async fn compare_and_swap(
        &self,
        pool: &str,
        expected: Option<u64>,
        blob: Vec<u8>,
    ) -> Result<u64, SchedulerError> {
        let path = self.path_for(pool)?;
        let pool = pool.to_string();
        self.blocking(move |store| {
            let _guard = store.write_lock.lock();
            let found = read_document(&path)?.map(|d| d.version);
            if found != expected {
                return Err(SchedulerError::Conflict {
                    pool,
                    expected,
                    found,
                });
            }
            let previous = match found {
                Some(v) => Some(v),
                None => read_retired(&path)?,
            };
            let version = previous.map_or(1, |v| v + 1);
            write_document(&path, version, &blob)?;
            Ok(version)
        })
        .await
    }

    async fn delete(&self, pool: &str) -> Result<bool, SchedulerError> {
        let path = self.path_for(pool)?;
        self.blocking(move |store| {
            let _guard = store.write_lock.lock();
            let Some(doc) = read_document(&path)? else {
                return Ok(false);
            };
            replace_file(&path.with_extension(RETIRED), &doc.version)?;
            fs::remove_file(&path).map_err(backend)?;
            Ok(true)
        })
        .await
    }

    async fn list_pools(&self) -> Result<Vec<PoolId>, SchedulerError> {
        self.blocking(|store| {
            let mut pools = Vec::new();
            for entry in fs::read_dir(&store.root).map_err(backend)? {
                let path = entry.map_err(backend)?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    pools.push(stem.to_string());
                }
            }
            pools.sort();
            Ok(pools)
        })
        .await
    }
}
