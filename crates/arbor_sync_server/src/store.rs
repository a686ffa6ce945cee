//! Filesystem persistence for document state.
//!
//! Layout under the data directory:
//!
//! ```text
//! data/
//! ├── workspaces/global.bin
//! ├── documents/<uuid>.bin
//! └── calendar-archive/<year>-<month>.bin
//! ```
//!
//! Each file is the full yrs state of one document; saves overwrite. Saving
//! the global document also prunes page files whose node no longer exists in
//! the workspace tree, so deleting a page eventually reclaims its file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use arbor_core::crdt::{DocStorage, DocumentId, ReplicaDoc, TreeCrdt};
use arbor_core::error::{ArborError, Result};
use yrs::{Any, Map, Transact};

const WORKSPACES_DIR: &str = "workspaces";
const DOCUMENTS_DIR: &str = "documents";
const CALENDAR_DIR: &str = "calendar-archive";

/// Storage backend writing one state file per document.
#[derive(Debug)]
pub struct FileStore {
    base: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `base`, creating the subdirectories.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        for dir in [WORKSPACES_DIR, DOCUMENTS_DIR, CALENDAR_DIR] {
            fs::create_dir_all(base.join(dir))?;
        }
        Ok(Self { base })
    }

    fn path_for(&self, id: &DocumentId) -> PathBuf {
        match id {
            DocumentId::Global => self.base.join(WORKSPACES_DIR).join("global.bin"),
            DocumentId::Page(uuid) => self.base.join(DOCUMENTS_DIR).join(format!("{}.bin", uuid)),
            DocumentId::CalendarArchive { year, month } => self
                .base
                .join(CALENDAR_DIR)
                .join(format!("{}-{}.bin", year, month)),
        }
    }

    /// Delete page files whose node is no longer present in the tree.
    fn prune_pages(&self, tree: &TreeCrdt) -> Result<()> {
        let dir = self.base.join(DOCUMENTS_DIR);
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            // Only files named by a page UUID are candidates.
            if uuid::Uuid::parse_str(stem).is_err() {
                continue;
            }
            if !tree.contains(stem) {
                tracing::info!("pruning deleted page file {:?}", path);
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!("failed to prune {:?}: {}", path, e);
                }
            }
        }
        Ok(())
    }
}

impl DocStorage for FileStore {
    fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArborError::storage(id.to_string(), e.to_string())),
        }
    }

    fn save(&self, id: &DocumentId, state: &[u8]) -> Result<()> {
        fs::write(self.path_for(id), state)
            .map_err(|e| ArborError::storage(id.to_string(), e.to_string()))?;

        if *id == DocumentId::Global {
            let tree = TreeCrdt::from_state(state)?;
            self.prune_pages(&tree)?;
        }
        Ok(())
    }

    fn create_initial(&self, id: &DocumentId, replica: &ReplicaDoc) -> Result<()> {
        // Fresh calendar archives carry a meta map identifying the bucket.
        if let DocumentId::CalendarArchive { year, month } = id {
            let meta = replica.doc().get_or_insert_map("meta");
            let mut txn = replica.doc().transact_mut();
            meta.insert(&mut txn, "year", Any::BigInt(i64::from(*year)));
            meta.insert(&mut txn, "month", Any::BigInt(i64::from(*month)));
            meta.insert(
                &mut txn,
                "createdAt",
                Any::from(chrono::Utc::now().to_rfc3339()),
            );
            meta.insert(&mut txn, "version", Any::BigInt(1));
        }
        Ok(())
    }
}

/// The base directory this store writes under.
impl AsRef<Path> for FileStore {
    fn as_ref(&self) -> &Path {
        &self.base
    }
}
