//! Artifact registry
//!
//! Tracks compiled executables by token. The registry owns the scratch
//! directory the compiler writes into; every record maps one token to one
//! path inside it.

use crate::errors::RegistryError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use sandpit_types::Token;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const EXE_SUFFIX: &str = std::env::consts::EXE_SUFFIX;

/// One reserved or compiled artifact
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Set once the compiler has produced the file at `path`
    pub ready: bool,
}

/// Concurrency-safe map from token to artifact path
#[derive(Debug)]
pub struct ArtifactRegistry {
    scratch_dir: PathBuf,
    records: RwLock<HashMap<Token, ArtifactRecord>>,
}

impl ArtifactRegistry {
    /// Wipe and recreate `scratch_dir`, then return an empty registry.
    ///
    /// Nothing from a previous process survives this call, so tokens handed
    /// out before a restart can never resolve to a stale file.
    pub fn open<P: AsRef<Path>>(scratch_dir: P) -> Result<Self, RegistryError> {
        let scratch_dir = scratch_dir.as_ref().to_path_buf();

        match std::fs::remove_dir_all(&scratch_dir) {
            Ok(()) => log::info!("Removed stale scratch directory {}", scratch_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(RegistryError::WipeScratchDir {
                    path: scratch_dir.display().to_string(),
                    source,
                })
            }
        }

        std::fs::create_dir_all(&scratch_dir).map_err(|source| {
            RegistryError::CreateScratchDir {
                path: scratch_dir.display().to_string(),
                source,
            }
        })?;

        Ok(Self {
            scratch_dir,
            records: RwLock::new(HashMap::new()),
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Reserve a fresh token and the path its artifact will be written to.
    pub fn mint(&self) -> (Token, PathBuf) {
        let mut rng = rand::thread_rng();
        let mut records = self.records.write();
        loop {
            let token = Token::new(rng.gen::<u64>());
            if records.contains_key(&token) {
                log::debug!("Token collision on {}, retrying", token);
                continue;
            }
            let path = self.artifact_path(token);
            records.insert(
                token,
                ArtifactRecord {
                    path: path.clone(),
                    created_at: Utc::now(),
                    ready: false,
                },
            );
            return (token, path);
        }
    }

    /// Path recorded for `token`, whether or not compilation has finished.
    pub fn get(&self, token: Token) -> Option<PathBuf> {
        self.records.read().get(&token).map(|r| r.path.clone())
    }

    /// Full record for `token`.
    pub fn record(&self, token: Token) -> Option<ArtifactRecord> {
        self.records.read().get(&token).cloned()
    }

    /// Confirm the artifact for `token` once it exists on disk.
    ///
    /// Inserts the record if it was dropped in the meantime.
    pub fn set(&self, token: Token, path: PathBuf) {
        let mut records = self.records.write();
        let created_at = records
            .get(&token)
            .map(|r| r.created_at)
            .unwrap_or_else(Utc::now);
        records.insert(
            token,
            ArtifactRecord {
                path,
                created_at,
                ready: true,
            },
        );
    }

    /// Forget `token` without touching the filesystem.
    pub fn delete(&self, token: Token) {
        self.records.write().remove(&token);
    }

    /// Remove `token` and delete its file.
    ///
    /// Returns `false` when the token was already gone, in which case the
    /// filesystem is left alone. The file is removed after the lock is
    /// released.
    pub fn reclaim(&self, token: Token, path: &Path) -> bool {
        if self.records.write().remove(&token).is_none() {
            return false;
        }
        remove_artifact(path);
        true
    }

    /// Take a compiled artifact out of the registry for execution.
    ///
    /// The record is removed in the same critical section as the lookup, so
    /// at most one run can ever obtain a given artifact. Reserved tokens whose
    /// compilation has not finished are left in place.
    pub fn claim(&self, token: Token) -> Option<PathBuf> {
        let mut records = self.records.write();
        match records.get(&token) {
            Some(record) if record.ready => records.remove(&token).map(|r| r.path),
            _ => None,
        }
    }

    /// Delete the file of an artifact previously taken with [`claim`].
    ///
    /// [`claim`]: ArtifactRegistry::claim
    pub fn discard(&self, token: Token, path: &Path) {
        log::debug!("Discarding artifact for token {}", token);
        remove_artifact(path);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn artifact_path(&self, token: Token) -> PathBuf {
        self.scratch_dir
            .join(format!("artifact_{}{}", token, EXE_SUFFIX))
    }
}

/// Delete an artifact file, tolerating one that was never written.
pub(crate) fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("Removed artifact {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::error!("Could not remove artifact {}: {}", path.display(), e),
    }
}
