//! Deposit archive ("factory")
//!
//! A deposit freezes a full-fidelity copy of the live file into a versioned
//! generation under the factory directory, then resets the live tables to
//! empty while keeping schema and auto-increment sequences, so later inserts
//! continue the rowid sequence instead of restarting it.
//!
//! Generations accumulate until explicitly purged; there is no implicit
//! retention limit. Each generation is staged in a hidden directory and
//! renamed into place, so a generation is either complete or invisible.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::engine::TableStore;
use crate::errors::{RepairError, RepairResult};
use crate::observe::TraceObserver;
use crate::paths::{derived_path, SUFFIX_FACTORY};

const MANIFEST_NAME: &str = "manifest.json";
const STAGING_PREFIX: &str = ".staging-";

/// Row and sequence counts of one table at deposit time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableCounts {
    pub name: String,
    pub rows: u64,
    pub next_rowid: i64,
}

/// Manifest written next to the frozen file in each generation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationManifest {
    pub created_at: String,
    pub page_size: u32,
    /// File name of the frozen database copy inside the generation
    pub file_name: String,
    pub tables: Vec<TableCounts>,
}

/// One complete generation on disk
#[derive(Debug, Clone)]
pub struct Generation {
    pub dir: PathBuf,
    pub manifest: GenerationManifest,
}

impl Generation {
    /// Path of the frozen database copy
    pub fn db_file_path(&self) -> PathBuf {
        self.dir.join(&self.manifest.file_name)
    }
}

/// The deposit archive of one database
pub struct DepositFactory {
    dir: PathBuf,
}

impl DepositFactory {
    pub fn for_database(db_path: &Path) -> DepositFactory {
        DepositFactory {
            dir: derived_path(db_path, SUFFIX_FACTORY),
        }
    }

    /// The factory directory path
    pub fn factory_path(&self) -> &Path {
        &self.dir
    }

    /// Freeze the live file into a new generation and reset the live tables.
    ///
    /// All-or-nothing: an error at any step leaves both the live file and
    /// the archive unchanged (a partially staged generation is removed).
    pub fn deposit(
        &self,
        store: &mut TableStore,
        observer: &dyn TraceObserver,
    ) -> RepairResult<()> {
        // Make sure the on-disk file matches the state being frozen
        store.persist()?;

        let file_name = store
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RepairError::Corrupt("database path has no file name".to_string()))?
            .to_string();

        let name = self.next_generation_name();
        let staging = self.dir.join(format!("{}{}", STAGING_PREFIX, name));
        let generation_dir = self.dir.join(&name);

        let stage = || -> RepairResult<()> {
            fs::create_dir_all(&staging).map_err(|e| RepairError::io_at(&staging, e))?;

            let frozen = staging.join(&file_name);
            fs::copy(store.path(), &frozen).map_err(|e| RepairError::io_at(&frozen, e))?;
            observer.file_operation("copy", &frozen);

            let manifest = GenerationManifest {
                created_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                page_size: store.page_size() as u32,
                file_name: file_name.clone(),
                tables: store
                    .catalog()
                    .tables
                    .iter()
                    .map(|t| TableCounts {
                        name: t.name.clone(),
                        rows: store.row_count(&t.name).unwrap_or(0) as u64,
                        next_rowid: t.next_rowid,
                    })
                    .collect(),
            };
            let manifest_path = staging.join(MANIFEST_NAME);
            let json = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| RepairError::Corrupt(format!("manifest serialization: {}", e)))?;
            fs::write(&manifest_path, json).map_err(|e| RepairError::io_at(&manifest_path, e))?;

            sync_dir_contents(&staging)?;
            fs::rename(&staging, &generation_dir)
                .map_err(|e| RepairError::io_at(&generation_dir, e))?;
            sync_dir(&self.dir)?;
            Ok(())
        };

        if let Err(e) = stage() {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        observer.file_operation("rename", &generation_dir);

        // Reset live tables; sequences keep counting
        let before = store.snapshot();
        store.truncate_all_tables();
        if let Err(e) = store.persist() {
            // Undo the in-memory truncation and drop the new generation so
            // caller-visible state is exactly as before the call
            for (schema, rows) in before.tables() {
                for row in rows {
                    let _ = store.insert_with_rowid(&schema.name, row.rowid, row.values.to_vec());
                }
            }
            let _ = fs::remove_dir_all(&generation_dir);
            return Err(e.into());
        }

        observer.repair_event("deposit", &name);
        Ok(())
    }

    /// True when at least one complete generation exists
    pub fn contains_deposited_files(&self) -> bool {
        !self.generations().is_empty()
    }

    /// Remove the whole archive directory. Idempotent: purging an absent or
    /// empty archive is not an error.
    pub fn remove_deposited_files(&self, observer: &dyn TraceObserver) -> RepairResult<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(|e| RepairError::io_at(&self.dir, e))?;
            observer.file_operation("remove", &self.dir);
        }
        Ok(())
    }

    /// All complete generations, oldest first
    pub fn generations(&self) -> Vec<Generation> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut generations = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            let name = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if !dir.is_dir() || name.starts_with('.') {
                continue;
            }
            let manifest_path = dir.join(MANIFEST_NAME);
            let manifest: GenerationManifest = match fs::read(&manifest_path)
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            {
                Some(manifest) => manifest,
                None => continue,
            };
            let generation = Generation { dir, manifest };
            if generation.db_file_path().exists() {
                generations.push(generation);
            }
        }
        generations.sort_by(|a, b| a.dir.file_name().cmp(&b.dir.file_name()));
        generations
    }

    /// The most recent complete generation, if any
    pub fn newest_generation(&self) -> Option<Generation> {
        self.generations().pop()
    }

    fn next_generation_name(&self) -> String {
        let base = Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();
        let mut name = base.clone();
        let mut seq = 1;
        while self.dir.join(&name).exists() {
            name = format!("{}-{}", base, seq);
            seq += 1;
        }
        name
    }
}

fn sync_dir(dir: &Path) -> RepairResult<()> {
    let handle = File::open(dir).map_err(|e| RepairError::io_at(dir, e))?;
    handle.sync_all().map_err(|e| RepairError::io_at(dir, e))
}

fn sync_dir_contents(dir: &Path) -> RepairResult<()> {
    let entries = fs::read_dir(dir).map_err(|e| RepairError::io_at(dir, e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            let file = File::open(&path).map_err(|e| RepairError::io_at(&path, e))?;
            file.sync_all().map_err(|e| RepairError::io_at(&path, e))?;
        }
    }
    sync_dir(dir)
}
