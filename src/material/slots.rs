//! Dual-slot material rotation
//!
//! Two material slots exist on disk, "first" and "last", written
//! alternately. A backup always targets the slot that is NOT the current
//! most-recent one, so a crash mid-write can destroy at most one generation
//! while the other stays valid.
//!
//! "Most recent" is the embedded generation counter of whichever slot
//! validates; the marker only advances via the atomic rename at the end of a
//! fully written, fsynced temp file. A torn write leaves a file that fails
//! validation and is simply not the most recent.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::cipher::CipherKey;
use crate::errors::{RepairError, RepairResult};
use crate::observe::TraceObserver;
use crate::paths::{derived_path, SUFFIX_FIRST_MATERIAL, SUFFIX_LAST_MATERIAL};

use super::format::Material;

/// The two rotation slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialSlot {
    First,
    Last,
}

impl MaterialSlot {
    pub fn other(self) -> MaterialSlot {
        match self {
            MaterialSlot::First => MaterialSlot::Last,
            MaterialSlot::Last => MaterialSlot::First,
        }
    }
}

/// The pair of slot paths derived from a database path
#[derive(Debug, Clone)]
pub struct MaterialSlots {
    first: PathBuf,
    last: PathBuf,
}

impl MaterialSlots {
    pub fn for_database(db_path: &Path) -> MaterialSlots {
        MaterialSlots {
            first: derived_path(db_path, SUFFIX_FIRST_MATERIAL),
            last: derived_path(db_path, SUFFIX_LAST_MATERIAL),
        }
    }

    pub fn slot_path(&self, slot: MaterialSlot) -> &Path {
        match slot {
            MaterialSlot::First => &self.first,
            MaterialSlot::Last => &self.last,
        }
    }

    /// The newest slot that validates with `key`, if any.
    ///
    /// A slot that is missing, truncated, checksum-damaged or keyed
    /// differently is treated as absent and the other slot is tried.
    pub fn newest_valid(&self, key: Option<&CipherKey>) -> Option<(MaterialSlot, Material)> {
        let mut newest: Option<(MaterialSlot, Material)> = None;
        for slot in [MaterialSlot::First, MaterialSlot::Last] {
            if let Ok(material) = Material::read_from(self.slot_path(slot), key) {
                let replace = match &newest {
                    Some((_, current)) => material.generation > current.generation,
                    None => true,
                };
                if replace {
                    newest = Some((slot, material));
                }
            }
        }
        newest
    }

    /// The slot and generation counter the next backup must use
    pub fn next_target(&self, key: Option<&CipherKey>) -> (MaterialSlot, u64) {
        match self.newest_valid(key) {
            Some((slot, material)) => (slot.other(), material.generation + 1),
            None => (MaterialSlot::First, 1),
        }
    }

    /// Durably write serialized material bytes into a slot.
    ///
    /// Writes a temp sibling, fsyncs it, renames it over the slot, then
    /// fsyncs the directory. On error the slot keeps its previous content.
    pub fn write(
        &self,
        slot: MaterialSlot,
        bytes: &[u8],
        observer: &dyn TraceObserver,
    ) -> RepairResult<()> {
        use std::io::Write;

        let target = self.slot_path(slot);
        let temp = derived_path(target, ".saving");

        let result = (|| -> RepairResult<()> {
            let mut file = File::create(&temp).map_err(|e| RepairError::io_at(&temp, e))?;
            file.write_all(bytes).map_err(|e| RepairError::io_at(&temp, e))?;
            file.sync_all().map_err(|e| RepairError::io_at(&temp, e))?;
            fs::rename(&temp, target).map_err(|e| RepairError::io_at(target, e))?;
            if let Some(parent) = target.parent() {
                let dir = File::open(parent).map_err(|e| RepairError::io_at(parent, e))?;
                dir.sync_all().map_err(|e| RepairError::io_at(parent, e))?;
            }
            Ok(())
        })();

        match &result {
            Ok(()) => observer.file_operation("rename", target),
            Err(_) => {
                // Leave no temp behind after a failed write
                let _ = fs::remove_file(&temp);
            }
        }
        result
    }
}
