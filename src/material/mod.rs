//! Material backup manager
//!
//! Produces and reads materials: compact recovery artifacts describing table
//! content, independent of the live file's current health. Materials rotate
//! through two slots (see `slots`), carry their own optional encryption key
//! decoupled from the database's content key, and can be scoped by a
//! per-table inclusion filter.
//!
//! Concurrent backups, a scheduler trigger racing an explicit call,
//! serialize on an internal mutex so they never target the same slot
//! simultaneously.

pub mod format;
pub mod slots;

pub use format::{Material, TableMaterial};
pub use slots::{MaterialSlot, MaterialSlots};

use std::path::Path;
use std::sync::Mutex;

use crate::cipher::{random_salt, Cipher, CipherKey};
use crate::engine::StoreSnapshot;
use crate::errors::RepairResult;
use crate::observe::TraceObserver;

/// Table-inclusion predicate consulted at backup time
pub type TableFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Manager for the two-slot material rotation of one database
pub struct MaterialBackupManager {
    slots: MaterialSlots,
    filter: Mutex<Option<TableFilter>>,
    // Serializes slot selection + write against concurrent backups
    backup_lock: Mutex<()>,
}

impl MaterialBackupManager {
    pub fn for_database(db_path: &Path) -> MaterialBackupManager {
        MaterialBackupManager {
            slots: MaterialSlots::for_database(db_path),
            filter: Mutex::new(None),
            backup_lock: Mutex::new(()),
        }
    }

    pub fn slots(&self) -> &MaterialSlots {
        &self.slots
    }

    /// Install (or clear, with `None`) the table filter consulted by the
    /// next backup. Excluded tables are absent from the material and cannot
    /// be recovered from it.
    pub fn set_filter(&self, filter: Option<TableFilter>) {
        *self.filter.lock().unwrap_or_else(|e| e.into_inner()) = filter;
    }

    /// Write a new material generation from a read-consistent snapshot.
    ///
    /// Targets the slot that is not currently most recent; on any failure
    /// no slot's most-recent marker changes, so previously valid material is
    /// unaffected.
    pub fn backup(
        &self,
        snapshot: &StoreSnapshot,
        key: Option<&CipherKey>,
        observer: &dyn TraceObserver,
    ) -> RepairResult<()> {
        let _serialize = self.backup_lock.lock().unwrap_or_else(|e| e.into_inner());

        let (slot, generation) = self.slots.next_target(key);
        let material = {
            let filter = self.filter.lock().unwrap_or_else(|e| e.into_inner());
            Material::from_snapshot(snapshot, generation, |table| match filter.as_ref() {
                Some(admit) => admit(table),
                None => true,
            })
        };

        let cipher = key.map(|k| Cipher::new(k, random_salt()));
        let bytes = material.encode(cipher.as_ref());
        self.slots.write(slot, &bytes, observer)?;
        observer.repair_event(
            "material_written",
            &format!("generation {} ({} rows)", generation, material.row_count()),
        );
        Ok(())
    }

    /// The most-recently-written valid material, if any.
    ///
    /// A generation that fails validation (wrong key, truncated write,
    /// checksum mismatch) is treated as absent and the other slot is tried
    /// before giving up.
    pub fn read_material(&self, key: Option<&CipherKey>) -> Option<Material> {
        self.slots.newest_valid(key).map(|(_, material)| material)
    }
}
