//! Backup rotation and deposit archive behavior
//!
//! Covers the two-slot material rotation (alternation, logical equality of
//! consecutive backups, filter scoping) and the deposit lifecycle
//! (sequence continuity, accumulation, idempotent purge) through the
//! public facade.

use duradb::material::{MaterialSlot, MaterialSlots};
use duradb::{Database, DatabaseConfig, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn open_db(path: &Path) -> Database {
    Database::open(path, DatabaseConfig::default()).expect("open database")
}

fn seeded_db(path: &Path) -> Database {
    let db = open_db(path);
    db.create_table("objects", &["name"]).unwrap();
    db.insert("objects", vec![text("object1")]).unwrap();
    db.insert("objects", vec![text("object2")]).unwrap();
    db
}

// =============================================================================
// Material rotation
// =============================================================================

/// Two consecutive backups of identical data land in alternating slots with
/// equal logical content.
#[test]
fn test_consecutive_backups_alternate_slots_with_equal_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.dura");
    let db = seeded_db(&path);
    let slots = MaterialSlots::for_database(&path);

    db.backup(None).unwrap();
    let (first_slot, first) = slots.newest_valid(None).expect("first material");
    assert_eq!(first_slot, MaterialSlot::First);
    assert_eq!(first.generation, 1);

    db.backup(None).unwrap();
    let (second_slot, second) = slots.newest_valid(None).expect("second material");
    assert_eq!(second_slot, MaterialSlot::Last);
    assert_eq!(second.generation, 2);

    // No writes in between: logical content is identical
    assert_eq!(first.tables.len(), second.tables.len());
    for (a, b) in first.tables.iter().zip(second.tables.iter()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.columns, b.columns);
        assert_eq!(a.next_rowid, b.next_rowid);
        assert_eq!(a.rows, b.rows);
    }

    assert!(db.first_material_path().exists());
    assert!(db.last_material_path().exists());
}

/// An exclude-all filter yields a strictly smaller material than an
/// unfiltered backup of the same data, and the excluded table cannot be
/// recovered from it.
#[test]
fn test_exclude_all_filter_shrinks_material() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.dura");
    let db = seeded_db(&path);

    db.backup(None).unwrap();
    let unfiltered = fs::metadata(db.first_material_path()).unwrap().len();

    db.filter_backup(Some(Box::new(|_| false)));
    db.backup(None).unwrap();
    let filtered = fs::metadata(db.last_material_path()).unwrap().len();

    assert!(filtered < unfiltered);

    let slots = MaterialSlots::for_database(&path);
    let (_, material) = slots.newest_valid(None).unwrap();
    assert!(material.tables.is_empty());
}

/// A material written under a key is unreadable without it and readable
/// with it.
#[test]
fn test_material_key_is_independent_of_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.dura");
    let db = seeded_db(&path);

    db.backup(Some(b"escrow key")).unwrap();

    let slots = MaterialSlots::for_database(&path);
    assert!(slots.newest_valid(None).is_none());
    let key = duradb::cipher::CipherKey::new(b"escrow key");
    assert!(slots.newest_valid(Some(&key)).is_some());
}

/// With auto-backup enabled, write activity alone eventually produces a
/// material.
#[test]
fn test_auto_backup_triggers_on_write_activity() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.dura");
    let db = seeded_db(&path);
    let slots = MaterialSlots::for_database(&path);

    db.set_auto_backup(true, Some(std::time::Duration::from_millis(10)));
    db.insert("objects", vec![text("object3")]).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while slots.newest_valid(None).is_none() {
        assert!(
            std::time::Instant::now() < deadline,
            "auto backup never fired"
        );
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    db.set_auto_backup(false, None);
    db.close();
}

// =============================================================================
// Deposit lifecycle
// =============================================================================

/// Each deposit freezes a generation, empties the live tables and keeps the
/// rowid sequence moving forward.
#[test]
fn test_deposits_accumulate_and_sequence_continues() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.dura");
    let db = seeded_db(&path);

    db.deposit().unwrap();
    assert_eq!(db.row_count("objects").unwrap(), 0);
    assert_eq!(db.insert("objects", vec![text("object3")]).unwrap(), 3);

    db.deposit().unwrap();
    assert_eq!(db.insert("objects", vec![text("object4")]).unwrap(), 4);

    // Two frozen generations plus the live file
    let entries = fs::read_dir(db.factory_path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .count();
    assert_eq!(entries, 2);
}

/// Purging the archive is idempotent and removes the directory itself.
#[test]
fn test_remove_deposited_files_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.dura");
    let db = seeded_db(&path);

    assert!(!db.contains_deposited_files());
    db.remove_deposited_files().unwrap();

    db.deposit().unwrap();
    assert!(db.contains_deposited_files());

    db.remove_deposited_files().unwrap();
    assert!(!db.contains_deposited_files());
    assert!(!db.factory_path().exists());

    db.remove_deposited_files().unwrap();
}
