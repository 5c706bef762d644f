//! Derived artifact paths
//!
//! Every auxiliary file of a database is colocated with the main file and
//! derived from its path by suffix, so the whole set shares one directory
//! lifecycle and survives process restarts:
//!
//! ```text
//! data.dura                live database file
//! data.dura-wal            write-ahead log
//! data.dura-shm            shared-memory index
//! data.dura-journal        rollback journal
//! data.dura-first.material first material generation slot
//! data.dura-last.material  last material generation slot
//! data.dura.factory/       deposit archive directory
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const SUFFIX_WAL: &str = "-wal";
pub const SUFFIX_SHM: &str = "-shm";
pub const SUFFIX_JOURNAL: &str = "-journal";
pub const SUFFIX_FIRST_MATERIAL: &str = "-first.material";
pub const SUFFIX_LAST_MATERIAL: &str = "-last.material";
pub const SUFFIX_FACTORY: &str = ".factory";

/// Append a suffix to the full file name of `base`
pub fn derived_path(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
