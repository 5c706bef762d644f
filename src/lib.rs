//! duradb - corruption-resilient backup, deposit and retrieve for an
//! embedded paged table store
//!
//! The live file can become partially unreadable; this crate recovers as
//! much committed data as possible from three redundancy sources: the
//! damaged file itself, rotating material backups, and a deposit archive of
//! frozen full copies.

pub mod autobackup;
pub mod cipher;
pub mod db;
pub mod engine;
pub mod errors;
pub mod factory;
pub mod handle;
pub mod material;
pub mod observe;
pub mod paths;
pub mod retrieve;

pub use autobackup::AutoBackupConfig;
pub use db::{Database, DatabaseConfig};
pub use engine::{Row, Value};
pub use errors::{RepairError, RepairResult};
pub use material::TableFilter;
pub use observe::{NoopObserver, RecordingObserver, TraceObserver};
pub use retrieve::ProgressSink;
