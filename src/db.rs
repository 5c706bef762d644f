//! Database facade
//!
//! Ties the engine, the handle pool and the repair subsystem together
//! behind one handle per database file:
//!
//! - ordinary reads and writes go through the bounded handle pool,
//! - `backup` / `filter_backup` / `set_auto_backup` drive the material
//!   rotation,
//! - `deposit` / `contains_deposited_files` / `remove_deposited_files`
//!   drive the archive factory,
//! - `retrieve` / `recover` rebuild a healthy file from whatever survives.
//!
//! All sibling artifacts (wal, shm, journal, the two material slots, the
//! factory directory) are colocated with the main file and derived from its
//! path by suffix.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::autobackup::{AutoBackupConfig, AutoBackupScheduler, BackupContext, CheckpointSignalHub};
use crate::cipher::CipherKey;
use crate::engine::page::{Header, HEADER_TOTAL_LEN, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::engine::{EngineError, Row, TableStore, Value, DEFAULT_PAGE_SIZE};
use crate::errors::RepairResult;
use crate::factory::DepositFactory;
use crate::handle::HandlePool;
use crate::material::{MaterialBackupManager, MaterialSlots, TableFilter};
use crate::observe::{NoopObserver, TraceObserver};
use crate::paths::{
    derived_path, SUFFIX_FACTORY, SUFFIX_FIRST_MATERIAL, SUFFIX_JOURNAL, SUFFIX_LAST_MATERIAL,
    SUFFIX_SHM, SUFFIX_WAL,
};
use crate::retrieve::{run_retrieve, ProgressSink, RetrieveContext};

/// Open-time configuration for one database
pub struct DatabaseConfig {
    /// Page size for newly created files; existing files keep their own
    pub page_size: usize,
    /// Upper bound on concurrently held handles
    pub handle_capacity: usize,
    /// Content-encryption key for the live file
    pub content_key: Option<CipherKey>,
    /// Key for material artifacts; defaults to the content key when unset
    pub material_key: Option<CipherKey>,
    pub auto_backup: AutoBackupConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            page_size: DEFAULT_PAGE_SIZE,
            handle_capacity: 8,
            content_key: None,
            material_key: None,
            auto_backup: AutoBackupConfig::default(),
        }
    }
}

impl DatabaseConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_content_key(mut self, raw: &[u8]) -> Self {
        self.content_key = Some(CipherKey::new(raw));
        self
    }

    /// Escrow the material under its own key, decoupled from the content key
    pub fn with_material_key(mut self, raw: &[u8]) -> Self {
        self.material_key = Some(CipherKey::new(raw));
        self
    }
}

/// One open database file plus its repair machinery
pub struct Database {
    path: PathBuf,
    page_size: usize,
    content_key: Option<CipherKey>,
    material_key: Option<CipherKey>,
    pool: Arc<HandlePool>,
    material: Arc<MaterialBackupManager>,
    factory: DepositFactory,
    hub: Arc<CheckpointSignalHub>,
    scheduler: AutoBackupScheduler,
    observer: Arc<dyn TraceObserver>,
}

impl Database {
    /// Open or create the database at `path`
    pub fn open(path: &Path, config: DatabaseConfig) -> RepairResult<Database> {
        Database::open_with_observer(path, config, Arc::new(NoopObserver))
    }

    pub fn open_with_observer(
        path: &Path,
        config: DatabaseConfig,
        observer: Arc<dyn TraceObserver>,
    ) -> RepairResult<Database> {
        let mut store = if path.exists() {
            TableStore::open(path, config.content_key.as_ref())?
        } else {
            TableStore::create(path, config.page_size, config.content_key.as_ref())?
        };
        let page_size = store.page_size();

        let hub = Arc::new(CheckpointSignalHub::new());
        install_hook(&mut store, &hub);

        let pool = Arc::new(HandlePool::new(store, config.handle_capacity));
        let material = Arc::new(MaterialBackupManager::for_database(path));
        let material_key = config
            .material_key
            .clone()
            .or_else(|| config.content_key.clone());

        let ctx = BackupContext {
            pool: Arc::clone(&pool),
            material: Arc::clone(&material),
            material_key: material_key.clone(),
            observer: Arc::clone(&observer),
        };
        let scheduler = AutoBackupScheduler::new(Arc::clone(&hub), ctx, config.auto_backup);

        Ok(Database {
            path: path.to_path_buf(),
            page_size,
            content_key: config.content_key,
            material_key,
            pool: Arc::clone(&pool),
            material,
            factory: DepositFactory::for_database(path),
            hub,
            scheduler,
            observer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    // Derived sibling paths

    pub fn wal_path(&self) -> PathBuf {
        derived_path(&self.path, SUFFIX_WAL)
    }

    pub fn shm_path(&self) -> PathBuf {
        derived_path(&self.path, SUFFIX_SHM)
    }

    pub fn journal_path(&self) -> PathBuf {
        derived_path(&self.path, SUFFIX_JOURNAL)
    }

    pub fn first_material_path(&self) -> PathBuf {
        derived_path(&self.path, SUFFIX_FIRST_MATERIAL)
    }

    pub fn last_material_path(&self) -> PathBuf {
        derived_path(&self.path, SUFFIX_LAST_MATERIAL)
    }

    pub fn factory_path(&self) -> PathBuf {
        derived_path(&self.path, SUFFIX_FACTORY)
    }

    // Ordinary table traffic, through the pool

    pub fn create_table(&self, name: &str, columns: &[&str]) -> RepairResult<()> {
        let handle = self.pool.acquire();
        let mut store = handle.write();
        store.create_table(name, columns)?;
        store.persist()?;
        Ok(())
    }

    pub fn insert(&self, table: &str, values: Vec<Value>) -> RepairResult<i64> {
        let handle = self.pool.acquire();
        let mut store = handle.write();
        let rowid = store.insert(table, values)?;
        store.persist()?;
        Ok(rowid)
    }

    pub fn scan(&self, table: &str) -> RepairResult<Vec<Row>> {
        let handle = self.pool.acquire();
        let store = handle.read();
        Ok(store.scan(table)?)
    }

    pub fn row_count(&self, table: &str) -> RepairResult<usize> {
        let handle = self.pool.acquire();
        let store = handle.read();
        Ok(store.row_count(table)?)
    }

    // Material backups

    /// Write a material backup now. `key` overrides the configured material
    /// key for this call; `None` uses the configured default.
    pub fn backup(&self, key: Option<&[u8]>) -> RepairResult<()> {
        let explicit = key.map(CipherKey::new);
        let effective = explicit.as_ref().or(self.material_key.as_ref());

        let snapshot = {
            let handle = self.pool.acquire();
            let store = handle.read();
            store.snapshot()
        };
        self.material
            .backup(&snapshot, effective, self.observer.as_ref())
    }

    /// Install the table-inclusion predicate consulted by the next backup
    pub fn filter_backup(&self, filter: Option<TableFilter>) {
        self.material.set_filter(filter);
    }

    /// Enable or disable debounced automatic backups on checkpoint activity
    pub fn set_auto_backup(&self, enabled: bool, debounce: Option<Duration>) {
        self.scheduler.set_auto_backup(enabled, debounce);
    }

    // Deposit archive

    /// Freeze the current file into a new archive generation and reset the
    /// live tables, keeping schemas and rowid sequences
    pub fn deposit(&self) -> RepairResult<()> {
        let handle = self.pool.acquire();
        let mut store = handle.write();
        self.factory.deposit(&mut store, self.observer.as_ref())
    }

    pub fn contains_deposited_files(&self) -> bool {
        self.factory.contains_deposited_files()
    }

    pub fn remove_deposited_files(&self) -> RepairResult<()> {
        self.factory.remove_deposited_files(self.observer.as_ref())
    }

    // Recovery

    /// Rebuild this database in place from whatever survives of the live
    /// file, the material slots and the deposit archive.
    ///
    /// Returns the completeness score in [0, 1]; data-level corruption never
    /// makes this fail.
    pub fn retrieve(&self, on_progress: ProgressSink<'_>) -> RepairResult<f64> {
        let ctx = RetrieveContext {
            source: &self.path,
            destination: &self.path,
            source_page_size: self.page_size,
            destination_page_size: self.page_size,
            content_key: self.content_key.as_ref(),
            material_key: self.material_key.as_ref(),
            destination_key: self.content_key.as_ref(),
            slots: self.material.slots(),
            factory: &self.factory,
            observer: self.observer.as_ref(),
        };
        let score = run_retrieve(&ctx, on_progress)?;
        self.reload_store()?;
        Ok(score)
    }

    /// Rebuild this database from a different, possibly corrupted source
    /// file, with the source's own page size and keys.
    ///
    /// A wrong `backup_key` makes the source's material unreadable; recovery
    /// then falls back to live scan and archive, it never merges wrongly
    /// decrypted rows.
    pub fn recover(
        &self,
        from: &Path,
        page_size: usize,
        backup_key: Option<&[u8]>,
        database_key: Option<&[u8]>,
    ) -> RepairResult<f64> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(EngineError::InvalidFormat(format!(
                "page size out of range: {}",
                page_size
            ))
            .into());
        }
        // When the source header is still readable it is authoritative; the
        // caller-supplied size is only the fallback for a destroyed header
        if let Some(header) = read_source_header(from) {
            if header.page_size as usize != page_size {
                return Err(EngineError::InvalidFormat(format!(
                    "page size {} does not match source page size {}",
                    page_size, header.page_size
                ))
                .into());
            }
        }

        let source_content = database_key.map(CipherKey::new);
        let source_material = backup_key.map(CipherKey::new);
        let slots = MaterialSlots::for_database(from);
        let factory = DepositFactory::for_database(from);

        let ctx = RetrieveContext {
            source: from,
            destination: &self.path,
            source_page_size: page_size,
            destination_page_size: self.page_size,
            content_key: source_content.as_ref(),
            material_key: source_material.as_ref(),
            destination_key: self.content_key.as_ref(),
            slots: &slots,
            factory: &factory,
            observer: self.observer.as_ref(),
        };
        let mut sink = |_percentage: f64, _increment: f64| {};
        let score = run_retrieve(&ctx, &mut sink)?;
        self.reload_store()?;
        Ok(score)
    }

    /// Stop the background scheduler; further writes no longer trigger
    /// backups. Called automatically on drop.
    pub fn close(&self) {
        self.scheduler.shutdown();
    }

    /// Swap the pooled store for a freshly opened one after an on-disk
    /// rebuild replaced the file
    fn reload_store(&self) -> RepairResult<()> {
        let mut store = TableStore::open(&self.path, self.content_key.as_ref())?;
        install_hook(&mut store, &self.hub);
        let handle = self.pool.acquire();
        *handle.write() = store;
        Ok(())
    }
}

/// Best-effort read of a source file's header prefix; `None` when the file
/// or its header is unreadable
fn read_source_header(path: &Path) -> Option<Header> {
    use std::io::Read;
    let mut prefix = [0u8; HEADER_TOTAL_LEN];
    let mut file = std::fs::File::open(path).ok()?;
    file.read_exact(&mut prefix).ok()?;
    Header::decode(&prefix).ok()
}

fn install_hook(store: &mut TableStore, hub: &Arc<CheckpointSignalHub>) {
    let hub = Arc::clone(hub);
    store.set_checkpoint_hook(Some(Box::new(move |pages| hub.signal(pages))));
}

impl Drop for Database {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}
