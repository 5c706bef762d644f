//! Paged table store
//!
//! The storage substrate the repair subsystem operates on: a single-file,
//! page-structured relational store with a JSON catalog, checksummed pages
//! and optional whole-page content encryption.
//!
//! Durability model: mutations accumulate in memory and `persist` rewrites
//! the file through a temp-file-and-rename, so the on-disk file is always a
//! complete, self-consistent generation. `persist` fires the checkpoint
//! hook, which is the write-activity signal the auto-backup scheduler
//! observes.
//!
//! Normal opens are strict: any page that fails validation is an error.
//! Tolerant, best-effort reading of damaged files lives in the retrieve
//! module, not here.

pub mod catalog;
pub mod codec;
mod errors;
pub mod page;

pub use catalog::{Catalog, TableSchema};
pub use codec::{Row, Value};
pub use errors::{EngineError, EngineResult};
pub use page::DEFAULT_PAGE_SIZE;

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::cipher::{random_salt, Cipher, CipherKey};
use crate::paths::derived_path;

use codec::ByteReader;
use page::{encode_page, page_capacity, Header, PageKind, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Callback invoked after each durable persist with the number of pages written
pub type CheckpointHook = Box<dyn Fn(u64) + Send + Sync>;

/// Read-consistent view of the store taken under a read guard.
///
/// Owns cloned catalog and row data, so later writes cannot mutate it
/// underneath a backup in progress.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub catalog: Catalog,
    rows: HashMap<u32, Vec<Row>>,
}

impl StoreSnapshot {
    /// Iterate tables in catalog order with their rows
    pub fn tables(&self) -> impl Iterator<Item = (&TableSchema, &[Row])> {
        self.catalog.tables.iter().map(move |schema| {
            let rows = self
                .rows
                .get(&schema.id)
                .map(|r| r.as_slice())
                .unwrap_or(&[]);
            (schema, rows)
        })
    }
}

/// Single-file paged table store
pub struct TableStore {
    path: PathBuf,
    page_size: usize,
    cipher: Option<Cipher>,
    catalog: Catalog,
    rows: HashMap<u32, Vec<Row>>,
    checkpoint_hook: Option<CheckpointHook>,
}

impl TableStore {
    /// Create a new store file at `path`, replacing any existing file
    pub fn create(
        path: &Path,
        page_size: usize,
        key: Option<&CipherKey>,
    ) -> EngineResult<TableStore> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(EngineError::InvalidFormat(format!(
                "page size out of range: {}",
                page_size
            )));
        }

        let mut store = TableStore {
            path: path.to_path_buf(),
            page_size,
            cipher: key.map(|k| Cipher::new(k, random_salt())),
            catalog: Catalog::new(),
            rows: HashMap::new(),
            checkpoint_hook: None,
        };
        store.persist()?;
        Ok(store)
    }

    /// Open an existing store, validating every page
    pub fn open(path: &Path, key: Option<&CipherKey>) -> EngineResult<TableStore> {
        let bytes = fs::read(path).map_err(|e| EngineError::io(path, e))?;
        let header = Header::decode(&bytes)?;
        let page_size = header.page_size as usize;

        if bytes.len() != header.page_count as usize * page_size {
            return Err(EngineError::InvalidFormat(format!(
                "file length {} does not match {} pages of {} bytes",
                bytes.len(),
                header.page_count,
                page_size
            )));
        }

        let cipher = match (header.encrypted, key) {
            (true, Some(k)) => {
                let cipher = Cipher::new(k, header.salt);
                if !cipher.verify(&header.verifier) {
                    return Err(EngineError::KeyMismatch);
                }
                Some(cipher)
            }
            (true, None) => return Err(EngineError::KeyMismatch),
            (false, Some(_)) => return Err(EngineError::KeyMismatch),
            (false, None) => None,
        };

        let mut catalog_json = Vec::new();
        let mut pending: Vec<(u32, Vec<Row>)> = Vec::new();

        for page_no in 1..header.page_count {
            let start = page_no as usize * page_size;
            let mut page = bytes[start..start + page_size].to_vec();
            if let Some(cipher) = &cipher {
                cipher.apply(page_no as u64, &mut page);
            }

            let (kind, table_id, payload) = page::decode_page(&page, page_no)?;
            match kind {
                PageKind::Catalog => catalog_json.extend_from_slice(payload),
                PageKind::Data => {
                    pending.push((table_id, decode_data_payload(payload)?));
                }
            }
        }

        let catalog = Catalog::from_json(&catalog_json)?;
        let mut rows: HashMap<u32, Vec<Row>> = HashMap::new();
        for table in &catalog.tables {
            rows.insert(table.id, Vec::new());
        }
        for (table_id, page_rows) in pending {
            let slot = rows.get_mut(&table_id).ok_or_else(|| {
                EngineError::InvalidFormat(format!(
                    "data page references unknown table id {}",
                    table_id
                ))
            })?;
            slot.extend(page_rows);
        }
        for table_rows in rows.values_mut() {
            table_rows.sort_by_key(|r| r.rowid);
        }

        Ok(TableStore {
            path: path.to_path_buf(),
            page_size,
            cipher,
            catalog,
            rows,
            checkpoint_hook: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn table_names(&self) -> Vec<String> {
        self.catalog.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Install or clear the checkpoint hook
    pub fn set_checkpoint_hook(&mut self, hook: Option<CheckpointHook>) {
        self.checkpoint_hook = hook;
    }

    /// Register a new table with columns, sequence starting at 1
    pub fn create_table(&mut self, name: &str, columns: &[&str]) -> EngineResult<()> {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        let id = self.catalog.create_table(name, columns, 1)?;
        self.rows.insert(id, Vec::new());
        Ok(())
    }

    /// Register a table with an explicit sequence, for rebuild paths
    pub fn create_table_with(
        &mut self,
        name: &str,
        columns: Vec<String>,
        next_rowid: i64,
    ) -> EngineResult<()> {
        let id = self.catalog.create_table(name, columns, next_rowid)?;
        self.rows.insert(id, Vec::new());
        Ok(())
    }

    /// Insert a row, allocating the next rowid from the table's sequence
    pub fn insert(&mut self, table: &str, values: Vec<Value>) -> EngineResult<i64> {
        let capacity = page_capacity(self.page_size);
        let schema = self
            .catalog
            .table_mut(table)
            .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
        if values.len() != schema.columns.len() {
            return Err(EngineError::SchemaMismatch {
                table: table.to_string(),
                detail: format!(
                    "expected {} values, got {}",
                    schema.columns.len(),
                    values.len()
                ),
            });
        }

        let rowid = schema.next_rowid;
        let row = Row::new(rowid, values);
        check_row_fits(&row, capacity)?;

        schema.next_rowid += 1;
        let id = schema.id;
        self.rows.entry(id).or_default().push(row);
        Ok(rowid)
    }

    /// Insert a row with a caller-chosen rowid, advancing the sequence past it
    pub fn insert_with_rowid(
        &mut self,
        table: &str,
        rowid: i64,
        values: Vec<Value>,
    ) -> EngineResult<()> {
        let capacity = page_capacity(self.page_size);
        let schema = self
            .catalog
            .table_mut(table)
            .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
        if values.len() != schema.columns.len() {
            return Err(EngineError::SchemaMismatch {
                table: table.to_string(),
                detail: format!(
                    "expected {} values, got {}",
                    schema.columns.len(),
                    values.len()
                ),
            });
        }

        let row = Row::new(rowid, values);
        check_row_fits(&row, capacity)?;

        schema.next_rowid = schema.next_rowid.max(rowid + 1);
        let id = schema.id;
        self.rows.entry(id).or_default().push(row);
        Ok(())
    }

    /// All rows of a table, sorted by rowid
    pub fn scan(&self, table: &str) -> EngineResult<Vec<Row>> {
        let schema = self
            .catalog
            .table(table)
            .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
        let mut rows = self.rows.get(&schema.id).cloned().unwrap_or_default();
        rows.sort_by_key(|r| r.rowid);
        Ok(rows)
    }

    pub fn row_count(&self, table: &str) -> EngineResult<usize> {
        let schema = self
            .catalog
            .table(table)
            .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
        Ok(self.rows.get(&schema.id).map(|r| r.len()).unwrap_or(0))
    }

    /// Drop all rows of a table; schema and sequence are untouched
    pub fn truncate_table(&mut self, table: &str) -> EngineResult<()> {
        let schema = self
            .catalog
            .table(table)
            .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
        let id = schema.id;
        if let Some(rows) = self.rows.get_mut(&id) {
            rows.clear();
        }
        Ok(())
    }

    /// Truncate every table, keeping schemas and sequences
    pub fn truncate_all_tables(&mut self) {
        for rows in self.rows.values_mut() {
            rows.clear();
        }
    }

    /// Read-consistent snapshot of catalog and rows
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut rows = self.rows.clone();
        for table_rows in rows.values_mut() {
            table_rows.sort_by_key(|r| r.rowid);
        }
        StoreSnapshot {
            catalog: self.catalog.clone(),
            rows,
        }
    }

    /// Durably write the current state: temp file, fsync, atomic rename,
    /// directory fsync. Fires the checkpoint hook on success.
    pub fn persist(&mut self) -> EngineResult<u64> {
        let capacity = page_capacity(self.page_size);

        let mut pages: Vec<Vec<u8>> = Vec::new();
        for chunk in self.catalog.to_json()?.chunks(capacity) {
            pages.push(encode_page(PageKind::Catalog, 0, chunk, self.page_size)?);
        }
        for table in &self.catalog.tables {
            let mut rows = self.rows.get(&table.id).cloned().unwrap_or_default();
            rows.sort_by_key(|r| r.rowid);
            for payload in pack_rows(&rows, capacity)? {
                pages.push(encode_page(PageKind::Data, table.id, &payload, self.page_size)?);
            }
        }

        let page_count = (1 + pages.len()) as u32;
        let header = match &self.cipher {
            Some(cipher) => Header {
                page_size: self.page_size as u32,
                page_count,
                encrypted: true,
                salt: cipher.salt(),
                verifier: cipher.verifier(),
            },
            None => Header {
                page_size: self.page_size as u32,
                page_count,
                encrypted: false,
                salt: [0u8; crate::cipher::SALT_LEN],
                verifier: [0u8; crate::cipher::VERIFIER_LEN],
            },
        };

        let mut bytes = header.encode();
        for (index, mut page) in pages.into_iter().enumerate() {
            let page_no = (index + 1) as u64;
            if let Some(cipher) = &self.cipher {
                cipher.apply(page_no, &mut page);
            }
            bytes.extend_from_slice(&page);
        }

        let temp = derived_path(&self.path, ".saving");
        write_durable(&temp, &bytes)?;
        fs::rename(&temp, &self.path).map_err(|e| EngineError::io(&self.path, e))?;
        sync_parent_dir(&self.path)?;

        if let Some(hook) = &self.checkpoint_hook {
            hook(page_count as u64);
        }
        Ok(page_count as u64)
    }
}

fn check_row_fits(row: &Row, capacity: usize) -> EngineResult<()> {
    // 2 bytes of the payload hold the page's row count
    if codec::encoded_row_len(row) > capacity - 2 {
        return Err(EngineError::InvalidFormat(format!(
            "row {} too large for a single page",
            row.rowid
        )));
    }
    Ok(())
}

/// Greedily pack rows into data-page payloads: `[row count u16][rows...]`
fn pack_rows(rows: &[Row], capacity: usize) -> EngineResult<Vec<Vec<u8>>> {
    let mut payloads = Vec::new();
    let mut current: Vec<Vec<u8>> = Vec::new();
    let mut current_len = 2usize;

    let flush = |current: &mut Vec<Vec<u8>>, payloads: &mut Vec<Vec<u8>>| {
        if current.is_empty() {
            return;
        }
        let mut payload = Vec::new();
        payload.extend_from_slice(&(current.len() as u16).to_le_bytes());
        for encoded in current.drain(..) {
            payload.extend_from_slice(&encoded);
        }
        payloads.push(payload);
    };

    for row in rows {
        let mut encoded = Vec::new();
        codec::encode_row(row, &mut encoded);
        if current_len + encoded.len() > capacity {
            flush(&mut current, &mut payloads);
            current_len = 2;
        }
        current_len += encoded.len();
        current.push(encoded);
    }
    flush(&mut current, &mut payloads);
    Ok(payloads)
}

/// Parse a data-page payload into rows
pub(crate) fn decode_data_payload(payload: &[u8]) -> EngineResult<Vec<Row>> {
    let mut reader = ByteReader::new(payload);
    let count = reader.read_u16()? as usize;
    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        rows.push(codec::decode_row(&mut reader)?);
    }
    if !reader.is_empty() {
        return Err(EngineError::InvalidFormat(
            "trailing bytes after last row".to_string(),
        ));
    }
    Ok(rows)
}

fn write_durable(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    use std::io::Write;
    let mut file = File::create(path).map_err(|e| EngineError::io(path, e))?;
    file.write_all(bytes).map_err(|e| EngineError::io(path, e))?;
    file.sync_all().map_err(|e| EngineError::io(path, e))?;
    Ok(())
}

fn sync_parent_dir(path: &Path) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent).map_err(|e| EngineError::io(parent, e))?;
            dir.sync_all().map_err(|e| EngineError::io(parent, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_path(dir: &TempDir) -> PathBuf {
        dir.path().join("main.dura")
    }

    fn text_row(s: &str) -> Vec<Value> {
        vec![Value::Text(s.to_string())]
    }

    #[test]
    fn test_create_open_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut store = TableStore::create(&path, DEFAULT_PAGE_SIZE, None).unwrap();
        store.create_table("objects", &["name"]).unwrap();
        let r1 = store.insert("objects", text_row("object1")).unwrap();
        let r2 = store.insert("objects", text_row("object2")).unwrap();
        store.persist().unwrap();

        assert_eq!(r1, 1);
        assert_eq!(r2, 2);

        let reopened = TableStore::open(&path, None).unwrap();
        let rows = reopened.scan("objects").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values, text_row("object1"));
        assert_eq!(rows[1].rowid, 2);
    }

    #[test]
    fn test_truncate_keeps_sequence() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut store = TableStore::create(&path, DEFAULT_PAGE_SIZE, None).unwrap();
        store.create_table("objects", &["name"]).unwrap();
        store.insert("objects", text_row("a")).unwrap();
        store.insert("objects", text_row("b")).unwrap();

        store.truncate_table("objects").unwrap();
        assert_eq!(store.row_count("objects").unwrap(), 0);

        let rowid = store.insert("objects", text_row("c")).unwrap();
        assert_eq!(rowid, 3, "sequence continues across truncation");
    }

    #[test]
    fn test_encrypted_roundtrip_and_wrong_key() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let key = CipherKey::new(b"content key");

        let mut store = TableStore::create(&path, DEFAULT_PAGE_SIZE, Some(&key)).unwrap();
        store.create_table("objects", &["name"]).unwrap();
        store.insert("objects", text_row("secret row")).unwrap();
        store.persist().unwrap();

        let reopened = TableStore::open(&path, Some(&key)).unwrap();
        assert_eq!(reopened.row_count("objects").unwrap(), 1);

        let wrong = CipherKey::new(b"other key");
        assert!(matches!(
            TableStore::open(&path, Some(&wrong)),
            Err(EngineError::KeyMismatch)
        ));
        assert!(matches!(
            TableStore::open(&path, None),
            Err(EngineError::KeyMismatch)
        ));
    }

    #[test]
    fn test_key_on_plaintext_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        TableStore::create(&path, DEFAULT_PAGE_SIZE, None).unwrap();

        let key = CipherKey::new(b"unexpected");
        assert!(matches!(
            TableStore::open(&path, Some(&key)),
            Err(EngineError::KeyMismatch)
        ));
    }

    #[test]
    fn test_strict_open_rejects_corrupt_page() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut store = TableStore::create(&path, DEFAULT_PAGE_SIZE, None).unwrap();
        store.create_table("objects", &["name"]).unwrap();
        store.insert("objects", text_row("x")).unwrap();
        store.persist().unwrap();

        // Damage a byte inside the last page
        let mut bytes = fs::read(&path).unwrap();
        let offset = bytes.len() - DEFAULT_PAGE_SIZE / 2;
        bytes[offset] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            TableStore::open(&path, None),
            Err(EngineError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_checkpoint_hook_fires_on_persist() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut store = TableStore::create(&path, DEFAULT_PAGE_SIZE, None).unwrap();
        let pages = Arc::new(AtomicU64::new(0));
        let observed = pages.clone();
        store.set_checkpoint_hook(Some(Box::new(move |p| {
            observed.fetch_add(p, Ordering::SeqCst);
        })));

        store.create_table("objects", &["name"]).unwrap();
        store.insert("objects", text_row("x")).unwrap();
        store.persist().unwrap();

        assert!(pages.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_insert_arity_checked() {
        let dir = TempDir::new().unwrap();
        let mut store = TableStore::create(&store_path(&dir), DEFAULT_PAGE_SIZE, None).unwrap();
        store.create_table("objects", &["a", "b"]).unwrap();

        let err = store.insert("objects", text_row("only one")).unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_unknown_table_rejected() {
        let dir = TempDir::new().unwrap();
        let store = TableStore::create(&store_path(&dir), DEFAULT_PAGE_SIZE, None).unwrap();
        assert!(matches!(
            store.scan("missing"),
            Err(EngineError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_oversized_row_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = TableStore::create(&store_path(&dir), MIN_PAGE_SIZE, None).unwrap();
        store.create_table("objects", &["blob"]).unwrap();

        let big = vec![Value::Blob(vec![0u8; MIN_PAGE_SIZE])];
        assert!(store.insert("objects", big).is_err());
    }

    #[test]
    fn test_many_rows_span_pages() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut store = TableStore::create(&path, MIN_PAGE_SIZE, None).unwrap();
        store.create_table("objects", &["name"]).unwrap();
        for i in 0..200 {
            store
                .insert("objects", text_row(&format!("object-{:04}", i)))
                .unwrap();
        }
        store.persist().unwrap();

        let reopened = TableStore::open(&path, None).unwrap();
        let rows = reopened.scan("objects").unwrap();
        assert_eq!(rows.len(), 200);
        assert_eq!(rows[199].rowid, 200);
    }

    #[test]
    fn test_snapshot_is_isolated_from_writes() {
        let dir = TempDir::new().unwrap();
        let mut store = TableStore::create(&store_path(&dir), DEFAULT_PAGE_SIZE, None).unwrap();
        store.create_table("objects", &["name"]).unwrap();
        store.insert("objects", text_row("before")).unwrap();

        let snapshot = store.snapshot();
        store.insert("objects", text_row("after")).unwrap();

        let (_, rows) = snapshot.tables().next().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(store.row_count("objects").unwrap(), 2);
    }

    #[test]
    fn test_insert_with_rowid_advances_sequence() {
        let dir = TempDir::new().unwrap();
        let mut store = TableStore::create(&store_path(&dir), DEFAULT_PAGE_SIZE, None).unwrap();
        store.create_table("objects", &["name"]).unwrap();

        store.insert_with_rowid("objects", 10, text_row("ten")).unwrap();
        let next = store.insert("objects", text_row("eleven")).unwrap();
        assert_eq!(next, 11);
    }
}
