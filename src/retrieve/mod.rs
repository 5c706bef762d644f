//! Retrieve engine
//!
//! Reconstructs a fresh, healthy database from a corrupted source plus
//! whatever redundancy exists: the material slots and the deposit archive.
//! Data-level damage never fails the call; it degrades the returned
//! completeness score. Only setup problems (an unwritable destination)
//! surface as errors.
//!
//! Phases, each owning a fixed share of the progress budget:
//!
//! 1. Schema discovery — read the catalog of the damaged file; failure
//!    yields an empty candidate set, not an abort.
//! 2. Live scan — walk pages one by one; invalid pages are skipped.
//! 3. Material cross-reference — merge rows from the newest valid material;
//!    live-scanned rows win conflicts (they are newer than the snapshot).
//! 4. Archive cross-reference — merge rows from the newest deposit
//!    generation; material and live rows win ties.
//! 5. Scoring and rebuild — recovered units over expected units, the
//!    denominator taken from the material when present, else the live
//!    file's own pages, else the archive.

pub mod progress;
pub mod scan;

pub use progress::{ProgressSink, ProgressTracker};
pub use scan::{discover_catalog, RawFile};

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::cipher::CipherKey;
use crate::engine::page::PageKind;
use crate::engine::{Row, TableStore, Value};
use crate::errors::{RepairError, RepairResult};
use crate::factory::DepositFactory;
use crate::material::{Material, MaterialSlots};
use crate::observe::TraceObserver;
use crate::paths::derived_path;

const DISCOVERY_SHARE: f64 = 0.05;
const LIVE_SHARE: f64 = 0.55;
const MATERIAL_SHARE: f64 = 0.20;
const ARCHIVE_SHARE: f64 = 0.15;
// The remaining 0.05 covers scoring and the destination rebuild

/// Inputs for one retrieve or recover run
pub(crate) struct RetrieveContext<'a> {
    pub source: &'a Path,
    pub destination: &'a Path,
    /// Page size used when the source header is too damaged to state it
    pub source_page_size: usize,
    pub destination_page_size: usize,
    pub content_key: Option<&'a CipherKey>,
    pub material_key: Option<&'a CipherKey>,
    pub destination_key: Option<&'a CipherKey>,
    pub slots: &'a MaterialSlots,
    pub factory: &'a DepositFactory,
    pub observer: &'a dyn TraceObserver,
}

/// One table being rebuilt, keyed by rowid for primary-key de-duplication
struct RecoveredTable {
    columns: Vec<String>,
    next_rowid: i64,
    rows: BTreeMap<i64, Vec<Value>>,
}

impl RecoveredTable {
    fn merge_row(&mut self, row: &Row) {
        // First writer wins: earlier phases hold newer data
        self.rows.entry(row.rowid).or_insert_with(|| row.values.clone());
    }
}

type Recovered = BTreeMap<String, RecoveredTable>;

fn merge_table(
    recovered: &mut Recovered,
    name: &str,
    columns: &[String],
    next_rowid: i64,
    rows: &[Row],
    observer: &dyn TraceObserver,
) {
    let entry = recovered.entry(name.to_string()).or_insert_with(|| RecoveredTable {
        columns: columns.to_vec(),
        next_rowid: 1,
        rows: BTreeMap::new(),
    });
    if entry.columns != columns {
        // Structurally incompatible source for this table: skip it, the
        // retrieve as a whole continues
        observer.repair_event("table_skipped", name);
        return;
    }
    entry.next_rowid = entry.next_rowid.max(next_rowid);
    for row in rows {
        entry.merge_row(row);
    }
}

/// Run the full retrieve pipeline, reporting progress through `sink`.
///
/// Returns the completeness score in [0, 1]. Errors are setup-only; all
/// data-level damage is absorbed into the score.
pub(crate) fn run_retrieve(ctx: &RetrieveContext<'_>, sink: ProgressSink<'_>) -> RepairResult<f64> {
    let mut tracker = ProgressTracker::new(sink);
    let mut recovered: Recovered = BTreeMap::new();

    // Phase 1: schema discovery
    let mut phase = tracker.begin(DISCOVERY_SHARE, 1);
    let raw = RawFile::load(ctx.source, ctx.source_page_size, ctx.content_key);
    let catalog = discover_catalog(&raw);
    if let Some(catalog) = &catalog {
        for table in &catalog.tables {
            merge_table(
                &mut recovered,
                &table.name,
                &table.columns,
                table.next_rowid,
                &[],
                ctx.observer,
            );
        }
    } else {
        ctx.observer
            .repair_event("discovery", "catalog unreadable, continuing");
    }
    tracker.step(&mut phase);
    tracker.end(phase);

    // Phase 2: live scan, page by page
    let total_pages = raw.total_pages();
    let mut valid_pages = 0usize;
    if raw.header().is_some() {
        valid_pages += 1;
    }
    let mut phase = tracker.begin(LIVE_SHARE, total_pages.saturating_sub(1));
    for page_no in 1..total_pages {
        match raw.read_page(page_no) {
            Some((PageKind::Data, table_id, payload)) => {
                match crate::engine::decode_data_payload(&payload) {
                    Ok(rows) => {
                        valid_pages += 1;
                        let schema = catalog
                            .as_ref()
                            .and_then(|catalog| catalog.table_by_id(table_id));
                        if let Some(schema) = schema {
                            merge_table(
                                &mut recovered,
                                &schema.name,
                                &schema.columns,
                                schema.next_rowid,
                                &rows,
                                ctx.observer,
                            );
                        }
                    }
                    Err(_) => ctx
                        .observer
                        .repair_event("page_skipped", &page_no.to_string()),
                }
            }
            Some((PageKind::Catalog, _, _)) => valid_pages += 1,
            None => ctx
                .observer
                .repair_event("page_skipped", &page_no.to_string()),
        }
        tracker.step(&mut phase);
    }
    tracker.end(phase);

    // Phase 3: material cross-reference
    let material = ctx
        .slots
        .newest_valid(ctx.material_key)
        .map(|(_, material)| material);
    let material_tables = material.as_ref().map(|m| m.tables.len()).unwrap_or(0);
    let mut phase = tracker.begin(MATERIAL_SHARE, material_tables);
    if let Some(material) = &material {
        for table in &material.tables {
            merge_table(
                &mut recovered,
                &table.name,
                &table.columns,
                table.next_rowid,
                &table.rows,
                ctx.observer,
            );
            tracker.step(&mut phase);
        }
    }
    tracker.end(phase);

    // Phase 4: archive cross-reference, newest generation only
    let frozen = ctx.factory.newest_generation().and_then(|generation| {
        match TableStore::open(&generation.db_file_path(), ctx.content_key) {
            Ok(store) => Some(store),
            Err(e) => {
                ctx.observer.error("archive", &e.to_string());
                None
            }
        }
    });
    let frozen_snapshot = frozen.as_ref().map(|store| store.snapshot());
    let archive_tables = frozen_snapshot
        .as_ref()
        .map(|s| s.catalog.tables.len())
        .unwrap_or(0);
    let mut phase = tracker.begin(ARCHIVE_SHARE, archive_tables);
    if let Some(snapshot) = &frozen_snapshot {
        for (schema, rows) in snapshot.tables() {
            merge_table(
                &mut recovered,
                &schema.name,
                &schema.columns,
                schema.next_rowid,
                rows,
                ctx.observer,
            );
            tracker.step(&mut phase);
        }
    }
    tracker.end(phase);

    // Phase 5: score, then rebuild the destination
    let score = compute_score(
        material.as_ref(),
        &recovered,
        valid_pages,
        total_pages,
        frozen_snapshot.as_ref(),
    );

    rebuild_destination(ctx, &recovered)?;
    ctx.observer
        .repair_event("retrieve_done", &format!("score {:.3}", score));

    tracker.finish();
    Ok(score)
}

/// Expected-vs-recovered units. Every table contributes units equal to its
/// expected row count, with a minimum of one so recovering an empty table's
/// schema still counts.
fn units(expected: &[(String, Vec<i64>)], recovered: &Recovered) -> (usize, usize) {
    let mut expected_units = 0usize;
    let mut got_units = 0usize;
    for (name, rowids) in expected {
        expected_units += rowids.len().max(1);
        match recovered.get(name) {
            Some(_) if rowids.is_empty() => got_units += 1,
            Some(table) => {
                got_units += rowids.iter().filter(|id| table.rows.contains_key(id)).count();
            }
            None => {}
        }
    }
    (expected_units, got_units)
}

fn compute_score(
    material: Option<&Material>,
    recovered: &Recovered,
    valid_pages: usize,
    total_pages: usize,
    frozen: Option<&crate::engine::StoreSnapshot>,
) -> f64 {
    // Denominator source of truth, in order: material, live pages, archive
    if let Some(material) = material {
        let expected: Vec<(String, Vec<i64>)> = material
            .tables
            .iter()
            .map(|t| (t.name.clone(), t.rows.iter().map(|r| r.rowid).collect()))
            .collect();
        let (expected_units, got_units) = units(&expected, recovered);
        if expected_units > 0 {
            return (got_units as f64 / expected_units as f64).clamp(0.0, 1.0);
        }
        // Exclude-all filter left the material empty; fall through to the
        // next denominator source
    }

    if total_pages > 0 {
        return (valid_pages as f64 / total_pages as f64).clamp(0.0, 1.0);
    }

    if let Some(snapshot) = frozen {
        let expected: Vec<(String, Vec<i64>)> = snapshot
            .tables()
            .map(|(schema, rows)| {
                (
                    schema.name.clone(),
                    rows.iter().map(|r| r.rowid).collect(),
                )
            })
            .collect();
        let (expected_units, got_units) = units(&expected, recovered);
        if expected_units > 0 {
            return (got_units as f64 / expected_units as f64).clamp(0.0, 1.0);
        }
    }

    0.0
}

/// Write the recovered tables into a fresh store and atomically replace the
/// destination path with it
fn rebuild_destination(ctx: &RetrieveContext<'_>, recovered: &Recovered) -> RepairResult<()> {
    let temp = derived_path(ctx.destination, ".recovering");

    let result = (|| -> RepairResult<()> {
        let mut out = TableStore::create(&temp, ctx.destination_page_size, ctx.destination_key)?;
        for (name, table) in recovered {
            let max_rowid = table.rows.keys().next_back().copied().unwrap_or(0);
            out.create_table_with(
                name,
                table.columns.clone(),
                table.next_rowid.max(max_rowid + 1),
            )?;
            for (rowid, values) in &table.rows {
                if let Err(e) = out.insert_with_rowid(name, *rowid, values.clone()) {
                    // A row that survived scanning but cannot be restored is
                    // dropped, not fatal
                    ctx.observer.error("rebuild", &e.to_string());
                }
            }
        }
        out.persist()?;
        fs::rename(&temp, ctx.destination)
            .map_err(|e| RepairError::io_at(ctx.destination, e))?;
        ctx.observer.file_operation("rename", ctx.destination);
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DEFAULT_PAGE_SIZE;
    use crate::observe::NoopObserver;
    use tempfile::TempDir;

    struct Fixture {
        source: std::path::PathBuf,
        slots: MaterialSlots,
        factory: DepositFactory,
    }

    fn fixture(dir: &TempDir) -> Fixture {
        let source = dir.path().join("main.dura");
        Fixture {
            slots: MaterialSlots::for_database(&source),
            factory: DepositFactory::for_database(&source),
            source,
        }
    }

    fn run(fixture: &Fixture) -> (f64, Vec<(f64, f64)>) {
        let mut calls = Vec::new();
        let mut sink = |p: f64, i: f64| calls.push((p, i));
        let ctx = RetrieveContext {
            source: &fixture.source,
            destination: &fixture.source,
            source_page_size: DEFAULT_PAGE_SIZE,
            destination_page_size: DEFAULT_PAGE_SIZE,
            content_key: None,
            material_key: None,
            destination_key: None,
            slots: &fixture.slots,
            factory: &fixture.factory,
            observer: &NoopObserver,
        };
        let score = run_retrieve(&ctx, &mut sink).unwrap();
        (score, calls)
    }

    fn populate(fixture: &Fixture) -> TableStore {
        let mut store = TableStore::create(&fixture.source, DEFAULT_PAGE_SIZE, None).unwrap();
        store.create_table("objects", &["name"]).unwrap();
        store
            .insert("objects", vec![Value::Text("object1".into())])
            .unwrap();
        store
            .insert("objects", vec![Value::Text("object2".into())])
            .unwrap();
        store.persist().unwrap();
        store
    }

    #[test]
    fn test_healthy_file_scores_one() {
        let dir = TempDir::new().unwrap();
        let fixture = fixture(&dir);
        populate(&fixture);

        let (score, calls) = run(&fixture);
        assert_eq!(score, 1.0);
        assert_eq!(calls.last().unwrap().0, 1.0);

        let rebuilt = TableStore::open(&fixture.source, None).unwrap();
        assert_eq!(rebuilt.row_count("objects").unwrap(), 2);
    }

    #[test]
    fn test_progress_well_formed_even_with_nothing_to_do() {
        let dir = TempDir::new().unwrap();
        let fixture = fixture(&dir);
        // No source file at all

        let (score, calls) = run(&fixture);
        assert_eq!(score, 0.0);
        let mut previous = 0.0;
        for &(percentage, increment) in &calls {
            assert!(increment > 0.0);
            assert!(percentage >= previous);
            previous = percentage;
        }
        assert_eq!(calls.last().unwrap().0, 1.0);
    }

    #[test]
    fn test_rebuilt_sequence_continues_past_recovered_rows() {
        let dir = TempDir::new().unwrap();
        let fixture = fixture(&dir);
        populate(&fixture);

        run(&fixture);

        let mut rebuilt = TableStore::open(&fixture.source, None).unwrap();
        let next = rebuilt
            .insert("objects", vec![Value::Text("object3".into())])
            .unwrap();
        assert_eq!(next, 3);
    }

    #[test]
    fn test_score_drops_with_lost_pages_and_no_redundancy() {
        let dir = TempDir::new().unwrap();
        let fixture = fixture(&dir);
        populate(&fixture);

        // Destroy the data page; catalog and header stay valid
        let mut bytes = fs::read(&fixture.source).unwrap();
        let start = 2 * DEFAULT_PAGE_SIZE;
        for b in &mut bytes[start..start + DEFAULT_PAGE_SIZE] {
            *b ^= 0xFF;
        }
        fs::write(&fixture.source, bytes).unwrap();

        let (score, _) = run(&fixture);
        assert!(score < 1.0);

        let rebuilt = TableStore::open(&fixture.source, None).unwrap();
        assert_eq!(rebuilt.row_count("objects").unwrap(), 0);
        // Schema itself was still discoverable
        assert!(rebuilt.catalog().table("objects").is_some());
    }
}
