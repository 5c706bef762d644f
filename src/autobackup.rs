//! Auto-backup scheduler
//!
//! Observes the engine's checkpoint signals (fired after each durable
//! persist) and triggers a material backup on a background thread once
//! enough time has passed since the last backup. The debounce coalesces
//! rapid write bursts into one backup instead of backing up on every write.
//!
//! Disabling stops future triggers but does not cancel an in-flight backup.
//! Errors from a triggered backup go to the observer; the worker never
//! panics over them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cipher::CipherKey;
use crate::errors::RepairResult;
use crate::handle::HandlePool;
use crate::material::MaterialBackupManager;
use crate::observe::TraceObserver;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct AutoBackupConfig {
    /// Minimum interval between scheduler-triggered backups
    pub debounce: Duration,
}

impl Default for AutoBackupConfig {
    fn default() -> Self {
        AutoBackupConfig {
            debounce: Duration::from_secs(60),
        }
    }
}

/// Everything a triggered backup needs, shared with the worker thread
#[derive(Clone)]
pub(crate) struct BackupContext {
    pub pool: Arc<HandlePool>,
    pub material: Arc<MaterialBackupManager>,
    pub material_key: Option<CipherKey>,
    pub observer: Arc<dyn TraceObserver>,
}

pub(crate) fn run_backup(ctx: &BackupContext) -> RepairResult<()> {
    // Snapshot under a pooled read handle, then release it; serialization
    // against other backups happens inside the manager
    let snapshot = {
        let handle = ctx.pool.acquire();
        let store = handle.read();
        store.snapshot()
    };
    ctx.material
        .backup(&snapshot, ctx.material_key.as_ref(), ctx.observer.as_ref())
}

/// Connection point between the engine's checkpoint hook and the worker
pub(crate) struct CheckpointSignalHub {
    enabled: AtomicBool,
    tx: Mutex<Option<Sender<u64>>>,
}

impl CheckpointSignalHub {
    pub fn new() -> CheckpointSignalHub {
        CheckpointSignalHub {
            enabled: AtomicBool::new(false),
            tx: Mutex::new(None),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn install_sender(&self, tx: Sender<u64>) {
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    fn take_sender(&self) -> Option<Sender<u64>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Called from the engine's checkpoint hook on every durable persist
    pub fn signal(&self, pages: u64) {
        if !self.enabled() {
            return;
        }
        if let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(pages);
        }
    }
}

/// Background scheduler for automatic material backups
pub struct AutoBackupScheduler {
    hub: Arc<CheckpointSignalHub>,
    debounce_ms: Arc<AtomicU64>,
    ctx: BackupContext,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AutoBackupScheduler {
    pub(crate) fn new(
        hub: Arc<CheckpointSignalHub>,
        ctx: BackupContext,
        config: AutoBackupConfig,
    ) -> AutoBackupScheduler {
        AutoBackupScheduler {
            hub,
            debounce_ms: Arc::new(AtomicU64::new(config.debounce.as_millis() as u64)),
            ctx,
            worker: Mutex::new(None),
        }
    }

    /// Enable or disable automatic backups; `debounce` of `None` keeps the
    /// current interval. The worker thread is spawned lazily on first enable
    /// and reused afterwards.
    pub fn set_auto_backup(&self, enabled: bool, debounce: Option<Duration>) {
        if let Some(debounce) = debounce {
            self.debounce_ms
                .store(debounce.as_millis() as u64, Ordering::SeqCst);
        }
        self.hub.set_enabled(enabled);

        if enabled {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            if worker.is_none() {
                let (tx, rx) = mpsc::channel();
                self.hub.install_sender(tx);
                let hub = self.hub.clone();
                let debounce_ms = self.debounce_ms.clone();
                let ctx = self.ctx.clone();
                *worker = Some(thread::spawn(move || {
                    worker_loop(rx, hub, debounce_ms, ctx);
                }));
            }
        }
    }

    /// Stop the worker; an in-flight backup finishes first
    pub fn shutdown(&self) {
        self.hub.set_enabled(false);
        drop(self.hub.take_sender());
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for AutoBackupScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    rx: Receiver<u64>,
    hub: Arc<CheckpointSignalHub>,
    debounce_ms: Arc<AtomicU64>,
    ctx: BackupContext,
) {
    let mut pending: u64 = 0;
    let mut last_backup: Option<Instant> = None;

    loop {
        let debounce = Duration::from_millis(debounce_ms.load(Ordering::SeqCst));
        let timeout = if pending > 0 {
            match last_backup {
                Some(at) => debounce
                    .checked_sub(at.elapsed())
                    .unwrap_or(Duration::from_millis(1))
                    .max(Duration::from_millis(1)),
                None => Duration::from_millis(1),
            }
        } else {
            Duration::from_millis(200)
        };

        match rx.recv_timeout(timeout) {
            Ok(pages) => pending += pages,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if !hub.enabled() {
            pending = 0;
            continue;
        }

        let ready = match last_backup {
            Some(at) => at.elapsed() >= debounce,
            None => true,
        };
        if pending > 0 && ready {
            match run_backup(&ctx) {
                Ok(()) => ctx.observer.repair_event("auto_backup", "completed"),
                Err(e) => ctx.observer.error("auto_backup", &e.to_string()),
            }
            pending = 0;
            last_backup = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{TableStore, Value, DEFAULT_PAGE_SIZE};
    use crate::observe::NoopObserver;
    use tempfile::TempDir;

    struct Rig {
        pool: Arc<HandlePool>,
        material: Arc<MaterialBackupManager>,
        scheduler: AutoBackupScheduler,
    }

    fn rig(dir: &TempDir, debounce: Duration) -> Rig {
        let path = dir.path().join("main.dura");
        let mut store = TableStore::create(&path, DEFAULT_PAGE_SIZE, None).unwrap();
        store.create_table("objects", &["name"]).unwrap();

        let hub = Arc::new(CheckpointSignalHub::new());
        let hook_hub = hub.clone();
        store.set_checkpoint_hook(Some(Box::new(move |pages| hook_hub.signal(pages))));

        let pool = Arc::new(HandlePool::new(store, 4));
        let material = Arc::new(MaterialBackupManager::for_database(&path));
        let ctx = BackupContext {
            pool: pool.clone(),
            material: material.clone(),
            material_key: None,
            observer: Arc::new(NoopObserver),
        };
        let scheduler = AutoBackupScheduler::new(
            hub.clone(),
            ctx,
            AutoBackupConfig { debounce },
        );
        Rig {
            pool,
            material,
            scheduler,
        }
    }

    fn write_row(pool: &HandlePool, name: &str) {
        let handle = pool.acquire();
        let mut store = handle.write();
        store
            .insert("objects", vec![Value::Text(name.into())])
            .unwrap();
        store.persist().unwrap();
    }

    fn wait_for_material(material: &MaterialBackupManager) -> bool {
        for _ in 0..100 {
            if material.read_material(None).is_some() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_write_activity_triggers_backup() {
        let dir = TempDir::new().unwrap();
        let rig = rig(&dir, Duration::from_millis(10));

        rig.scheduler.set_auto_backup(true, None);
        write_row(&rig.pool, "object1");

        assert!(wait_for_material(&rig.material));
        let material = rig.material.read_material(None).unwrap();
        assert_eq!(material.row_count(), 1);
        rig.scheduler.shutdown();
    }

    #[test]
    fn test_disabled_scheduler_never_backs_up() {
        let dir = TempDir::new().unwrap();
        let rig = rig(&dir, Duration::from_millis(10));

        write_row(&rig.pool, "object1");
        thread::sleep(Duration::from_millis(200));
        assert!(rig.material.read_material(None).is_none());
    }

    #[test]
    fn test_disable_stops_future_triggers() {
        let dir = TempDir::new().unwrap();
        let rig = rig(&dir, Duration::from_millis(10));

        rig.scheduler.set_auto_backup(true, None);
        write_row(&rig.pool, "object1");
        assert!(wait_for_material(&rig.material));
        let first = rig.material.read_material(None).unwrap();

        rig.scheduler.set_auto_backup(false, None);
        thread::sleep(Duration::from_millis(100));
        write_row(&rig.pool, "object2");
        thread::sleep(Duration::from_millis(300));

        let after = rig.material.read_material(None).unwrap();
        assert_eq!(
            after.generation, first.generation,
            "no new generation after disable"
        );
        rig.scheduler.shutdown();
    }

    #[test]
    fn test_burst_coalesces_into_few_backups() {
        let dir = TempDir::new().unwrap();
        let rig = rig(&dir, Duration::from_millis(300));

        rig.scheduler.set_auto_backup(true, None);
        for i in 0..10 {
            write_row(&rig.pool, &format!("object{}", i));
        }
        assert!(wait_for_material(&rig.material));
        thread::sleep(Duration::from_millis(100));

        let material = rig.material.read_material(None).unwrap();
        assert!(
            material.generation <= 2,
            "burst of 10 writes produced generation {}",
            material.generation
        );
        rig.scheduler.shutdown();
    }

    #[test]
    fn test_hub_drops_signals_when_disabled() {
        let hub = CheckpointSignalHub::new();
        // No sender installed, disabled: must be a no-op either way
        hub.signal(3);
        hub.set_enabled(true);
        hub.signal(3);
    }
}
