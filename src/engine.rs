use crate::cache::CacheStore;
use crate::catalog::{load_catalog, save_catalog, Catalog, FileState, TapeRecord};
use crate::config::Config;
use crate::defrag::DefragPlanner;
use crate::device::{ChangerDevice, DriveDevice};
use crate::error::Result;
use crate::namespace::Namespace;
use crate::recovery::{Recovery, RecoverySummary};
use crate::scheduler::DriveScheduler;
use crate::writeback::WriteBackEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// Defrag scans are cheap (catalog-only until a job is planned), so a slow
// cadence is fine.
const DEFRAG_TICK: Duration = Duration::from_secs(60);

/// Snapshot of engine state for the status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub files_total: usize,
    pub files_by_state: Vec<(String, usize)>,
    pub cache_used_bytes: u64,
    pub cache_capacity_bytes: u64,
    pub drive_tape: Option<String>,
    pub drive_faulted: bool,
    pub tapes: Vec<TapeRecord>,
}

/// Owns every moving part and their lifecycles. Construction performs the
/// startup gate: the persisted catalog is loaded and checked, and a missing,
/// corrupt or inconsistent store triggers a full reindex from tape before
/// any file traffic is admitted.
pub struct Engine {
    catalog: Arc<Catalog>,
    cache: Arc<CacheStore>,
    scheduler: Arc<DriveScheduler>,
    changer: Arc<dyn ChangerDevice>,
    drive: Arc<dyn DriveDevice>,
    namespace: Arc<Namespace>,
    state_dir: PathBuf,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Engine {
    pub async fn start(
        config: &Config,
        changer: Arc<dyn ChangerDevice>,
        drive: Arc<dyn DriveDevice>,
    ) -> Result<Engine> {
        let state_dir = config.paths.get_state_dir()?;
        std::fs::create_dir_all(&state_dir)?;

        let scheduler = Arc::new(DriveScheduler::new(
            Arc::clone(&changer),
            config.devices.get_device_retry_limit(),
            config.devices.get_device_retry_backoff(),
        ));

        let (catalog, needs_recovery) = match load_catalog(&state_dir) {
            Ok(Some(catalog)) => match catalog.check_consistent() {
                Ok(()) => (Arc::new(catalog), false),
                Err(reason) => {
                    tracing::warn!("Catalog snapshot inconsistent ({}), reindexing", reason);
                    // Recovery merges: cache-authoritative records in the
                    // loaded snapshot survive the rebuild.
                    (Arc::new(catalog), true)
                }
            },
            Ok(None) => {
                tracing::info!("No catalog snapshot found, reindexing from tape");
                (Arc::new(Catalog::new()), true)
            }
            Err(e) => {
                tracing::warn!("Catalog snapshot unusable ({}), reindexing", e);
                (Arc::new(Catalog::new()), true)
            }
        };

        if needs_recovery {
            let recovery = Recovery::new(
                Arc::clone(&catalog),
                Arc::clone(&scheduler),
                Arc::clone(&changer),
                Arc::clone(&drive),
            );
            let summary = recovery.run().await?;
            tracing::info!(
                "Startup reindex rebuilt {} files from {} tapes",
                summary.files_indexed,
                summary.tapes_scanned
            );
            save_catalog(&catalog, &state_dir)?;
        }

        let cache = Arc::new(CacheStore::new(
            &state_dir.join("cache"),
            config.migration.get_cache_size_bytes(),
        )?);
        reconcile_cache_accounting(&catalog, &cache);

        let namespace = Arc::new(Namespace::new(
            Arc::clone(&catalog),
            Arc::clone(&cache),
            Arc::clone(&scheduler),
            Arc::clone(&drive),
            state_dir.clone(),
            config.migration.get_stage_timeout(),
        ));

        let (shutdown, _) = watch::channel(false);

        Ok(Engine {
            catalog,
            cache,
            scheduler,
            changer,
            drive,
            namespace,
            state_dir,
            shutdown,
            tasks: Vec::new(),
        })
    }

    /// Launch the write-back engine and defrag planner. Idempotent per
    /// engine; normally called once right after `start`.
    pub fn spawn_background(&mut self, config: &Config) {
        let writeback = Arc::new(WriteBackEngine::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.cache),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.drive),
            self.state_dir.clone(),
            config.migration.get_write_back_delay(),
            config.migration.get_migration_retry_limit(),
        ));
        self.tasks.push(tokio::spawn(writeback.run(
            self.shutdown.subscribe(),
            config.migration.get_write_back_tick(),
        )));

        let defrag = Arc::new(DefragPlanner::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.drive),
            self.state_dir.clone(),
            config.migration.get_defrag_threshold_percent(),
        ));
        self.tasks
            .push(tokio::spawn(defrag.run(self.shutdown.subscribe(), DEFRAG_TICK)));
    }

    pub fn namespace(&self) -> Arc<Namespace> {
        Arc::clone(&self.namespace)
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog)
    }

    pub fn scheduler(&self) -> Arc<DriveScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Operator-requested full reindex. Unlike the startup gate this merges
    /// into the live catalog, so dirty data pending migration is preserved.
    pub async fn reindex(&self) -> Result<RecoverySummary> {
        let recovery = Recovery::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.changer),
            Arc::clone(&self.drive),
        );
        let summary = recovery.run().await?;
        save_catalog(&self.catalog, &self.state_dir)?;
        Ok(summary)
    }

    pub fn status(&self) -> StatusReport {
        let mut by_state: std::collections::BTreeMap<String, usize> =
            std::collections::BTreeMap::new();
        let mut total = 0usize;
        for state in [
            FileState::Dirty,
            FileState::Eligible,
            FileState::Migrating,
            FileState::Clean,
            FileState::Unrecoverable,
        ] {
            let count = self.catalog.query_by_state(state).len();
            if count > 0 {
                by_state.insert(state.to_string(), count);
            }
            total += count;
        }

        let mut tapes = self.catalog.tapes();
        tapes.sort_by(|a, b| a.id.cmp(&b.id));

        StatusReport {
            files_total: total,
            files_by_state: by_state.into_iter().collect(),
            cache_used_bytes: self.cache.used_bytes(),
            cache_capacity_bytes: self.cache.capacity(),
            drive_tape: self.scheduler.current_tape().map(|t| t.to_string()),
            drive_faulted: self.scheduler.is_faulted(),
            tapes,
        }
    }

    /// Stop background work and persist a final snapshot. Dirty data stays
    /// in the cache and resumes its dwell clock on next start.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        save_catalog(&self.catalog, &self.state_dir)?;
        tracing::info!("Engine stopped");
        Ok(())
    }
}

/// Rebuild cache accounting from the catalog after a restart. Blob files
/// with no surviving record are stale and removed.
fn reconcile_cache_accounting(catalog: &Arc<Catalog>, cache: &Arc<CacheStore>) {
    for record in catalog.contents().files.values() {
        let Some(_) = &record.cache_blob else {
            continue;
        };
        let abs = cache.blob_abs(&CacheStore::blob_rel(&record.path));
        let Ok(meta) = std::fs::metadata(&abs) else {
            tracing::warn!("Cache blob for {} missing on disk", record.path);
            let _ = catalog.with_record_mut(&record.path, |r| r.cache_blob = None);
            continue;
        };
        if record.state.cache_is_authoritative() {
            cache.account_dirty(&record.path, meta.len());
        } else {
            cache.mark_clean_replica(&record.path, meta.len());
        }
    }
}
