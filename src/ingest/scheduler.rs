//! Bounded job queue plus a fixed pool of worker threads.
//!
//! Each worker owns one job at a time and runs the whole pipeline for it:
//! thumbnail, probe, classify, relocate, append to the ledger. The status
//! map is shared behind one reader/writer lock; a given asset id is only
//! ever written by the worker holding its job.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use super::category::normalize_category;
use super::gateway::ClassificationGateway;
use super::ledger::IndexLedger;
use super::store::ContentStore;
use super::{
    AssetKind, AssetRecord, MultiViewLayout, PRIMARY_SLOT, SingleImageLayout, StagedAsset, StagedModel,
    StoredLayout, UploadJob,
};
use crate::error::{IngestError, Result};
use crate::settings::IngestConfig;

type StatusMap = HashMap<String, AssetRecord>;

/// The collaborators every worker needs to process one job.
pub struct Pipeline {
    store: ContentStore,
    gateway: ClassificationGateway,
    ledger: IndexLedger,
}

impl Pipeline {
    pub fn new(store: ContentStore, gateway: ClassificationGateway, ledger: IndexLedger) -> Self {
        Self {
            store,
            gateway,
            ledger,
        }
    }

    /// Build from configuration and prepare the on-disk layout and ledger.
    pub fn from_config(config: &IngestConfig, gateway: ClassificationGateway) -> Result<Self> {
        config.validate()?;
        let store = ContentStore::new(&config.data_dir, config.max_upload_bytes);
        let ledger = IndexLedger::new(config.ledger_path(), config.ledger.lock_timeout());
        store.initialize()?;
        ledger.initialize()?;
        Ok(Self::new(store, gateway, ledger))
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn gateway(&self) -> &ClassificationGateway {
        &self.gateway
    }

    pub fn ledger(&self) -> &IndexLedger {
        &self.ledger
    }

    /// Run every step for `job`, filling `record` as it goes so a failure
    /// after classification still leaves the analysis on the record.
    fn process(&self, job: &UploadJob, record: &mut AssetRecord) -> Result<()> {
        match &job.staged {
            StagedAsset::Single { path } => self.process_single(&job.asset_id, path, record)?,
            StagedAsset::MultiView { dir, views, model } => {
                self.process_multi_view(&job.asset_id, dir, views, model.as_ref(), record)?
            }
        }
        self.ledger.append(record)?;
        record.mark_completed();
        Ok(())
    }

    fn process_single(&self, asset_id: &str, path: &Path, record: &mut AssetRecord) -> Result<()> {
        self.store.thumbnail(path)?;
        let (width, height) = self.store.dimensions(path)?;
        let file_size = self.store.file_size(path)?;

        let slots = BTreeMap::from([(PRIMARY_SLOT.to_string(), path.to_path_buf())]);
        let category = self.classify(AssetKind::SingleImage, &slots, record)?;

        let (file_path, thumbnail_path) = self.store.relocate_single(asset_id, path, &category)?;
        record.layout = Some(StoredLayout::Single(SingleImageLayout {
            file_path,
            thumbnail_path,
            width,
            height,
            file_size,
        }));
        Ok(())
    }

    fn process_multi_view(
        &self,
        asset_id: &str,
        dir: &Path,
        views: &BTreeMap<String, PathBuf>,
        model: Option<&StagedModel>,
        record: &mut AssetRecord,
    ) -> Result<()> {
        self.store.thumbnails(views)?;

        let mut total_file_size = 0;
        for path in views.values().map(PathBuf::as_path).chain(model.map(|m| m.path.as_path())) {
            total_file_size += self.store.file_size(path)?;
        }

        let category = self.classify(AssetKind::MultiViewSet, views, record)?;

        let relocated = self.store.relocate_multi_view(asset_id, dir, &category)?;
        record.layout = Some(StoredLayout::MultiView(MultiViewLayout {
            folder_path: relocated.folder_path,
            views: relocated.views,
            model_filename: model.map(|m| m.filename.clone()),
            model_path: relocated.model_path,
            total_file_size,
        }));
        Ok(())
    }

    fn classify(
        &self,
        kind: AssetKind,
        slots: &BTreeMap<String, PathBuf>,
        record: &mut AssetRecord,
    ) -> Result<String> {
        let analysis = self.gateway.classify(kind, slots)?;
        let category = normalize_category(&analysis.primary_category);
        debug!(
            asset_id = %record.id,
            raw = %analysis.primary_category,
            category = %category,
            "classified"
        );
        record.analysis = Some(analysis);
        record.category = Some(category.clone());
        Ok(category)
    }
}

/// Accepts upload jobs and tracks their status.
///
/// There is no retry and no timeout: a failed step marks the job failed for
/// good, and a provider call that never returns keeps its worker (and the
/// job's `processing` status) blocked. Dropping or shutting down the
/// scheduler joins the workers, so such a call blocks that thread too.
pub struct Scheduler {
    sender: Mutex<Option<Sender<UploadJob>>>,
    statuses: Arc<RwLock<StatusMap>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl Scheduler {
    /// Spawn `workers` threads draining a queue of at most `queue_capacity` jobs.
    pub fn start(pipeline: Arc<Pipeline>, workers: usize, queue_capacity: usize) -> Result<Self> {
        if workers == 0 || queue_capacity == 0 {
            return Err(IngestError::Validation(
                "scheduler needs at least one worker and one queue slot".into(),
            ));
        }

        let (tx, rx) = crossbeam_channel::bounded(queue_capacity);
        let statuses = Arc::new(RwLock::new(StatusMap::new()));

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker| {
                let rx = rx.clone();
                let pipeline = Arc::clone(&pipeline);
                let statuses = Arc::clone(&statuses);
                thread::spawn(move || run_worker(worker, rx, pipeline, statuses))
            })
            .collect();

        info!(workers, queue_capacity, "scheduler started");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            statuses,
            workers: Mutex::new(handles),
            capacity: queue_capacity,
        })
    }

    pub fn from_config(config: &IngestConfig, pipeline: Arc<Pipeline>) -> Result<Self> {
        Self::start(pipeline, config.workers, config.queue_capacity)
    }

    /// Validate and enqueue a job, recording it as `processing`.
    ///
    /// A full queue returns [`IngestError::QueueSaturated`] and leaves the
    /// status map untouched.
    pub fn submit(&self, job: UploadJob) -> Result<()> {
        job.validate()?;

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = sender.as_ref() else {
            return Err(IngestError::ShutDown);
        };

        // Held across the send so a worker cannot finish the job before it is tracked.
        let mut statuses = write_statuses(&self.statuses);
        if statuses.contains_key(&job.asset_id) {
            return Err(IngestError::Validation(format!(
                "asset id already submitted: {}",
                job.asset_id
            )));
        }

        let record = AssetRecord::processing(&job);
        match tx.try_send(job) {
            Ok(()) => {
                debug!(asset_id = %record.id, kind = %record.kind, "job queued");
                statuses.insert(record.id.clone(), record);
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                warn!(asset_id = %job.asset_id, capacity = self.capacity, "job queue saturated");
                Err(IngestError::QueueSaturated {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(IngestError::ShutDown),
        }
    }

    pub fn status(&self, asset_id: &str) -> Result<AssetRecord> {
        read_statuses(&self.statuses)
            .get(asset_id)
            .cloned()
            .ok_or_else(|| IngestError::NotFound(asset_id.to_string()))
    }

    /// Snapshot of every tracked record, oldest first.
    pub fn statuses(&self) -> Vec<AssetRecord> {
        let mut records: Vec<AssetRecord> = read_statuses(&self.statuses).values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Close the queue, let workers finish the jobs already accepted and wait
    /// for them. Later submissions fail with [`IngestError::ShutDown`].
    pub fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked outside a job");
            }
        }
        info!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    worker: usize,
    jobs: Receiver<UploadJob>,
    pipeline: Arc<Pipeline>,
    statuses: Arc<RwLock<StatusMap>>,
) {
    debug!(worker, "worker started");
    for job in jobs.iter() {
        let mut record = read_statuses(&statuses)
            .get(&job.asset_id)
            .cloned()
            .unwrap_or_else(|| AssetRecord::processing(&job));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| pipeline.process(&job, &mut record)));
        match outcome {
            Ok(Ok(())) => {
                info!(worker, asset_id = %job.asset_id, category = ?record.category, "job completed");
            }
            Ok(Err(err)) => {
                error!(worker, asset_id = %job.asset_id, error = %err, "job failed");
                record.mark_failed(err.to_string());
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker, asset_id = %job.asset_id, panic = %message, "job panicked");
                record.mark_failed(format!("worker panicked: {message}"));
            }
        }

        write_statuses(&statuses).insert(job.asset_id, record);
    }
    debug!(worker, "worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn read_statuses(statuses: &RwLock<StatusMap>) -> RwLockReadGuard<'_, StatusMap> {
    statuses.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_statuses(statuses: &RwLock<StatusMap>) -> RwLockWriteGuard<'_, StatusMap> {
    statuses.write().unwrap_or_else(PoisonError::into_inner)
}
