use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::attempt::{AttemptResult, DispatchFailure, FailureKind};
use crate::models::batch::Batch;
use crate::models::image::ImageUnit;
use crate::services::dispatcher::CaptionRequest;
use crate::services::encoder::{self, EncodedImage};
use crate::services::manifest::{ManifestError, ManifestStore, Selection};
use crate::services::planner::BatchPlanner;
use crate::services::recorder::{RecordedBatch, ResultRecorder};
use crate::services::stop::StopSignal;

/// Room left in every request for the JSON envelope around the images.
pub const REQUEST_ENVELOPE_BYTES: u64 = 2048;

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Units chosen from the manifest for this run.
    pub selected: usize,
    /// Units that failed before dispatch (missing, empty or unsupported files).
    pub unreadable: usize,
    pub batches_planned: usize,
    pub batches_dispatched: usize,
    pub captioned: usize,
    pub failed: usize,
    /// Units left at their prior status because the run was stopped.
    pub not_processed: usize,
    pub stopped: bool,
}

/// Scan → plan → dispatch (with retries) → record, on a bounded worker pool.
pub struct Pipeline {
    state: AppState,
    stop: StopSignal,
}

impl Pipeline {
    pub fn new(state: AppState, stop: StopSignal) -> Self {
        Self { state, stop }
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Process every selected image in `store` and return the updated manifest.
    pub async fn run(
        &self,
        store: ManifestStore,
        selection: Selection,
    ) -> Result<(ManifestStore, RunSummary), PipelineError> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id, store, selection)
            .instrument(tracing::info_span!("run", %run_id))
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        store: ManifestStore,
        selection: Selection,
    ) -> Result<(ManifestStore, RunSummary), PipelineError> {
        let settings = self.state.settings.clone();
        let mut summary = RunSummary {
            run_id,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            selected: 0,
            unreadable: 0,
            batches_planned: 0,
            batches_dispatched: 0,
            captioned: 0,
            failed: 0,
            not_processed: 0,
            stopped: false,
        };

        let mut recorder = ResultRecorder::new(store, settings.approval_policy, self.stop.clone());
        let (units, unreadable) = size_units(recorder.store(), selection);
        summary.selected = units.len() + unreadable.len();
        summary.unreadable = unreadable.len();

        tracing::info!(
            selected = summary.selected,
            unreadable = summary.unreadable,
            concurrency = settings.concurrency,
            "Starting pipeline"
        );

        for (unit, failure) in unreadable {
            recorder.record(&singleton(0, unit), &AttemptResult::failed(0, failure))?;
        }

        if units.is_empty() {
            tracing::info!("Nothing to dispatch");
            let report = recorder.finish();
            summary.failed = report.tally.failed;
            summary.finished_at = Utc::now();
            return Ok((report.store, summary));
        }

        let unit_count = units.len();
        let concurrency = settings.concurrency.max(1);
        let (sender, receiver) = mpsc::channel(concurrency * 2);
        let recorder_task = tokio::spawn(recorder.run(receiver));

        let planner = BatchPlanner::new(
            settings
                .max_batch_size_bytes
                .saturating_sub(REQUEST_ENVELOPE_BYTES)
                .max(1),
        );
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut workers = JoinSet::new();
        let mut units_sent = 0;

        for batch in planner.plan(units) {
            if self.stop.is_stopped() {
                break;
            }
            summary.batches_planned += 1;

            if batch.is_oversized(planner.max_bytes()) {
                let failure = DispatchFailure::new(
                    FailureKind::PayloadTooLarge,
                    format!(
                        "encoded image is {} bytes, limit is {}",
                        batch.total_bytes,
                        planner.max_bytes()
                    ),
                );
                units_sent += batch.len();
                if sender
                    .send(RecordedBatch {
                        batch,
                        result: AttemptResult::failed(0, failure),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.stop.stopped() => break,
            };

            summary.batches_dispatched += 1;
            units_sent += batch.len();
            tracing::debug!(
                batch = batch.index,
                units = batch.len(),
                bytes = batch.total_bytes,
                "Dispatching batch"
            );

            let state = self.state.clone();
            let stop = self.stop.clone();
            let sender = sender.clone();
            let index = batch.index;
            workers.spawn(
                async move {
                    let _permit = permit;
                    let (batch, images, rejected) = encode_batch(batch).await;
                    let mut finished: Vec<RecordedBatch> = rejected
                        .into_iter()
                        .map(|(unit, failure)| RecordedBatch {
                            batch: singleton(index, unit),
                            result: AttemptResult::failed(0, failure),
                        })
                        .collect();
                    if !batch.is_empty() {
                        let result = dispatch_batch(&state, &stop, index, images).await;
                        finished.push(RecordedBatch { batch, result });
                    }
                    for recorded in finished {
                        if sender.send(recorded).await.is_err() {
                            tracing::error!("Recorder gone before batch could be recorded");
                            break;
                        }
                    }
                }
                .in_current_span(),
            );
        }
        drop(sender);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Batch worker panicked");
            }
        }
        let report = recorder_task.await??;

        summary.captioned = report.tally.captioned;
        summary.failed = report.tally.failed;
        summary.not_processed = report.tally.cancelled + (unit_count - units_sent);
        summary.stopped = self.stop.is_stopped();
        summary.finished_at = Utc::now();

        if let Some(failure) = report.fatal {
            return Err(PipelineError::Auth(failure));
        }

        tracing::info!(
            batches = summary.batches_dispatched,
            captioned = summary.captioned,
            failed = summary.failed,
            not_processed = summary.not_processed,
            stopped = summary.stopped,
            "Pipeline finished"
        );
        Ok((report.store, summary))
    }
}

/// Estimate payload sizes for the selected records; files that cannot be
/// sent at all come back separately with their failure.
fn size_units(
    store: &ManifestStore,
    selection: Selection,
) -> (Vec<ImageUnit>, Vec<(ImageUnit, DispatchFailure)>) {
    let mut units = Vec::new();
    let mut unreadable = Vec::new();

    for record in store.select(selection) {
        let source = store.resolve(&record.filepath);
        match encoder::estimated_size(&source) {
            Ok(encoded_size) => units.push(ImageUnit {
                filepath: record.filepath.clone(),
                source,
                encoded_size,
            }),
            Err(e) => {
                tracing::warn!(filepath = %record.filepath, error = %e, "Image cannot be sent");
                unreadable.push((
                    ImageUnit {
                        filepath: record.filepath.clone(),
                        source,
                        encoded_size: 0,
                    },
                    DispatchFailure::from(e),
                ));
            }
        }
    }
    (units, unreadable)
}

/// Batch holding one unit, for failures recorded outside a planned batch.
fn singleton(index: usize, unit: ImageUnit) -> Batch<ImageUnit> {
    let mut batch = Batch::empty(index);
    let size = unit.encoded_size;
    batch.push(unit, size);
    batch
}

/// Encode every unit of a batch. Units that fail are split off with their
/// failure so the rest of the batch can still be sent.
async fn encode_batch(
    batch: Batch<ImageUnit>,
) -> (Batch<ImageUnit>, Vec<EncodedImage>, Vec<(ImageUnit, DispatchFailure)>) {
    let mut kept = Batch::empty(batch.index);
    let mut images = Vec::with_capacity(batch.len());
    let mut rejected = Vec::new();

    for unit in batch.items {
        match encoder::encode(&unit.source).await {
            Ok(image) => {
                images.push(image);
                let size = unit.encoded_size;
                kept.push(unit, size);
            }
            Err(e) => {
                tracing::warn!(filepath = %unit.filepath, error = %e, "Encoding failed");
                rejected.push((unit, e.into()));
            }
        }
    }
    (kept, images, rejected)
}

/// Push encoded images through the retry controller.
async fn dispatch_batch(
    state: &AppState,
    stop: &StopSignal,
    index: usize,
    images: Vec<EncodedImage>,
) -> AttemptResult {
    let request = CaptionRequest::for_batch(
        &state.settings.prompt,
        state.settings.system_prompt.as_deref(),
        images,
    );
    let request = &request;
    let dispatcher = state.dispatcher.as_ref();
    let limiter = state.limiter.as_ref();

    state
        .retry
        .run(stop, |attempt| async move {
            limiter.acquire().await;
            tracing::debug!(batch = index, attempt, "Sending batch");
            dispatcher.dispatch(request).await
        })
        .await
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Authentication with the vision API failed: {0}")]
    Auth(DispatchFailure),

    #[error("Recorder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
