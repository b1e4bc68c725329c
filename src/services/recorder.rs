use tokio::sync::mpsc;

use crate::config::ApprovalPolicy;
use crate::models::attempt::{AttemptOutcome, AttemptResult, DispatchFailure, FailureKind};
use crate::models::batch::Batch;
use crate::models::image::{ImageStatus, ImageUnit};
use crate::services::manifest::{ManifestError, ManifestStore};
use crate::services::stop::StopSignal;
use crate::services::text::split_bilingual;

/// A finished batch on its way to the recorder.
#[derive(Debug)]
pub struct RecordedBatch {
    pub batch: Batch<ImageUnit>,
    pub result: AttemptResult,
}

/// Unit-level totals for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub batches: usize,
    pub captioned: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// What the recorder hands back once its channel closes.
pub struct RecorderReport {
    pub store: ManifestStore,
    pub tally: Tally,
    /// Set when a batch failed in a way that invalidates the whole run.
    pub fatal: Option<DispatchFailure>,
}

/// Sole writer of image status. Owns the manifest for the duration of a run
/// and persists it after every recorded batch.
pub struct ResultRecorder {
    store: ManifestStore,
    policy: ApprovalPolicy,
    stop: StopSignal,
    tally: Tally,
    fatal: Option<DispatchFailure>,
}

impl ResultRecorder {
    pub fn new(store: ManifestStore, policy: ApprovalPolicy, stop: StopSignal) -> Self {
        Self {
            store,
            policy,
            stop,
            tally: Tally::default(),
            fatal: None,
        }
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    /// Fold a batch's final result into the manifest and save it.
    pub fn record(
        &mut self,
        batch: &Batch<ImageUnit>,
        result: &AttemptResult,
    ) -> Result<(), ManifestError> {
        self.tally.batches += 1;

        match &result.outcome {
            AttemptOutcome::Captioned(captions) if captions.len() == batch.len() => {
                for (unit, caption) in batch.items.iter().zip(captions) {
                    self.record_caption(unit, caption);
                }
                self.tally.captioned += batch.len();
            }
            AttemptOutcome::Captioned(captions) => {
                let failure = DispatchFailure::new(
                    FailureKind::MalformedResponse,
                    format!("{} captions for {} images", captions.len(), batch.len()),
                );
                self.record_failure(batch, &failure);
            }
            AttemptOutcome::Failed(failure) if failure.kind.is_fatal() => {
                tracing::error!(
                    batch = batch.index,
                    kind = %failure.kind,
                    error = %failure.message,
                    "Fatal dispatch failure, stopping run"
                );
                self.fatal.get_or_insert_with(|| failure.clone());
                self.stop.stop();
                return Ok(());
            }
            AttemptOutcome::Failed(failure) => self.record_failure(batch, failure),
            AttemptOutcome::Cancelled => {
                tracing::info!(batch = batch.index, units = batch.len(), "Batch cancelled, status unchanged");
                self.tally.cancelled += batch.len();
                return Ok(());
            }
        }

        if let Err(e) = self.store.save() {
            self.stop.stop();
            return Err(e);
        }
        tracing::info!(
            batch = batch.index,
            units = batch.len(),
            attempts = result.attempts,
            success = result.is_success(),
            captioned_total = self.tally.captioned,
            failed_total = self.tally.failed,
            "Recorded batch"
        );
        Ok(())
    }

    fn record_caption(&mut self, unit: &ImageUnit, caption: &str) {
        let (english, chinese) = split_bilingual(caption);
        let prompt_en = if english.is_empty() {
            caption.trim().to_string()
        } else {
            english
        };
        let status = match self.policy {
            ApprovalPolicy::Review => ImageStatus::Pending,
            ApprovalPolicy::AutoApprove => ImageStatus::Approved,
        };

        let updated = self.store.update(&unit.filepath, |record| {
            record.prompt_en = prompt_en;
            record.prompt_cn = chinese;
            record.status = status;
            record.retry_cnt = 0;
        });

        match updated {
            Ok(record) if self.policy == ApprovalPolicy::AutoApprove => {
                let record = record.clone();
                if let Err(e) = self.store.write_sidecar(&record, None) {
                    tracing::warn!(filepath = %unit.filepath, error = %e, "Failed to write caption file");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(filepath = %unit.filepath, error = %e, "Captioned image missing from manifest"),
        }
    }

    fn record_failure(&mut self, batch: &Batch<ImageUnit>, failure: &DispatchFailure) {
        for unit in &batch.items {
            let updated = self.store.update(&unit.filepath, |record| {
                record.retry_cnt += 1;
                record.status = ImageStatus::Retry(record.retry_cnt);
            });
            match updated {
                Ok(record) => tracing::warn!(
                    filepath = %unit.filepath,
                    kind = %failure.kind,
                    retry_cnt = record.retry_cnt,
                    error = %failure.message,
                    "Image failed"
                ),
                Err(e) => tracing::warn!(filepath = %unit.filepath, error = %e, "Failed image missing from manifest"),
            }
        }
        self.tally.failed += batch.len();
    }

    /// Consume finished batches until every sender is gone.
    pub async fn run(
        mut self,
        mut receiver: mpsc::Receiver<RecordedBatch>,
    ) -> Result<RecorderReport, ManifestError> {
        while let Some(finished) = receiver.recv().await {
            self.record(&finished.batch, &finished.result)?;
        }
        Ok(self.finish())
    }

    pub fn finish(self) -> RecorderReport {
        RecorderReport {
            store: self.store,
            tally: self.tally,
            fatal: self.fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::image::ImageRecord;
    use crate::services::manifest::MANIFEST_FILE_NAME;
    use tempfile::TempDir;

    fn setup(dir: &TempDir, keys: &[&str]) -> ManifestStore {
        let mut store = ManifestStore::create(dir.path().join(MANIFEST_FILE_NAME));
        for key in keys {
            store.add(key);
        }
        store
    }

    fn batch(keys: &[&str]) -> Batch<ImageUnit> {
        let mut batch = Batch::empty(0);
        for key in keys {
            batch.push(
                ImageUnit {
                    filepath: key.to_string(),
                    source: key.into(),
                    encoded_size: 10,
                },
                10,
            );
        }
        batch
    }

    fn record(store: &ManifestStore, key: &str) -> ImageRecord {
        store.get(key).unwrap().clone()
    }

    #[test]
    fn test_success_keeps_pending_and_resets_retries() {
        let dir = TempDir::new().unwrap();
        let mut store = setup(&dir, &["a.png", "b.png"]);
        store
            .update("a.png", |r| {
                r.retry_cnt = 2;
                r.status = ImageStatus::Retry(2);
            })
            .unwrap();

        let mut recorder = ResultRecorder::new(store, ApprovalPolicy::Review, StopSignal::new());
        let result = AttemptResult::captioned(
            1,
            vec!["a cat\n一只猫".to_string(), "a dog".to_string()],
        );
        recorder.record(&batch(&["a.png", "b.png"]), &result).unwrap();

        let a = record(recorder.store(), "a.png");
        assert_eq!(a.status, ImageStatus::Pending);
        assert_eq!(a.retry_cnt, 0);
        assert_eq!(a.prompt_en, "a cat");
        assert_eq!(a.prompt_cn, "一只猫");

        // Persisted immediately.
        let on_disk = ManifestStore::open(dir.path().join(MANIFEST_FILE_NAME)).unwrap();
        assert_eq!(on_disk.get("b.png").unwrap().prompt_en, "a dog");
    }

    #[test]
    fn test_auto_approve_writes_sidecar() {
        let dir = TempDir::new().unwrap();
        let store = setup(&dir, &["a.png"]);
        let mut recorder = ResultRecorder::new(store, ApprovalPolicy::AutoApprove, StopSignal::new());

        recorder
            .record(&batch(&["a.png"]), &AttemptResult::captioned(1, vec!["a cat".into()]))
            .unwrap();

        assert_eq!(record(recorder.store(), "a.png").status, ImageStatus::Approved);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "a cat");
    }

    #[test]
    fn test_failure_increments_retry_count() {
        let dir = TempDir::new().unwrap();
        let mut store = setup(&dir, &["a.png"]);
        store.update("a.png", |r| r.retry_cnt = 1).unwrap();
        let mut recorder = ResultRecorder::new(store, ApprovalPolicy::Review, StopSignal::new());

        let failure = DispatchFailure::new(FailureKind::Timeout, "timed out");
        recorder
            .record(&batch(&["a.png"]), &AttemptResult::failed(3, failure))
            .unwrap();

        let a = record(recorder.store(), "a.png");
        assert_eq!(a.retry_cnt, 2);
        assert_eq!(a.status, ImageStatus::Retry(2));
        assert_eq!(recorder.finish().tally.failed, 1);
    }

    #[test]
    fn test_auth_failure_is_not_recorded_per_unit() {
        let dir = TempDir::new().unwrap();
        let store = setup(&dir, &["a.png"]);
        let stop = StopSignal::new();
        let mut recorder = ResultRecorder::new(store, ApprovalPolicy::Review, stop.clone());

        let failure = DispatchFailure::new(FailureKind::Auth, "401");
        recorder
            .record(&batch(&["a.png"]), &AttemptResult::failed(1, failure))
            .unwrap();

        assert!(stop.is_stopped());
        let a = record(recorder.store(), "a.png");
        assert_eq!(a.status, ImageStatus::Pending);
        assert_eq!(a.retry_cnt, 0);
        assert_eq!(recorder.finish().fatal.unwrap().kind, FailureKind::Auth);
    }

    #[test]
    fn test_cancelled_leaves_status_alone() {
        let dir = TempDir::new().unwrap();
        let store = setup(&dir, &["a.png"]);
        let mut recorder = ResultRecorder::new(store, ApprovalPolicy::Review, StopSignal::new());
        recorder
            .record(&batch(&["a.png"]), &AttemptResult::cancelled(0))
            .unwrap();

        assert_eq!(record(recorder.store(), "a.png"), ImageRecord::new("a.png"));
        // Nothing changed, nothing written.
        assert!(!dir.path().join(MANIFEST_FILE_NAME).exists());
    }

    #[test]
    fn test_caption_count_mismatch_fails_whole_batch() {
        let dir = TempDir::new().unwrap();
        let store = setup(&dir, &["a.png", "b.png"]);
        let mut recorder = ResultRecorder::new(store, ApprovalPolicy::Review, StopSignal::new());
        recorder
            .record(
                &batch(&["a.png", "b.png"]),
                &AttemptResult::captioned(1, vec!["only one".into()]),
            )
            .unwrap();

        for key in ["a.png", "b.png"] {
            assert_eq!(record(recorder.store(), key).status, ImageStatus::Retry(1));
        }
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let dir = TempDir::new().unwrap();
        let store = setup(&dir, &["a.png", "b.png"]);
        let recorder = ResultRecorder::new(store, ApprovalPolicy::Review, StopSignal::new());
        let (sender, receiver) = mpsc::channel(4);
        let handle = tokio::spawn(recorder.run(receiver));

        for key in ["a.png", "b.png"] {
            sender
                .send(RecordedBatch {
                    batch: batch(&[key]),
                    result: AttemptResult::captioned(1, vec![format!("caption {key}")]),
                })
                .await
                .unwrap();
        }
        drop(sender);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.tally.batches, 2);
        assert_eq!(report.tally.captioned, 2);
        assert_eq!(report.store.get("b.png").unwrap().prompt_en, "caption b.png");
    }
}
