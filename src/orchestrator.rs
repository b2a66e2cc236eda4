//! Restoration workflow: stage, upload, submit, poll, persist.
//!
//! Each call to [`Orchestrator::submit`] is one sequential job. Nothing is
//! shared between jobs except the directories owned by [`ArtifactStore`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::cancel::CancelToken;
use crate::job::RestoreJob;
use crate::restore::{PredictionHandle, PredictionState, RestorationService, RestoreError, Stage};
use crate::storage::ArtifactStore;

/// Hard ceiling on status checks per prediction.
pub const MAX_POLL_ATTEMPTS: u32 = 60;

/// Successful job result.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub job_id: String,
    /// Name of the restored file inside the results directory.
    pub result_name: String,
}

/// Drives uploaded images through a [`RestorationService`].
pub struct Orchestrator {
    service: Arc<dyn RestorationService>,
    store: ArtifactStore,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        service: Arc<dyn RestorationService>,
        store: ArtifactStore,
        poll_interval: Duration,
    ) -> Self {
        Self {
            service,
            store,
            poll_interval,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Runs one restoration job to completion.
    ///
    /// Every stage failure ends the job immediately; nothing is retried.
    /// `cancel` aborts the job while it is waiting on the prediction.
    pub async fn submit(
        &self,
        image: Vec<u8>,
        original_filename: &str,
        content_type: &str,
        cancel: CancelToken,
    ) -> Result<RestoreOutcome, RestoreError> {
        if image.is_empty() {
            return Err(RestoreError::InvalidInput("uploaded file is empty".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(RestoreError::Cancelled);
        }

        let size = image.len();
        let staged = self.store.stage(original_filename, &image).await?;
        // the upload stage reads the staged copy back
        drop(image);
        let mut job = RestoreJob::new(staged.id, staged.path);
        let span = info_span!("restore_job", job_id = %job.id());

        async {
            info!(bytes = size, content_type, "restoration job started");
            match self.run(&mut job, content_type, cancel).await {
                Ok(result_name) => {
                    info!(
                        result = %result_name,
                        path = ?job.result_path(),
                        "restoration job succeeded"
                    );
                    Ok(RestoreOutcome {
                        job_id: job.id().to_string(),
                        result_name,
                    })
                }
                Err(err) => {
                    job.fail(&err);
                    warn!(status = job.status().as_str(), error = %err, "restoration job ended");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        job: &mut RestoreJob,
        content_type: &str,
        cancel: CancelToken,
    ) -> Result<String, RestoreError> {
        let bytes = self.store.read_staged(job.source_path()).await?;
        let slot = self.service.create_upload(job.id(), content_type).await?;
        let slot = job.begin_upload(slot)?;
        self.service.upload(slot, bytes, content_type).await?;

        let handle = self.service.create_prediction(&slot.download_url).await?;
        debug!(prediction = %handle, "prediction submitted");
        let handle = job.mark_submitted(handle)?.clone();

        job.begin_polling()?;
        let output_url = self.poll_until_done(&handle, cancel).await?;

        let restored = self.service.fetch_output(&output_url).await?;
        let stored = self.store.persist_result(job.id(), &restored).await?;
        job.succeed(stored.path)?;
        Ok(stored.name)
    }

    /// Polls `handle` until a terminal state, at most [`MAX_POLL_ATTEMPTS`] times.
    ///
    /// Waits `poll_interval` between checks, never after the last one.
    pub(crate) async fn poll_until_done(
        &self,
        handle: &PredictionHandle,
        mut cancel: CancelToken,
    ) -> Result<String, RestoreError> {
        for attempt in 1..=MAX_POLL_ATTEMPTS {
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
                status = self.service.get_prediction(handle) => status?,
            };

            match status.state {
                PredictionState::Succeeded => {
                    return status.output_url().ok_or_else(|| RestoreError::Upstream {
                        stage: Stage::Poll,
                        status: None,
                        body: format!("prediction succeeded without an output url: {}", status.raw),
                    });
                }
                PredictionState::Failed | PredictionState::Canceled => {
                    return Err(RestoreError::PredictionFailed { detail: status.raw });
                }
                state => debug!(attempt, ?state, "prediction still running"),
            }

            if attempt < MAX_POLL_ATTEMPTS {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        Err(RestoreError::Timeout {
            attempts: MAX_POLL_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::task::JoinSet;

    use super::{Orchestrator, MAX_POLL_ATTEMPTS};
    use crate::cancel::CancelToken;
    use crate::restore::{
        PredictionHandle, PredictionStatus, RestorationService, RestoreError, Stage, UploadSlot,
    };
    use crate::storage::{ArtifactStore, RESULT_PREFIX};

    const INTERVAL: Duration = Duration::from_secs(1);
    const OUTPUT: &[u8] = b"restored-image-bytes";

    /// In-memory service that follows a script of poll responses.
    #[derive(Default)]
    struct ScriptedService {
        reject_upload_slot: bool,
        polls: Mutex<VecDeque<PredictionStatus>>,
        slot_calls: AtomicUsize,
        upload_calls: AtomicUsize,
        submit_calls: AtomicUsize,
        poll_calls: AtomicUsize,
        fetch_calls: AtomicUsize,
        uploaded: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedService {
        fn with_polls(states: &[&str]) -> Self {
            let polls = states
                .iter()
                .map(|state| {
                    let error = (*state == "failed").then_some("model crashed");
                    PredictionStatus::from_json(json!({
                        "status": state,
                        "output": ["https://cdn.test/out.png"],
                        "error": error,
                    }))
                })
                .collect();
            Self {
                polls: Mutex::new(polls),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl RestorationService for ScriptedService {
        async fn create_upload(
            &self,
            filename: &str,
            _content_type: &str,
        ) -> Result<UploadSlot, RestoreError> {
            self.slot_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_upload_slot {
                return Err(RestoreError::Upstream {
                    stage: Stage::AcquireUpload,
                    status: Some(401),
                    body: "invalid token".to_string(),
                });
            }
            Ok(UploadSlot {
                upload_url: format!("https://up.test/put/{filename}"),
                download_url: format!("https://up.test/get/{filename}"),
            })
        }

        async fn upload(
            &self,
            _slot: &UploadSlot,
            bytes: Vec<u8>,
            _content_type: &str,
        ) -> Result<(), RestoreError> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            self.uploaded.lock().unwrap().push(bytes);
            Ok(())
        }

        async fn create_prediction(
            &self,
            input_url: &str,
        ) -> Result<PredictionHandle, RestoreError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PredictionHandle(format!("https://api.test/p?input={input_url}")))
        }

        async fn get_prediction(
            &self,
            _handle: &PredictionHandle,
        ) -> Result<PredictionStatus, RestoreError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.polls.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| {
                PredictionStatus::from_json(json!({"status": "processing", "output": null}))
            }))
        }

        async fn fetch_output(&self, _url: &str) -> Result<Vec<u8>, RestoreError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(OUTPUT.to_vec())
        }
    }

    async fn orchestrator(service: Arc<ScriptedService>) -> (Orchestrator, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).await.expect("store");
        (Orchestrator::new(service, store, INTERVAL), dir)
    }

    fn never() -> CancelToken {
        let (guard, token) = CancelToken::root();
        std::mem::forget(guard);
        token
    }

    fn file_names(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .expect("read_dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn successful_job_stores_exactly_one_result() {
        let service = Arc::new(ScriptedService::with_polls(&["starting", "succeeded"]));
        let (orch, _dir) = orchestrator(service.clone()).await;

        tokio::time::pause();
        let outcome = orch
            .submit(b"jpeg-bytes".to_vec(), "face.jpg", "image/jpeg", never())
            .await
            .expect("restored");

        assert!(outcome.job_id.ends_with("_face.jpg"));
        assert_eq!(outcome.result_name, format!("{RESULT_PREFIX}{}", outcome.job_id));
        assert_eq!(file_names(orch.store().results_dir()), vec![outcome.result_name.clone()]);
        assert_eq!(file_names(orch.store().staging_dir()), vec![outcome.job_id.clone()]);

        let artifact = orch.store().retrieve(&outcome.result_name).await.expect("retrieve");
        assert_eq!(artifact.bytes, OUTPUT);
        assert_eq!(service.uploaded.lock().unwrap().as_slice(), &[b"jpeg-bytes".to_vec()]);
        assert_eq!(service.poll_calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_upload_slot_never_submits_a_prediction() {
        let service = Arc::new(ScriptedService {
            reject_upload_slot: true,
            ..ScriptedService::default()
        });
        let (orch, _dir) = orchestrator(service.clone()).await;

        let err = orch
            .submit(b"jpeg".to_vec(), "face.jpg", "image/jpeg", never())
            .await
            .expect_err("must fail");

        assert!(matches!(
            err,
            RestoreError::Upstream {
                stage: Stage::AcquireUpload,
                status: Some(401),
                ..
            }
        ));
        assert_eq!(service.slot_calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.upload_calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.submit_calls.load(Ordering::SeqCst), 0);
        assert!(file_names(orch.store().results_dir()).is_empty());
    }

    #[tokio::test]
    async fn failed_prediction_stops_polling_at_that_attempt() {
        let service = Arc::new(ScriptedService::with_polls(&[
            "starting",
            "processing",
            "failed",
            "succeeded",
        ]));
        let (orch, _dir) = orchestrator(service.clone()).await;

        tokio::time::pause();
        let err = orch
            .submit(b"jpeg".to_vec(), "face.jpg", "image/jpeg", never())
            .await
            .expect_err("must fail");

        match err {
            RestoreError::PredictionFailed { detail } => {
                assert_eq!(detail["status"], "failed");
                assert_eq!(detail["error"], "model crashed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(service.poll_calls.load(Ordering::SeqCst), 3);
        assert_eq!(service.fetch_calls.load(Ordering::SeqCst), 0);
        assert!(file_names(orch.store().results_dir()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_gives_up_after_exactly_sixty_checks() {
        let service = Arc::new(ScriptedService::default());
        let (orch, _dir) = orchestrator(service.clone()).await;
        let handle = PredictionHandle("https://api.test/p/1".to_string());

        let started = tokio::time::Instant::now();
        let err = orch
            .poll_until_done(&handle, never())
            .await
            .expect_err("must time out");

        assert!(matches!(err, RestoreError::Timeout { attempts: 60 }));
        assert_eq!(
            service.poll_calls.load(Ordering::SeqCst),
            MAX_POLL_ATTEMPTS as usize
        );
        assert_eq!(started.elapsed(), INTERVAL * (MAX_POLL_ATTEMPTS - 1));
    }

    #[tokio::test]
    async fn timed_out_job_leaves_no_result() {
        let service = Arc::new(ScriptedService::default());
        let (orch, _dir) = orchestrator(service.clone()).await;

        tokio::time::pause();
        let err = orch
            .submit(b"jpeg".to_vec(), "face.jpg", "image/jpeg", never())
            .await
            .expect_err("must time out");

        assert!(matches!(err, RestoreError::Timeout { .. }));
        assert_eq!(service.poll_calls.load(Ordering::SeqCst), 60);
        assert!(file_names(orch.store().results_dir()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_polling() {
        let service = Arc::new(ScriptedService::default());
        let (orch, _dir) = orchestrator(service.clone()).await;
        let handle = PredictionHandle("https://api.test/p/1".to_string());
        let (guard, token) = CancelToken::root();

        let canceller = async {
            tokio::time::sleep(INTERVAL * 5 + INTERVAL / 2).await;
            drop(guard);
        };
        let (result, ()) = tokio::join!(orch.poll_until_done(&handle, token), canceller);

        assert!(matches!(result, Err(RestoreError::Cancelled)));
        assert_eq!(service.poll_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn empty_upload_is_rejected_before_staging() {
        let service = Arc::new(ScriptedService::default());
        let (orch, _dir) = orchestrator(service.clone()).await;

        let err = orch
            .submit(Vec::new(), "face.jpg", "image/jpeg", never())
            .await
            .expect_err("must fail");

        assert!(matches!(err, RestoreError::InvalidInput(_)));
        assert_eq!(service.slot_calls.load(Ordering::SeqCst), 0);
        assert!(file_names(orch.store().staging_dir()).is_empty());
    }

    #[tokio::test]
    async fn concurrent_jobs_never_share_filenames() {
        let service = Arc::new(ScriptedService::default());
        for _ in 0..16 {
            service.polls.lock().unwrap().push_back(PredictionStatus::from_json(
                json!({"status": "succeeded", "output": "https://cdn.test/out.png"}),
            ));
        }
        let (orch, _dir) = orchestrator(service.clone()).await;
        let orch = Arc::new(orch);

        let mut jobs = JoinSet::new();
        for _ in 0..16 {
            let orch = orch.clone();
            jobs.spawn(async move {
                orch.submit(b"same".to_vec(), "same.jpg", "image/jpeg", never())
                    .await
            });
        }

        let mut names = HashSet::new();
        while let Some(joined) = jobs.join_next().await {
            let outcome = joined.expect("join").expect("restored");
            assert!(names.insert(outcome.result_name));
        }
        assert_eq!(names.len(), 16);
        assert_eq!(file_names(orch.store().results_dir()).len(), 16);
        assert_eq!(file_names(orch.store().staging_dir()).len(), 16);
    }
}
