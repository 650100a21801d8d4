use facecomp_core::artifacts::{Artifact, ArtifactError, RunFolder, RunRecord};
use facecomp_core::models::Availability;
use facecomp_core::protocol::{ChannelSink, ProgressEvent};
use facecomp_core::request::RequestError;
use facecomp_core::{
    CancelToken, ComposeContext, ComposeError, CompositeRequest, GenerationOrchestrator, GenerationParams,
    StageStatus,
};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("cannot read {path}: {source}")]
    Input {
        path: String,
        source: image::ImageError,
    },
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error("artifacts: {0}")]
    Artifacts(#[from] ArtifactError),
    #[error("worker thread exited")]
    ChannelClosed,
}

impl WorkerError {
    /// Short machine-readable failure kind for completion lines.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Input { .. } | WorkerError::Request(_) => "invalid_request",
            WorkerError::Compose(ComposeError::NoFaceFound) => "no_face_found",
            WorkerError::Compose(ComposeError::ModelUnavailable(_)) => "model_unavailable",
            WorkerError::Compose(ComposeError::Cancelled) => "cancelled",
            WorkerError::Compose(ComposeError::InvalidRequest(_)) => "invalid_request",
            WorkerError::Compose(_) => "engine",
            WorkerError::Artifacts(_) => "artifacts",
            WorkerError::ChannelClosed => "worker_exited",
        }
    }
}

/// One compose job as submitted by the supervisor.
#[derive(Debug, Clone)]
pub struct ComposeJob {
    pub id: String,
    pub background: PathBuf,
    pub face: PathBuf,
    pub params: GenerationParams,
}

/// Result of a finished job.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub result: PathBuf,
    pub run_folder: PathBuf,
    pub mode: String,
    pub similarity: Option<f32>,
    pub generated_prompt: Option<String>,
    /// Stages that fell back, with the reason.
    pub degraded: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub mode: String,
    pub models: Availability,
}

/// Messages sent from the stdin loop to the worker thread.
enum WorkerRequest {
    Compose {
        job: ComposeJob,
        cancel: CancelToken,
        reply: oneshot::Sender<Result<JobOutcome, WorkerError>>,
    },
    SwitchMode {
        faceid: bool,
        reply: oneshot::Sender<Result<WorkerStatus, WorkerError>>,
    },
    Status {
        reply: oneshot::Sender<WorkerStatus>,
    },
}

/// Clone-safe handle to the worker thread.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
}

impl WorkerHandle {
    /// Queue a job; waits while the queue is full.
    pub async fn compose(&self, job: ComposeJob, cancel: CancelToken) -> Result<JobOutcome, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest::Compose {
                job,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }

    /// Switch to `faceid` (true) or `standard` (false) for later jobs.
    pub async fn switch_mode(&self, faceid: bool) -> Result<WorkerStatus, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest::SwitchMode { faceid, reply: reply_tx })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<WorkerStatus, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)
    }
}

/// Spawn the worker on a dedicated OS thread.
///
/// The orchestrator arrives with its models already loaded; jobs run one at
/// a time in arrival order, and at most `queue_depth` wait behind the current one.
pub fn spawn_worker(
    mut orchestrator: GenerationOrchestrator,
    outputs_dir: PathBuf,
    queue_depth: usize,
) -> std::io::Result<WorkerHandle> {
    let (tx, mut rx) = mpsc::channel::<WorkerRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("facecomp-worker".into())
        .spawn(move || {
            tracing::info!(mode = %orchestrator.current_mode(), "worker thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    WorkerRequest::Compose { job, cancel, reply } => {
                        let id = job.id.clone();
                        let result = run_job(&mut orchestrator, &outputs_dir, job, cancel);
                        if let Err(e) = &result {
                            tracing::warn!(id = %id, error = %e, "job failed");
                        }
                        let _ = reply.send(result);
                    }
                    WorkerRequest::SwitchMode { faceid, reply } => {
                        let switched = if faceid {
                            orchestrator.switch_to_faceid().map_err(WorkerError::from)
                        } else {
                            orchestrator.switch_to_standard();
                            Ok(())
                        };
                        let _ = reply.send(switched.map(|()| status(&orchestrator)));
                    }
                    WorkerRequest::Status { reply } => {
                        let _ = reply.send(status(&orchestrator));
                    }
                }
            }
            tracing::info!("worker thread exiting");
        })?;

    Ok(WorkerHandle { tx })
}

fn status(orchestrator: &GenerationOrchestrator) -> WorkerStatus {
    WorkerStatus {
        mode: orchestrator.current_mode().to_string(),
        models: orchestrator.availability(),
    }
}

fn run_job(
    orchestrator: &mut GenerationOrchestrator,
    outputs_dir: &Path,
    job: ComposeJob,
    cancel: CancelToken,
) -> Result<JobOutcome, WorkerError> {
    if cancel.is_cancelled() {
        return Err(ComposeError::Cancelled.into());
    }
    let background = load_rgb(&job.background)?;
    let face = load_rgb(&job.face)?;
    let request = CompositeRequest::new(background, face, job.params.clone())?;

    let run = RunFolder::create(outputs_dir, Some(&job.id))?;
    tracing::info!(id = %job.id, run = %run.path().display(), "job started");

    let (tx, rx) = std::sync::mpsc::channel();
    let result = std::thread::scope(|scope| {
        let id = job.id.as_str();
        scope.spawn(move || forward_progress(id, rx));
        let mut sink = ChannelSink(tx);
        orchestrator.compose(
            &request,
            ComposeContext {
                sink: &mut sink,
                cancel,
                run_folder: Some(&run),
            },
        )
    })?;

    let prompt_used = result.generated_prompt.as_deref().unwrap_or(&job.params.prompt);
    let record = RunRecord {
        command: format!("facecompd job {}", job.id),
        background_path: &job.background,
        face_path: &job.face,
        params: &job.params,
        prompt_used,
        mode: orchestrator.current_mode(),
    };
    if let Err(e) = run.write_params(&record) {
        tracing::warn!(id = %job.id, error = %e, "failed to write params.txt");
    }

    let degraded = result
        .stages
        .iter()
        .filter_map(|r| match &r.status {
            StageStatus::Degraded(reason) => Some(format!("{:?}: {reason}", r.stage)),
            _ => None,
        })
        .collect();

    Ok(JobOutcome {
        result: run.artifact_path(Artifact::Result),
        run_folder: run.path().to_path_buf(),
        mode: result.effective_mode.to_string(),
        similarity: result.identity_similarity,
        generated_prompt: result.generated_prompt,
        degraded,
    })
}

/// Protocol lines verbatim, each step followed by a JSON progress line for job `id`.
fn forward_progress(id: &str, events: std::sync::mpsc::Receiver<ProgressEvent>) {
    let stdout = std::io::stdout();
    for event in events {
        let mut out = stdout.lock();
        let mut text = event.to_line();
        if let Some(percent) = event.percent() {
            let progress = serde_json::json!({ "type": "progress", "id": id, "percent": percent });
            text.push('\n');
            text.push_str(&progress.to_string());
        }
        if let Err(e) = writeln!(out, "{text}").and_then(|_| out.flush()) {
            tracing::warn!(id, error = %e, "failed to write progress line");
        }
    }
}

fn load_rgb(path: &Path) -> Result<image::RgbImage, WorkerError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| WorkerError::Input {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facecomp_core::detector::{DetectorError, FaceLocator};
    use facecomp_core::{BoundingBox, FaceModels, HarmonicInpainter, IdentityMode};
    use image::{Rgb, RgbImage};

    /// One face in the middle of every image.
    struct CentreFace;

    impl FaceLocator for CentreFace {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            let (w, h) = (image.width() as f32, image.height() as f32);
            Ok(vec![BoundingBox::new(w * 0.35, h * 0.3, w * 0.3, h * 0.4)])
        }
    }

    struct NoFace;

    impl FaceLocator for NoFace {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(Vec::new())
        }
    }

    fn worker(detector: Box<dyn FaceLocator + Send>, outputs: &Path) -> WorkerHandle {
        let models = FaceModels::with_detector(detector);
        let orch = GenerationOrchestrator::new(models, Box::new(HarmonicInpainter::new()), IdentityMode::Standard);
        spawn_worker(orch, outputs.to_path_buf(), 2).unwrap()
    }

    fn job(dir: &Path, id: &str) -> ComposeJob {
        let bg = dir.join("bg.png");
        let face = dir.join("face.png");
        RgbImage::from_pixel(64, 48, Rgb([90, 100, 110])).save(&bg).unwrap();
        RgbImage::from_pixel(32, 32, Rgb([200, 160, 140])).save(&face).unwrap();
        ComposeJob {
            id: id.into(),
            background: bg,
            face,
            params: GenerationParams {
                steps: 2,
                mask_blur: 2.0,
                seed: 1,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_compose_writes_result() {
        let dir = tempfile::tempdir().unwrap();
        let handle = worker(Box::new(CentreFace), &dir.path().join("outputs"));
        let outcome = handle
            .compose(job(dir.path(), "job1"), CancelToken::new())
            .await
            .unwrap();
        assert!(outcome.result.exists());
        assert!(outcome.run_folder.join("params.txt").exists());
        let saved = image::open(&outcome.result).unwrap();
        assert_eq!((saved.width(), saved.height()), (64, 48));
        assert_eq!(outcome.mode, "standard");
    }

    #[tokio::test]
    async fn test_no_face_kind() {
        let dir = tempfile::tempdir().unwrap();
        let handle = worker(Box::new(NoFace), &dir.path().join("outputs"));
        let err = handle
            .compose(job(dir.path(), "job2"), CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_face_found");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let handle = worker(Box::new(CentreFace), &dir.path().join("outputs"));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = handle.compose(job(dir.path(), "job3"), cancel).await.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[tokio::test]
    async fn test_switch_mode_needs_identity() {
        let dir = tempfile::tempdir().unwrap();
        let handle = worker(Box::new(CentreFace), dir.path());
        let err = handle.switch_mode(true).await.unwrap_err();
        assert_eq!(err.kind(), "model_unavailable");
        let status = handle.switch_mode(false).await.unwrap();
        assert_eq!(status.mode, "standard");
        assert!(!status.models.identity);
    }
}
