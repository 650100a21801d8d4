use anyhow::{Context, Result};
use facecomp_core::{CancelToken, FaceModels, GenerationOrchestrator, GenerationParams, HarmonicInpainter, ModelPaths};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

mod config;
mod worker;

use config::Config;
use worker::{ComposeJob, JobOutcome, WorkerHandle, WorkerStatus};

/// One stdin line from the supervisor.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Command {
    Compose {
        /// Generated when omitted.
        id: Option<String>,
        background: PathBuf,
        face: PathBuf,
        /// Random when omitted.
        seed: Option<u64>,
        #[serde(default)]
        params: GenerationParams,
    },
    Cancel {
        id: String,
    },
    SwitchMode {
        faceid: bool,
    },
    Status,
}

/// One JSON completion line on stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Accepted {
        id: String,
        seed: u64,
    },
    Done {
        id: String,
        #[serde(flatten)]
        outcome: JobOutcome,
    },
    Failed {
        id: String,
        kind: &'static str,
        error: String,
    },
    Status(WorkerStatus),
    Error {
        error: String,
    },
}

type InFlight = Arc<Mutex<HashMap<String, CancelToken>>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("facecompd starting");

    let config = Config::load().context("loading configuration")?;
    let mode = config.mode()?;
    let paths = ModelPaths::in_dir(&config.model_dir);
    let models = FaceModels::load(&paths, config.swap_model)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let orchestrator = GenerationOrchestrator::new(models, Box::new(HarmonicInpainter::new()), mode);
    let handle = worker::spawn_worker(orchestrator, config.outputs_dir.clone(), config.queue_depth)
        .context("failed to spawn worker thread")?;

    tracing::info!(
        model_dir = %config.model_dir.display(),
        outputs = %config.outputs_dir.display(),
        queue_depth = config.queue_depth,
        "facecompd ready"
    );

    // Replies from the command loop and from job tasks share one ordered writer.
    let (replies, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(line) = reply_rx.recv().await {
            println!("{line}");
        }
    });

    let mut session = Session::new(handle, replies);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => session.dispatch(&line).await,
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                interrupted = true;
                break;
            }
        }
    }

    session.shutdown(interrupted).await;
    printer.await.context("reply writer")?;
    tracing::info!("facecompd shutting down");
    Ok(())
}

/// Command state for one stdin stream: the worker, the running compose
/// tasks and their cancel tokens.
struct Session {
    handle: WorkerHandle,
    in_flight: InFlight,
    jobs: JoinSet<()>,
    replies: mpsc::UnboundedSender<String>,
}

impl Session {
    fn new(handle: WorkerHandle, replies: mpsc::UnboundedSender<String>) -> Self {
        Self {
            handle,
            in_flight: Arc::default(),
            jobs: JoinSet::new(),
            replies,
        }
    }

    async fn dispatch(&mut self, line: &str) {
        let command = match serde_json::from_str::<Command>(line) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable command");
                emit(&self.replies, &Reply::Error {
                    error: format!("bad command: {e}"),
                });
                return;
            }
        };

        match command {
            Command::Compose {
                id,
                background,
                face,
                seed,
                mut params,
            } => {
                let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                params.seed = seed.unwrap_or_else(|| rand::random::<u32>() as u64);
                let cancel = CancelToken::new();
                if let Ok(mut jobs) = self.in_flight.lock() {
                    jobs.insert(id.clone(), cancel.clone());
                }
                emit(&self.replies, &Reply::Accepted {
                    id: id.clone(),
                    seed: params.seed,
                });

                let job = ComposeJob {
                    id: id.clone(),
                    background,
                    face,
                    params,
                };
                let handle = self.handle.clone();
                let in_flight = Arc::clone(&self.in_flight);
                let replies = self.replies.clone();
                self.jobs.spawn(async move {
                    let reply = match handle.compose(job, cancel).await {
                        Ok(outcome) => Reply::Done { id: id.clone(), outcome },
                        Err(e) => Reply::Failed {
                            id: id.clone(),
                            kind: e.kind(),
                            error: e.to_string(),
                        },
                    };
                    if let Ok(mut jobs) = in_flight.lock() {
                        jobs.remove(&id);
                    }
                    emit(&replies, &reply);
                });
            }
            Command::Cancel { id } => {
                let token = self.in_flight.lock().ok().and_then(|jobs| jobs.get(&id).cloned());
                match token {
                    Some(token) => {
                        tracing::info!(id = %id, "cancel requested");
                        token.cancel();
                    }
                    None => emit(&self.replies, &Reply::Error {
                        error: format!("no running job '{id}'"),
                    }),
                }
            }
            Command::SwitchMode { faceid } => match self.handle.switch_mode(faceid).await {
                Ok(status) => emit(&self.replies, &Reply::Status(status)),
                Err(e) => emit(&self.replies, &Reply::Error { error: e.to_string() }),
            },
            Command::Status => match self.handle.status().await {
                Ok(status) => emit(&self.replies, &Reply::Status(status)),
                Err(e) => emit(&self.replies, &Reply::Error { error: e.to_string() }),
            },
        }
    }

    /// Wait until every accepted job has written its `done` or `failed` line.
    ///
    /// With `cancel`, running and queued jobs are asked to stop first; they
    /// still report.
    async fn shutdown(mut self, cancel: bool) {
        if cancel {
            for (id, token) in self.in_flight.lock().map(|m| m.clone()).unwrap_or_default() {
                tracing::info!(id = %id, "cancelling unfinished job");
                token.cancel();
            }
        }
        if !self.jobs.is_empty() {
            tracing::info!(jobs = self.jobs.len(), "waiting for jobs to finish");
        }
        while let Some(joined) = self.jobs.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "compose task ended abnormally");
            }
        }
    }
}

fn emit(replies: &mpsc::UnboundedSender<String>, reply: &Reply) {
    match serde_json::to_string(reply) {
        Ok(line) => {
            if replies.send(line).is_err() {
                tracing::warn!("reply writer is gone");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode reply"),
    }
}
