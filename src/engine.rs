//! One long-lived `tokio::task` per pool slot, owning an
//! [`EpdState`] and a [`Transcriber`], processing one client session per
//! main-loop iteration.
//!
//! Modeled as a `tokio::task` rather than an OS process: Rust has no GIL,
//! so there's no interpreter-level contention to isolate workers from.
//! Crash/queue isolation between sessions is preserved instead by
//! resetting all per-session state at the top of every loop iteration and
//! by never letting a panic inside one session corrupt the next (the
//! blocking transcribe call is isolated in its own task via
//! `spawn_blocking`, which converts a panic there into a recoverable
//! `JoinError` instead of taking the worker down).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::epd::EpdState;
use crate::transcriber::Transcriber;
use crate::vad::FrameClassifier;

#[derive(Debug)]
pub enum WorkerInput {
    Begin(String),
    Speech(Vec<u8>),
    Finish,
    /// Any wire code other than `%s`/`%f`/`%b` relayed verbatim from the
    /// session handler: an unexpected code is the worker's problem to
    /// report, not the relay's to filter.
    Illegal(String),
}

#[derive(Debug, Clone)]
pub enum WorkerOutput {
    Result(String),
    Error(String),
    /// Idempotent terminator; may be sent more than once per session.
    Final,
}

pub struct WorkerConfig {
    pub frame_size: usize,
    pub frame_duration_ms: u32,
    pub sample_rate: u32,
    pub language: String,
    /// Mirrors `socket_timeout + 1`s: the worker always outlives a client
    /// read timeout by one second.
    pub recv_timeout: Duration,
    /// Whether to dump the session's raw PCM to disk on every session end.
    pub save_pcm: bool,
    pub pcm_path: String,
}

/// Runs forever, one iteration per client session. Exits only if the
/// in-queue is closed (pool shutdown).
pub async fn run_worker(
    id: usize,
    mut in_rx: mpsc::Receiver<WorkerInput>,
    out_tx: mpsc::Sender<WorkerOutput>,
    classifier: Arc<dyn FrameClassifier>,
    transcriber: Arc<dyn Transcriber>,
    config: WorkerConfig,
) {
    info!(engine_id = id, backend = transcriber.name(), "ASR worker starting");

    loop {
        let mut epd = EpdState::new(config.frame_size, config.frame_duration_ms, config.sample_rate);
        epd.reset();

        // Block until the session-start token (%b) arrives, discarding
        // anything else received first.
        let username = loop {
            match in_rx.recv().await {
                Some(WorkerInput::Begin(name)) => break name,
                Some(_) => continue,
                None => {
                    info!(engine_id = id, "worker shutting down: in-queue closed");
                    return;
                }
            }
        };
        debug!(engine_id = id, user = %username, "session begin");

        let session_result = run_session(id, &mut in_rx, &out_tx, &classifier, &transcriber, &config, &mut epd).await;
        if let Err(e) = session_result {
            warn!(engine_id = id, user = %username, error = %e, "session ended with error");
            let _ = out_tx.send(WorkerOutput::Error(format!("WorkerError:{e}"))).await;
        }

        // Idempotent terminator; safe to send more than once per session.
        let _ = out_tx.send(WorkerOutput::Final).await;

        if config.save_pcm {
            match crate::recorder::save_session_pcm(&config.pcm_path, &username, epd.pcm()).await {
                Ok(Some(path)) => debug!(engine_id = id, user = %username, path = %path.display(), "session PCM saved"),
                Ok(None) => {}
                Err(e) => warn!(engine_id = id, user = %username, error = %e, "failed to save session PCM"),
            }
        }
    }
}

async fn run_session(
    id: usize,
    in_rx: &mut mpsc::Receiver<WorkerInput>,
    out_tx: &mpsc::Sender<WorkerOutput>,
    classifier: &Arc<dyn FrameClassifier>,
    transcriber: &Arc<dyn Transcriber>,
    config: &WorkerConfig,
    epd: &mut EpdState,
) -> Result<(), String> {
    loop {
        let next = tokio::time::timeout(config.recv_timeout, in_rx.recv()).await;
        let message = match next {
            Ok(Some(m)) => m,
            Ok(None) => return Err("in-queue closed mid-session".to_string()),
            Err(_) => {
                warn!(engine_id = id, "worker in-queue idle past recv_timeout, ending session");
                flush_tail(transcriber.as_ref(), &config.language, epd, out_tx).await;
                return Ok(());
            }
        };

        match message {
            WorkerInput::Speech(chunk) => {
                let (new_epd, new_utterances) = process_chunk_blocking(
                    epd_take(epd),
                    chunk,
                    classifier.clone(),
                    transcriber.clone(),
                    config.language.clone(),
                )
                .await;
                for u in new_utterances {
                    let line = format!("{:3.1} {:3.1} : {}", u.start_sec, u.end_sec, u.text);
                    let _ = out_tx.send(WorkerOutput::Result(line)).await;
                }
                *epd = new_epd;
            }
            WorkerInput::Finish => {
                flush_tail(transcriber.as_ref(), &config.language, epd, out_tx).await;
                return Ok(());
            }
            WorkerInput::Begin(_) => {
                return Err("illegal %b received mid-session".to_string());
            }
            WorkerInput::Illegal(code) => {
                warn!(engine_id = id, code = %code, "illegal packet mid-session");
                let _ = out_tx.send(WorkerOutput::Final).await;
                return Err(format!("illegal packet: {code}"));
            }
        }
    }
}

fn epd_take(epd: &mut EpdState) -> EpdState {
    std::mem::replace(epd, EpdState::new(1, 1, 1))
}

/// Runs the (potentially slow) EPD/transcribe step off the async executor.
async fn process_chunk_blocking(
    mut epd: EpdState,
    chunk: Vec<u8>,
    classifier: Arc<dyn FrameClassifier>,
    transcriber: Arc<dyn Transcriber>,
    language: String,
) -> (EpdState, Vec<crate::epd::Utterance>) {
    tokio::task::spawn_blocking(move || {
        let utterances = epd.process_chunk(&chunk, classifier.as_ref(), transcriber.as_ref(), &language);
        (epd, utterances)
    })
    .await
    .unwrap_or_else(|join_err| {
        error!(error = %join_err, "transcription task panicked; dropping chunk");
        (EpdState::new(1, 1, 1), Vec::new())
    })
}

async fn flush_tail(
    transcriber: &dyn Transcriber,
    language: &str,
    epd: &mut EpdState,
    out_tx: &mpsc::Sender<WorkerOutput>,
) {
    if let Some(u) = epd.flush_tail(transcriber, language) {
        let line = format!("{:3.1} {:3.1} : {}", u.start_sec, u.end_sec, u.text);
        let _ = out_tx.send(WorkerOutput::Result(line)).await;
    }
}
