use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use whisper_streaming_server::config::{Cli, Config};
use whisper_streaming_server::engine::{self, WorkerConfig};
use whisper_streaming_server::pool::EnginePool;
use whisper_streaming_server::transcriber::{self, StubTranscriber};
use whisper_streaming_server::vad::{self, EnergyFrameClassifier};
use whisper_streaming_server::{listener, logging};

/// Bounded per-engine queue depth. A worker only ever has one session's
/// messages in flight at a time, so this just needs headroom for a burst
/// of `%s` chunks plus the handler's drain-before-release step.
const ENGINE_QUEUE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    if cli.print_config {
        println!("{config:#?}");
        return Ok(());
    }

    let _log_guard = logging::init_logging(&config.logging)?;
    logging::prune_old_logs(&config.logging.log_path).await;

    info!(
        listen = config.listen_addr(),
        channel = config.model.channel,
        sample_rate = config.audio.sample_rate,
        frame_size = config.audio.frame_size,
        language = %config.model.language,
        "whisper-streaming-server starting"
    );

    let config = Arc::new(config);
    let classifier: Arc<dyn vad::FrameClassifier> = Arc::new(EnergyFrameClassifier::new(config.vad.mode));

    let mut handles = Vec::with_capacity(config.model.channel);
    for id in 0..config.model.channel {
        let (in_tx, in_rx) = mpsc::channel(ENGINE_QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(ENGINE_QUEUE_CAPACITY);

        let worker_config = WorkerConfig {
            frame_size: config.audio.frame_size,
            frame_duration_ms: config.audio.frame_duration_ms,
            sample_rate: config.audio.sample_rate,
            language: config.model.language.clone(),
            recv_timeout: Duration::from_secs(config.network.socket_timeout + 1),
            save_pcm: config.logging.save_pcm,
            pcm_path: config.logging.pcm_path.clone(),
        };
        // A fresh Transcriber per worker: reentrant-safe within one worker
        // but not shared across workers.
        let transcriber: Arc<dyn transcriber::Transcriber> = Arc::new(StubTranscriber::new());
        let classifier = classifier.clone();

        tokio::spawn(engine::run_worker(id, in_rx, out_tx, classifier, transcriber, worker_config));
        handles.push((in_tx, out_rx));
    }

    let pool = EnginePool::new(handles);
    info!(engines = pool.len(), "engine pool ready");

    listener::run_server(config, pool).await
}
