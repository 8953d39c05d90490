//! End-to-end scenarios driven over a real loopback TCP socket rather than
//! an in-memory duplex, so the test exercises the same `accept` →
//! `handle_connection` path the real listener uses.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use whisper_streaming_server::config::{AudioConfig, Config, Device, LoggingConfig, ModelConfig, NetworkConfig, VadConfig};
use whisper_streaming_server::engine::{self, WorkerConfig};
use whisper_streaming_server::pool::EnginePool;
use whisper_streaming_server::protocol::{self, CODE_BEGIN, CODE_ENGINE_STATUS, CODE_FINAL, CODE_FINISH, CODE_RESULT, CODE_SPEECH, CODE_STATUS_QUERY, CODE_USERNAME};
use whisper_streaming_server::session;
use whisper_streaming_server::transcriber::StubTranscriber;
use whisper_streaming_server::vad::EnergyFrameClassifier;

const FRAME_SIZE: usize = 960; // 30ms @ 16kHz 16-bit mono
const SAMPLE_RATE: u32 = 16000;
const FRAME_MS: u32 = 30;

fn test_config(channel: usize, socket_timeout: u64) -> Config {
    Config {
        audio: AudioConfig {
            frame_size: FRAME_SIZE,
            sample_rate: SAMPLE_RATE,
            frame_duration_ms: FRAME_MS,
        },
        vad: VadConfig { mode: 0 },
        model: ModelConfig {
            size: "large-v2".into(),
            device: Device::Cpu,
            language: "en".into(),
            channel,
        },
        network: NetworkConfig {
            ip: "127.0.0.1".into(),
            port: 0,
            socket_timeout,
        },
        logging: LoggingConfig {
            log_path: "./logs".into(),
            level: "info".into(),
            save_pcm: false,
            pcm_path: "./pcm".into(),
        },
    }
}

/// Spawns `channel` workers behind an `EnginePool` and a real listener on
/// an ephemeral loopback port. Returns the address and the pool handle
/// (so tests can inspect `status_lines()`).
async fn spawn_server(config: Config) -> (std::net::SocketAddr, Arc<EnginePool>) {
    let config = Arc::new(config);
    let classifier: Arc<dyn whisper_streaming_server::vad::FrameClassifier> = Arc::new(EnergyFrameClassifier::new(config.vad.mode));

    let mut handles = Vec::with_capacity(config.model.channel);
    for id in 0..config.model.channel {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let worker_config = WorkerConfig {
            frame_size: config.audio.frame_size,
            frame_duration_ms: config.audio.frame_duration_ms,
            sample_rate: config.audio.sample_rate,
            language: config.model.language.clone(),
            recv_timeout: Duration::from_secs(config.network.socket_timeout + 1),
            save_pcm: false,
            pcm_path: String::new(),
        };
        let transcriber: Arc<dyn whisper_streaming_server::transcriber::Transcriber> = Arc::new(StubTranscriber::new());
        tokio::spawn(engine::run_worker(id, in_rx, out_tx, classifier.clone(), transcriber, worker_config));
        handles.push((in_tx, out_rx));
    }
    let pool = EnginePool::new(handles);

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let pool_clone = pool.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, remote)) = listener.accept().await else {
                return;
            };
            let pool = pool_clone.clone();
            let config = config.clone();
            tokio::spawn(async move {
                session::handle_connection(stream, remote, pool, config).await;
            });
        }
    });

    (addr, pool)
}

/// PCM that the `EnergyFrameClassifier` (mode 0, threshold tuned off a
/// silence baseline) classifies as speech: a loud full-scale tone.
fn speech_frame() -> Vec<u8> {
    (0..FRAME_SIZE / 2)
        .flat_map(|i| {
            let phase = (i as f64) * 0.35;
            let sample = (phase.sin() * i16::MAX as f64) as i16;
            sample.to_le_bytes()
        })
        .collect()
}

fn silence_frame() -> Vec<u8> {
    vec![0u8; FRAME_SIZE]
}

async fn connect_and_handshake(addr: std::net::SocketAddr, user: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(protocol::MAGIC).await.unwrap();
    protocol::write_frame(&mut stream, CODE_USERNAME, user.as_bytes()).await.unwrap();
    let (code, _payload) = protocol::read_frame(&mut stream).await.unwrap();
    assert_eq!(code, protocol::CODE_WELCOME);
    stream
}

/// A short burst of speech followed by silence produces exactly one
/// `%R` utterance, then `%F`.
#[tokio::test]
async fn happy_path_emits_one_utterance_then_final() {
    let (addr, _pool) = spawn_server(test_config(2, 60)).await;
    let mut stream = connect_and_handshake(addr, "yc7764").await;
    protocol::write_frame(&mut stream, CODE_BEGIN, b"").await.unwrap();

    for _ in 0..10 {
        protocol::write_frame(&mut stream, CODE_SPEECH, &speech_frame()).await.unwrap();
    }
    protocol::write_frame(&mut stream, CODE_FINISH, b"").await.unwrap();

    let (code, payload) = protocol::read_frame(&mut stream).await.unwrap();
    assert_eq!(code, CODE_RESULT);
    let text = String::from_utf8(payload).unwrap();
    assert!(text.contains(" : "), "result line must be \"<start> <end> : <text>\", got {text:?}");

    let (code, _) = protocol::read_frame(&mut stream).await.unwrap();
    assert_eq!(code, CODE_FINAL);
}

/// An utterance longer than 10s is force-flushed into at least two
/// `%R` frames before `%F`.
#[tokio::test]
async fn long_utterance_force_flushes_twice() {
    let (addr, _pool) = spawn_server(test_config(1, 60)).await;
    let mut stream = connect_and_handshake(addr, "longtalker").await;
    protocol::write_frame(&mut stream, CODE_BEGIN, b"").await.unwrap();

    // 12s of continuous speech at 30ms/frame => 400 frames.
    for _ in 0..400 {
        protocol::write_frame(&mut stream, CODE_SPEECH, &speech_frame()).await.unwrap();
    }
    protocol::write_frame(&mut stream, CODE_FINISH, b"").await.unwrap();

    let mut result_count = 0;
    loop {
        let (code, _payload) = protocol::read_frame(&mut stream).await.unwrap();
        if code == CODE_RESULT {
            result_count += 1;
        } else if code == CODE_FINAL {
            break;
        }
    }
    assert!(result_count >= 2, "a 12s speech run must force at least two flushes, got {result_count}");
}

/// A bad magic string gets `%F0000` and the connection closes; no
/// engine is ever allocated.
#[tokio::test]
async fn bad_magic_rejects_without_allocating() {
    let (addr, pool) = spawn_server(test_config(1, 60)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"WHISPER_STREAMING_V9.9").await.unwrap();

    let (code, payload) = protocol::read_frame(&mut stream).await.unwrap();
    assert_eq!(code, CODE_FINAL);
    assert!(payload.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.status_lines(), vec!["engine 0: sleeping"]);
}

/// With a single-engine pool and one client mid-relay, a second client
/// completes its handshake, waits, and proceeds once the first releases
/// the engine.
#[tokio::test]
async fn second_client_waits_then_proceeds_after_release() {
    let (addr, _pool) = spawn_server(test_config(1, 60)).await;

    let mut first = connect_and_handshake(addr, "first").await;
    protocol::write_frame(&mut first, CODE_BEGIN, b"").await.unwrap();

    // Second client starts its handshake concurrently; it should block in
    // ALLOCATE until the first releases its engine.
    let addr2 = addr;
    let second_task = tokio::spawn(async move {
        let mut second = connect_and_handshake(addr2, "second").await;
        protocol::write_frame(&mut second, CODE_BEGIN, b"").await.unwrap();
        protocol::write_frame(&mut second, CODE_FINISH, b"").await.unwrap();
        let (code, _) = protocol::read_frame(&mut second).await.unwrap();
        assert_eq!(code, CODE_FINAL);
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second_task.is_finished(), "second client must not proceed while the only engine is held");

    protocol::write_frame(&mut first, CODE_FINISH, b"").await.unwrap();
    let (code, _) = protocol::read_frame(&mut first).await.unwrap();
    assert_eq!(code, CODE_FINAL);

    tokio::time::timeout(Duration::from_secs(5), second_task)
        .await
        .expect("second client must proceed once the engine is released")
        .unwrap();
}

/// A status query lists every engine and never allocates one.
#[tokio::test]
async fn status_query_lists_all_engines() {
    let (addr, pool) = spawn_server(test_config(3, 60)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(protocol::MAGIC).await.unwrap();
    protocol::write_frame(&mut stream, CODE_STATUS_QUERY, b"").await.unwrap();

    let mut lines = Vec::new();
    loop {
        let (code, payload) = protocol::read_frame(&mut stream).await.unwrap();
        if code == CODE_ENGINE_STATUS {
            lines.push(String::from_utf8(payload).unwrap());
        } else if code == CODE_FINAL {
            break;
        } else {
            panic!("unexpected code during status query: {code:?}");
        }
    }
    assert_eq!(lines.len(), 3);
    assert!(lines.iter().all(|l| l.ends_with("sleeping")));
    assert_eq!(pool.status_lines().len(), 3);
}

/// A client that disconnects mid-stream (no `%f`) still releases its
/// engine within a bounded window.
#[tokio::test]
async fn client_disconnect_mid_stream_releases_engine() {
    let (addr, pool) = spawn_server(test_config(1, 5)).await;
    {
        let mut stream = connect_and_handshake(addr, "dropper").await;
        protocol::write_frame(&mut stream, CODE_BEGIN, b"").await.unwrap();
        for _ in 0..3 {
            protocol::write_frame(&mut stream, CODE_SPEECH, &speech_frame()).await.unwrap();
        }
        // Drop the socket without sending %f.
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pool.status_lines() == vec!["engine 0: sleeping"] {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("engine must be released after a mid-stream disconnect");
}

/// Queue isolation: session n+1's first `%R` never carries session n's
/// text. Driven as two sequential sessions on a one-engine pool with
/// distinguishable utterance counts.
#[tokio::test]
async fn queue_isolation_across_sequential_sessions() {
    let (addr, _pool) = spawn_server(test_config(1, 60)).await;

    // Session 1: two short utterances separated by enough silence to close
    // the first one before the second starts.
    let mut first = connect_and_handshake(addr, "session-one").await;
    protocol::write_frame(&mut first, CODE_BEGIN, b"").await.unwrap();
    for _ in 0..5 {
        protocol::write_frame(&mut first, CODE_SPEECH, &speech_frame()).await.unwrap();
    }
    for _ in 0..20 {
        protocol::write_frame(&mut first, CODE_SPEECH, &silence_frame()).await.unwrap();
    }
    protocol::write_frame(&mut first, CODE_FINISH, b"").await.unwrap();
    let mut first_results = 0;
    loop {
        let (code, _) = protocol::read_frame(&mut first).await.unwrap();
        if code == CODE_RESULT {
            first_results += 1;
        } else if code == CODE_FINAL {
            break;
        }
    }
    assert!(first_results >= 1);
    drop(first);

    // Session 2 on the same (only) engine must start from a clean EPD.
    let mut second = connect_and_handshake(addr, "session-two").await;
    protocol::write_frame(&mut second, CODE_BEGIN, b"").await.unwrap();
    for _ in 0..3 {
        protocol::write_frame(&mut second, CODE_SPEECH, &silence_frame()).await.unwrap();
    }
    protocol::write_frame(&mut second, CODE_FINISH, b"").await.unwrap();
    let (code, _) = protocol::read_frame(&mut second).await.unwrap();
    assert_eq!(code, CODE_FINAL, "pure-silence second session must emit no leftover %R from session one");
}

/// Any premature read past the expected frame count must time out rather
/// than silently block forever (sanity guard for the tests above).
#[tokio::test]
async fn read_frame_times_out_on_truncated_final_response() {
    let (addr, _pool) = spawn_server(test_config(1, 60)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(protocol::MAGIC).await.unwrap();
    protocol::write_frame(&mut stream, CODE_STATUS_QUERY, b"").await.unwrap();

    let mut buf = [0u8; 1];
    let result = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
    assert!(result.is_ok(), "server must respond promptly to a status query");
}
