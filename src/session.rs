//! Per-connection state machine from handshake
//! through relay to cleanup.
//!
//! Each connection is a task spawned off the accept loop; errors propagate
//! as a typed `Result` and are logged once at the call site rather than at
//! every intermediate layer.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::{WorkerInput, WorkerOutput};
use crate::error::SessionError;
use crate::pool::EnginePool;
use crate::protocol::{
    self, CODE_BEGIN, CODE_ENGINE_STATUS, CODE_FINISH, CODE_RESULT, CODE_SPEECH, CODE_STATUS_QUERY,
    CODE_USERNAME, CODE_WELCOME,
};

/// `{"reason": "SERVER_TOO_BUSY"}`, built with `serde_json` rather than a
/// hand-written literal so the shape stays in one place if it grows fields.
fn server_too_busy_reason() -> String {
    serde_json::json!({ "reason": "SERVER_TOO_BUSY" }).to_string()
}

/// Drives one accepted connection end-to-end. Every exit path — normal
/// close, protocol error, timeout, disconnect — releases its engine (if
/// any was allocated) exactly once and is logged with `remote`/`user`/
/// `engine_id` context.
pub async fn handle_connection<S>(mut stream: S, remote: std::net::SocketAddr, pool: Arc<EnginePool>, config: Arc<Config>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let socket_timeout = Duration::from_secs(config.network.socket_timeout);

    if let Err(e) = run_handshake_and_relay(&mut stream, remote, &pool, &config, socket_timeout).await {
        warn!(remote = %remote, kind = e.kind_tag(), error = %e, "session ended");
        let _ = protocol::write_final(&mut stream, None).await;
    }
}

async fn run_handshake_and_relay<S>(
    stream: &mut S,
    remote: std::net::SocketAddr,
    pool: &Arc<EnginePool>,
    config: &Arc<Config>,
    socket_timeout: Duration,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match with_timeout(socket_timeout, protocol::read_magic(stream)).await {
        Ok(Ok(())) => {}
        Ok(Err(protocol::ProtocolError::InvalidMagic)) => return Err(SessionError::InvalidMagic),
        Ok(Err(e)) => return Err(SessionError::Protocol(e)),
        Err(_) => return Err(SessionError::ReadTimeout),
    }

    let (code, payload) = with_timeout(socket_timeout, protocol::read_frame(stream))
        .await
        .map_err(|_| SessionError::ReadTimeout)??;

    if code == CODE_STATUS_QUERY {
        return handle_status_query(stream, pool).await;
    }
    if code != CODE_USERNAME {
        return Err(SessionError::Protocol(protocol::ProtocolError::InvalidLength(
            "expected %u or %c at handshake".to_string(),
        )));
    }
    let username = String::from_utf8(payload)?;
    info!(remote = %remote, user = %username, "handshake complete");

    let handle = pool.allocate().await;
    let handle = match handle {
        Ok(h) => h,
        Err(e) => {
            protocol::write_frame(stream, CODE_RESULT, server_too_busy_reason().as_bytes()).await?;
            return Err(SessionError::NoEngine(e));
        }
    };
    drain_out_queue(&handle.out_rx).await;

    protocol::write_frame(
        stream,
        CODE_WELCOME,
        format!("welcome message for user[{username}]").as_bytes(),
    )
    .await?;

    let begin_result = expect_begin(stream, socket_timeout).await;
    if let Err(e) = begin_result {
        pool.release(handle.id);
        return Err(e);
    }
    let _ = handle.in_tx.send(WorkerInput::Begin(username.clone())).await;

    let relay_result = relay_loop(stream, &handle.in_tx, handle.out_rx.clone(), socket_timeout).await;

    // Cleanup (always): make sure the worker's inner loop exits regardless
    // of why relay stopped, drain any straggling results, then release.
    let _ = handle.in_tx.send(WorkerInput::Finish).await;
    drain_out_queue(&handle.out_rx).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    pool.release(handle.id);

    relay_result
}

async fn handle_status_query<S>(stream: &mut S, pool: &Arc<EnginePool>) -> Result<(), SessionError>
where
    S: AsyncWrite + Unpin,
{
    for line in pool.status_lines() {
        protocol::write_frame(stream, CODE_ENGINE_STATUS, line.as_bytes()).await?;
    }
    protocol::write_final(stream, None).await?;
    Ok(())
}

async fn expect_begin<S>(stream: &mut S, socket_timeout: Duration) -> Result<(), SessionError>
where
    S: AsyncRead + Unpin,
{
    loop {
        let (code, _payload) = with_timeout(socket_timeout, protocol::read_frame(stream))
            .await
            .map_err(|_| SessionError::ReadTimeout)??;
        if code == CODE_BEGIN {
            return Ok(());
        }
        return Err(SessionError::Protocol(protocol::ProtocolError::InvalidLength(
            "expected %b at EXPECT_BEGIN".to_string(),
        )));
    }
}

/// Interleaves forwarding engine results to the socket with reading client
/// frames into the engine's in-queue over the same stream, via
/// `tokio::select!` rather than a spawned subtask — a subtask holding a
/// `tokio::io::split` half borrowed from this connection's `&mut S` would
/// need a `'static` bound `tokio::spawn` can't satisfy, so both directions
/// are driven from one task instead (still a concurrent reader/writer,
/// just without a second OS/runtime task to get there).
async fn relay_loop<S>(
    stream: &mut S,
    in_tx: &mpsc::Sender<WorkerInput>,
    out_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkerOutput>>>,
    socket_timeout: Duration,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut out_rx = out_rx.lock().await;

    loop {
        tokio::select! {
            frame = with_timeout(socket_timeout, protocol::read_frame(stream)) => {
                let (code, payload) = match frame {
                    Ok(Ok(f)) => f,
                    Ok(Err(protocol::ProtocolError::Truncated)) => return Err(SessionError::ClientDisconnect),
                    Ok(Err(e)) => return Err(SessionError::Protocol(e)),
                    Err(_) => return Err(SessionError::ReadTimeout),
                };

                if code == CODE_SPEECH {
                    let _ = in_tx.send(WorkerInput::Speech(payload)).await;
                } else if code == CODE_FINISH {
                    let _ = in_tx.send(WorkerInput::Finish).await;
                    return forward_until_final(stream, &mut *out_rx).await;
                } else {
                    let tag = String::from_utf8_lossy(&code).to_string();
                    let _ = in_tx.send(WorkerInput::Illegal(tag)).await;
                    return Err(SessionError::Protocol(protocol::ProtocolError::InvalidLength(
                        "illegal code during relay".to_string(),
                    )));
                }
            }
            msg = out_rx.recv() => {
                match msg {
                    Some(WorkerOutput::Result(text)) => {
                        protocol::write_frame(stream, CODE_RESULT, text.as_bytes()).await?;
                    }
                    Some(WorkerOutput::Error(text)) => {
                        protocol::write_frame(stream, protocol::CODE_ERROR, text.as_bytes()).await?;
                    }
                    Some(WorkerOutput::Final) => {
                        let _ = protocol::write_final(stream, None).await;
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

/// After the client's `%f`, there is nothing left to read from the socket;
/// keep forwarding `engine.out -> socket` (the worker's final-flush `%R`, if
/// any, then its terminal `%F`) until the worker emits `Final`, joining the
/// result stream before the connection closes.
async fn forward_until_final<S>(stream: &mut S, out_rx: &mut mpsc::Receiver<WorkerOutput>) -> Result<(), SessionError>
where
    S: AsyncWrite + Unpin,
{
    loop {
        match out_rx.recv().await {
            Some(WorkerOutput::Result(text)) => {
                protocol::write_frame(stream, CODE_RESULT, text.as_bytes()).await?;
            }
            Some(WorkerOutput::Error(text)) => {
                protocol::write_frame(stream, protocol::CODE_ERROR, text.as_bytes()).await?;
            }
            Some(WorkerOutput::Final) => {
                protocol::write_final(stream, None).await?;
                return Ok(());
            }
            None => {
                protocol::write_final(stream, None).await?;
                return Ok(());
            }
        }
    }
}

async fn drain_out_queue(out_rx: &Arc<tokio::sync::Mutex<mpsc::Receiver<WorkerOutput>>>) {
    let mut rx = out_rx.lock().await;
    while rx.try_recv().is_ok() {}
}

async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T, tokio::time::error::Elapsed>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, fut).await
}
