//! Binds the server socket, accepts connections, and shuts
//! down cleanly on `SIGINT`.
//!
//! Bind once, loop on `accept`, spawn one task per connection. Shutdown
//! uses the same `Arc<AtomicBool>` stop-flag shape as the rest of this
//! crate's long-running tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::pool::EnginePool;

/// Documented maximum concurrent client capacity. Tokio's listener already
/// configures a generous OS backlog by default; this constant records the
/// intended capacity rather than being pushed through a raw socket option,
/// since the crate carries no `socket2` dependency for it.
pub const MAX_CLIENT_N: u32 = 50;

/// Binds `config.network`'s address and accepts connections until `SIGINT`
/// fires. Each accepted socket is handed to its own
/// [`crate::session::handle_connection`] task; the listener itself never
/// blocks on a session.
pub async fn run_server(config: Arc<Config>, pool: Arc<EnginePool>) -> anyhow::Result<()> {
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, backlog = MAX_CLIENT_N, "listener bound");

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, shutting down");
            shutdown_signal.store(true, Ordering::SeqCst);
        }
    });

    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("listener stopping: shutdown requested");
            return Ok(());
        }

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = wait_for_shutdown(&shutdown) => {
                info!("listener stopping: shutdown requested");
                return Ok(());
            }
        };

        match accepted {
            Ok((stream, remote)) => {
                let pool = pool.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    crate::session::handle_connection(stream, remote, pool, config).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept error");
            }
        }
    }
}

/// Polls the shutdown flag so `tokio::select!` can race it against
/// `accept()` without a condition variable.
async fn wait_for_shutdown(flag: &AtomicBool) {
    loop {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
