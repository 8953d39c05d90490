//! A fixed set of pre-initialized ASR workers, allocated
//! to sessions on demand and released exactly once per session.
//!
//! Built on an `Arc`-cloneable shared-handle pattern (a mutex wrapping
//! plain state), generalized from a single flag to a `Vec<Slot>` behind
//! one `parking_lot::Mutex` so allocation never holds the lock across an
//! `.await`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::engine::{WorkerInput, WorkerOutput};

/// Allocation retry ceiling: 60 attempts at 1 s apart.
const ENGINE_TIMEOUT_ATTEMPTS: u32 = 60;
const ENGINE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no idle engine available after {0} attempts")]
    TooBusy(u32),
}

struct Slot {
    in_tx: mpsc::Sender<WorkerInput>,
    out_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkerOutput>>>,
    busy: bool,
}

/// A session's exclusive handle on one engine's queues. Dropping this
/// without calling [`EnginePool::release`] leaks the slot as permanently
/// busy — callers must release on every exit path.
pub struct EngineHandle {
    pub id: usize,
    pub in_tx: mpsc::Sender<WorkerInput>,
    pub out_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkerOutput>>>,
}

pub struct EnginePool {
    slots: Mutex<Vec<Slot>>,
}

impl EnginePool {
    pub fn new(handles: Vec<(mpsc::Sender<WorkerInput>, mpsc::Receiver<WorkerOutput>)>) -> Arc<Self> {
        let slots = handles
            .into_iter()
            .map(|(in_tx, out_rx)| Slot {
                in_tx,
                out_rx: Arc::new(tokio::sync::Mutex::new(out_rx)),
                busy: false,
            })
            .collect();
        Arc::new(Self {
            slots: Mutex::new(slots),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Linear scan for a free slot; on contention, backs off 1 s and
    /// retries up to [`ENGINE_TIMEOUT_ATTEMPTS`] times before giving up.
    pub async fn allocate(&self) -> Result<EngineHandle, PoolError> {
        for _ in 0..ENGINE_TIMEOUT_ATTEMPTS {
            if let Some(handle) = self.try_allocate() {
                return Ok(handle);
            }
            tokio::time::sleep(ENGINE_RETRY_INTERVAL).await;
        }
        Err(PoolError::TooBusy(ENGINE_TIMEOUT_ATTEMPTS))
    }

    fn try_allocate(&self) -> Option<EngineHandle> {
        let mut slots = self.slots.lock();
        let (id, slot) = slots.iter_mut().enumerate().find(|(_, s)| !s.busy)?;
        slot.busy = true;
        Some(EngineHandle {
            id,
            in_tx: slot.in_tx.clone(),
            out_rx: slot.out_rx.clone(),
        })
    }

    /// Must be called exactly once per successful [`allocate`], after the
    /// worker's in-queue has been drained.
    pub fn release(&self, id: usize) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(id) {
            slot.busy = false;
        }
    }

    /// One `"engine <i>: running"` / `"engine <i>: sleeping"` line per
    /// engine, in pool order, for the `%c` status-query reply.
    pub fn status_lines(&self) -> Vec<String> {
        let slots = self.slots.lock();
        slots
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let state = if s.busy { "running" } else { "sleeping" };
                format!("engine {i}: {state}")
            })
            .collect()
    }
}
