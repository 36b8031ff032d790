use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub type ConnId = String;

/// Mutable per-connection fields. Guarded by the connection's own mutex so
/// the admission path, the message loop, both sweeps, and the close path can
/// interleave safely. Never hold this lock across network I/O or token
/// verification.
#[derive(Debug)]
pub struct ConnState {
    pub alive: bool,
    pub authenticated: bool,
    pub expires_at_ms: Option<u64>,
    pub auth_expired: bool,
    pub grace_timer: Option<JoinHandle<()>>,
    /// Bumped on every arm/cancel/close. A fired timer task re-checks its
    /// captured generation under the lock before acting, which makes timer
    /// cancellation race-free against the timer firing concurrently.
    pub timer_gen: u64,
    pub closed: bool,
}

pub struct Connection {
    pub id: ConnId,
    pub tx: mpsc::Sender<Message>,
    pub state: Mutex<ConnState>,
}

impl Connection {
    pub fn new(id: ConnId, tx: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            id,
            tx,
            state: Mutex::new(ConnState {
                alive: true,
                authenticated: false,
                expires_at_ms: None,
                auth_expired: false,
                grace_timer: None,
                timer_gen: 0,
                closed: false,
            }),
        })
    }

    /// Marks the first, terminal close transition. Returns false if the
    /// connection was already closed. Cancels any pending grace timer and
    /// invalidates in-flight timer tasks via the generation counter.
    pub async fn begin_close(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        state.closed = true;
        state.timer_gen += 1;
        if let Some(handle) = state.grace_timer.take() {
            handle.abort();
        }
        state.authenticated = false;
        state.auth_expired = false;
        true
    }

    /// Close transition taken by a fired grace timer. Succeeds only if the
    /// timer generation still matches, and drops the stored handle without
    /// aborting it: the stored handle is the calling task's own, and a
    /// self-abort would cancel the close mid-teardown at its next await.
    /// Checking the generation and claiming the close under one lock also
    /// means a concurrent re-authentication either invalidates the firing
    /// before this point or observes `closed` afterwards; there is no
    /// in-between.
    pub async fn begin_close_if_current(&self, gen: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.closed || state.timer_gen != gen {
            return false;
        }
        state.closed = true;
        state.timer_gen += 1;
        state.grace_timer = None;
        state.authenticated = false;
        state.auth_expired = false;
        true
    }

    pub async fn mark_alive(&self) {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.alive = true;
        }
    }

    /// Applies a successful (re-)authentication: cancels the grace timer,
    /// clears the expired flag, records the new expiry. No-op after close.
    pub async fn mark_authenticated(&self, expires_at_ms: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        state.timer_gen += 1;
        if let Some(handle) = state.grace_timer.take() {
            handle.abort();
        }
        state.authenticated = true;
        state.auth_expired = false;
        state.expires_at_ms = Some(expires_at_ms);
        true
    }

    pub async fn is_authenticated(&self) -> bool {
        let state = self.state.lock().await;
        !state.closed && state.authenticated
    }
}

/// The process-wide connection set. Sweeps and the fan-out copy the handle
/// set out of the lock before doing any per-connection work, so insertion
/// and removal interleave with iteration without torn reads.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<ConnId, Arc<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conn: Arc<Connection>) {
        let mut guard = self.inner.lock().await;
        guard.insert(conn.id.clone(), conn);
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let mut guard = self.inner.lock().await;
        guard.remove(id)
    }

    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        let guard = self.inner.lock().await;
        guard.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        let guard = self.inner.lock().await;
        guard.len()
    }
}
