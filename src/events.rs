use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const EVENT_BUFFER: usize = 1024;

/// Narrow interface over the shared external event channel all gateway
/// instances subscribe to. The gateway only consumes: one subscription per
/// process, plus a lightweight round-trip health probe.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn subscribe(&self) -> Result<mpsc::Receiver<String>>;
    async fn is_healthy(&self) -> bool;
}

/// Production channel: a WebSocket client against the upstream event bus,
/// reconnecting with a fixed delay. Health is a ping/pong round trip against
/// the live connection.
pub struct WsEventChannel {
    url: String,
    probe_tx: mpsc::Sender<oneshot::Sender<()>>,
    probe_rx: Mutex<Option<mpsc::Receiver<oneshot::Sender<()>>>>,
}

impl WsEventChannel {
    pub fn new(url: impl Into<String>) -> Self {
        let (probe_tx, probe_rx) = mpsc::channel(8);
        Self {
            url: url.into(),
            probe_tx,
            probe_rx: Mutex::new(Some(probe_rx)),
        }
    }
}

#[async_trait]
impl EventChannel for WsEventChannel {
    async fn subscribe(&self) -> Result<mpsc::Receiver<String>> {
        let probe_rx = self
            .probe_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("event channel already subscribed"))?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run_event_pump(self.url.clone(), tx, probe_rx));
        Ok(rx)
    }

    async fn is_healthy(&self) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.probe_tx.send(ack_tx).await.is_err() {
            return false;
        }
        matches!(tokio::time::timeout(PROBE_TIMEOUT, ack_rx).await, Ok(Ok(())))
    }
}

/// Owns the upstream socket: forwards text frames to the gateway, answers
/// health probes with a ws ping, reconnects on failure. Exits when either
/// side of the plumbing is dropped.
async fn run_event_pump(
    url: String,
    tx: mpsc::Sender<String>,
    mut probe_rx: mpsc::Receiver<oneshot::Sender<()>>,
) {
    loop {
        match connect_async(&url).await {
            Ok((ws, _)) => {
                info!("event channel connected to {url}");
                let (mut sink, mut stream) = ws.split();
                let mut pending_probes: VecDeque<oneshot::Sender<()>> = VecDeque::new();
                loop {
                    tokio::select! {
                        probe = probe_rx.recv() => {
                            let Some(ack) = probe else { return };
                            match sink.send(Message::Ping(Vec::new())).await {
                                Ok(()) => pending_probes.push_back(ack),
                                Err(err) => {
                                    warn!("event channel ping failed: {err}");
                                    break;
                                }
                            }
                        }
                        frame = stream.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    if tx.send(text).await.is_err() {
                                        return;
                                    }
                                }
                                Some(Ok(Message::Pong(_))) => {
                                    if let Some(ack) = pending_probes.pop_front() {
                                        let _ = ack.send(());
                                    }
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = sink.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!("event channel read failed: {err}");
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
                // Unanswered probes fail by drop; callers observe a timeout.
                pending_probes.clear();
                warn!("event channel disconnected from {url}, reconnecting");
            }
            Err(err) => {
                warn!("event channel connect to {url} failed: {err}");
            }
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use tokio::sync::broadcast;

    /// In-process stand-in for the external event bus.
    pub struct LocalEventChannel {
        tx: broadcast::Sender<String>,
        healthy: AtomicBool,
    }

    impl LocalEventChannel {
        pub fn new() -> Self {
            let (tx, _) = broadcast::channel(64);
            Self {
                tx,
                healthy: AtomicBool::new(true),
            }
        }

        pub fn publish(&self, raw: impl Into<String>) {
            let _ = self.tx.send(raw.into());
        }

        pub fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EventChannel for LocalEventChannel {
        async fn subscribe(&self) -> Result<mpsc::Receiver<String>> {
            let mut source = self.tx.subscribe();
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            tokio::spawn(async move {
                while let Ok(raw) = source.recv().await {
                    if tx.send(raw).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }

        async fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }
}
