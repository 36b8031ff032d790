use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::auth::{TokenVerifier, Verification};
use crate::config::Config;
use crate::connection::{Connection, ConnectionRegistry};
use crate::events::EventChannel;
use crate::protocol::{
    auth_expired_frame, auth_required_frame, parse_client_frame, parse_event_envelope,
    ClientFrame, EventEnvelope,
};

pub struct GatewayServer {
    config: Config,
}

struct ServerState {
    registry: ConnectionRegistry,
    verifier: Arc<TokenVerifier>,
    events: Arc<dyn EventChannel>,
    grace_ms: u64,
    queue_capacity: usize,
    conn_seq: AtomicU64,
}

/// Every path that can terminate a connection funnels through
/// `close_connection` with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    GraceTimeout,
    AuthExpired,
    LivenessTimeout,
    ClientGone,
    BrokenPipe,
    Shutdown,
}

impl GatewayServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run_until<F>(
        &self,
        verifier: Arc<TokenVerifier>,
        events: Arc<dyn EventChannel>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.config.server.bind)
            .await
            .with_context(|| {
                format!("failed binding gateway listener on {}", self.config.server.bind)
            })?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("gateway listening on ws://{bound_addr}");

        let state = Arc::new(ServerState {
            registry: ConnectionRegistry::new(),
            verifier,
            events,
            grace_ms: self.config.auth.grace_ms,
            queue_capacity: self.config.server.outbound_queue_capacity,
            conn_seq: AtomicU64::new(0),
        });

        let event_rx = state
            .events
            .subscribe()
            .await
            .context("failed subscribing to the external event channel")?;
        let fanout_task = tokio::spawn(run_fanout(state.clone(), event_rx));
        let liveness_task = spawn_liveness_task(
            state.clone(),
            Duration::from_millis(self.config.server.liveness_interval_ms),
        );
        let expiry_task = spawn_expiry_task(
            state.clone(),
            Duration::from_millis(self.config.auth.expiry_interval_ms),
        );
        let health_task = self
            .config
            .server
            .http_bind
            .clone()
            .map(|bind| spawn_health_http_task(state.clone(), bind));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, state).await {
                                    warn!("gateway connection {remote_addr} failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("gateway accept failed: {err}");
                        }
                    }
                }
            }
        }

        // Stop accepting first, then make sure neither sweep can fire again
        // before tearing down the connection set.
        drop(listener);
        liveness_task.abort();
        let _ = liveness_task.await;
        expiry_task.abort();
        let _ = expiry_task.await;
        fanout_task.abort();
        let _ = fanout_task.await;
        if let Some(task) = health_task {
            task.abort();
            let _ = task.await;
        }
        for conn in state.registry.snapshot().await {
            close_connection(&state.registry, &conn, CloseReason::Shutdown).await;
        }
        Ok(())
    }
}

fn parse_bearer(value: &str) -> Option<String> {
    let rest = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_owned())
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: std::net::SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let mut bearer: Option<String> = None;
    let callback = |req: &Request, response: Response| {
        let Some(value) = req.headers().get("authorization") else {
            return Ok(response);
        };
        match value.to_str().ok().and_then(parse_bearer) {
            Some(token) => {
                bearer = Some(token);
                Ok(response)
            }
            None => {
                // Present-but-malformed credentials are a hard rejection; the
                // upgrade never completes.
                let mut reject = ErrorResponse::new(Some("invalid authorization scheme".to_owned()));
                *reject.status_mut() = StatusCode::UNAUTHORIZED;
                Err(reject)
            }
        }
    };
    let mut ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(err) => {
            debug!("websocket upgrade for {remote_addr} rejected: {err}");
            return Ok(());
        }
    };

    // Credentialed admission verifies before any Connection record exists.
    // Verification may block on the signing-key fetch; only this one
    // connection waits on it.
    let admitted_expiry = match &bearer {
        None => None,
        Some(token) => match state.verifier.verify(token).await {
            Ok(Verification::Valid { expires_at_ms }) => Some(expires_at_ms),
            Ok(Verification::Invalid) => {
                debug!("rejecting {remote_addr}: handshake token invalid");
                let _ = ws
                    .send(Message::Close(Some(close_frame(1008, "authentication failed"))))
                    .await;
                return Ok(());
            }
            Err(err) => {
                warn!("rejecting {remote_addr}: signing-key lookup unavailable: {err:#}");
                let _ = ws
                    .send(Message::Close(Some(close_frame(
                        1013,
                        "authentication temporarily unavailable",
                    ))))
                    .await;
                return Ok(());
            }
        },
    };

    let conn_id = format!("conn-{}", state.conn_seq.fetch_add(1, Ordering::Relaxed) + 1);
    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(state.queue_capacity);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if write.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    });

    let conn = Connection::new(conn_id.clone(), out_tx);
    match admitted_expiry {
        Some(expires_at_ms) => {
            conn.mark_authenticated(expires_at_ms).await;
            state.registry.insert(conn.clone()).await;
            info!("{conn_id} ({remote_addr}) connected, authenticated at handshake");
        }
        None => {
            state.registry.insert(conn.clone()).await;
            let _ = conn
                .tx
                .send(Message::Text(auth_required_frame(state.grace_ms)))
                .await;
            arm_grace_timer(&state, &conn, CloseReason::GraceTimeout).await;
            info!("{conn_id} ({remote_addr}) connected anonymously, grace window open");
        }
    }

    while let Some(inbound) = read.next().await {
        let message = match inbound {
            Ok(message) => message,
            Err(err) => {
                debug!("websocket read on {conn_id} failed: {err}");
                break;
            }
        };
        match message {
            Message::Text(text) => match parse_client_frame(&text) {
                ClientFrame::Auth { access_token } => {
                    handle_auth_message(&state, &conn, &access_token).await;
                }
                // Malformed or unknown envelopes never close the connection.
                ClientFrame::Ignored => {}
            },
            Message::Pong(_) => conn.mark_alive().await,
            Message::Ping(payload) => {
                let _ = conn.tx.try_send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Frame(_) => {}
        }
    }

    close_connection(&state.registry, &conn, CloseReason::ClientGone).await;
    drop(conn);
    let _ = writer.await;
    Ok(())
}

async fn handle_auth_message(state: &Arc<ServerState>, conn: &Arc<Connection>, token: &str) {
    // No connection lock may be held across this await.
    match state.verifier.verify(token).await {
        Ok(Verification::Valid { expires_at_ms }) => {
            if conn.mark_authenticated(expires_at_ms).await {
                info!("{} authenticated via AUTH message", conn.id);
            }
        }
        Ok(Verification::Invalid) => {
            // Failed attempt: no transition, the grace timer keeps running
            // and the client may retry.
            debug!("{} sent an invalid AUTH token", conn.id);
        }
        Err(err) => {
            warn!(
                "{} AUTH verification unavailable, treating as failed attempt: {err:#}",
                conn.id
            );
        }
    }
}

/// Arms the single pending grace timer for a connection, replacing any
/// previous one. The fired task re-checks its generation under the state
/// lock, so a cancel or close that raced the firing wins cleanly.
async fn arm_grace_timer(state: &Arc<ServerState>, conn: &Arc<Connection>, reason: CloseReason) {
    let grace = Duration::from_millis(state.grace_ms);
    let gen = {
        let mut st = conn.state.lock().await;
        if st.closed {
            return;
        }
        st.timer_gen += 1;
        if let Some(handle) = st.grace_timer.take() {
            handle.abort();
        }
        st.timer_gen
    };

    let handle = tokio::spawn({
        let state = state.clone();
        let conn = conn.clone();
        async move {
            tokio::time::sleep(grace).await;
            // The fired task claims the close and disarms itself in one lock
            // scope; going through `close_connection` here would abort this
            // very task and strand the connection half-closed.
            if conn.begin_close_if_current(gen).await {
                finish_close(&state.registry, &conn, reason).await;
            }
        }
    });

    let mut st = conn.state.lock().await;
    if !st.closed && st.timer_gen == gen {
        st.grace_timer = Some(handle);
    } else {
        handle.abort();
    }
}

/// Teardown entry point for every eviction path except a fired grace timer
/// (which claims the close via `begin_close_if_current` to avoid aborting its
/// own task, then runs `finish_close` directly). Returns true only for the
/// caller that wins the close transition; duplicate side effects (a second
/// AUTH_EXPIRED, a second close frame) are impossible by construction.
async fn close_connection(
    registry: &ConnectionRegistry,
    conn: &Arc<Connection>,
    reason: CloseReason,
) -> bool {
    if !conn.begin_close().await {
        return false;
    }
    finish_close(registry, conn, reason).await;
    true
}

/// Teardown side effects after the close transition has been claimed:
/// registry removal, final notices, close frame.
async fn finish_close(registry: &ConnectionRegistry, conn: &Arc<Connection>, reason: CloseReason) {
    registry.remove(&conn.id).await;
    if reason == CloseReason::AuthExpired {
        let _ = conn.tx.try_send(Message::Text(auth_expired_frame()));
    }
    match reason {
        CloseReason::ClientGone | CloseReason::BrokenPipe => {}
        CloseReason::GraceTimeout => {
            let _ = conn
                .tx
                .try_send(Message::Close(Some(close_frame(1008, "authentication required"))));
        }
        CloseReason::AuthExpired => {
            let _ = conn
                .tx
                .try_send(Message::Close(Some(close_frame(1008, "authentication expired"))));
        }
        CloseReason::LivenessTimeout => {
            let _ = conn
                .tx
                .try_send(Message::Close(Some(close_frame(1001, "liveness timeout"))));
        }
        CloseReason::Shutdown => {
            let _ = conn
                .tx
                .try_send(Message::Close(Some(close_frame(1001, "server shutdown"))));
        }
    }
    info!("{} closed ({reason:?})", conn.id);
}

fn spawn_liveness_task(state: Arc<ServerState>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so fresh connections get
        // a full interval before their first probe.
        interval.tick().await;
        loop {
            interval.tick().await;
            liveness_sweep(&state.registry).await;
        }
    })
}

/// One liveness pass: evict anything that missed the previous probe, then
/// probe everything else. Connections are evaluated independently.
async fn liveness_sweep(registry: &ConnectionRegistry) {
    for conn in registry.snapshot().await {
        let verdict = {
            let mut st = conn.state.lock().await;
            if st.closed {
                None
            } else if !st.alive {
                Some(true)
            } else {
                st.alive = false;
                Some(false)
            }
        };
        match verdict {
            Some(true) => {
                close_connection(registry, &conn, CloseReason::LivenessTimeout).await;
            }
            Some(false) => {
                let _ = conn.tx.try_send(Message::Ping(Vec::new()));
            }
            None => {}
        }
    }
}

fn spawn_expiry_task(state: Arc<ServerState>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            expiry_sweep(&state).await;
        }
    })
}

/// One expiry pass over a single `now()` snapshot. Connections already in a
/// grace window are governed by their pending timer, not re-noticed here.
async fn expiry_sweep(state: &Arc<ServerState>) {
    let now = now_ms();
    for conn in state.registry.snapshot().await {
        let needs_reauth = {
            let mut st = conn.state.lock().await;
            if st.closed || !st.authenticated || st.auth_expired {
                false
            } else if st.expires_at_ms.is_some_and(|exp| exp <= now) {
                st.authenticated = false;
                st.auth_expired = true;
                true
            } else {
                false
            }
        };
        if needs_reauth {
            let _ = conn
                .tx
                .try_send(Message::Text(auth_required_frame(state.grace_ms)));
            arm_grace_timer(state, &conn, CloseReason::AuthExpired).await;
            info!("{} token expired, re-auth window open", conn.id);
        }
    }
}

async fn run_fanout(state: Arc<ServerState>, mut rx: mpsc::Receiver<String>) {
    while let Some(raw) = rx.recv().await {
        let Some(envelope) = parse_event_envelope(&raw) else {
            debug!("dropping malformed external event");
            continue;
        };
        broadcast_event(&state.registry, &envelope).await;
    }
    warn!("external event stream ended");
}

/// Relays one event to every connection authenticated at this instant
/// (snapshot semantics). A broken recipient is marked for closure and never
/// stalls delivery to the rest.
async fn broadcast_event(registry: &ConnectionRegistry, envelope: &EventEnvelope) {
    let frame = envelope.relay_frame();
    let mut broken = Vec::new();
    for conn in registry.snapshot().await {
        if !conn.is_authenticated().await {
            continue;
        }
        match conn.tx.try_send(Message::Text(frame.clone())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => broken.push(conn),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("dropping event {} for slow {}", envelope.event_type, conn.id);
            }
        }
    }
    for conn in broken {
        close_connection(registry, &conn, CloseReason::BrokenPipe).await;
    }
}

fn spawn_health_http_task(state: Arc<ServerState>, bind: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!("health endpoint bind failed on {bind}: {err}");
                return;
            }
        };
        info!("health endpoint listening on http://{bind}");
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let _ = serve_health_request(stream, state).await;
            });
        }
    })
}

async fn serve_health_request(mut stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let mut buffer = vec![0_u8; 1024];
    let read = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..read]);
    let request_line = request.lines().next().unwrap_or_default();

    let (status, body) = if request_line.starts_with("GET /health") {
        let healthy = state.events.is_healthy().await;
        let status = if healthy { 200 } else { 503 };
        (status, json!({ "ok": healthy }).to_string())
    } else {
        (404, json!({ "ok": false, "error": "not_found" }).to_string())
    };
    let status_text = match status {
        200 => "OK",
        503 => "Service Unavailable",
        _ => "Not Found",
    };
    let head = format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

fn close_frame(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
