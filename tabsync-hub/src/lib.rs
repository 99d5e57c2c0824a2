use std::{collections::HashMap, sync::Arc, time::Duration, time::Instant};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tabsync_core::{
    ControlMessage, Envelope, Hello, MAX_FRAME_BYTES, MAX_TABS_PER_ORIGIN, Origin, TabId,
    WireMessage, decode_frame, encode_frame,
};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct Connection {
    tab_id: TabId,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Default)]
struct OriginTabs {
    tabs: HashMap<TabId, Connection>,
}

#[derive(Debug, Default)]
struct HubInner {
    origins: HashMap<Origin, OriginTabs>,
}

#[derive(Debug, Clone)]
pub struct HubState {
    inner: Arc<RwLock<HubInner>>,
}

impl HubState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HubInner::default())),
        }
    }

    pub async fn tab_count(&self, origin: &str) -> usize {
        let hub = self.inner.read().await;
        hub.origins.get(origin).map_or(0, |o| o.tabs.len())
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: HubState) -> Result<(), String> {
    info!(
        "hub listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler(State(state): State<HubState>) -> impl IntoResponse {
    let origins = state.inner.read().await.origins.len();
    Json(serde_json::json!({"ok": true, "origins": origins}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: HubState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Pongs queued by the read half are only flushed when the write half
    // sends, so idle tabs get a periodic ping.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let first_message = ws_receiver
        .next()
        .await
        .ok_or_else(|| "tab disconnected before hello".to_owned())
        .and_then(|result| result.map_err(|err| err.to_string()))?;

    let hello = match parse_hello_message(&first_message) {
        Ok(hello) => hello,
        Err(err) => {
            send_task.abort();
            return Err(err);
        }
    };

    let origin = hello.origin.clone();
    let tab_id = hello.tab_id.clone();

    if let Err(err) = register_tab(
        &state,
        &origin,
        Connection {
            tab_id: tab_id.clone(),
            tx: outbound_tx.clone(),
        },
    )
    .await
    {
        send_control(&outbound_tx, ControlMessage::Error {
            message: err.clone(),
        });
        drop(outbound_tx);
        let _ = tokio::time::timeout(Duration::from_secs(1), send_task).await;
        return Err(err);
    }

    info!("tab {} joined origin {}", tab_id, origin);

    let mut rate_limiter = TokenBucket::new(64.0, 32.0);

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                if data.len() > MAX_FRAME_BYTES {
                    warn!("dropping oversized frame from {}", tab_id);
                    continue;
                }

                let wire = match decode_frame(&data) {
                    Ok(wire) => wire,
                    Err(err) => {
                        warn!("failed to decode frame from {}: {}", tab_id, err);
                        continue;
                    }
                };

                match wire {
                    WireMessage::Broadcast(envelope) => {
                        if envelope.sender != tab_id {
                            warn!("sender id mismatch from {}", tab_id);
                            continue;
                        }

                        if !rate_limiter.consume(1.0) {
                            warn!("rate limit exceeded for {}", tab_id);
                            continue;
                        }

                        forward_broadcast(&state, &origin, &tab_id, envelope).await;
                    }
                    WireMessage::Control(_) => {
                        warn!("unexpected control message after hello from {}", tab_id);
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    unregister_tab(&state, &origin, &tab_id).await;
    send_task.abort();
    info!("tab {} left origin {}", tab_id, origin);
    Ok(())
}

fn parse_hello_message(message: &Message) -> Result<Hello, String> {
    let data = match message {
        Message::Binary(data) => data,
        _ => return Err("first message must be binary hello frame".to_owned()),
    };

    let frame = decode_frame(data).map_err(|err| format!("invalid hello frame: {}", err))?;
    match frame {
        WireMessage::Control(ControlMessage::Hello(hello)) => {
            if hello.origin.trim().is_empty() {
                return Err("origin cannot be empty".to_owned());
            }
            if hello.tab_id.as_str().trim().is_empty() {
                return Err("tab_id cannot be empty".to_owned());
            }
            Ok(hello)
        }
        _ => Err("first control message must be Hello".to_owned()),
    }
}

async fn register_tab(
    state: &HubState,
    origin: &Origin,
    connection: Connection,
) -> Result<(), String> {
    let mut hub = state.inner.write().await;
    let tabs = hub.origins.entry(origin.clone()).or_default();
    if tabs.tabs.contains_key(&connection.tab_id) {
        return Err(format!(
            "tab {} is already registered in origin {}",
            connection.tab_id, origin
        ));
    }
    if tabs.tabs.len() >= MAX_TABS_PER_ORIGIN {
        return Err(format!(
            "origin {} is full (max {})",
            origin, MAX_TABS_PER_ORIGIN
        ));
    }
    tabs.tabs.insert(connection.tab_id.clone(), connection);
    Ok(())
}

async fn unregister_tab(state: &HubState, origin: &Origin, tab_id: &TabId) {
    let mut hub = state.inner.write().await;
    if let Some(tabs) = hub.origins.get_mut(origin) {
        tabs.tabs.remove(tab_id);
        if tabs.tabs.is_empty() {
            hub.origins.remove(origin);
        }
    }
}

async fn forward_broadcast(state: &HubState, origin: &Origin, sender: &TabId, envelope: Envelope) {
    let recipients = {
        let hub = state.inner.read().await;
        hub.origins
            .get(origin)
            .map(|tabs| {
                tabs.tabs
                    .iter()
                    .filter(|(tab_id, _)| *tab_id != sender)
                    .map(|(_, conn)| conn.tx.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    debug!(
        topic = %envelope.topic,
        sender = %sender,
        recipients = recipients.len(),
        "forwarding broadcast"
    );

    match encode_frame(&WireMessage::Broadcast(envelope)) {
        Ok(frame) => {
            for tx in recipients {
                let _ = tx.send(Message::Binary(frame.clone().into()));
            }
        }
        Err(err) => error!("failed to re-encode broadcast from {}: {}", sender, err),
    }
}

fn send_control(tx: &mpsc::UnboundedSender<Message>, control: ControlMessage) {
    match encode_frame(&WireMessage::Control(control)) {
        Ok(frame) => {
            let _ = tx.send(Message::Binary(frame.into()));
        }
        Err(err) => error!("failed to serialize control message: {}", err),
    }
}
