use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tabsync_core::{
    ControlMessage, Envelope, Hello, TabId, WireMessage, decode_frame, encode_frame,
};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    error::TransportError,
    transport::{BroadcastTransport, Delivery, SubscriberRegistry, Subscription, check_topic},
};

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_BASE_MS: u64 = 200;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug)]
pub struct WsTransport {
    tab_id: TabId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    registry: SubscriberRegistry,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsTransport {
    /// Connects to the hub at `hub_url` and registers this tab under `origin`.
    ///
    /// Retries a few times with exponential backoff; a hub that stays
    /// unreachable is reported as [`TransportError::Unavailable`].
    pub async fn connect(hub_url: &str, origin: &str, tab_id: &TabId) -> Result<Self, TransportError> {
        Url::parse(hub_url)
            .map_err(|err| TransportError::Unavailable(format!("invalid hub url: {err}")))?;
        if origin.trim().is_empty() {
            return Err(TransportError::Unavailable("origin must not be empty".to_owned()));
        }

        let ws_stream = connect_with_retry(hub_url).await?;
        info!(hub_url, origin, tab_id = %tab_id, "connected to hub");

        let (write_half, read_half) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let registry = SubscriberRegistry::default();
        let connected = Arc::new(AtomicBool::new(true));

        let hello = encode_frame(&WireMessage::Control(ControlMessage::Hello(Hello {
            origin: origin.to_owned(),
            tab_id: tab_id.clone(),
        })))?;
        outbound_tx.send(hello).map_err(|_| TransportError::Closed)?;

        let send_task = tokio::spawn(hub_send_task(write_half, outbound_rx, connected.clone()));
        let receive_task = tokio::spawn(hub_receive_task(
            read_half,
            registry.clone(),
            connected.clone(),
        ));

        Ok(Self {
            tab_id: tab_id.clone(),
            outbound: outbound_tx,
            registry,
            connected,
            tasks: vec![send_task, receive_task],
        })
    }
}

impl BroadcastTransport for WsTransport {
    fn is_available(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        check_topic(topic)?;
        if !self.is_available() {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(&WireMessage::Broadcast(Envelope {
            topic: topic.to_owned(),
            sender: self.tab_id.clone(),
            payload: payload.to_vec(),
        }))?;
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        self.registry.register(&self.tab_id, topic)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn connect_with_retry(hub_url: &str) -> Result<WsStream, TransportError> {
    let mut attempt: u32 = 1;
    loop {
        debug!(attempt, max_attempts = MAX_CONNECT_ATTEMPTS, hub_url, "connecting");

        let failure = match timeout(CONNECT_TIMEOUT, connect_async(hub_url)).await {
            Ok(Ok((stream, _))) => return Ok(stream),
            Ok(Err(err)) => format!("connect failed: {err}"),
            Err(_) => format!("connect timed out after {:?}", CONNECT_TIMEOUT),
        };
        warn!(attempt, hub_url, "{failure}");
        if attempt >= MAX_CONNECT_ATTEMPTS {
            return Err(TransportError::Unavailable(failure));
        }

        let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        attempt += 1;
    }
}

async fn hub_send_task(
    mut ws_write: futures::stream::SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(err) = ws_write.send(Message::Binary(frame.into())).await {
            warn!("hub write failed: {}", err);
            break;
        }
    }
    connected.store(false, Ordering::Relaxed);
}

async fn hub_receive_task(
    mut ws_read: futures::stream::SplitStream<WsStream>,
    registry: SubscriberRegistry,
    connected: Arc<AtomicBool>,
) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("hub read failed: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => match decode_frame(&data) {
                Ok(WireMessage::Broadcast(envelope)) => {
                    let delivery = Delivery {
                        sender: envelope.sender,
                        payload: envelope.payload,
                    };
                    registry.dispatch(None, &envelope.topic, &delivery);
                }
                Ok(WireMessage::Control(ControlMessage::Error { message })) => {
                    error!("hub rejected tab: {}", message);
                }
                Ok(WireMessage::Control(ControlMessage::Hello(_))) => {}
                Err(err) => warn!("decode frame failed: {}", err),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    connected.store(false, Ordering::Relaxed);
    registry.clear();
    info!("hub connection closed");
}
