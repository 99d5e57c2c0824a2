use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tabsync_core::{
    ControlMessage, Envelope, Hello, MAX_FRAME_BYTES, MAX_TABS_PER_ORIGIN, TOPIC_PRESENCE, TabId,
    WireMessage, decode_frame, encode_frame,
};
use tabsync_hub::{HubState, build_router};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

struct TestTab {
    tab_id: TabId,
    write: WsWrite,
    read: WsRead,
}

#[tokio::test]
async fn broadcast_is_forwarded_to_other_tabs_only() {
    let (address, state, shutdown_tx) = start_hub().await;

    let mut tab_a = connect_tab(&address, "origin-a").await;
    let mut tab_b = connect_tab(&address, "origin-a").await;
    let mut tab_c = connect_tab(&address, "origin-a").await;
    wait_for_tabs(&state, "origin-a", 3).await;

    let envelope = envelope_from(&tab_a.tab_id, b"beacon".to_vec());
    send_broadcast(&mut tab_a, envelope.clone()).await;

    for tab in [&mut tab_b, &mut tab_c] {
        let received = recv_broadcast(tab, Duration::from_secs(2))
            .await
            .expect("peer receives broadcast");
        assert_eq!(received, envelope);
    }

    let echoed = recv_broadcast(&mut tab_a, Duration::from_millis(300)).await;
    assert!(echoed.is_none(), "publisher received its own broadcast");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn origins_are_isolated() {
    let (address, state, shutdown_tx) = start_hub().await;

    let mut tab_a = connect_tab(&address, "origin-x").await;
    let mut tab_b = connect_tab(&address, "origin-y").await;
    wait_for_tabs(&state, "origin-x", 1).await;
    wait_for_tabs(&state, "origin-y", 1).await;

    let envelope = envelope_from(&tab_a.tab_id, b"hello".to_vec());
    send_broadcast(&mut tab_a, envelope).await;

    let leaked = recv_broadcast(&mut tab_b, Duration::from_millis(400)).await;
    assert!(leaked.is_none(), "broadcast leaked across origins");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn messages_from_one_sender_keep_their_order() {
    let (address, state, shutdown_tx) = start_hub().await;

    let mut tab_a = connect_tab(&address, "origin-order").await;
    let mut tab_b = connect_tab(&address, "origin-order").await;
    wait_for_tabs(&state, "origin-order", 2).await;

    for index in 0..20_u8 {
        let envelope = envelope_from(&tab_a.tab_id, vec![index]);
        send_broadcast(&mut tab_a, envelope).await;
    }

    for expected in 0..20_u8 {
        let received = recv_broadcast(&mut tab_b, Duration::from_secs(2))
            .await
            .expect("ordered broadcast");
        assert_eq!(received.payload, vec![expected]);
    }

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn invalid_first_frame_is_rejected() {
    let (address, _state, shutdown_tx) = start_hub().await;

    let (ws_stream, _) = connect_async(&address).await.expect("connect websocket");
    let (mut write, mut read) = ws_stream.split();

    let sender = TabId::generate();
    let frame = encode_frame(&WireMessage::Broadcast(envelope_from(&sender, vec![1, 2, 3])))
        .expect("encode broadcast");
    write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send invalid first frame");

    let closed = timeout(Duration::from_secs(2), read.next())
        .await
        .expect("server should close websocket quickly");
    assert!(
        closed.is_none()
            || matches!(closed, Some(Ok(Message::Close(_))))
            || matches!(closed, Some(Err(_))),
        "expected websocket termination after invalid first frame"
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn sender_identity_mismatch_is_dropped() {
    let (address, state, shutdown_tx) = start_hub().await;

    let mut tab_a = connect_tab(&address, "origin-spoof").await;
    let mut tab_b = connect_tab(&address, "origin-spoof").await;
    wait_for_tabs(&state, "origin-spoof", 2).await;

    let spoofed = envelope_from(&TabId::generate(), vec![7, 7, 7]);
    send_broadcast(&mut tab_a, spoofed).await;

    let received = recv_broadcast(&mut tab_b, Duration::from_millis(500)).await;
    assert!(
        received.is_none(),
        "peer received broadcast with mismatched sender identity"
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn malformed_and_oversized_frames_are_dropped() {
    let (address, state, shutdown_tx) = start_hub().await;

    let mut tab_a = connect_tab(&address, "origin-malformed").await;
    let mut tab_b = connect_tab(&address, "origin-malformed").await;
    wait_for_tabs(&state, "origin-malformed", 2).await;

    tab_a
        .write
        .send(Message::Binary(vec![0xFF, 0x00, 0xAB, 0xCD].into()))
        .await
        .expect("send malformed frame");

    let received = recv_broadcast(&mut tab_b, Duration::from_millis(400)).await;
    assert!(received.is_none(), "peer received data from malformed frame");

    let oversized = vec![0_u8; MAX_FRAME_BYTES + 1];
    let _ = tab_a.write.send(Message::Binary(oversized.into())).await;

    let received = recv_broadcast(&mut tab_b, Duration::from_millis(400)).await;
    assert!(received.is_none(), "peer received data from oversized frame");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn unexpected_control_after_hello_is_ignored() {
    let (address, state, shutdown_tx) = start_hub().await;

    let mut tab_a = connect_tab(&address, "origin-control").await;
    let mut tab_b = connect_tab(&address, "origin-control").await;
    wait_for_tabs(&state, "origin-control", 2).await;

    let control = WireMessage::Control(ControlMessage::Error {
        message: "not for the hub".to_owned(),
    });
    let control_frame = encode_frame(&control).expect("encode control");
    tab_a
        .write
        .send(Message::Binary(control_frame.into()))
        .await
        .expect("send unexpected control frame");

    let envelope = envelope_from(&tab_a.tab_id, b"after-control".to_vec());
    send_broadcast(&mut tab_a, envelope.clone()).await;

    let received = recv_broadcast(&mut tab_b, Duration::from_secs(2)).await;
    assert_eq!(received, Some(envelope));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn origin_capacity_rejects_extra_tab() {
    let (address, state, shutdown_tx) = start_hub().await;

    let mut tabs = Vec::with_capacity(MAX_TABS_PER_ORIGIN);
    for _ in 0..MAX_TABS_PER_ORIGIN {
        tabs.push(connect_tab(&address, "origin-cap").await);
    }
    wait_for_tabs(&state, "origin-cap", MAX_TABS_PER_ORIGIN).await;

    let mut overflow = connect_tab(&address, "origin-cap").await;
    let rejection = recv_next_wire_message(&mut overflow, Duration::from_secs(2)).await;
    assert!(
        matches!(rejection, Some(WireMessage::Control(ControlMessage::Error { .. }))),
        "overflow tab should be told the origin is full"
    );
    assert_eq!(state.tab_count("origin-cap").await, MAX_TABS_PER_ORIGIN);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn departed_tab_is_unregistered() {
    let (address, state, shutdown_tx) = start_hub().await;

    let tab_a = connect_tab(&address, "origin-leave").await;
    let _tab_b = connect_tab(&address, "origin-leave").await;
    wait_for_tabs(&state, "origin-leave", 2).await;

    drop(tab_a);
    wait_for_tabs(&state, "origin-leave", 1).await;

    let _ = shutdown_tx.send(());
}

async fn start_hub() -> (String, HubState, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral hub socket");
    let address = listener.local_addr().expect("hub local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let state = HubState::new();

    let server = axum::serve(listener, build_router(state.clone())).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("ws://{}/ws", address), state, shutdown_tx)
}

async fn connect_tab(ws_url: &str, origin: &str) -> TestTab {
    let (ws_stream, _) = connect_async(ws_url).await.expect("connect websocket");
    let (mut write, read) = ws_stream.split();
    let tab_id = TabId::generate();

    let hello = WireMessage::Control(ControlMessage::Hello(Hello {
        origin: origin.to_owned(),
        tab_id: tab_id.clone(),
    }));
    let frame = encode_frame(&hello).expect("encode hello");
    write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send hello");

    TestTab {
        tab_id,
        write,
        read,
    }
}

async fn wait_for_tabs(state: &HubState, origin: &str, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.tab_count(origin).await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "origin {origin} never reached {expected} tabs"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn envelope_from(sender: &TabId, payload: Vec<u8>) -> Envelope {
    Envelope {
        topic: TOPIC_PRESENCE.to_owned(),
        sender: sender.clone(),
        payload,
    }
}

async fn send_broadcast(tab: &mut TestTab, envelope: Envelope) {
    let frame = encode_frame(&WireMessage::Broadcast(envelope)).expect("encode broadcast");
    tab.write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send broadcast");
}

async fn recv_broadcast(tab: &mut TestTab, wait: Duration) -> Option<Envelope> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match recv_next_wire_message(tab, remaining).await {
            Some(WireMessage::Broadcast(envelope)) => return Some(envelope),
            Some(WireMessage::Control(_)) => continue,
            None => return None,
        }
    }
}

async fn recv_next_wire_message(tab: &mut TestTab, wait: Duration) -> Option<WireMessage> {
    let next = timeout(wait, tab.read.next()).await.ok()?;
    let ws_result = next?;
    let message = ws_result.ok()?;

    match message {
        Message::Binary(bytes) => decode_frame(&bytes).ok(),
        _ => None,
    }
}
