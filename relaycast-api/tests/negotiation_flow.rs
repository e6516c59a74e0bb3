//! End-to-end negotiation tests
//!
//! Real signaling handlers and the loopback media engine on the server side,
//! session negotiators with loopback local media on the client side.
//!
//! Run with: cargo test --test negotiation_flow

use relaycast_api::{create_router, spawn_pipe, AppState};
use relaycast_client::{
    LoopbackDevice, LoopbackSource, MediaConstraints, NegotiationError, Phase, ProduceOptions,
    RecordingView, SessionNegotiator, SignalingClient,
};
use relaycast_proto::{
    ConnectTransport, ConsumerResume, DtlsParameters, ErrorKind, GetRouterRtpCapabilities,
    ServerEvent, StateReason,
};
use relaycast_sfu::{
    ConnectionId, ConsumerId, LoopbackEngine, RoomId, SfuConfig, SfuManager, TransportRole,
    TransportState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn manager() -> Arc<SfuManager> {
    manager_with_engine().0
}

fn manager_with_engine() -> (Arc<SfuManager>, Arc<LoopbackEngine>) {
    let engine = Arc::new(LoopbackEngine::default());
    (SfuManager::new(SfuConfig::default(), engine.clone()), engine)
}

async fn next_consumer_closed(
    events: &mut tokio::sync::broadcast::Receiver<ServerEvent>,
) -> relaycast_proto::ConsumerClosed {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ServerEvent::ConsumerClosed(closed)) => return closed,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("consumer-closed in time")
}

struct Peer {
    negotiator: SessionNegotiator,
    connection_id: ConnectionId,
}

async fn join(manager: &Arc<SfuManager>, room: &str, device: LoopbackDevice) -> Peer {
    let (tx, rx) = spawn_pipe(Arc::clone(manager), RoomId::new(room), 64);
    let client = Arc::new(SignalingClient::new(tx, rx).with_timeout(Duration::from_secs(5)));
    let socket_id = client.wait_connected().await.expect("connection-success");

    let negotiator = SessionNegotiator::new(
        client,
        Arc::new(device),
        Arc::new(LoopbackSource::default()),
        Arc::new(RecordingView::default()),
    );
    Peer {
        negotiator,
        connection_id: ConnectionId::new(socket_id),
    }
}

/// Round-trip a request so every earlier frame of this peer has been processed
async fn flush(peer: &Peer) {
    peer.negotiator
        .client()
        .request(&GetRouterRtpCapabilities)
        .await
        .expect("flush request");
}

async fn start_producing(peer: &mut Peer) -> String {
    let n = &mut peer.negotiator;
    n.request_capabilities().await.expect("capabilities");
    n.acquire_local_media(&MediaConstraints::default())
        .await
        .expect("local media");
    n.open_send_transport().await.expect("send transport");
    n.produce(&ProduceOptions::simulcast_video())
        .await
        .expect("produce")
        .id
}

#[tokio::test]
async fn test_two_peers_publish_and_consume() {
    let manager = manager();
    let mut alice = join(&manager, "studio", LoopbackDevice::default()).await;
    let mut bob = join(&manager, "studio", LoopbackDevice::default()).await;

    let producer_id = start_producing(&mut alice).await;
    assert_eq!(alice.negotiator.phase(), Phase::Producing);

    let n = &mut bob.negotiator;
    n.request_capabilities().await.expect("capabilities");
    n.open_receive_transport().await.expect("recv transport");
    let consumer = n.consume().await.expect("consume");
    assert_eq!(consumer.producer_id, producer_id);
    assert_eq!(n.phase(), Phase::Consuming);

    flush(&bob).await;
    let coordinator = manager.connection(&bob.connection_id).expect("bob's coordinator");
    assert_eq!(
        coordinator.is_consumer_paused(&ConsumerId::new(consumer.id.clone())),
        Some(false)
    );

    let stats = manager.stats();
    assert_eq!(stats.rooms, 1);
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.producers, 1);
    assert_eq!(stats.consumers, 1);
}

#[tokio::test]
async fn test_capabilities_are_stable() {
    let manager = manager();
    let mut alice = join(&manager, "room", LoopbackDevice::default()).await;
    let bob = join(&manager, "room", LoopbackDevice::default()).await;

    let first = alice.negotiator.request_capabilities().await.expect("first");
    let second = alice.negotiator.request_capabilities().await.expect("second");
    assert_eq!(first, second);

    let direct = bob
        .negotiator
        .client()
        .request(&GetRouterRtpCapabilities)
        .await
        .expect("bob capabilities")
        .into_result()
        .expect("capabilities reply");
    assert_eq!(direct.router_rtp_capabilities, first);
}

#[tokio::test]
async fn test_incompatible_consumer_is_denied() {
    let manager = manager();
    let mut alice = join(&manager, "room", LoopbackDevice::default()).await;
    let mut bob = join(&manager, "room", LoopbackDevice::new(["audio/opus"])).await;

    start_producing(&mut alice).await;

    let n = &mut bob.negotiator;
    n.request_capabilities().await.expect("audio-only device still loads");
    n.open_receive_transport().await.expect("recv transport");
    let err = n.consume().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsumeDenied);
    assert_eq!(n.phase(), Phase::RecvTransportConnected);

    // A later resume for everything is a no-op
    n.client()
        .notify(&ConsumerResume { consumer_id: None })
        .await
        .expect("resume");
    flush(&bob).await;
    let coordinator = manager.connection(&bob.connection_id).expect("bob's coordinator");
    assert_eq!(coordinator.consumer_count(), 0);
}

#[tokio::test]
async fn test_consume_before_any_producer() {
    let manager = manager();
    let mut bob = join(&manager, "empty", LoopbackDevice::default()).await;

    let n = &mut bob.negotiator;
    n.request_capabilities().await.expect("capabilities");
    n.open_receive_transport().await.expect("recv transport");
    let err = n.consume().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsumeDenied);
}

#[tokio::test]
async fn test_connect_without_create() {
    let manager = manager();
    let peer = join(&manager, "room", LoopbackDevice::default()).await;

    let reply = peer
        .negotiator
        .client()
        .request(&ConnectTransport {
            dtls_parameters: DtlsParameters::new(json!({"role": "client", "fingerprints": []})),
        })
        .await
        .expect("reply");
    let err = NegotiationError::from(reply.into_result().unwrap_err());
    assert_eq!(err.reason(), Some(StateReason::NoSuchTransport));
}

#[tokio::test]
async fn test_producer_close_reaches_consumers() {
    let manager = manager();
    let mut alice = join(&manager, "room", LoopbackDevice::default()).await;
    let mut bob = join(&manager, "room", LoopbackDevice::default()).await;

    start_producing(&mut alice).await;
    let n = &mut bob.negotiator;
    n.request_capabilities().await.expect("capabilities");
    n.open_receive_transport().await.expect("recv transport");
    let consumer = n.consume().await.expect("consume");
    let mut events = n.client().subscribe();

    alice.negotiator.close_producer().await.expect("close producer");

    let closed = next_consumer_closed(&mut events).await;
    assert_eq!(closed.consumer_id, consumer.id);

    bob.negotiator
        .handle_server_event(&ServerEvent::ConsumerClosed(closed));
    assert!(bob.negotiator.consumers().is_empty());
    assert_eq!(bob.negotiator.phase(), Phase::RecvTransportConnected);
    assert_eq!(manager.stats().producers, 0);
}

#[tokio::test]
async fn test_engine_side_transport_close_reaches_consumers() {
    let (manager, engine) = manager_with_engine();
    let mut alice = join(&manager, "room", LoopbackDevice::default()).await;
    let mut bob = join(&manager, "room", LoopbackDevice::default()).await;

    start_producing(&mut alice).await;
    let n = &mut bob.negotiator;
    n.request_capabilities().await.expect("capabilities");
    n.open_receive_transport().await.expect("recv transport");
    let consumer = n.consume().await.expect("consume");
    let mut events = n.client().subscribe();

    let producer_side = manager
        .connection(&alice.connection_id)
        .expect("alice's coordinator");
    let send_id = producer_side
        .transport_id(TransportRole::Send)
        .expect("send transport");
    engine.simulate_dtls_closed(&send_id).await;

    let closed = next_consumer_closed(&mut events).await;
    assert_eq!(closed.consumer_id, consumer.id);
    assert_eq!(manager.stats().producers, 0);

    tokio::time::timeout(Duration::from_secs(5), async {
        while producer_side.transport_state(TransportRole::Send) != Some(TransportState::Closed) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("send transport released");

    // Nothing left to consume: denied, not a dangling producer
    bob.negotiator
        .handle_server_event(&ServerEvent::ConsumerClosed(closed));
    let err = bob.negotiator.consume().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsumeDenied);
}

#[tokio::test]
async fn test_disconnect_releases_everything() {
    let manager = manager();
    let mut alice = join(&manager, "room", LoopbackDevice::default()).await;
    start_producing(&mut alice).await;
    assert_eq!(manager.stats().producers, 1);

    drop(alice);
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection torn down");
    assert_eq!(manager.stats().producers, 0);
}

#[tokio::test]
async fn test_websocket_signaling() {
    let manager = manager();
    let app = create_router(AppState::new(Arc::clone(&manager)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let client = relaycast_client::ws::connect(&format!("ws://{addr}/ws/lobby"))
        .await
        .expect("websocket connect");
    let socket_id = client.wait_connected().await.expect("connection-success");
    assert!(!socket_id.is_empty());

    let reply = client
        .request(&GetRouterRtpCapabilities)
        .await
        .expect("capabilities")
        .into_result()
        .expect("capabilities reply");
    assert!(reply.router_rtp_capabilities.as_value()["codecs"].is_array());
    assert_eq!(manager.room_ids(), vec![RoomId::new("lobby")]);
}
