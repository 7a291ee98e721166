mod common;

use std::sync::Arc;

use common::{Echo, FakeServer, Harness, ROOM, transport_params, wait_until};
use serde_json::{Value, json};
use voice_room_core::media::{
    DEFAULT_STUN_URL, Direction, LocalStream, MediaError, TransportHandler, TransportObservation,
};
use voice_room_core::negotiation::protocol::{
    CONNECT_TRANSPORT, CREATE_TRANSPORT, GET_ROUTER_RTP_CAPABILITIES, ROUTER_RTP_CAPABILITIES,
    TRANSPORT_CONNECTED,
};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use voice_room_core::negotiation::{
    NegotiationError, NegotiationState, Negotiator, NegotiatorConfig,
};
use voice_room_core::room::{RoomError, SessionConfig};
use voice_room_core::signaling::SignalingError;
use voice_room_core::signaling::app_events::SOCKET_INSUFFICIENT_FUNDS;

fn negotiator(harness: &Harness) -> Negotiator {
    let defaults = SessionConfig::default();
    Negotiator::new(
        harness.client.clone(),
        harness.device.clone(),
        ROOM,
        NegotiatorConfig {
            match_timeout: defaults.match_timeout,
            fallback_stun: defaults.fallback_stun,
        },
    )
}

#[test_timeout::tokio_timeout_test]
async fn anonymous_replies_bind_transports_in_request_order() {
    let mut ids = vec!["Y", "X"];
    let server = FakeServer::new().respond_with(CREATE_TRANSPORT, move |_| {
        let id = ids.pop().unwrap_or("Z");
        vec![("transport-created".into(), json!({ "id": id }))]
    });
    let harness = Harness::start(server);
    let room = harness.room();

    let transports = room.initialize_room().await.expect("room initialized");

    assert_eq!(transports.send.id(), "X");
    assert_eq!(transports.recv.id(), "Y");
    assert_eq!(
        harness.device.loaded_capabilities().map(|caps| caps.0),
        Some(json!({ "codecs": [] }))
    );
    assert_eq!(harness.server.count(GET_ROUTER_RTP_CAPABILITIES), 1);
    let send = room
        .negotiation_record(Direction::Send)
        .expect("send record");
    assert_eq!(send.state, NegotiationState::Constructed);
    assert_eq!(send.transport_id.as_deref(), Some("X"));
}

#[test_timeout::tokio_timeout_test]
async fn alternate_transport_id_fields_are_canonicalized() {
    for key in ["transportId", "id", "transport_id"] {
        for direction in [Direction::Send, Direction::Recv] {
            let server = FakeServer::new().respond_with(CREATE_TRANSPORT, move |_| {
                let mut reply = serde_json::Map::new();
                reply.insert(key.to_string(), json!("t-1"));
                vec![("transport-created".into(), Value::Object(reply))]
            });
            let harness = Harness::start(server);
            let transport = negotiator(&harness)
                .negotiate(direction)
                .await
                .expect("negotiated");
            assert_eq!(transport.id(), "t-1", "{key} on {direction}");
            assert_eq!(transport.direction(), direction);
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn reversed_replies_match_by_request_id() {
    let harness = Harness::start(
        FakeServer::new()
            .echo(Echo::RequestId)
            .reverse_transport_replies(),
    );
    let negotiator = negotiator(&harness);

    let (send, recv) = tokio::join!(
        negotiator.negotiate(Direction::Send),
        negotiator.negotiate(Direction::Recv)
    );

    assert_eq!(send.expect("send").id(), "send-transport");
    assert_eq!(recv.expect("recv").id(), "recv-transport");
    assert_eq!(harness.server.count(GET_ROUTER_RTP_CAPABILITIES), 1);
}

#[test_timeout::tokio_timeout_test]
async fn reversed_replies_match_by_direction_echo() {
    let harness = Harness::start(
        FakeServer::new()
            .echo(Echo::Direction)
            .reverse_transport_replies(),
    );
    let negotiator = negotiator(&harness);

    let (send, recv) = tokio::join!(
        negotiator.negotiate(Direction::Send),
        negotiator.negotiate(Direction::Recv)
    );

    assert_eq!(send.expect("send").id(), "send-transport");
    assert_eq!(recv.expect("recv").id(), "recv-transport");
}

#[test_timeout::tokio_timeout_test]
async fn relay_servers_fall_back_to_stun() {
    let server = FakeServer::new().respond_with(CREATE_TRANSPORT, |request| {
        let mut reply = transport_params("send-transport");
        if request["direction"] == "recv" {
            reply = transport_params("recv-transport");
            reply["iceServers"] = json!([
                { "urls": ["turn:relay.example.com:3478"], "username": "u", "credential": "c" }
            ]);
        }
        vec![("transport-created".into(), reply)]
    });
    let harness = Harness::start(server);
    let room = harness.room();
    room.initialize_room().await.expect("room initialized");

    let send = harness.mock_transport(Direction::Send);
    let stun = &send.options().ice_servers;
    assert_eq!(stun.len(), 1);
    assert_eq!(stun[0].urls, vec![DEFAULT_STUN_URL.to_string()]);

    let recv = harness.mock_transport(Direction::Recv);
    let relays = &recv.options().ice_servers;
    assert_eq!(relays[0].urls, vec!["turn:relay.example.com:3478".to_string()]);
    assert_eq!(relays[0].username, "u");
}

#[test_timeout::tokio_timeout_test]
async fn produced_alternate_id_is_returned_to_the_library() {
    let server = FakeServer::new().respond_with("produce", |_| {
        vec![("produced".into(), json!({ "producer_id": "p1" }))]
    });
    let harness = Harness::start(server);
    let room = harness.room();
    let transports = room.initialize_room().await.expect("room initialized");

    let session = room
        .start_producing(&transports.send)
        .await
        .expect("producing");

    assert_eq!(session.producer.id(), "p1");
    assert!(session.stream.is_active());
    let connects = harness.server.emitted(CONNECT_TRANSPORT);
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0]["transportId"], "send-transport");
    assert!(harness.mock_transport(Direction::Send).is_connected());
    assert_eq!(
        room.negotiation_record(Direction::Send).map(|record| record.state),
        Some(NegotiationState::Connected)
    );
}

#[test_timeout::tokio_timeout_test]
async fn connect_rejection_fails_produce_and_releases_capture() {
    let server = FakeServer::new().respond_with(CONNECT_TRANSPORT, |request| {
        vec![(
            "transport-connected".into(),
            json!({ "transportId": request["transportId"], "error": "DTLS handshake refused" }),
        )]
    });
    let harness = Harness::start(server);
    let room = harness.room();
    let transports = room.initialize_room().await.expect("room initialized");

    let err = room
        .start_producing(&transports.send)
        .await
        .err()
        .expect("produce must fail");

    assert!(
        matches!(err, RoomError::Media(MediaError::Rejected { operation, .. }) if operation == CONNECT_TRANSPORT),
        "unexpected error: {err:?}"
    );
    assert!(!err.user_message().contains("DTLS"));
    let streams = harness.microphone.streams();
    assert_eq!(streams.len(), 1);
    assert!(!streams[0].is_active());
    assert_eq!(
        room.negotiation_record(Direction::Send).map(|record| record.state),
        Some(NegotiationState::Failed)
    );
}

#[test_timeout::tokio_timeout_test(paused)]
async fn unanswered_connect_times_out_and_fails_produce() {
    let server = FakeServer::new().respond_with(CONNECT_TRANSPORT, |_| Vec::new());
    let harness = Harness::start(server);
    let room = harness.room();
    let transports = room.initialize_room().await.expect("room initialized");

    let err = room
        .start_producing(&transports.send)
        .await
        .err()
        .expect("produce must fail");

    match &err {
        RoomError::Media(MediaError::Rejected { operation, reason }) => {
            assert_eq!(*operation, CONNECT_TRANSPORT);
            assert!(reason.contains(TRANSPORT_CONNECTED), "{reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(harness.client.listener_count(TRANSPORT_CONNECTED), 0);
    assert_eq!(harness.server.count("produce"), 0);
    assert!(!harness.microphone.streams()[0].is_active());
    assert_eq!(
        room.negotiation_record(Direction::Send).map(|record| record.state),
        Some(NegotiationState::Failed)
    );
}

#[test_timeout::tokio_timeout_test]
async fn failed_transport_keeps_a_stats_snapshot() {
    let harness = Harness::start(FakeServer::new());
    let room = harness.room();
    room.initialize_room().await.expect("room initialized");
    let handler = harness.mock_transport(Direction::Send).handler();

    handler.observe(TransportObservation::Connection(RTCPeerConnectionState::Failed));
    wait_until(|| {
        room.negotiation_record(Direction::Send)
            .is_some_and(|record| record.failure_snapshot.is_some())
    })
    .await;

    let send = room.negotiation_record(Direction::Send).expect("send record");
    assert_eq!(send.state, NegotiationState::Failed);
    assert_eq!(send.connection_state, Some(RTCPeerConnectionState::Failed));
    let recv = room.negotiation_record(Direction::Recv).expect("recv record");
    assert_eq!(recv.state, NegotiationState::Constructed);
    assert!(recv.failure_snapshot.is_none());
}

#[test_timeout::tokio_timeout_test]
async fn insufficient_funds_is_reported_to_the_wallet() {
    let server = FakeServer::new().respond_with("produce", |_| {
        vec![("produced".into(), json!({ "error": "INSUFFICIENT_FUNDS" }))]
    });
    let harness = Harness::start(server);
    let mut wallet = harness.app_events.subscribe(SOCKET_INSUFFICIENT_FUNDS);
    let room = harness.room();
    let transports = room.initialize_room().await.expect("room initialized");

    let err = room
        .start_producing(&transports.send)
        .await
        .err()
        .expect("produce must fail");

    assert!(matches!(err, RoomError::InsufficientFunds(_)), "{err:?}");
    assert_eq!(
        err.user_message(),
        "Insufficient balance. Please recharge to continue."
    );
    assert!(wallet.recv().await.is_ok());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn silent_server_times_out_and_deregisters() {
    let server = FakeServer::new().respond_with(GET_ROUTER_RTP_CAPABILITIES, |_| Vec::new());
    let harness = Harness::start(server);
    let room = harness.room();

    let err = room
        .initialize_room()
        .await
        .err()
        .expect("no capabilities reply");

    assert!(
        matches!(
            err,
            RoomError::Negotiation(NegotiationError::Signaling(SignalingError::Timeout { .. }))
        ),
        "{err:?}"
    );
    assert_eq!(
        err.user_message(),
        "The room server is not responding. Please try again."
    );
    assert_eq!(harness.client.listener_count(ROUTER_RTP_CAPABILITIES), 0);
    assert_eq!(
        room.negotiation_record(Direction::Send).map(|record| record.state),
        Some(NegotiationState::Failed)
    );
}

#[test_timeout::tokio_timeout_test]
async fn capabilities_are_requested_once_per_room() {
    let harness = Harness::start(FakeServer::new().echo(Echo::Direction));
    let negotiator = Arc::new(negotiator(&harness));

    let (first, second) = tokio::join!(negotiator.load_capabilities(), negotiator.load_capabilities());
    first.expect("first");
    second.expect("second");
    negotiator
        .negotiate(Direction::Recv)
        .await
        .expect("negotiated");

    assert_eq!(harness.server.count(GET_ROUTER_RTP_CAPABILITIES), 1);
}
