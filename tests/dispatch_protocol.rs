// Request dispatch through the lobby codec: envelope handling, validation
// failures and reason policing.

mod support;

use autohost_server::interface_adapters::dispatch::Dispatcher;
use autohost_server::interface_adapters::protocol::{self, MessageType};
use serde_json::{Value, json};
use support::{HOSTING_IP, harness, start_request};
use tokio::sync::mpsc;

fn request_frame(command_id: &str, message_id: &str, data: Value) -> String {
    json!({
        "type": "request",
        "messageId": message_id,
        "commandId": command_id,
        "data": data,
    })
    .to_string()
}

async fn dispatch(dispatcher: &Dispatcher, frame: &str) -> Value {
    let envelope = protocol::parse_envelope(frame).expect("parsable frame");
    let response = dispatcher.handle(envelope).await.expect("a response");
    serde_json::from_str(&response).expect("json response")
}

#[tokio::test]
async fn start_request_round_trips_to_a_success_response() {
    let h = harness().await;
    let (outbound_tx, _outbound_rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(h.service.clone(), outbound_tx);

    let frame = request_frame("autohost/start", "m-1", json!({
        "battleId": "battle-1",
        "engineVersion": support::ENGINE_VERSION,
        "gameName": "Game 1.0",
        "mapName": "Quicksilver",
        "allyTeams": [
            {"teams": [{"players": [
                {"userId": "u-alice", "name": "Alice", "password": "p1"},
            ]}]},
        ],
    }));
    let response = dispatch(&dispatcher, &frame).await;

    assert_eq!(response["type"], "response");
    assert_eq!(response["status"], "success");
    assert_eq!(response["commandId"], "autohost/start");
    assert_eq!(response["messageId"], "m-1");
    assert_eq!(response["data"]["ips"], json!([HOSTING_IP]));
    assert_eq!(response["data"]["port"], 20000);
}

#[tokio::test]
async fn unknown_command_is_unimplemented() {
    let h = harness().await;
    let (outbound_tx, _outbound_rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(h.service.clone(), outbound_tx);

    let frame = request_frame("autohost/fly", "m-2", json!({}));
    let response = dispatch(&dispatcher, &frame).await;
    assert_eq!(response["status"], "failed");
    assert_eq!(response["reason"], "command_unimplemented");
    assert_eq!(response["messageId"], "m-2");
}

#[tokio::test]
async fn invalid_request_data_reports_the_validator_message() {
    let h = harness().await;
    let (outbound_tx, _outbound_rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(h.service.clone(), outbound_tx);

    // battleId is missing entirely.
    let frame = request_frame("autohost/kill", "m-3", json!({"battle": "nope"}));
    let response = dispatch(&dispatcher, &frame).await;
    assert_eq!(response["status"], "failed");
    assert_eq!(response["reason"], "invalid_request");
    assert!(
        response["details"].as_str().unwrap().contains("invalid request data"),
        "details: {}",
        response["details"]
    );
}

#[tokio::test]
async fn domain_failures_keep_their_reason() {
    let h = harness().await;
    let (outbound_tx, _outbound_rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(h.service.clone(), outbound_tx);

    let frame = request_frame("autohost/kill", "m-4", json!({"battleId": "ghost"}));
    let response = dispatch(&dispatcher, &frame).await;
    assert_eq!(response["status"], "failed");
    assert_eq!(response["reason"], "invalid_request");
}

#[tokio::test]
async fn inbound_events_and_responses_are_ignored() {
    let h = harness().await;
    let (outbound_tx, _outbound_rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(h.service.clone(), outbound_tx);

    let frame = json!({
        "type": "event",
        "messageId": "m-5",
        "commandId": "lobby/something",
        "data": {},
    })
    .to_string();
    let envelope = protocol::parse_envelope(&frame).unwrap();
    assert_eq!(envelope.kind, MessageType::Event);
    assert!(dispatcher.handle(envelope).await.is_none());
}

#[tokio::test]
async fn subscribe_updates_streams_frames_through_the_connection_channel() {
    let h = harness().await;
    let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(h.service.clone(), outbound_tx);

    let since = h.buffer.now_us();
    let frame = request_frame("autohost/subscribeUpdates", "m-6", json!({"since": since}));
    let response = dispatch(&dispatcher, &frame).await;
    assert_eq!(response["status"], "success");

    // A second subscription is rejected while the first is active.
    let frame = request_frame("autohost/subscribeUpdates", "m-7", json!({"since": since}));
    let response = dispatch(&dispatcher, &frame).await;
    assert_eq!(response["status"], "failed");
    assert_eq!(response["reason"], "invalid_request");
    assert_eq!(response["details"], "callback_already_set");

    // Updates flow as event frames with fresh message ids.
    h.service.start(start_request("battle-1")).await.unwrap();
    let battle = h.spawner.battle(0);
    battle
        .control
        .emit(autohost_server::use_cases::runner::RunnerEvent::Packet(
            autohost_server::domain::events::EngineEvent::ServerMessage {
                message: "hello".to_string(),
            },
        ))
        .await;

    let frame = tokio::time::timeout(std::time::Duration::from_secs(2), outbound_rx.recv())
        .await
        .expect("update frame in time")
        .expect("open channel");
    let event: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(event["type"], "event");
    assert_eq!(event["commandId"], "autohost/update");
    assert_eq!(event["data"]["battleId"], "battle-1");
    assert_eq!(event["data"]["update"]["type"], "engine_message");
    assert_eq!(event["data"]["update"]["message"], "hello");
    assert!(event["data"]["time"].as_u64().unwrap() > since);
}
