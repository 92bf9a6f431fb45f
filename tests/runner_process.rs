// End-to-end runner behaviour against a real child process. The "engine" is
// a small shell script; the test plays the engine's side of the UDP channel.

#![cfg(unix)]

use autohost_server::domain::events::EngineEvent;
use autohost_server::interface_adapters::start_script::StartScriptSpec;
use autohost_server::use_cases::runner::{
    ENGINE_BINARY, ProcessRunnerSpawner, RunnerEvent, RunnerOpts, RunnerSpawner,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const ENGINE_VERSION: &str = "test-engine";

// Exits cleanly on SIGTERM, otherwise idles like a real dedicated server.
const ENGINE_SCRIPT: &str = "#!/bin/sh\ntrap 'exit 0' TERM\nsleep 30 &\nwait $!\n";

fn write_engine(engines_dir: &Path) {
    let version_dir = engines_dir.join(ENGINE_VERSION);
    std::fs::create_dir_all(&version_dir).unwrap();
    let binary = version_dir.join(ENGINE_BINARY);
    std::fs::write(&binary, ENGINE_SCRIPT).unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
}

async fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

fn opts(dir: &Path, battle_id: &str, autohost_port: u16) -> RunnerOpts {
    RunnerOpts {
        battle_id: battle_id.into(),
        engine_version: ENGINE_VERSION.to_string(),
        script: StartScriptSpec {
            game_name: "Game".to_string(),
            map_name: "Map".to_string(),
            start_pos_type: None,
            ally_teams: Vec::new(),
            spectators: Vec::new(),
            game_options: BTreeMap::new(),
            map_options: BTreeMap::new(),
        },
        settings: BTreeMap::new(),
        engines_dir: dir.join("engines"),
        instances_dir: dir.join("instances"),
        engine_bind_ip: "0.0.0.0".to_string(),
        host_port: 20000,
        autohost_port,
    }
}

/// Send SERVER_STARTED until the runner acknowledges it.
async fn drive_startup(
    engine_socket: &UdpSocket,
    target: &str,
    events_rx: &mut mpsc::Receiver<RunnerEvent>,
) -> SocketAddr {
    for _ in 0..100 {
        let _ = engine_socket.send_to(&[0], target).await;
        match tokio::time::timeout(Duration::from_millis(50), events_rx.recv()).await {
            Ok(Some(RunnerEvent::Started { engine_addr })) => return engine_addr,
            Ok(Some(other)) => panic!("unexpected event before start: {other:?}"),
            Ok(None) => panic!("runner event stream closed before start"),
            Err(_) => {}
        }
    }
    panic!("runner never reported start");
}

/// Next event that is not a stray decoded SERVER_STARTED retransmission.
async fn next_event(events_rx: &mut mpsc::Receiver<RunnerEvent>) -> RunnerEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("event in time")
            .expect("open event stream");
        if matches!(event, RunnerEvent::Packet(EngineEvent::ServerStarted)) {
            continue;
        }
        return event;
    }
}

#[tokio::test]
async fn full_battle_lifecycle_with_a_real_process() {
    let dir = tempfile::tempdir().unwrap();
    write_engine(&dir.path().join("engines"));

    let autohost_port = free_udp_port().await;
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let control = ProcessRunnerSpawner
        .spawn(opts(dir.path(), "battle-real", autohost_port), events_tx)
        .await;

    let engine_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = format!("127.0.0.1:{autohost_port}");
    let engine_addr = drive_startup(&engine_socket, &target, &mut events_rx).await;
    assert_eq!(engine_addr, engine_socket.local_addr().unwrap());

    // The start script landed in the instance directory with the endpoints.
    let script = std::fs::read_to_string(
        dir.path()
            .join("instances")
            .join("battle-real")
            .join("script.txt"),
    )
    .unwrap();
    assert!(script.contains(&format!("autohostport={autohost_port};")));
    let settings = std::fs::read_to_string(
        dir.path()
            .join("instances")
            .join("battle-real")
            .join("settings.txt"),
    )
    .unwrap();
    assert!(settings.contains("AllowAdditionalPlayers = 1"));

    // Outbound packets reach the engine's socket.
    control.send_packet(b"/hello world".to_vec()).await.unwrap();
    let mut buf = [0u8; 128];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), engine_socket.recv_from(&mut buf))
        .await
        .expect("packet in time")
        .unwrap();
    assert_eq!(&buf[..len], b"/hello world");

    // Datagrams from a foreign port are dropped without an event.
    let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let _ = intruder.send_to(&[10, 0, b'X'], &target).await;
    let _ = engine_socket.send_to(&[10, 0, b'A'], &target).await;
    match next_event(&mut events_rx).await {
        RunnerEvent::Packet(EngineEvent::PlayerJoined { player: 0, name }) => {
            assert_eq!(name, "A");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Undecodable datagrams are logged and dropped, not fatal.
    let _ = engine_socket.send_to(&[11, 0, 9], &target).await;
    let _ = engine_socket.send_to(&[14, 1], &target).await;
    match next_event(&mut events_rx).await {
        RunnerEvent::Packet(EngineEvent::PlayerDefeated { player: 1 }) => {}
        other => panic!("unexpected event: {other:?}"),
    }

    // Close terminates the script via SIGTERM; exactly one exit follows.
    control.close().await;
    control.close().await;
    match next_event(&mut events_rx).await {
        RunnerEvent::Exited => {}
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(200), events_rx.recv())
            .await
            .map(|event| event.is_none())
            .unwrap_or(true),
        "no events after exit"
    );

    // Sends after shutdown are rejected.
    assert!(control.send_packet(b"/late".to_vec()).await.is_err());
}

#[tokio::test]
async fn wrong_first_packet_stops_the_battle() {
    let dir = tempfile::tempdir().unwrap();
    write_engine(&dir.path().join("engines"));

    let autohost_port = free_udp_port().await;
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let _control = ProcessRunnerSpawner
        .spawn(opts(dir.path(), "battle-bad-first", autohost_port), events_tx)
        .await;

    let engine_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = format!("127.0.0.1:{autohost_port}");

    // Keep poking until the runner's socket is up and reacts.
    let event = loop {
        let _ = engine_socket.send_to(&[10, 0, b'A'], &target).await;
        match tokio::time::timeout(Duration::from_millis(50), events_rx.recv()).await {
            Ok(Some(event)) => break event,
            Ok(None) => panic!("runner event stream closed"),
            Err(_) => {}
        }
    };
    match event {
        RunnerEvent::Error { details } => {
            assert_eq!(details, "expected SERVER_STARTED first");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut events_rx).await {
        RunnerEvent::Exited => {}
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn missing_engine_binary_surfaces_as_error_then_exit() {
    let dir = tempfile::tempdir().unwrap();
    // No engine installed at all.
    std::fs::create_dir_all(dir.path().join("engines")).unwrap();

    let autohost_port = free_udp_port().await;
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let _control = ProcessRunnerSpawner
        .spawn(opts(dir.path(), "battle-no-binary", autohost_port), events_tx)
        .await;

    match next_event(&mut events_rx).await {
        RunnerEvent::Error { details } => {
            assert!(details.contains("failed to spawn engine"), "{details}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut events_rx).await {
        RunnerEvent::Exited => {}
        other => panic!("unexpected event: {other:?}"),
    }
}
