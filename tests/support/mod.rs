// Shared wiring for integration tests: a full service stack with a
// synthetic runner spawner and throwaway directories.
#![allow(dead_code)]

use autohost_server::interface_adapters::protocol::{
    AllyTeamDto, PlayerDto, StartRequest, TeamDto,
};
use autohost_server::use_cases::adapter::AutohostService;
use autohost_server::use_cases::buffer::{BufferedEvent, EventsBuffer, UpdateSink};
use autohost_server::use_cases::manager::{GamesManager, GamesSettings};
use autohost_server::use_cases::registry::{EngineRegistry, RegistrySettings};
use autohost_server::use_cases::runner::ENGINE_BINARY;
use autohost_server::use_cases::testing::FakeRunnerSpawner;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const HOSTING_IP: &str = "203.0.113.7";
pub const ENGINE_VERSION: &str = "105.1.1-2449";

pub struct Harness {
    pub service: Arc<AutohostService>,
    pub manager: Arc<GamesManager>,
    pub buffer: Arc<EventsBuffer>,
    pub spawner: Arc<FakeRunnerSpawner>,
    // Keeps the temp tree alive for the duration of the test.
    #[allow(dead_code)]
    pub dir: tempfile::TempDir,
}

pub async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let engines_dir = dir.path().join("engines");
    let instances_dir = dir.path().join("instances");

    // A present engine binary makes the version count as installed.
    let version_dir = engines_dir.join(ENGINE_VERSION);
    std::fs::create_dir_all(&version_dir).expect("engine dir");
    std::fs::write(version_dir.join(ENGINE_BINARY), b"#!/bin/sh\n").expect("engine binary");

    let registry = EngineRegistry::open(RegistrySettings {
        engines_dir: engines_dir.clone(),
        cdn_base_url: "http://127.0.0.1:9".to_string(),
        install_timeout: Duration::from_secs(5),
        download_max_attempts: 2,
        download_retry_backoff_base: Duration::from_millis(5),
    })
    .expect("registry");

    let buffer = Arc::new(EventsBuffer::new(Duration::from_secs(600)));
    let spawner = Arc::new(FakeRunnerSpawner::new());
    let (manager_tx, manager_rx) = mpsc::channel(256);
    let manager = GamesManager::new(
        GamesSettings {
            max_battles: 8,
            engine_start_port: 20000,
            engine_autohost_start_port: 22000,
            max_ports_used: 16,
            max_game_duration: Duration::from_secs(3600),
            engines_dir,
            instances_dir,
            engine_bind_ip: "0.0.0.0".to_string(),
            engine_settings: BTreeMap::new(),
        },
        spawner.clone(),
        manager_tx,
    );
    let service = AutohostService::new(
        manager.clone(),
        buffer.clone(),
        registry,
        HOSTING_IP.to_string(),
    );
    service.spawn_event_loops(manager_rx);

    Harness {
        service,
        manager,
        buffer,
        spawner,
        dir,
    }
}

pub fn player(user_id: &str, name: &str) -> PlayerDto {
    PlayerDto {
        user_id: user_id.to_string(),
        name: name.to_string(),
        password: format!("pw-{user_id}"),
    }
}

/// Two players (numbers 0 and 1) on opposing ally teams plus one spectator
/// (number 2).
pub fn start_request(battle_id: &str) -> StartRequest {
    StartRequest {
        battle_id: battle_id.to_string(),
        engine_version: ENGINE_VERSION.to_string(),
        game_name: "Game 1.0".to_string(),
        map_name: "Quicksilver".to_string(),
        start_pos_type: Some(2),
        ally_teams: vec![
            AllyTeamDto {
                teams: vec![TeamDto {
                    players: vec![player("u-alice", "Alice")],
                }],
            },
            AllyTeamDto {
                teams: vec![TeamDto {
                    players: vec![player("u-bob", "Bob")],
                }],
            },
        ],
        spectators: vec![player("u-carol", "Carol")],
        game_options: BTreeMap::new(),
        map_options: BTreeMap::new(),
    }
}

pub fn recording_sink() -> (UpdateSink, Arc<Mutex<Vec<BufferedEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_sink = seen.clone();
    let sink: UpdateSink = Box::new(move |event| {
        let seen = seen_in_sink.clone();
        Box::pin(async move {
            seen.lock().unwrap().push(event);
        })
    });
    (sink, seen)
}

/// Poll until `predicate` holds; panics after a couple of seconds.
pub async fn wait_for(mut predicate: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
