//! Performance benchmarks for critical server paths
//!
//! Bounds are generous: these catch accidental quadratic behavior, not
//! small regressions.

use isoworld_server::config::ServerConfig;
use isoworld_server::events::EventBus;
use isoworld_server::game_server::GameServer;
use isoworld_server::player_manager::PlayerManager;
use isoworld_server::store::{KeyValueStore, MemoryStore};
use isoworld_server::world_state::WorldState;
use shared::{CharacterSnapshot, Characteristics, Priority, StatsUpdate};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn character(id: u64) -> CharacterSnapshot {
    CharacterSnapshot {
        id,
        user_id: id,
        map_id: Some((id % 50) as u32),
        cell_id: Some((id % 560) as u32),
        level: Some((id % 200) as u32 + 1),
        characteristics: Characteristics {
            vitality: 100,
            wisdom: 50,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn populated_registry(count: u64) -> Arc<PlayerManager> {
    let players = Arc::new(PlayerManager::new(
        Arc::new(MemoryStore::new()),
        EventBus::default(),
    ));
    for id in 0..count {
        players
            .add_player(&format!("player-{}", id), &character(id), "bench")
            .await
            .unwrap();
    }
    players
}

/// Benchmarks session registration including persistence
#[tokio::test]
async fn benchmark_session_registration() {
    let iterations = 1_000;
    let start = Instant::now();

    let players = populated_registry(iterations).await;

    let duration = start.elapsed();
    println!(
        "Session registration: {} sessions in {:?} ({:.2} μs/session)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(players.get_online_count().await, iterations as usize);
    assert!(duration.as_secs() < 5);
}

/// Benchmarks position and stats updates on a populated registry
#[tokio::test]
async fn benchmark_session_updates() {
    let players = populated_registry(1_000).await;

    let iterations = 10_000u64;
    let start = Instant::now();

    for i in 0..iterations {
        let player_id = format!("player-{}", i % 1_000);
        players
            .update_player_position(&player_id, (i % 50) as u32, (i % 560) as u32)
            .await;
        let update = StatsUpdate {
            hp: Some((i % 100) as i32),
            ..Default::default()
        };
        players.update_player_stats(&player_id, &update).await;
    }

    let duration = start.elapsed();
    println!(
        "Session updates: {} update pairs in {:?} ({:.2} μs/pair)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 10);
}

/// Benchmarks registry statistics with many players online
#[tokio::test]
async fn benchmark_registry_statistics() {
    let players = populated_registry(1_000).await;

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let stats = players.get_statistics().await;
        assert_eq!(stats.online_count, 1_000);
    }

    let duration = start.elapsed();
    println!(
        "Registry statistics: {} queries in {:?} ({:.2} μs/query)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks a full game tick with 1 000 players on the local collaborators
#[tokio::test]
async fn benchmark_game_tick() {
    let config = ServerConfig {
        port: 0,
        tick_rate: 20,
        save_interval: Duration::from_secs(3600),
        install_signal_handlers: false,
        ..Default::default()
    };
    let server = Arc::new(GameServer::with_local_subsystems(
        config,
        Arc::new(MemoryStore::new()),
    ));
    server.start().await.unwrap();

    for id in 0..1_000 {
        server
            .players()
            .add_player(&format!("player-{}", id), &character(id), "bench")
            .await
            .unwrap();
    }

    let iterations = 200;
    let start = Instant::now();

    for _ in 0..iterations {
        server.game_tick().await;
    }

    let duration = start.elapsed();
    let per_tick = duration / iterations;
    println!(
        "Game tick: {} ticks with 1000 players in {:?} ({:?}/tick)",
        iterations, duration, per_tick
    );

    let metrics = server.get_metrics().await;
    assert_eq!(metrics.online_players, 1_000);
    assert_eq!(metrics.active_map_instances, 50);

    // Must fit comfortably inside the 50ms tick budget
    assert!(per_tick < Duration::from_millis(50));

    server.stop().await;
}

/// Benchmarks a paginated prefix scan over a large keyspace
#[tokio::test]
async fn benchmark_store_scan() {
    let store = MemoryStore::new();
    for i in 0..10_000 {
        let prefix = if i % 2 == 0 { "player:" } else { "cache:" };
        store
            .set(&format!("{}{:05}", prefix, i), "{}")
            .await
            .unwrap();
    }

    let start = Instant::now();
    let mut cursor = 0;
    let mut found = 0;
    loop {
        let (next, keys) = store.scan(cursor, "player:", 100).await.unwrap();
        found += keys.len();
        if next == 0 {
            break;
        }
        cursor = next;
    }

    let duration = start.elapsed();
    println!("Store scan: {} keys in {:?}", found, duration);

    assert_eq!(found, 5_000);
    assert!(duration.as_secs() < 5);
}

/// Benchmarks announcement reads with a long announcement list
#[tokio::test]
async fn benchmark_announcements() {
    let world = WorldState::new(Arc::new(MemoryStore::new()), EventBus::default());
    let priorities = [Priority::Low, Priority::Medium, Priority::High];
    for i in 0..500 {
        world
            .add_announcement(format!("notice {}", i), priorities[i % 3], 60_000)
            .await;
    }

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let list = world.get_announcements().await;
        assert_eq!(list.len(), 500);
    }

    let duration = start.elapsed();
    println!(
        "Announcements: {} sorted reads in {:?} ({:.2} μs/read)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 10);
}
