//! # Game Server Core Library
//!
//! This library provides the authoritative core of the multiplayer game
//! backend. It owns the single source of truth for connected players and for
//! the global world, and runs the fixed-rate simulation loop that advances
//! them.
//!
//! ## Core Responsibilities
//!
//! ### Lifecycle
//! The server boots its subsystems in dependency order, arms a game tick
//! timer and a periodic save timer, and on shutdown saves, disconnects every
//! player and cleans subsystems up in reverse order. SIGINT, SIGTERM and
//! panics all go through the same graceful shutdown.
//!
//! ### Player Sessions
//! Every connected player has exactly one session, indexed by player id, by
//! map and by character. Every mutation is mirrored to the key-value store
//! with a 24 hour TTL so sessions survive a restart, and only recent, active
//! sessions are re-admitted at boot.
//!
//! ### World State
//! Server-wide state independent of any session: time of day, weather,
//! announcements, global events and aggregate statistics. The world runs on
//! its own one second clock and persists itself with a one hour TTL.
//!
//! ## Architecture Design
//!
//! ### Explicit Dependencies
//! Nothing is global. The store, the world and the session registry are
//! built once and handed to each collaborator that needs them.
//!
//! ### Fault Isolation
//! A subsystem error during a tick or a save is logged and the cycle moves
//! on. Only boot failures and session creation failures reach the caller.
//!
//! ### Events Instead of Callbacks
//! Components publish [`events::GameEvent`]s on a bounded broadcast channel.
//! The transport layer subscribes and forwards what its clients need.
//!
//! ## Module Organization
//!
//! ### Game Server Module (`game_server`)
//! Orchestrator: boot order, tick and save timers, shutdown, metrics.
//!
//! ### Player Manager Module (`player_manager`)
//! The session registry and its secondary indexes.
//!
//! ### World State Module (`world_state`)
//! Clock, day/night cycle, weather, announcements, events, statistics.
//!
//! ### Subsystems Module (`subsystems`)
//! Collaborator traits for maps, combat, movement and AI, plus lightweight
//! in-process implementations.
//!
//! ### Store Module (`store`)
//! The key-value store contract and the bundled in-memory backend with
//! optional JSON snapshot file.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use isoworld_server::config::ServerConfig;
//! use isoworld_server::game_server::GameServer;
//! use isoworld_server::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let store = Arc::new(MemoryStore::with_snapshot("world.json"));
//!     let server = Arc::new(GameServer::with_local_subsystems(config, store));
//!
//!     // Boots subsystems, binds the listener, arms tick and save timers
//!     // and installs the shutdown handlers
//!     server.start().await?;
//!
//!     if let Some(mut connections) = server.take_connections().await {
//!         while let Some((_stream, peer)) = connections.recv().await {
//!             println!("client connected from {}", peer);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod game_server;
pub mod player_manager;
pub mod store;
pub mod subsystems;
pub mod utils;
pub mod world_state;
