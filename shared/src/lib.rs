//! Data model shared by the game server core and anything that talks to it
//! (transport layer, tooling, tests).
//!
//! Every type here serializes to camelCase JSON, which is the format used for
//! the key-value store records (`player:<id>` and `cache:world_state`).

pub mod session;
pub mod world;

pub use session::{
    max_ap, max_hp, max_mp, CharacterSnapshot, Characteristics, CombatStats, PlayerSession,
    RegistryStatistics, StatsUpdate,
};
pub use world::{
    Announcement, DayNightCycle, GlobalEvent, Priority, StatisticKind, Weather, WorldInfo,
    WorldSnapshot, WorldStatistics,
};

/// Map a new character lands on when its snapshot carries no position.
pub const DEFAULT_START_MAP_ID: u32 = 7411;
pub const DEFAULT_START_CELL_ID: u32 = 311;
/// Number of cells on every map (cells are indexed `0..MAP_CELL_COUNT`).
pub const MAP_CELL_COUNT: u32 = 560;

pub const PLAYER_KEY_PREFIX: &str = "player:";
pub const WORLD_STATE_KEY: &str = "cache:world_state";

pub const SESSION_TTL_SECS: u64 = 86_400;
pub const WORLD_STATE_TTL_SECS: u64 = 3_600;

/// Sessions connected for longer than this are not re-admitted at boot.
pub const SESSION_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;
/// Sessions idle for longer than this are not re-admitted at boot.
pub const SESSION_MAX_IDLE_MS: u64 = 60 * 60 * 1000;

pub const DEFAULT_ANNOUNCEMENT_DURATION_MS: i64 = 5 * 60 * 1000;

/// First and last wall-clock hours (inclusive) counted as daytime.
pub const DAY_START_HOUR: u32 = 6;
pub const DAY_END_HOUR: u32 = 19;

/// Store key for a player session.
pub fn player_key(player_id: &str) -> String {
    format!("{}{}", PLAYER_KEY_PREFIX, player_id)
}
