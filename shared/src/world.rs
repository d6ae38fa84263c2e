use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

use crate::{DAY_END_HOUR, DAY_START_HOUR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: String,
    pub message: String,
    pub priority: Priority,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Announcement {
    pub fn is_visible(&self, now: u64) -> bool {
        self.expires_at > now
    }

    /// Display order: priority descending, then most recent first.
    pub fn display_order(a: &Announcement, b: &Announcement) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.created_at.cmp(&a.created_at))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weather {
    Clear,
    Cloudy,
    Rain,
    Storm,
    Fog,
}

impl Weather {
    pub const ALL: [Weather; 5] = [
        Weather::Clear,
        Weather::Cloudy,
        Weather::Rain,
        Weather::Storm,
        Weather::Fog,
    ];
}

impl Default for Weather {
    fn default() -> Self {
        Weather::Clear
    }
}

impl fmt::Display for Weather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Weather::Clear => "clear",
            Weather::Cloudy => "cloudy",
            Weather::Rain => "rain",
            Weather::Storm => "storm",
            Weather::Fog => "fog",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayNightCycle {
    Day,
    Night,
}

impl DayNightCycle {
    pub fn from_hour(hour: u32) -> Self {
        if (DAY_START_HOUR..=DAY_END_HOUR).contains(&hour) {
            DayNightCycle::Day
        } else {
            DayNightCycle::Night
        }
    }
}

impl Default for DayNightCycle {
    fn default() -> Self {
        DayNightCycle::Day
    }
}

impl fmt::Display for DayNightCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayNightCycle::Day => f.write_str("day"),
            DayNightCycle::Night => f.write_str("night"),
        }
    }
}

/// Names of the aggregate counters kept by the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatisticKind {
    TotalPlayers,
    TotalBattles,
    TotalMessages,
    TotalMovements,
    #[serde(rename = "totalAIDecisions")]
    TotalAiDecisions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldStatistics {
    pub server_start_time: u64,
    #[serde(default)]
    pub total_players: i64,
    #[serde(default)]
    pub total_battles: i64,
    #[serde(default)]
    pub total_messages: i64,
    #[serde(default)]
    pub total_movements: i64,
    #[serde(default, rename = "totalAIDecisions")]
    pub total_ai_decisions: i64,
}

impl WorldStatistics {
    pub fn new(server_start_time: u64) -> Self {
        Self {
            server_start_time,
            ..Default::default()
        }
    }

    fn counter_mut(&mut self, kind: StatisticKind) -> &mut i64 {
        match kind {
            StatisticKind::TotalPlayers => &mut self.total_players,
            StatisticKind::TotalBattles => &mut self.total_battles,
            StatisticKind::TotalMessages => &mut self.total_messages,
            StatisticKind::TotalMovements => &mut self.total_movements,
            StatisticKind::TotalAiDecisions => &mut self.total_ai_decisions,
        }
    }

    pub fn increment(&mut self, kind: StatisticKind, delta: i64) {
        let counter = self.counter_mut(kind);
        *counter = counter.saturating_add(delta);
    }
}

/// A running server-wide event: caller data plus the injected `startedAt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalEvent {
    #[serde(flatten)]
    pub data: Map<String, Value>,
    pub started_at: u64,
}

impl GlobalEvent {
    pub fn new(mut data: Map<String, Value>, started_at: u64) -> Self {
        data.remove("startedAt");
        Self { data, started_at }
    }
}

/// Record persisted under `cache:world_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldSnapshot {
    pub statistics: WorldStatistics,
    #[serde(default)]
    pub announcements: Vec<Announcement>,
    pub server_time: u64,
    pub day_night_cycle: DayNightCycle,
    pub weather_state: Weather,
    pub saved_at: u64,
}

/// Read-only summary of the world for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldInfo {
    pub server_time: u64,
    pub uptime: u64,
    pub day_night_cycle: DayNightCycle,
    pub weather: Weather,
    pub active_events: usize,
    pub active_announcements: usize,
    pub statistics: WorldStatistics,
}
