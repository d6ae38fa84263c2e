use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{DEFAULT_START_CELL_ID, DEFAULT_START_MAP_ID};

/// Maximum hit points: `50 + level * 5 + vitality`, clamped to the `i32` range.
pub fn max_hp(level: u32, vitality: i32) -> i32 {
    let hp = 50 + i64::from(level) * 5 + i64::from(vitality);
    hp.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Maximum movement points: `3 + floor(wisdom / 10)`.
pub fn max_mp(wisdom: i32) -> i32 {
    3 + wisdom.div_euclid(10)
}

/// Maximum action points: `6 + floor(wisdom / 100)`.
pub fn max_ap(wisdom: i32) -> i32 {
    6 + wisdom.div_euclid(100)
}

/// The six base characteristics of a character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Characteristics {
    pub vitality: i32,
    pub wisdom: i32,
    pub strength: i32,
    pub intelligence: i32,
    pub chance: i32,
    pub agility: i32,
}

/// Persistent character data handed over when a player enters the world.
///
/// Anything missing falls back to the defaults applied by the session
/// registry: start map and cell, level 1, zeroed characteristics, full hp/mp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterSnapshot {
    pub id: u64,
    pub user_id: u64,
    pub class_id: u32,
    pub map_id: Option<u32>,
    pub cell_id: Option<u32>,
    pub level: Option<u32>,
    pub characteristics: Characteristics,
    pub current_hp: Option<i32>,
    pub current_mp: Option<i32>,
}

/// Base characteristics plus the derived pools, as carried by a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombatStats {
    pub vitality: i32,
    pub wisdom: i32,
    pub strength: i32,
    pub intelligence: i32,
    pub chance: i32,
    pub agility: i32,
    pub hp: i32,
    pub max_hp: i32,
    pub mp: i32,
    pub max_mp: i32,
    pub ap: i32,
    pub max_ap: i32,
}

impl CombatStats {
    /// Derives the pools from level and characteristics. Current hp/mp come
    /// from the snapshot when known, otherwise they start full.
    pub fn derive(
        level: u32,
        base: &Characteristics,
        current_hp: Option<i32>,
        current_mp: Option<i32>,
    ) -> Self {
        let max_hp = max_hp(level, base.vitality);
        let max_mp = max_mp(base.wisdom);
        let max_ap = max_ap(base.wisdom);

        Self {
            vitality: base.vitality,
            wisdom: base.wisdom,
            strength: base.strength,
            intelligence: base.intelligence,
            chance: base.chance,
            agility: base.agility,
            hp: current_hp.unwrap_or(max_hp),
            max_hp,
            mp: current_mp.unwrap_or(max_mp),
            max_mp,
            ap: max_ap,
            max_ap,
        }
    }
}

/// Partial stats change. `None` fields leave the current value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vitality: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wisdom: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intelligence: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chance: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agility: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_mp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ap: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ap: Option<i32>,
}

impl StatsUpdate {
    /// Shallow merge into `stats`.
    pub fn apply(&self, stats: &mut CombatStats) {
        let fields = [
            (self.vitality, &mut stats.vitality),
            (self.wisdom, &mut stats.wisdom),
            (self.strength, &mut stats.strength),
            (self.intelligence, &mut stats.intelligence),
            (self.chance, &mut stats.chance),
            (self.agility, &mut stats.agility),
            (self.hp, &mut stats.hp),
            (self.max_hp, &mut stats.max_hp),
            (self.mp, &mut stats.mp),
            (self.max_mp, &mut stats.max_mp),
            (self.ap, &mut stats.ap),
            (self.max_ap, &mut stats.max_ap),
        ];
        for (value, slot) in fields {
            if let Some(value) = value {
                *slot = value;
            }
        }
    }
}

/// Live record of one connected player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSession {
    pub player_id: String,
    pub character_id: u64,
    pub user_id: u64,
    /// Opaque handle owned by the transport layer.
    pub socket_id: String,
    pub map_id: u32,
    pub cell_id: u32,
    pub level: u32,
    pub class_id: u32,
    pub stats: CombatStats,
    pub connected_at: u64,
    pub last_activity: u64,
    pub is_in_combat: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_battle_id: Option<String>,
}

impl PlayerSession {
    /// Builds a fresh session from a character snapshot, applying defaults.
    pub fn from_snapshot(
        player_id: &str,
        character: &CharacterSnapshot,
        socket_id: &str,
        now: u64,
    ) -> Self {
        let level = character.level.unwrap_or(1);
        Self {
            player_id: player_id.to_string(),
            character_id: character.id,
            user_id: character.user_id,
            socket_id: socket_id.to_string(),
            map_id: character.map_id.unwrap_or(DEFAULT_START_MAP_ID),
            cell_id: character.cell_id.unwrap_or(DEFAULT_START_CELL_ID),
            level,
            class_id: character.class_id,
            stats: CombatStats::derive(
                level,
                &character.characteristics,
                character.current_hp,
                character.current_mp,
            ),
            connected_at: now,
            last_activity: now,
            is_in_combat: false,
            current_battle_id: None,
        }
    }

    /// True when the session is young and active enough to be re-admitted.
    pub fn is_recoverable(&self, now: u64, max_age_ms: u64, max_idle_ms: u64) -> bool {
        now.saturating_sub(self.connected_at) < max_age_ms
            && now.saturating_sub(self.last_activity) < max_idle_ms
    }
}

/// Aggregate view over every online session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatistics {
    pub online_count: usize,
    pub map_population: BTreeMap<u32, usize>,
    pub in_combat_count: usize,
    pub average_level: f64,
}
