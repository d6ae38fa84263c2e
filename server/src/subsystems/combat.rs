//! Turn-based battles between players on a live map instance.

use async_trait::async_trait;
use log::{debug, info, warn};
use shared::StatisticKind;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{CombatManager, Dependency, MapManager};
use crate::error::SubsystemError;
use crate::events::{EventBus, GameEvent};
use crate::player_manager::PlayerManager;
use crate::utils::{get_timestamp, random_suffix};
use crate::world_state::WorldState;

pub const DEFAULT_TURN_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Battle {
    pub id: String,
    pub map_id: u32,
    /// Player ids in turn order.
    pub fighters: Vec<String>,
    pub turn: u32,
    pub active_fighter: usize,
    pub started_at: u64,
    pub turn_started_at: u64,
}

pub struct LocalCombatManager {
    players: Arc<PlayerManager>,
    world: Arc<WorldState>,
    events: EventBus,
    maps: Dependency<dyn MapManager>,
    battles: RwLock<HashMap<String, Battle>>,
    turn_duration_ms: u64,
}

impl LocalCombatManager {
    pub fn new(players: Arc<PlayerManager>, world: Arc<WorldState>, events: EventBus) -> Self {
        Self::with_turn_duration(players, world, events, DEFAULT_TURN_DURATION)
    }

    pub fn with_turn_duration(
        players: Arc<PlayerManager>,
        world: Arc<WorldState>,
        events: EventBus,
        turn_duration: Duration,
    ) -> Self {
        Self {
            players,
            world,
            events,
            maps: Dependency::new("CombatManager"),
            battles: RwLock::new(HashMap::new()),
            turn_duration_ms: turn_duration.as_millis() as u64,
        }
    }

    /// Starts a battle between players standing on `map_id`.
    ///
    /// Every fighter must be online, on that map and not already fighting,
    /// and the map must have a live instance. Fighters are checked and
    /// flagged under the battle table lock, so a player never joins two
    /// battles.
    pub async fn start_battle(
        &self,
        map_id: u32,
        fighters: &[String],
    ) -> Result<String, SubsystemError> {
        let maps = self.maps.get().await?;
        if !maps.has_instance(map_id).await {
            return Err(SubsystemError::failed(
                "CombatManager",
                format!("no instance for map {}", map_id),
            ));
        }
        if fighters.is_empty() {
            return Err(SubsystemError::failed("CombatManager", "battle without fighters"));
        }

        let mut battles = self.battles.write().await;
        for (index, player_id) in fighters.iter().enumerate() {
            if fighters[..index].contains(player_id) {
                return Err(SubsystemError::failed(
                    "CombatManager",
                    format!("player {} listed twice", player_id),
                ));
            }
            match self.players.get_player(player_id).await {
                Some(session) if session.map_id == map_id && !session.is_in_combat => {}
                Some(_) => {
                    return Err(SubsystemError::failed(
                        "CombatManager",
                        format!("player {} cannot fight on map {}", player_id, map_id),
                    ))
                }
                None => {
                    return Err(SubsystemError::failed(
                        "CombatManager",
                        format!("player {} is not online", player_id),
                    ))
                }
            }
        }

        let now = get_timestamp();
        let id = format!("battle_{}_{}", now, random_suffix(6));
        let battle = Battle {
            id: id.clone(),
            map_id,
            fighters: fighters.to_vec(),
            turn: 1,
            active_fighter: 0,
            started_at: now,
            turn_started_at: now,
        };
        battles.insert(id.clone(), battle);

        for player_id in fighters {
            self.players.set_player_in_combat(player_id, Some(&id)).await;
        }
        drop(battles);

        self.world
            .increment_statistic(StatisticKind::TotalBattles, 1)
            .await;

        info!(
            "Battle started: battle={} map={} fighters={}",
            id,
            map_id,
            fighters.len()
        );
        self.events.publish(GameEvent::BattleStarted {
            battle_id: id.clone(),
            map_id,
        });
        Ok(id)
    }

    /// Ends a battle and clears its fighters' combat flags.
    pub async fn end_battle(&self, battle_id: &str) -> bool {
        let Some(battle) = self.battles.write().await.remove(battle_id) else {
            return false;
        };

        for player_id in &battle.fighters {
            self.players.set_player_in_combat(player_id, None).await;
        }

        info!(
            "Battle ended: battle={} map={} turns={}",
            battle.id, battle.map_id, battle.turn
        );
        self.events.publish(GameEvent::BattleEnded {
            battle_id: battle.id,
            map_id: battle.map_id,
        });
        true
    }

    pub async fn get_battle(&self, battle_id: &str) -> Option<Battle> {
        self.battles.read().await.get(battle_id).cloned()
    }

    /// Advances expired turns at `now`; returns battles whose fighters are all gone.
    async fn advance_turns_at(&self, now: u64) -> Vec<String> {
        let mut battles = self.battles.write().await;
        let mut abandoned = Vec::new();

        for battle in battles.values_mut() {
            let mut online = 0;
            for player_id in &battle.fighters {
                if self.players.get_player(player_id).await.is_some() {
                    online += 1;
                }
            }
            if online == 0 {
                abandoned.push(battle.id.clone());
                continue;
            }

            if now.saturating_sub(battle.turn_started_at) >= self.turn_duration_ms {
                battle.active_fighter = (battle.active_fighter + 1) % battle.fighters.len();
                battle.turn += 1;
                battle.turn_started_at = now;
                debug!("Battle {} turn {}", battle.id, battle.turn);
            }
        }
        abandoned
    }
}

#[async_trait]
impl CombatManager for LocalCombatManager {
    async fn initialize(&self, maps: Arc<dyn MapManager>) -> Result<(), SubsystemError> {
        self.maps.set(maps).await;
        info!("Combat manager initialized");
        Ok(())
    }

    async fn update_battles(&self) -> Result<(), SubsystemError> {
        if !self.maps.is_set().await {
            return Err(SubsystemError::NotInitialized("CombatManager"));
        }

        for battle_id in self.advance_turns_at(get_timestamp()).await {
            warn!("Battle {} abandoned by all fighters", battle_id);
            self.end_battle(&battle_id).await;
        }
        Ok(())
    }

    async fn save_all(&self) -> Result<(), SubsystemError> {
        debug!(
            "Combat manager save: {} battles in progress",
            self.battles.read().await.len()
        );
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), SubsystemError> {
        let ids: Vec<String> = self.battles.read().await.keys().cloned().collect();
        for battle_id in &ids {
            self.end_battle(battle_id).await;
        }
        self.maps.clear().await;
        info!("Combat manager cleaned up, ended {} battles", ids.len());
        Ok(())
    }

    async fn active_battle_count(&self) -> usize {
        self.battles.read().await.len()
    }

    async fn battle_count_on_map(&self, map_id: u32) -> usize {
        self.battles
            .read()
            .await
            .values()
            .filter(|battle| battle.map_id == map_id)
            .count()
    }
}
