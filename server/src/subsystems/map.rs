//! Map instances derived from where players actually are.
//!
//! An instance is opened the first tick a map has a player on it and closed
//! once it has been empty for the idle grace period, so a player hopping
//! between two maps does not churn instances.

use async_trait::async_trait;
use log::{debug, info};
use shared::MAP_CELL_COUNT;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::MapManager;
use crate::error::SubsystemError;
use crate::player_manager::PlayerManager;
use crate::utils::get_timestamp;

pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInstance {
    pub map_id: u32,
    pub opened_at: u64,
    pub population: usize,
    /// Last time the instance had at least one player.
    pub last_populated: u64,
}

pub struct LocalMapManager {
    players: Arc<PlayerManager>,
    idle_grace_ms: u64,
    instances: RwLock<HashMap<u32, MapInstance>>,
    initialized: AtomicBool,
}

impl LocalMapManager {
    pub fn new(players: Arc<PlayerManager>) -> Self {
        Self::with_idle_grace(players, DEFAULT_IDLE_GRACE)
    }

    pub fn with_idle_grace(players: Arc<PlayerManager>, idle_grace: Duration) -> Self {
        Self {
            players,
            idle_grace_ms: idle_grace.as_millis() as u64,
            instances: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub async fn instance(&self, map_id: u32) -> Option<MapInstance> {
        self.instances.read().await.get(&map_id).cloned()
    }

    /// Syncs instances with the given per-map population at time `now`.
    async fn sync_at(&self, population: &HashMap<u32, usize>, now: u64) {
        let mut instances = self.instances.write().await;

        for (&map_id, &count) in population {
            let instance = instances.entry(map_id).or_insert_with(|| {
                info!("Map instance opened: map={}", map_id);
                MapInstance {
                    map_id,
                    opened_at: now,
                    population: 0,
                    last_populated: now,
                }
            });
            instance.population = count;
            instance.last_populated = now;
        }

        let grace = self.idle_grace_ms;
        instances.retain(|map_id, instance| {
            if population.contains_key(map_id) {
                return true;
            }
            instance.population = 0;
            let keep = now.saturating_sub(instance.last_populated) < grace;
            if !keep {
                info!("Map instance closed: map={}", map_id);
            }
            keep
        });
    }
}

#[async_trait]
impl MapManager for LocalMapManager {
    async fn initialize(&self) -> Result<(), SubsystemError> {
        self.instances.write().await.clear();
        self.initialized.store(true, Ordering::SeqCst);
        info!("Map manager initialized ({} cells per map)", MAP_CELL_COUNT);
        Ok(())
    }

    async fn update_all(&self) -> Result<(), SubsystemError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(SubsystemError::NotInitialized("MapManager"));
        }

        let population: HashMap<u32, usize> = self
            .players
            .get_statistics()
            .await
            .map_population
            .into_iter()
            .collect();
        self.sync_at(&population, get_timestamp()).await;
        Ok(())
    }

    async fn save_all(&self) -> Result<(), SubsystemError> {
        // Instances are rebuilt from player positions, nothing to persist.
        debug!(
            "Map manager save: {} active instances",
            self.instances.read().await.len()
        );
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), SubsystemError> {
        self.initialized.store(false, Ordering::SeqCst);
        let closed = {
            let mut instances = self.instances.write().await;
            let closed = instances.len();
            instances.clear();
            closed
        };
        info!("Map manager cleaned up, closed {} instances", closed);
        Ok(())
    }

    async fn active_instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    async fn active_map_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.instances.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    async fn has_instance(&self, map_id: u32) -> bool {
        self.instances.read().await.contains_key(&map_id)
    }

    fn is_valid_cell(&self, _map_id: u32, cell_id: u32) -> bool {
        cell_id < MAP_CELL_COUNT
    }
}
