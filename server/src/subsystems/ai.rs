//! Monster decision making.
//!
//! Decisions are taken once per world second rather than every tick: one for
//! the idle monster groups of each live map, plus one per battle on that map
//! for the monster side's turn.

use async_trait::async_trait;
use log::{debug, info};
use shared::StatisticKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{AiManager, CombatManager, Dependency, MapManager};
use crate::error::SubsystemError;
use crate::world_state::WorldState;

pub struct LocalAiManager {
    world: Arc<WorldState>,
    maps: Dependency<dyn MapManager>,
    combat: Dependency<dyn CombatManager>,
    /// Ticks between two decision rounds.
    decision_period: u64,
    ticks: AtomicU64,
    decisions: AtomicU64,
}

impl LocalAiManager {
    pub fn new(world: Arc<WorldState>, tick_rate: u32) -> Self {
        Self {
            world,
            maps: Dependency::new("AiManager"),
            combat: Dependency::new("AiManager"),
            decision_period: u64::from(tick_rate.max(1)),
            ticks: AtomicU64::new(0),
            decisions: AtomicU64::new(0),
        }
    }

    /// Decisions taken since the last initialize.
    pub fn total_decisions(&self) -> u64 {
        self.decisions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AiManager for LocalAiManager {
    async fn initialize(
        &self,
        maps: Arc<dyn MapManager>,
        combat: Arc<dyn CombatManager>,
    ) -> Result<(), SubsystemError> {
        self.maps.set(maps).await;
        self.combat.set(combat).await;
        self.ticks.store(0, Ordering::Relaxed);
        self.decisions.store(0, Ordering::Relaxed);
        info!(
            "AI manager initialized (decision round every {} ticks)",
            self.decision_period
        );
        Ok(())
    }

    async fn update(&self) -> Result<(), SubsystemError> {
        let maps = self.maps.get().await?;
        let combat = self.combat.get().await?;

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if tick % self.decision_period != 0 {
            return Ok(());
        }

        let mut decisions = 0;
        for map_id in maps.active_map_ids().await {
            decisions += 1 + combat.battle_count_on_map(map_id).await as u64;
        }

        if decisions > 0 {
            self.decisions.fetch_add(decisions, Ordering::Relaxed);
            self.world
                .increment_statistic(StatisticKind::TotalAiDecisions, decisions as i64)
                .await;
            debug!("AI round at tick {}: {} decisions", tick, decisions);
        }
        Ok(())
    }

    async fn save_all(&self) -> Result<(), SubsystemError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), SubsystemError> {
        self.maps.clear().await;
        self.combat.clear().await;
        info!(
            "AI manager cleaned up after {} decisions",
            self.total_decisions()
        );
        Ok(())
    }
}
