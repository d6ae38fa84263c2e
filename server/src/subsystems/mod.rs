//! Collaborator subsystems driven by the game server.
//!
//! Each collaborator is a trait object so the orchestrator can run against
//! the bundled local implementations or anything else with the same surface.
//! Per-tick methods only touch in-memory state (or hand work to a spawned
//! task) because the tick awaits them in a fixed order.

pub mod ai;
pub mod combat;
pub mod map;
pub mod movement;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::SubsystemError;
use crate::game_server::CoreServices;

pub use ai::LocalAiManager;
pub use combat::{Battle, LocalCombatManager};
pub use map::LocalMapManager;
pub use movement::{LocalMovementManager, MoveRequest};

/// Live map instances.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MapManager: Send + Sync {
    async fn initialize(&self) -> Result<(), SubsystemError>;

    /// Per-tick entry point.
    async fn update_all(&self) -> Result<(), SubsystemError>;

    async fn save_all(&self) -> Result<(), SubsystemError>;

    async fn cleanup(&self) -> Result<(), SubsystemError>;

    async fn active_instance_count(&self) -> usize;

    async fn active_map_ids(&self) -> Vec<u32>;

    async fn has_instance(&self, map_id: u32) -> bool;

    fn is_valid_cell(&self, map_id: u32, cell_id: u32) -> bool;
}

/// Turn-based battles. Needs an initialized map manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CombatManager: Send + Sync {
    async fn initialize(&self, maps: Arc<dyn MapManager>) -> Result<(), SubsystemError>;

    /// Per-tick entry point.
    async fn update_battles(&self) -> Result<(), SubsystemError>;

    async fn save_all(&self) -> Result<(), SubsystemError>;

    async fn cleanup(&self) -> Result<(), SubsystemError>;

    async fn active_battle_count(&self) -> usize;

    async fn battle_count_on_map(&self, map_id: u32) -> usize;
}

/// Queued player movement. Needs an initialized map manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MovementManager: Send + Sync {
    async fn initialize(&self, maps: Arc<dyn MapManager>) -> Result<(), SubsystemError>;

    /// Per-tick entry point.
    async fn process_queue(&self) -> Result<(), SubsystemError>;

    async fn save_all(&self) -> Result<(), SubsystemError>;

    async fn cleanup(&self) -> Result<(), SubsystemError>;
}

/// Monster decisions. Needs initialized map and combat managers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AiManager: Send + Sync {
    async fn initialize(
        &self,
        maps: Arc<dyn MapManager>,
        combat: Arc<dyn CombatManager>,
    ) -> Result<(), SubsystemError>;

    /// Per-tick entry point.
    async fn update(&self) -> Result<(), SubsystemError>;

    async fn save_all(&self) -> Result<(), SubsystemError>;

    async fn cleanup(&self) -> Result<(), SubsystemError>;
}

/// The four collaborators handed to the game server.
#[derive(Clone)]
pub struct Subsystems {
    pub maps: Arc<dyn MapManager>,
    pub combat: Arc<dyn CombatManager>,
    pub movement: Arc<dyn MovementManager>,
    pub ai: Arc<dyn AiManager>,
}

impl Subsystems {
    /// Wires the bundled in-process collaborators around the core services.
    pub fn local(core: &CoreServices, tick_rate: u32) -> Self {
        Self {
            maps: Arc::new(LocalMapManager::new(Arc::clone(&core.players))),
            combat: Arc::new(LocalCombatManager::new(
                Arc::clone(&core.players),
                Arc::clone(&core.world),
                core.events.clone(),
            )),
            movement: Arc::new(LocalMovementManager::new(
                Arc::clone(&core.players),
                Arc::clone(&core.world),
            )),
            ai: Arc::new(LocalAiManager::new(Arc::clone(&core.world), tick_rate)),
        }
    }
}

/// A dependency handed over by `initialize`, cleared again by `cleanup`.
pub(crate) struct Dependency<T: ?Sized> {
    owner: &'static str,
    slot: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> Dependency<T> {
    pub(crate) fn new(owner: &'static str) -> Self {
        Self {
            owner,
            slot: RwLock::new(None),
        }
    }

    pub(crate) async fn set(&self, value: Arc<T>) {
        *self.slot.write().await = Some(value);
    }

    pub(crate) async fn clear(&self) {
        self.slot.write().await.take();
    }

    pub(crate) async fn get(&self) -> Result<Arc<T>, SubsystemError> {
        self.slot
            .read()
            .await
            .clone()
            .ok_or(SubsystemError::NotInitialized(self.owner))
    }

    pub(crate) async fn is_set(&self) -> bool {
        self.slot.read().await.is_some()
    }
}
