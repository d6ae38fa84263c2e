//! Queued player movement.
//!
//! The transport layer enqueues move requests; each tick drains a bounded
//! batch, drops moves to cells that do not exist and applies the rest in a
//! spawned task so the tick never waits on session persistence. Batches are
//! chained so two batches never apply out of order.

use async_trait::async_trait;
use log::{debug, info, warn};
use shared::StatisticKind;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{Dependency, MapManager, MovementManager};
use crate::error::SubsystemError;
use crate::player_manager::PlayerManager;
use crate::world_state::WorldState;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
/// Moves applied per tick at most.
pub const DEFAULT_MOVES_PER_TICK: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub player_id: String,
    pub map_id: u32,
    pub cell_id: u32,
}

pub struct LocalMovementManager {
    players: Arc<PlayerManager>,
    world: Arc<WorldState>,
    maps: Dependency<dyn MapManager>,
    sender: mpsc::Sender<MoveRequest>,
    receiver: Mutex<mpsc::Receiver<MoveRequest>>,
    moves_per_tick: usize,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl LocalMovementManager {
    pub fn new(players: Arc<PlayerManager>, world: Arc<WorldState>) -> Self {
        Self::with_limits(players, world, DEFAULT_QUEUE_CAPACITY, DEFAULT_MOVES_PER_TICK)
    }

    pub fn with_limits(
        players: Arc<PlayerManager>,
        world: Arc<WorldState>,
        queue_capacity: usize,
        moves_per_tick: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        Self {
            players,
            world,
            maps: Dependency::new("MovementManager"),
            sender,
            receiver: Mutex::new(receiver),
            moves_per_tick: moves_per_tick.max(1),
            in_flight: Mutex::new(None),
        }
    }

    /// Enqueues a move without waiting; a full queue is reported, not awaited.
    pub fn request_move(&self, request: MoveRequest) -> Result<(), SubsystemError> {
        self.sender.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => SubsystemError::QueueFull("MovementManager"),
            TrySendError::Closed(_) => {
                SubsystemError::failed("MovementManager", "move queue closed")
            }
        })
    }

    /// Waits for the batch currently being applied, if any.
    pub async fn flush(&self) {
        let handle = self.in_flight.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Movement batch task failed: {}", e);
            }
        }
    }

    async fn apply_batch(
        players: Arc<PlayerManager>,
        world: Arc<WorldState>,
        batch: Vec<MoveRequest>,
    ) {
        let mut applied = 0;
        for request in &batch {
            if players
                .update_player_position(&request.player_id, request.map_id, request.cell_id)
                .await
            {
                applied += 1;
            }
        }
        if applied > 0 {
            world
                .increment_statistic(StatisticKind::TotalMovements, applied)
                .await;
        }
        debug!("Applied {} of {} moves", applied, batch.len());
    }
}

#[async_trait]
impl MovementManager for LocalMovementManager {
    async fn initialize(&self, maps: Arc<dyn MapManager>) -> Result<(), SubsystemError> {
        self.maps.set(maps).await;
        info!("Movement manager initialized");
        Ok(())
    }

    async fn process_queue(&self) -> Result<(), SubsystemError> {
        let maps = self.maps.get().await?;

        let mut batch = Vec::new();
        let mut rejected = 0;
        {
            let mut receiver = self.receiver.lock().await;
            while batch.len() + rejected < self.moves_per_tick {
                let Ok(request) = receiver.try_recv() else {
                    break;
                };
                if maps.is_valid_cell(request.map_id, request.cell_id) {
                    batch.push(request);
                } else {
                    rejected += 1;
                }
            }
        }

        if rejected > 0 {
            warn!("Dropped {} moves to invalid cells", rejected);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut in_flight = self.in_flight.lock().await;
        let previous = in_flight.take();
        let players = Arc::clone(&self.players);
        let world = Arc::clone(&self.world);
        *in_flight = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            Self::apply_batch(players, world, batch).await;
        }));
        Ok(())
    }

    async fn save_all(&self) -> Result<(), SubsystemError> {
        self.flush().await;
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), SubsystemError> {
        self.flush().await;

        let mut dropped = 0;
        {
            let mut receiver = self.receiver.lock().await;
            while receiver.try_recv().is_ok() {
                dropped += 1;
            }
        }
        self.maps.clear().await;
        info!("Movement manager cleaned up, dropped {} queued moves", dropped);
        Ok(())
    }
}
