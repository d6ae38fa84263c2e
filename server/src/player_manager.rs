//! Player session registry for the game server
//!
//! This module owns every connected player's session record and is the only
//! place allowed to change one. It handles:
//! - Session creation from a character snapshot, with derived combat stats
//! - Secondary indexes by map and by character
//! - Position, stats, combat flag and activity updates
//! - Mirroring every mutation to the key-value store with a 24h TTL
//! - Re-admitting still-valid sessions from the store at boot
//!
//! Index updates happen under a single write lock so concurrent registrations
//! for different players never leave the indexes out of sync. Session writes
//! and deletes in the store are issued while that lock is held: a write for a
//! session can never land after the session was removed.

use log::{debug, info, warn};
use shared::{
    player_key, CharacterSnapshot, PlayerSession, RegistryStatistics, StatsUpdate,
    PLAYER_KEY_PREFIX, SESSION_MAX_AGE_MS, SESSION_MAX_IDLE_MS, SESSION_TTL_SECS,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{PlayerError, StoreError, SubsystemError};
use crate::events::{EventBus, GameEvent};
use crate::store::KeyValueStore;
use crate::utils::get_timestamp;

/// Keys requested per store scan round trip.
const SCAN_BATCH: usize = 100;

/// In-memory sessions plus the two secondary indexes.
///
/// Invariants: every session sits in exactly one map bucket (its `map_id`),
/// map buckets are never empty, and a character id maps to at most one
/// session.
#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<String, PlayerSession>,
    map_index: HashMap<u32, HashSet<String>>,
    character_index: HashMap<u64, String>,
}

impl Registry {
    /// Inserts a session, replacing any session with the same player id.
    ///
    /// Returns the session of another player that was bound to the same
    /// character, if one had to be evicted.
    fn insert(&mut self, session: PlayerSession) -> Option<PlayerSession> {
        self.remove(&session.player_id);

        let evicted = match self.character_index.get(&session.character_id) {
            Some(other) if *other != session.player_id => {
                let other = other.clone();
                self.remove(&other)
            }
            _ => None,
        };

        self.map_index
            .entry(session.map_id)
            .or_default()
            .insert(session.player_id.clone());
        self.character_index
            .insert(session.character_id, session.player_id.clone());
        self.sessions.insert(session.player_id.clone(), session);

        evicted
    }

    fn remove(&mut self, player_id: &str) -> Option<PlayerSession> {
        let session = self.sessions.remove(player_id)?;
        self.unindex_map(session.map_id, player_id);
        if self.character_index.get(&session.character_id).map(String::as_str) == Some(player_id)
        {
            self.character_index.remove(&session.character_id);
        }
        Some(session)
    }

    fn unindex_map(&mut self, map_id: u32, player_id: &str) {
        if let Some(bucket) = self.map_index.get_mut(&map_id) {
            bucket.remove(player_id);
            if bucket.is_empty() {
                self.map_index.remove(&map_id);
            }
        }
    }

    fn clear(&mut self) {
        self.sessions.clear();
        self.map_index.clear();
        self.character_index.clear();
    }
}

/// Single source of truth for connected-player state.
pub struct PlayerManager {
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    registry: RwLock<Registry>,
}

impl PlayerManager {
    pub fn new(store: Arc<dyn KeyValueStore>, events: EventBus) -> Self {
        Self {
            store,
            events,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Re-admits sessions persisted by a previous run
    ///
    /// Scans every `player:*` key and keeps only sessions connected for less
    /// than 24h and active within the last hour; the others are deleted from
    /// the store. A failing scan counts as zero recovered sessions, a single
    /// unreadable record is deleted and skipped. Returns the number of
    /// sessions re-admitted.
    pub async fn initialize(&self) -> usize {
        let keys = match self.scan_session_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Session recovery scan failed, recovered 0 sessions: {}", e);
                return 0;
            }
        };

        let now = get_timestamp();
        let mut recovered = 0;
        let mut expired = 0;

        for key in keys {
            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Could not read session {}: {}", key, e);
                    continue;
                }
            };

            let session = match serde_json::from_str::<PlayerSession>(&raw) {
                Ok(session)
                    if session.is_recoverable(now, SESSION_MAX_AGE_MS, SESSION_MAX_IDLE_MS) =>
                {
                    session
                }
                Ok(_) => {
                    expired += 1;
                    self.delete_key(&key).await;
                    continue;
                }
                Err(e) => {
                    warn!("Dropping unreadable session {}: {}", key, e);
                    self.delete_key(&key).await;
                    continue;
                }
            };

            let evicted = self.registry.write().await.insert(session);
            match evicted {
                Some(evicted) => {
                    warn!(
                        "Character {} recovered twice, dropping session {}",
                        evicted.character_id, evicted.player_id
                    );
                    self.delete_key(&player_key(&evicted.player_id)).await;
                }
                None => recovered += 1,
            }
        }

        info!(
            "Recovered {} player sessions ({} expired)",
            recovered, expired
        );
        recovered
    }

    async fn scan_session_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, batch) = self
                .store
                .scan(cursor, PLAYER_KEY_PREFIX, SCAN_BATCH)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn delete_key(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!("Could not delete {}: {}", key, e);
        }
    }

    async fn persist(&self, session: &PlayerSession) -> Result<(), PlayerError> {
        let json = serde_json::to_string(session).map_err(|source| PlayerError::Serialization {
            player_id: session.player_id.clone(),
            source,
        })?;
        self.store
            .set_with_ttl(
                &player_key(&session.player_id),
                &json,
                Duration::from_secs(SESSION_TTL_SECS),
            )
            .await
            .map_err(|source| PlayerError::Persist {
                player_id: session.player_id.clone(),
                source,
            })
    }

    // Mutations other than add_player degrade to a warning when the store fails.
    async fn persist_or_warn(&self, session: &PlayerSession) {
        if let Err(e) = self.persist(session).await {
            warn!("{}", e);
        }
    }

    /// Registers a player entering the world
    ///
    /// Builds the session from the character snapshot, persists it and
    /// indexes it. A persistence failure is returned and nothing is
    /// registered. If the character was already online under another player
    /// id, that older session is dropped.
    pub async fn add_player(
        &self,
        player_id: &str,
        character: &CharacterSnapshot,
        socket_id: &str,
    ) -> Result<PlayerSession, PlayerError> {
        let session = PlayerSession::from_snapshot(player_id, character, socket_id, get_timestamp());

        let evicted = {
            let mut registry = self.registry.write().await;
            self.persist(&session).await?;
            let evicted = registry.insert(session.clone());
            if let Some(evicted) = &evicted {
                self.delete_key(&player_key(&evicted.player_id)).await;
            }
            evicted
        };
        if let Some(evicted) = evicted {
            warn!(
                "Character {} already online as {}, replacing with {}",
                evicted.character_id, evicted.player_id, player_id
            );
            self.events.publish(GameEvent::PlayerLeft {
                player_id: evicted.player_id,
                map_id: evicted.map_id,
            });
        }

        info!(
            "Session created: player={} character={} user={} map={} cell={} level={}",
            session.player_id,
            session.character_id,
            session.user_id,
            session.map_id,
            session.cell_id,
            session.level
        );
        self.events.publish(GameEvent::PlayerJoined {
            player_id: session.player_id.clone(),
            map_id: session.map_id,
        });
        Ok(session)
    }

    /// Removes a player's session
    ///
    /// Returns false, without touching the store, if the player is unknown.
    pub async fn remove_player(&self, player_id: &str) -> bool {
        let session = {
            let mut registry = self.registry.write().await;
            let Some(session) = registry.remove(player_id) else {
                return false;
            };
            self.delete_key(&player_key(player_id)).await;
            session
        };

        info!(
            "Session removed: player={} character={} map={}",
            player_id, session.character_id, session.map_id
        );
        self.events.publish(GameEvent::PlayerLeft {
            player_id: player_id.to_string(),
            map_id: session.map_id,
        });
        true
    }

    /// Moves a player, re-bucketing it in the map index on map change
    pub async fn update_player_position(&self, player_id: &str, map_id: u32, cell_id: u32) -> bool {
        let from_map = {
            let mut registry = self.registry.write().await;
            let Some(session) = registry.sessions.get_mut(player_id) else {
                return false;
            };

            let from_map = session.map_id;
            session.map_id = map_id;
            session.cell_id = cell_id;
            session.last_activity = get_timestamp();
            let session = session.clone();

            if from_map != map_id {
                registry.unindex_map(from_map, player_id);
                registry
                    .map_index
                    .entry(map_id)
                    .or_default()
                    .insert(player_id.to_string());
            }
            self.persist_or_warn(&session).await;
            from_map
        };

        debug!(
            "Position updated: player={} map={} cell={}",
            player_id, map_id, cell_id
        );
        self.events.publish(GameEvent::PlayerMoved {
            player_id: player_id.to_string(),
            from_map,
            map_id,
            cell_id,
        });
        true
    }

    /// Shallow-merges `update` into the player's stats
    pub async fn update_player_stats(&self, player_id: &str, update: &StatsUpdate) -> bool {
        {
            let mut registry = self.registry.write().await;
            let Some(session) = registry.sessions.get_mut(player_id) else {
                return false;
            };
            update.apply(&mut session.stats);
            session.last_activity = get_timestamp();
            let session = session.clone();
            self.persist_or_warn(&session).await;
        }

        info!(
            "Stats updated: player={} delta={}",
            player_id,
            serde_json::to_string(update).unwrap_or_default()
        );
        true
    }

    /// Flags a player as fighting in `battle_id`, or clears the flag with `None`
    pub async fn set_player_in_combat(&self, player_id: &str, battle_id: Option<&str>) -> bool {
        let session = {
            let mut registry = self.registry.write().await;
            let Some(session) = registry.sessions.get_mut(player_id) else {
                return false;
            };
            session.is_in_combat = battle_id.is_some();
            session.current_battle_id = battle_id.map(str::to_string);
            session.last_activity = get_timestamp();
            let session = session.clone();
            self.persist_or_warn(&session).await;
            session
        };

        info!(
            "Combat state: player={} in_combat={} battle={}",
            player_id,
            session.is_in_combat,
            battle_id.unwrap_or("-")
        );
        self.events.publish(GameEvent::CombatStateChanged {
            player_id: player_id.to_string(),
            battle_id: session.current_battle_id,
        });
        true
    }

    pub async fn update_activity(&self, player_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        let Some(session) = registry.sessions.get_mut(player_id) else {
            return false;
        };
        session.last_activity = get_timestamp();
        let session = session.clone();
        self.persist_or_warn(&session).await;
        true
    }

    /// Re-persists every in-memory session
    ///
    /// Every session is attempted; the error reports how many failed.
    pub async fn save_all(&self) -> Result<(), SubsystemError> {
        let registry = self.registry.read().await;
        let total = registry.sessions.len();

        let mut failed = 0;
        for session in registry.sessions.values() {
            if let Err(e) = self.persist(session).await {
                warn!("{}", e);
                failed += 1;
            }
        }
        drop(registry);

        if failed > 0 {
            return Err(SubsystemError::failed(
                "PlayerManager",
                format!("{} of {} sessions not saved", failed, total),
            ));
        }
        debug!("Saved {} player sessions", total);
        Ok(())
    }

    /// Drops every session and its store key without persisting first
    pub async fn disconnect_all(&self) -> usize {
        let sessions: Vec<PlayerSession> = {
            let mut registry = self.registry.write().await;
            let sessions: Vec<PlayerSession> =
                registry.sessions.drain().map(|(_, s)| s).collect();
            registry.clear();
            for session in &sessions {
                self.delete_key(&player_key(&session.player_id)).await;
            }
            sessions
        };

        for session in &sessions {
            self.events.publish(GameEvent::PlayerLeft {
                player_id: session.player_id.clone(),
                map_id: session.map_id,
            });
        }

        info!("Disconnected {} players", sessions.len());
        sessions.len()
    }

    /// Saves every session, then clears all in-memory state
    pub async fn cleanup(&self) {
        if let Err(e) = self.save_all().await {
            warn!("Player save during cleanup failed: {}", e);
        }
        self.registry.write().await.clear();
        info!("Player manager cleaned up");
    }

    pub async fn get_player(&self, player_id: &str) -> Option<PlayerSession> {
        self.registry.read().await.sessions.get(player_id).cloned()
    }

    pub async fn get_player_by_character_id(&self, character_id: u64) -> Option<PlayerSession> {
        let registry = self.registry.read().await;
        registry
            .character_index
            .get(&character_id)
            .and_then(|player_id| registry.sessions.get(player_id))
            .cloned()
    }

    pub async fn get_players_in_map(&self, map_id: u32) -> Vec<PlayerSession> {
        let registry = self.registry.read().await;
        registry
            .map_index
            .get(&map_id)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|player_id| registry.sessions.get(player_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_online_count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    pub async fn get_map_population(&self, map_id: u32) -> usize {
        self.registry
            .read()
            .await
            .map_index
            .get(&map_id)
            .map_or(0, HashSet::len)
    }

    /// Map ids with at least one player on them.
    pub async fn get_populated_maps(&self) -> Vec<u32> {
        self.registry.read().await.map_index.keys().copied().collect()
    }

    pub async fn get_active_player_ids(&self) -> Vec<String> {
        self.registry.read().await.sessions.keys().cloned().collect()
    }

    pub async fn get_statistics(&self) -> RegistryStatistics {
        let registry = self.registry.read().await;
        let online_count = registry.sessions.len();
        let map_population: BTreeMap<u32, usize> = registry
            .map_index
            .iter()
            .map(|(map_id, bucket)| (*map_id, bucket.len()))
            .collect();
        let in_combat_count = registry
            .sessions
            .values()
            .filter(|s| s.is_in_combat)
            .count();
        let average_level = if online_count == 0 {
            0.0
        } else {
            registry.sessions.values().map(|s| s.level as f64).sum::<f64>() / online_count as f64
        };

        RegistryStatistics {
            online_count,
            map_population,
            in_combat_count,
            average_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockKeyValueStore};
    use assert_approx_eq::assert_approx_eq;
    use async_trait::async_trait;
    use shared::{Characteristics, DEFAULT_START_CELL_ID, DEFAULT_START_MAP_ID};

    fn character(id: u64, level: u32, map_id: u32) -> CharacterSnapshot {
        CharacterSnapshot {
            id,
            user_id: id * 10,
            level: Some(level),
            map_id: Some(map_id),
            cell_id: Some(100),
            ..Default::default()
        }
    }

    /// Memory store whose session writes take `write_delay` to land.
    struct SlowStore {
        inner: MemoryStore,
        write_delay: Duration,
    }

    #[async_trait]
    impl KeyValueStore for SlowStore {
        async fn connect(&self) -> Result<(), StoreError> {
            self.inner.connect().await
        }
        async fn disconnect(&self) -> Result<(), StoreError> {
            self.inner.disconnect().await
        }
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.set(key, value).await
        }
        async fn set_with_ttl(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            tokio::time::sleep(self.write_delay).await;
            self.inner.set_with_ttl(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }
        async fn scan(
            &self,
            cursor: u64,
            prefix: &str,
            count: usize,
        ) -> Result<(u64, Vec<String>), StoreError> {
            self.inner.scan(cursor, prefix, count).await
        }
        async fn incr_many_with_expiry(
            &self,
            increments: &[(String, i64)],
            ttl: Duration,
        ) -> Result<Vec<i64>, StoreError> {
            self.inner.incr_many_with_expiry(increments, ttl).await
        }
    }

    fn memory_manager() -> (Arc<MemoryStore>, PlayerManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = PlayerManager::new(store.clone(), EventBus::default());
        (store, manager)
    }

    async fn assert_indexes_consistent(manager: &PlayerManager) {
        let registry = manager.registry.read().await;
        let indexed: usize = registry.map_index.values().map(HashSet::len).sum();
        assert_eq!(indexed, registry.sessions.len());
        assert_eq!(registry.character_index.len(), registry.sessions.len());
        for (map_id, bucket) in &registry.map_index {
            assert!(!bucket.is_empty());
            for player_id in bucket {
                assert_eq!(registry.sessions[player_id].map_id, *map_id);
            }
        }
        for (character_id, player_id) in &registry.character_index {
            assert_eq!(registry.sessions[player_id].character_id, *character_id);
        }
    }

    #[tokio::test]
    async fn test_add_player_derives_stats() {
        let (store, manager) = memory_manager();
        let snapshot = CharacterSnapshot {
            id: 1,
            level: Some(25),
            characteristics: Characteristics {
                vitality: 100,
                wisdom: 50,
                ..Default::default()
            },
            ..Default::default()
        };

        let session = manager.add_player("p1", &snapshot, "sock-1").await.unwrap();
        assert_eq!(session.stats.max_hp, 275);
        assert_eq!(session.stats.max_mp, 8);
        assert_eq!(session.stats.max_ap, 6);
        assert_eq!(session.stats.hp, 275);
        assert_eq!(session.map_id, DEFAULT_START_MAP_ID);
        assert_eq!(session.cell_id, DEFAULT_START_CELL_ID);

        let raw = store.get("player:p1").await.unwrap().unwrap();
        let stored: PlayerSession = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, session);
    }

    #[tokio::test]
    async fn test_add_then_remove_leaves_nothing() {
        let (store, manager) = memory_manager();
        manager.add_player("p1", &character(1, 5, 10), "s").await.unwrap();
        assert!(manager.remove_player("p1").await);

        assert!(manager.get_player("p1").await.is_none());
        assert!(manager.get_player_by_character_id(1).await.is_none());
        assert!(manager.get_players_in_map(10).await.is_empty());
        assert_eq!(manager.get_map_population(10).await, 0);
        assert!(manager.get_populated_maps().await.is_empty());
        assert!(store.get("player:p1").await.unwrap().is_none());
        assert_indexes_consistent(&manager).await;
    }

    #[tokio::test]
    async fn test_remove_unknown_player_touches_nothing() {
        // No expectations: any store call panics.
        let store = MockKeyValueStore::new();
        let manager = PlayerManager::new(Arc::new(store), EventBus::default());
        assert!(!manager.remove_player("ghost").await);
    }

    #[tokio::test]
    async fn test_add_player_propagates_store_failure() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_set_with_ttl()
            .returning(|_, _, _| Err(StoreError::Connection("down".into())));
        let manager = PlayerManager::new(Arc::new(store), EventBus::default());

        let result = manager.add_player("p1", &character(1, 1, 1), "s").await;
        assert!(matches!(result, Err(PlayerError::Persist { .. })));
        assert_eq!(manager.get_online_count().await, 0);
    }

    #[tokio::test]
    async fn test_session_persisted_with_day_ttl() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_set_with_ttl()
            .withf(|key, _, ttl| key == "player:p1" && *ttl == Duration::from_secs(86_400))
            .times(2)
            .returning(|_, _, _| Ok(()));
        let manager = PlayerManager::new(Arc::new(store), EventBus::default());

        manager.add_player("p1", &character(1, 1, 1), "s").await.unwrap();
        assert!(manager.update_activity("p1").await);
    }

    #[tokio::test]
    async fn test_position_update_moves_between_buckets() {
        let (store, manager) = memory_manager();
        manager.add_player("p1", &character(1, 1, 10), "s").await.unwrap();
        manager.add_player("p2", &character(2, 1, 10), "s").await.unwrap();

        assert!(manager.update_player_position("p1", 20, 42).await);
        assert_eq!(manager.get_map_population(10).await, 1);
        assert_eq!(manager.get_map_population(20).await, 1);

        assert!(manager.update_player_position("p2", 20, 7).await);
        assert!(!manager.get_populated_maps().await.contains(&10));

        let stored: PlayerSession =
            serde_json::from_str(&store.get("player:p1").await.unwrap().unwrap()).unwrap();
        assert_eq!((stored.map_id, stored.cell_id), (20, 42));
        assert_indexes_consistent(&manager).await;

        assert!(!manager.update_player_position("nobody", 1, 1).await);
    }

    #[tokio::test]
    async fn test_same_map_position_update() {
        let (_, manager) = memory_manager();
        manager.add_player("p1", &character(1, 1, 10), "s").await.unwrap();
        assert!(manager.update_player_position("p1", 10, 300).await);

        let session = manager.get_player("p1").await.unwrap();
        assert_eq!(session.cell_id, 300);
        assert_eq!(manager.get_map_population(10).await, 1);
    }

    #[tokio::test]
    async fn test_stats_update_is_partial() {
        let (_, manager) = memory_manager();
        manager.add_player("p1", &character(1, 10, 1), "s").await.unwrap();
        let before = manager.get_player("p1").await.unwrap();

        let update = StatsUpdate {
            hp: Some(3),
            ..Default::default()
        };
        assert!(manager.update_player_stats("p1", &update).await);

        let after = manager.get_player("p1").await.unwrap();
        assert_eq!(after.stats.hp, 3);
        assert_eq!(after.stats.max_hp, before.stats.max_hp);
        assert_eq!(after.stats.mp, before.stats.mp);
        assert!(after.last_activity >= before.last_activity);
    }

    #[tokio::test]
    async fn test_combat_flag() {
        let (_, manager) = memory_manager();
        manager.add_player("p1", &character(1, 1, 1), "s").await.unwrap();

        assert!(manager.set_player_in_combat("p1", Some("battle-1")).await);
        let session = manager.get_player("p1").await.unwrap();
        assert!(session.is_in_combat);
        assert_eq!(session.current_battle_id.as_deref(), Some("battle-1"));

        assert!(manager.set_player_in_combat("p1", None).await);
        let session = manager.get_player("p1").await.unwrap();
        assert!(!session.is_in_combat);
        assert!(session.current_battle_id.is_none());
    }

    #[tokio::test]
    async fn test_statistics() {
        let (_, manager) = memory_manager();
        manager.add_player("a", &character(1, 10, 100), "s").await.unwrap();
        manager.add_player("b", &character(2, 20, 100), "s").await.unwrap();
        manager.add_player("c", &character(3, 30, 200), "s").await.unwrap();

        manager.set_player_in_combat("a", Some("b1")).await;
        manager.set_player_in_combat("c", Some("b2")).await;
        manager.set_player_in_combat("c", None).await;

        let stats = manager.get_statistics().await;
        assert_eq!(stats.online_count, 3);
        assert_approx_eq!(stats.average_level, 20.0);
        assert_eq!(stats.map_population.get(&100), Some(&2));
        assert_eq!(stats.map_population.get(&200), Some(&1));
        assert_eq!(stats.in_combat_count, 1);
    }

    #[tokio::test]
    async fn test_statistics_empty() {
        let (_, manager) = memory_manager();
        let stats = manager.get_statistics().await;
        assert_eq!(stats.online_count, 0);
        assert_eq!(stats.average_level, 0.0);
        assert!(stats.map_population.is_empty());
    }

    #[tokio::test]
    async fn test_character_is_unique() {
        let (store, manager) = memory_manager();
        manager.add_player("old", &character(7, 1, 1), "s1").await.unwrap();
        manager.add_player("new", &character(7, 1, 2), "s2").await.unwrap();

        assert_eq!(manager.get_online_count().await, 1);
        assert_eq!(
            manager.get_player_by_character_id(7).await.unwrap().player_id,
            "new"
        );
        assert!(store.get("player:old").await.unwrap().is_none());
        assert_indexes_consistent(&manager).await;
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let (_, manager) = memory_manager();
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for i in 0..64u64 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager
                    .add_player(&format!("p{}", i), &character(i, 1, (i % 4) as u32), "s")
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(manager.get_online_count().await, 64);
        for map_id in 0..4 {
            assert_eq!(manager.get_map_population(map_id).await, 16);
        }
        assert_indexes_consistent(&manager).await;
    }

    #[tokio::test]
    async fn test_initialize_recovers_valid_sessions() {
        let store = Arc::new(MemoryStore::new());
        let now = get_timestamp();

        let mut fresh = PlayerSession::from_snapshot("fresh", &character(1, 3, 5), "s", now);
        fresh.connected_at = now - 1000;
        let mut too_old = PlayerSession::from_snapshot("old", &character(2, 3, 5), "s", now);
        too_old.connected_at = now - SESSION_MAX_AGE_MS - 1;
        let mut idle = PlayerSession::from_snapshot("idle", &character(3, 3, 5), "s", now);
        idle.last_activity = now - SESSION_MAX_IDLE_MS - 1;

        for session in [&fresh, &too_old, &idle] {
            store
                .set(
                    &player_key(&session.player_id),
                    &serde_json::to_string(session).unwrap(),
                )
                .await
                .unwrap();
        }
        store.set("player:broken", "{").await.unwrap();

        let manager = PlayerManager::new(store.clone(), EventBus::default());
        assert_eq!(manager.initialize().await, 1);

        assert!(manager.get_player("fresh").await.is_some());
        assert!(manager.get_player("old").await.is_none());
        assert!(manager.get_player("idle").await.is_none());
        assert_eq!(manager.get_map_population(5).await, 1);

        assert!(store.get("player:old").await.unwrap().is_none());
        assert!(store.get("player:idle").await.unwrap().is_none());
        assert!(store.get("player:broken").await.unwrap().is_none());
        assert!(store.get("player:fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_initialize_survives_scan_failure() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_scan()
            .returning(|_, _, _| Err(StoreError::backend("scan", "timeout")));
        let manager = PlayerManager::new(Arc::new(store), EventBus::default());

        assert_eq!(manager.initialize().await, 0);
        assert_eq!(manager.get_online_count().await, 0);
    }

    #[tokio::test]
    async fn test_initialize_follows_cursor() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_scan()
            .withf(|cursor, prefix, _| *cursor == 0 && prefix == "player:")
            .times(1)
            .returning(|_, _, _| Ok((5, vec![])));
        store
            .expect_scan()
            .withf(|cursor, _, _| *cursor == 5)
            .times(1)
            .returning(|_, _, _| Ok((0, vec![])));
        let manager = PlayerManager::new(Arc::new(store), EventBus::default());

        assert_eq!(manager.initialize().await, 0);
    }

    #[tokio::test]
    async fn test_save_all_reports_failures() {
        let mut store = MockKeyValueStore::new();
        let mut calls = 0;
        store.expect_set_with_ttl().returning(move |_, _, _| {
            calls += 1;
            if calls <= 2 {
                Ok(())
            } else {
                Err(StoreError::Connection("down".into()))
            }
        });
        let manager = PlayerManager::new(Arc::new(store), EventBus::default());
        manager.add_player("a", &character(1, 1, 1), "s").await.unwrap();
        manager.add_player("b", &character(2, 1, 1), "s").await.unwrap();

        let result = manager.save_all().await;
        assert!(matches!(result, Err(SubsystemError::Failed { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_all_deletes_keys() {
        let (store, manager) = memory_manager();
        manager.add_player("a", &character(1, 1, 1), "s").await.unwrap();
        manager.add_player("b", &character(2, 1, 2), "s").await.unwrap();

        assert_eq!(manager.disconnect_all().await, 2);
        assert_eq!(manager.get_online_count().await, 0);
        assert!(store.is_empty().await);
        assert_indexes_consistent(&manager).await;
    }

    #[tokio::test]
    async fn test_removal_wins_over_slow_update() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            write_delay: Duration::from_millis(50),
        });
        let manager = Arc::new(PlayerManager::new(store.clone(), EventBus::default()));
        manager.add_player("p1", &character(1, 5, 10), "s").await.unwrap();

        let updating = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.update_player_position("p1", 5, 5).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.remove_player("p1").await);
        assert!(updating.await.unwrap());

        assert!(manager.get_player("p1").await.is_none());
        assert!(store.get("player:p1").await.unwrap().is_none());

        let rebooted = PlayerManager::new(store.clone(), EventBus::default());
        assert_eq!(rebooted.initialize().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_all_wins_over_slow_save() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            write_delay: Duration::from_millis(20),
        });
        let manager = Arc::new(PlayerManager::new(store.clone(), EventBus::default()));
        manager.add_player("p1", &character(1, 5, 10), "s").await.unwrap();
        manager.add_player("p2", &character(2, 5, 10), "s").await.unwrap();

        let saving = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.save_all().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.disconnect_all().await, 2);
        saving.await.unwrap().unwrap();

        let (_, keys) = store.scan(0, PLAYER_KEY_PREFIX, 10).await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_saves_then_clears() {
        let (store, manager) = memory_manager();
        manager.add_player("a", &character(1, 1, 1), "s").await.unwrap();
        store.delete("player:a").await.unwrap();

        manager.cleanup().await;
        assert_eq!(manager.get_online_count().await, 0);
        assert!(store.get("player:a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_events_published() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let manager = PlayerManager::new(store, bus);

        manager.add_player("p1", &character(1, 1, 3), "s").await.unwrap();
        manager.update_player_position("p1", 4, 1).await;
        manager.remove_player("p1").await;

        assert!(matches!(rx.recv().await.unwrap(), GameEvent::PlayerJoined { map_id: 3, .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            GameEvent::PlayerMoved { from_map: 3, map_id: 4, .. }
        ));
        assert!(matches!(rx.recv().await.unwrap(), GameEvent::PlayerLeft { map_id: 4, .. }));
    }
}
