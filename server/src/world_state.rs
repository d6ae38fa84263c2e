//! Global, session-independent world state: clock, day/night cycle, weather,
//! announcements, global events and aggregate statistics.
//!
//! The world runs its own one-second clock task, independent of the game
//! tick, and persists itself under `cache:world_state`.

use chrono::Timelike;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Value};
use shared::{
    Announcement, DayNightCycle, GlobalEvent, Priority, StatisticKind, Weather, WorldInfo,
    WorldSnapshot, WorldStatistics, DEFAULT_ANNOUNCEMENT_DURATION_MS, WORLD_STATE_KEY,
    WORLD_STATE_TTL_SECS,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::events::{EventBus, GameEvent};
use crate::store::KeyValueStore;
use crate::utils::{get_timestamp, random_suffix};

pub const WORLD_CLOCK_PERIOD: Duration = Duration::from_secs(1);
/// Chance per world second that the weather rolls a new state.
pub const WEATHER_CHANGE_CHANCE: f64 = 0.01;

#[derive(Debug)]
struct WorldInner {
    server_time: u64,
    day_night_cycle: DayNightCycle,
    weather: Weather,
    announcements: HashMap<String, Announcement>,
    events: HashMap<String, GlobalEvent>,
    statistics: WorldStatistics,
}

pub struct WorldState {
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    inner: RwLock<WorldInner>,
    clock_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorldState {
    pub fn new(store: Arc<dyn KeyValueStore>, events: EventBus) -> Self {
        let now = get_timestamp();
        Self {
            store,
            events,
            inner: RwLock::new(WorldInner {
                server_time: now,
                day_night_cycle: DayNightCycle::from_hour(chrono::Local::now().hour()),
                weather: Weather::Clear,
                announcements: HashMap::new(),
                events: HashMap::new(),
                statistics: WorldStatistics::new(now),
            }),
            clock_task: Mutex::new(None),
        }
    }

    /// Starts the world clock, then restores persisted state if any.
    ///
    /// A missing, malformed or unreadable record leaves the defaults in place.
    pub async fn initialize(self: &Arc<Self>) {
        let world = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut clock = interval(WORLD_CLOCK_PERIOD);
            clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
            clock.tick().await;

            loop {
                clock.tick().await;
                match world.upgrade() {
                    Some(world) => world.clock_tick().await,
                    None => break,
                }
            }
        });

        if let Some(previous) = self.clock_task.lock().await.replace(handle) {
            previous.abort();
        }

        self.load_state().await;
        info!("World state initialized");
    }

    async fn clock_tick(&self) {
        let now = get_timestamp();
        let hour = chrono::Local::now().hour();
        let weather_change = {
            let mut rng = rand::thread_rng();
            if rng.gen_bool(WEATHER_CHANGE_CHANCE) {
                Weather::ALL.choose(&mut rng).copied()
            } else {
                None
            }
        };
        self.step_at(now, hour, weather_change).await;
    }

    /// One world-clock step at a given time. Weather only changes when
    /// `weather_change` carries the rolled state.
    pub async fn step_at(&self, now: u64, hour: u32, weather_change: Option<Weather>) {
        let mut inner = self.inner.write().await;
        inner.server_time = now;

        let cycle = DayNightCycle::from_hour(hour);
        if cycle != inner.day_night_cycle {
            info!("Day/night cycle changed: {} -> {}", inner.day_night_cycle, cycle);
            self.events.publish(GameEvent::DayNightChanged {
                from: inner.day_night_cycle,
                to: cycle,
            });
            inner.day_night_cycle = cycle;
        }

        if let Some(weather) = weather_change {
            if weather != inner.weather {
                info!("Weather changed: {} -> {}", inner.weather, weather);
                self.events.publish(GameEvent::WeatherChanged {
                    from: inner.weather,
                    to: weather,
                });
                inner.weather = weather;
            }
        }

        let expired: Vec<String> = inner
            .announcements
            .values()
            .filter(|a| !a.is_visible(now))
            .map(|a| a.id.clone())
            .collect();
        for id in expired {
            inner.announcements.remove(&id);
            info!("Announcement expired: {}", id);
            self.events.publish(GameEvent::AnnouncementExpired { id });
        }
    }

    /// Per game tick hook.
    pub async fn update(&self) {
        self.inner.write().await.server_time = get_timestamp();
    }

    async fn load_state(&self) {
        let raw = match self.store.get(WORLD_STATE_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("No saved world state, starting fresh");
                return;
            }
            Err(e) => {
                warn!("Could not load world state: {}", e);
                return;
            }
        };

        let snapshot: WorldSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring malformed world state: {}", e);
                return;
            }
        };

        let now = get_timestamp();
        let mut inner = self.inner.write().await;
        inner.statistics = snapshot.statistics;
        inner.weather = snapshot.weather_state;
        inner.day_night_cycle = snapshot.day_night_cycle;
        for announcement in snapshot.announcements {
            if announcement.is_visible(now) {
                inner
                    .announcements
                    .insert(announcement.id.clone(), announcement);
            }
        }

        info!(
            "World state restored (saved at {}, {} announcements)",
            snapshot.saved_at,
            inner.announcements.len()
        );
    }

    /// Posts an announcement visible for `duration_ms` and returns its id.
    pub async fn add_announcement(
        &self,
        message: impl Into<String>,
        priority: Priority,
        duration_ms: i64,
    ) -> String {
        let now = get_timestamp();
        let announcement = Announcement {
            id: format!("announce_{}_{}", now, random_suffix(9)),
            message: message.into(),
            priority,
            created_at: now,
            expires_at: now.saturating_add_signed(duration_ms),
        };
        let id = announcement.id.clone();

        info!("Announcement added: {} ({:?})", id, priority);
        self.inner
            .write()
            .await
            .announcements
            .insert(id.clone(), announcement.clone());
        self.events.publish(GameEvent::AnnouncementPosted(announcement));
        id
    }

    /// Medium priority announcement with the default duration.
    pub async fn announce(&self, message: impl Into<String>) -> String {
        self.add_announcement(message, Priority::Medium, DEFAULT_ANNOUNCEMENT_DURATION_MS)
            .await
    }

    pub async fn remove_announcement(&self, id: &str) -> bool {
        let removed = self.inner.write().await.announcements.remove(id).is_some();
        if removed {
            info!("Announcement removed: {}", id);
        }
        removed
    }

    /// Live announcements, highest priority first, newest first within a priority.
    pub async fn get_announcements(&self) -> Vec<Announcement> {
        let now = get_timestamp();
        let mut inner = self.inner.write().await;
        inner.announcements.retain(|_, a| a.is_visible(now));

        let mut visible: Vec<Announcement> = inner.announcements.values().cloned().collect();
        visible.sort_by(Announcement::display_order);
        visible
    }

    /// Starts (or restarts) a global event.
    pub async fn start_global_event(&self, id: impl Into<String>, data: Map<String, Value>) {
        let id = id.into();
        let event = GlobalEvent::new(data, get_timestamp());
        self.inner.write().await.events.insert(id.clone(), event);

        info!("Global event started: {}", id);
        self.events.publish(GameEvent::GlobalEventStarted { id });
    }

    pub async fn end_global_event(&self, id: &str) -> bool {
        let Some(event) = self.inner.write().await.events.remove(id) else {
            return false;
        };

        let duration_ms = get_timestamp().saturating_sub(event.started_at);
        info!("Global event ended: {} after {}ms", id, duration_ms);
        self.events.publish(GameEvent::GlobalEventEnded {
            id: id.to_string(),
            duration_ms,
        });
        true
    }

    pub async fn get_active_events(&self) -> HashMap<String, GlobalEvent> {
        self.inner.read().await.events.clone()
    }

    pub async fn increment_statistic(&self, kind: StatisticKind, delta: i64) {
        self.inner.write().await.statistics.increment(kind, delta);
    }

    pub async fn get_statistics(&self) -> WorldStatistics {
        self.inner.read().await.statistics
    }

    pub async fn weather(&self) -> Weather {
        self.inner.read().await.weather
    }

    pub async fn day_night_cycle(&self) -> DayNightCycle {
        self.inner.read().await.day_night_cycle
    }

    pub async fn server_time(&self) -> u64 {
        self.inner.read().await.server_time
    }

    /// Persists the world record. Failures are logged, never returned.
    pub async fn save_state(&self) {
        let snapshot = {
            let inner = self.inner.read().await;
            WorldSnapshot {
                statistics: inner.statistics,
                announcements: inner.announcements.values().cloned().collect(),
                server_time: inner.server_time,
                day_night_cycle: inner.day_night_cycle,
                weather_state: inner.weather,
                saved_at: get_timestamp(),
            }
        };

        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!("Could not serialize world state: {}", e);
                return;
            }
        };

        match self
            .store
            .set_with_ttl(
                WORLD_STATE_KEY,
                &json,
                Duration::from_secs(WORLD_STATE_TTL_SECS),
            )
            .await
        {
            Ok(()) => debug!("World state saved"),
            Err(e) => warn!("Could not save world state: {}", e),
        }
    }

    /// Stops the world clock. Returns false if it was not running.
    pub async fn stop_clock(&self) -> bool {
        match self.clock_task.lock().await.take() {
            Some(handle) => {
                handle.abort();
                debug!("World clock stopped");
                true
            }
            None => false,
        }
    }

    /// Stops the clock, saves (best effort) and clears announcements and events.
    pub async fn cleanup(&self) {
        self.stop_clock().await;
        self.save_state().await;

        let mut inner = self.inner.write().await;
        inner.announcements.clear();
        inner.events.clear();
        info!("World state cleaned up");
    }

    pub async fn get_world_info(&self) -> WorldInfo {
        let now = get_timestamp();
        let inner = self.inner.read().await;
        WorldInfo {
            server_time: inner.server_time,
            uptime: now.saturating_sub(inner.statistics.server_start_time),
            day_night_cycle: inner.day_night_cycle,
            weather: inner.weather,
            active_events: inner.events.len(),
            active_announcements: inner
                .announcements
                .values()
                .filter(|a| a.is_visible(now))
                .count(),
            statistics: inner.statistics,
        }
    }
}
