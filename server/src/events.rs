//! Server-wide notification channel.
//!
//! Components publish [`GameEvent`]s on a bounded broadcast channel instead
//! of calling listeners directly. Publishing never blocks: when nobody is
//! subscribed the event is dropped, and a subscriber that falls more than
//! the channel capacity behind sees `RecvError::Lagged` and resumes from the
//! oldest retained event.

use log::trace;
use serde::Serialize;
use shared::{Announcement, DayNightCycle, Weather};
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameEvent {
    #[serde(rename_all = "camelCase")]
    PlayerJoined {
        player_id: String,
        map_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    PlayerLeft {
        player_id: String,
        map_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    PlayerMoved {
        player_id: String,
        from_map: u32,
        map_id: u32,
        cell_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    CombatStateChanged {
        player_id: String,
        battle_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    BattleStarted {
        battle_id: String,
        map_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    BattleEnded {
        battle_id: String,
        map_id: u32,
    },
    AnnouncementPosted(Announcement),
    AnnouncementExpired {
        id: String,
    },
    WeatherChanged {
        from: Weather,
        to: Weather,
    },
    DayNightChanged {
        from: DayNightCycle,
        to: DayNightCycle,
    },
    GlobalEventStarted {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    GlobalEventEnded {
        id: String,
        duration_ms: u64,
    },
}

/// Cheap to clone; every clone publishes into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GameEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: GameEvent) {
        if self.sender.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
