//! Server lifecycle and timing authority
//!
//! [`GameServer`] owns every subsystem and drives them:
//! - Boot: store connection, then subsystem initialization in dependency
//!   order (world, maps, players, combat, movement, AI), then the listener
//! - A fixed-rate game tick calling each subsystem in a fixed order
//! - A periodic save of players, maps and combat
//! - Shutdown: final save, movement flush, disconnect, cleanup in reverse
//!   order
//!
//! A failing subsystem never stops the tick or save timers: its error is
//! logged with the timer's context and the next cycle runs as usual.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once, Weak};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, Duration, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::error::{ServerError, SubsystemError};
use crate::events::{EventBus, GameEvent};
use crate::player_manager::PlayerManager;
use crate::store::KeyValueStore;
use crate::subsystems::{AiManager, CombatManager, MapManager, MovementManager, Subsystems};
use crate::utils::{get_timestamp, memory_usage, MemoryUsage};
use crate::world_state::WorldState;

/// Accepted connections waiting for the transport layer.
pub const CONNECTION_QUEUE_CAPACITY: usize = 64;

const TICK_CONTEXT: &str = "GameServer.gameTick";
const SAVE_CONTEXT: &str = "GameServer.saveWorldState";
const STOP_CONTEXT: &str = "GameServer.stop";

/// A raw connection handed to the transport layer.
pub type Connection = (TcpStream, SocketAddr);

static PANIC_HOOK: Once = Once::new();

// Where the panic hook sends fatal reports; set while a server with signal
// handling is running.
static FATAL_REPORTS: StdMutex<Option<mpsc::UnboundedSender<String>>> = StdMutex::new(None);

/// The store plus the two components the core owns outright.
pub struct CoreServices {
    pub store: Arc<dyn KeyValueStore>,
    pub events: EventBus,
    pub world: Arc<WorldState>,
    pub players: Arc<PlayerManager>,
}

impl CoreServices {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let events = EventBus::default();
        Self {
            world: Arc::new(WorldState::new(Arc::clone(&store), events.clone())),
            players: Arc::new(PlayerManager::new(Arc::clone(&store), events.clone())),
            store,
            events,
        }
    }
}

/// Point-in-time server metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetrics {
    pub server_id: String,
    /// Milliseconds since `start()`, 0 when stopped.
    pub uptime: u64,
    pub tick_count: u64,
    /// Milliseconds.
    pub last_tick_duration: f64,
    pub online_players: usize,
    pub active_map_instances: usize,
    pub active_battles: usize,
    pub memory_usage: Option<MemoryUsage>,
}

pub struct GameServer {
    config: ServerConfig,
    core: CoreServices,
    subsystems: Subsystems,

    running: AtomicBool,
    started_at: AtomicU64,
    tick_count: AtomicU64,
    last_tick_micros: AtomicU64,

    // Tick, save and accept tasks, aborted by stop()
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    connection_tx: mpsc::Sender<Connection>,
    connection_rx: Mutex<Option<mpsc::Receiver<Connection>>>,
    stopped: watch::Sender<bool>,
}

impl GameServer {
    pub fn new(config: ServerConfig, core: CoreServices, subsystems: Subsystems) -> Self {
        let (connection_tx, connection_rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        let (stopped, _) = watch::channel(true);
        Self {
            config,
            core,
            subsystems,
            running: AtomicBool::new(false),
            started_at: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            last_tick_micros: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
            connection_tx,
            connection_rx: Mutex::new(Some(connection_rx)),
            stopped,
        }
    }

    /// Builds a server running the bundled collaborators.
    pub fn with_local_subsystems(config: ServerConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let core = CoreServices::new(store);
        let subsystems = Subsystems::local(&core, config.tick_rate);
        Self::new(config, core, subsystems)
    }

    /// Boots every subsystem, binds the listener and arms the timers
    ///
    /// Any store or initialization failure aborts the start and is returned.
    /// Returns once the listener is bound and both timers are running.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        match self.boot().await {
            Ok(addr) => {
                info!(
                    "Game server {} started on {} ({} Hz, save every {:?})",
                    self.config.server_id,
                    addr,
                    self.config.tick_rate,
                    self.config.save_interval
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                error!("Failed to start game server: {}", e);
                Err(e)
            }
        }
    }

    async fn boot(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        self.started_at.store(get_timestamp(), Ordering::SeqCst);
        self.tick_count.store(0, Ordering::SeqCst);

        self.core.store.connect().await?;

        match self.boot_connected().await {
            Ok(addr) => Ok(addr),
            Err(e) => {
                self.core.world.stop_clock().await;
                if let Err(disconnect) = self.core.store.disconnect().await {
                    warn!("Store disconnect after failed start: {}", disconnect);
                }
                Err(e)
            }
        }
    }

    async fn boot_connected(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        self.core.world.initialize().await;

        let maps = Arc::clone(&self.subsystems.maps);
        maps.initialize()
            .await
            .map_err(|source| ServerError::Initialize {
                subsystem: "MapManager",
                source,
            })?;

        self.core.players.initialize().await;

        self.subsystems
            .combat
            .initialize(Arc::clone(&maps))
            .await
            .map_err(|source| ServerError::Initialize {
                subsystem: "CombatManager",
                source,
            })?;

        self.subsystems
            .movement
            .initialize(Arc::clone(&maps))
            .await
            .map_err(|source| ServerError::Initialize {
                subsystem: "MovementManager",
                source,
            })?;

        self.subsystems
            .ai
            .initialize(maps, Arc::clone(&self.subsystems.combat))
            .await
            .map_err(|source| ServerError::Initialize {
                subsystem: "AiManager",
                source,
            })?;

        let addr = self.config.listen_addr();
        let listener = match TcpListener::bind(addr.as_str()).await {
            Ok(listener) => listener,
            Err(source) => return Err(ServerError::Bind { addr, source }),
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind {
                addr: self.config.listen_addr(),
                source,
            })?;
        *self.local_addr.lock().await = Some(local_addr);

        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(self.spawn_accept_loop(listener));
            tasks.push(self.spawn_tick_loop());
            tasks.push(self.spawn_save_loop());
        }

        self.stopped.send_replace(false);
        if self.config.install_signal_handlers {
            self.spawn_shutdown_watcher();
        }

        Ok(local_addr)
    }

    /// Forwards accepted connections to the transport layer's queue.
    fn spawn_accept_loop(&self, listener: TcpListener) -> JoinHandle<()> {
        let connections = self.connection_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => match connections.try_send((stream, peer)) {
                        Ok(()) => debug!("Accepted connection from {}", peer),
                        Err(TrySendError::Full(_)) => {
                            warn!("Connection queue full, dropping {}", peer)
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!("No transport attached, dropping {}", peer)
                        }
                    },
                    Err(e) => {
                        warn!("Error accepting connection: {}", e);
                        sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    fn spawn_tick_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let server: Weak<Self> = Arc::downgrade(self);
        let period = self.config.tick_duration();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match server.upgrade() {
                    Some(server) => server.game_tick().await,
                    None => break,
                }
            }
        })
    }

    fn spawn_save_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let server: Weak<Self> = Arc::downgrade(self);
        let period = self.config.save_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match server.upgrade() {
                    Some(server) => server.save_world_state().await,
                    None => break,
                }
            }
        })
    }

    /// SIGINT, SIGTERM or a panic anywhere in the process: stop, then exit 0.
    fn spawn_shutdown_watcher(self: &Arc<Self>) {
        let server: Weak<Self> = Arc::downgrade(self);
        let mut stopped = self.stopped.subscribe();

        install_panic_hook();
        let mut fatal_rx = route_fatal_reports();

        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = ctrl_c() => "SIGINT",
                _ = terminate() => "SIGTERM",
                Some(_) = fatal_rx.recv() => "fatal error",
                _ = stopped.changed() => return,
            };

            info!("Received {}, shutting down gracefully...", reason);
            if let Some(server) = server.upgrade() {
                server.stop().await;
            }
            std::process::exit(0);
        });
    }

    /// One fixed-period step of the simulation
    ///
    /// Subsystems run in the order world, maps, combat, AI, movement. An
    /// error from one is logged and the others still run.
    pub async fn game_tick(&self) {
        let started = Instant::now();

        self.core.world.update().await;
        log_tick_error(self.subsystems.maps.update_all().await);
        log_tick_error(self.subsystems.combat.update_battles().await);
        log_tick_error(self.subsystems.ai.update().await);
        log_tick_error(self.subsystems.movement.process_queue().await);

        let elapsed = started.elapsed();
        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_tick_micros
            .store(elapsed.as_micros() as u64, Ordering::SeqCst);

        let budget = self.config.tick_duration();
        if elapsed > budget {
            warn!(
                "[{}] tick {} took {:.2}ms, over the {:.2}ms budget",
                TICK_CONTEXT,
                tick,
                elapsed.as_secs_f64() * 1000.0,
                budget.as_secs_f64() * 1000.0
            );
        }
    }

    /// Saves players, maps and combat, in that order. Each failure is logged
    /// and does not prevent the following saves.
    pub async fn save_world_state(&self) {
        let started = Instant::now();
        log_save_error(self.core.players.save_all().await);
        log_save_error(self.subsystems.maps.save_all().await);
        log_save_error(self.subsystems.combat.save_all().await);
        debug!("World state saved in {:?}", started.elapsed());
    }

    /// Graceful shutdown. Does nothing if the server is not running.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Stop requested but server is not running");
            return;
        }

        let started = Instant::now();
        info!("Stopping game server {}", self.config.server_id);

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.stopped.send_replace(true);
        if self.config.install_signal_handlers {
            release_fatal_reports();
        }
        self.local_addr.lock().await.take();

        self.save_world_state().await;
        // Moves already dequeued must land before the sessions are dropped.
        log_stop_error(self.subsystems.movement.save_all().await);
        self.core.players.disconnect_all().await;

        log_stop_error(self.subsystems.ai.cleanup().await);
        log_stop_error(self.subsystems.combat.cleanup().await);
        log_stop_error(self.subsystems.movement.cleanup().await);
        log_stop_error(self.subsystems.maps.cleanup().await);
        self.core.players.cleanup().await;
        self.core.world.cleanup().await;

        if let Err(e) = self.core.store.disconnect().await {
            error!("[{}] {}", STOP_CONTEXT, e);
        }

        info!("Game server stopped in {:?}", started.elapsed());
    }

    /// Live counts, read from the subsystems on every call.
    pub async fn get_metrics(&self) -> ServerMetrics {
        let uptime = if self.is_running() {
            get_timestamp().saturating_sub(self.started_at.load(Ordering::SeqCst))
        } else {
            0
        };

        ServerMetrics {
            server_id: self.config.server_id.clone(),
            uptime,
            tick_count: self.tick_count(),
            last_tick_duration: self.last_tick_micros.load(Ordering::SeqCst) as f64 / 1000.0,
            online_players: self.core.players.get_online_count().await,
            active_map_instances: self.subsystems.maps.active_instance_count().await,
            active_battles: self.subsystems.combat.active_battle_count().await,
            memory_usage: memory_usage(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the listener is bound to, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Hands the accepted-connection queue to the transport layer. Only the
    /// first caller gets it.
    pub async fn take_connections(&self) -> Option<mpsc::Receiver<Connection>> {
        self.connection_rx.lock().await.take()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GameEvent> {
        self.core.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.core.store
    }

    pub fn world(&self) -> &Arc<WorldState> {
        &self.core.world
    }

    pub fn players(&self) -> &Arc<PlayerManager> {
        &self.core.players
    }

    pub fn maps(&self) -> &Arc<dyn MapManager> {
        &self.subsystems.maps
    }

    pub fn combat(&self) -> &Arc<dyn CombatManager> {
        &self.subsystems.combat
    }

    pub fn movement(&self) -> &Arc<dyn MovementManager> {
        &self.subsystems.movement
    }

    pub fn ai(&self) -> &Arc<dyn AiManager> {
        &self.subsystems.ai
    }
}

fn log_tick_error(result: Result<(), SubsystemError>) {
    if let Err(e) = result {
        error!("[{}] {}", TICK_CONTEXT, e);
    }
}

fn log_save_error(result: Result<(), SubsystemError>) {
    if let Err(e) = result {
        error!("[{}] {}", SAVE_CONTEXT, e);
    }
}

fn log_stop_error(result: Result<(), SubsystemError>) {
    if let Err(e) = result {
        error!("[{}] {}", STOP_CONTEXT, e);
    }
}

/// Chains the fatal-report hook in front of the existing panic hook, once per
/// process.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous_hook = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            error!("[fatal] {}", info);
            let reports = FATAL_REPORTS.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(reports) = reports.as_ref() {
                let _ = reports.send(info.to_string());
            }
            drop(reports);
            previous_hook(info);
        }));
    });
}

fn route_fatal_reports() -> mpsc::UnboundedReceiver<String> {
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    *FATAL_REPORTS.lock().unwrap_or_else(|e| e.into_inner()) = Some(reports_tx);
    reports_rx
}

fn release_fatal_reports() {
    FATAL_REPORTS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
}

async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
