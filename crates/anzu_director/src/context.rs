//! The director root context.
//!
//! One object constructed at startup carries the pool, the event bus, the
//! adapter set and all orchestration state; every component receives it
//! explicitly. There is no module-level state anywhere in the workspace.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicI64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use anzu_backends::{GpuRouter, ImageBackend, LlmConfig, LlmService, VisionService};
use anzu_db::{
    create_pool, run_migrations_non_fatal, AuditLog, CharacterProjectCache, DbConfig, DbPool,
};
use anzu_events::EventBus;
use anzu_protocol::defaults::{
    DEFAULT_DAILY_GENERATION_CAP, DEFAULT_PAUSE_COOLDOWN_SECS, DEFAULT_REJECTION_STREAK_LIMIT,
    DEFAULT_REPLENISH_INTERVAL_SECS, DEFAULT_REPLENISH_TARGET, DEFAULT_TICK_INTERVAL_SECS,
    DEFAULT_TRAINING_TARGET,
};
use anzu_protocol::AnzuConfig;

use crate::collab::{
    CommandAssembler, HttpTrainer, JellyfinLibrary, LoraTrainer, MediaLibrary, NullTrainer,
    VideoAssembler,
};

/// Replenishment safety configuration, first-class and runtime mutable.
#[derive(Debug, Clone)]
pub struct ReplenishmentConfig {
    pub target_global: i64,
    pub targets_by_character: HashMap<String, i64>,
    pub daily_cap: i64,
    pub rejection_streak_limit: i64,
    pub pause_cooldown: Duration,
    pub interval: Duration,
}

impl Default for ReplenishmentConfig {
    fn default() -> Self {
        ReplenishmentConfig {
            target_global: DEFAULT_REPLENISH_TARGET,
            targets_by_character: HashMap::new(),
            daily_cap: DEFAULT_DAILY_GENERATION_CAP,
            rejection_streak_limit: DEFAULT_REJECTION_STREAK_LIMIT,
            pause_cooldown: Duration::from_secs(DEFAULT_PAUSE_COOLDOWN_SECS as u64),
            interval: Duration::from_secs(DEFAULT_REPLENISH_INTERVAL_SECS),
        }
    }
}

/// Mutable replenishment state behind one lock.
#[derive(Debug)]
pub(crate) struct ReplenishState {
    pub config: ReplenishmentConfig,
    pub paused_until: HashMap<String, DateTime<Utc>>,
    pub in_flight: HashSet<String>,
}

pub struct Director {
    pub config: AnzuConfig,
    pub pool: DbPool,
    pub bus: EventBus,
    pub audit: AuditLog,
    pub char_cache: CharacterProjectCache,
    pub image_backend: Arc<ImageBackend>,
    pub llm: Arc<LlmService>,
    pub vision: Arc<VisionService>,
    pub gpu: GpuRouter,
    pub assembler: Option<Arc<dyn VideoAssembler>>,
    pub library: Arc<dyn MediaLibrary>,
    pub trainer: Arc<dyn LoraTrainer>,
    /// Bootstrap migration failure, surfaced via health.
    pub migration_error: Option<String>,

    // ── orchestrator state ─────────────────────────────────────────────
    pub(crate) enabled: AtomicBool,
    pub(crate) training_target: AtomicI64,
    pub(crate) tick_interval: Duration,
    pub(crate) active_work: Mutex<HashMap<String, JoinHandle<()>>>,

    // ── replenishment & correction state ───────────────────────────────
    pub(crate) replenish_enabled: AtomicBool,
    pub(crate) replenish: Mutex<ReplenishState>,
    pub(crate) correction_enabled: AtomicBool,

    // ── shutdown signal: loops exit on their next iteration ────────────
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl Director {
    /// Build the full context: pool, migration, adapters, collaborators.
    pub async fn new(config: AnzuConfig) -> Result<Arc<Self>> {
        // Postgres URLs may defer their password to the secret store.
        let mut db_url = config.db_url.clone();
        if db_url.contains("${DB_PASSWORD}") {
            match config.db_password() {
                Some(password) => db_url = db_url.replace("${DB_PASSWORD}", &password),
                None => anyhow::bail!(
                    "database URL expects a password but neither the vault secret nor \
                     ANIME_DB_PASSWORD is available"
                ),
            }
        }
        let pool = create_pool(DbConfig::from_url(&db_url)?).await?;
        let migration_error = run_migrations_non_fatal(&pool).await;
        Ok(Self::assemble(config, pool, migration_error))
    }

    /// Build on an existing (already migrated) pool. Used by tests.
    pub fn with_pool(config: AnzuConfig, pool: DbPool) -> Arc<Self> {
        Self::assemble(config, pool, None)
    }

    fn assemble(config: AnzuConfig, pool: DbPool, migration_error: Option<String>) -> Arc<Self> {
        let image_backend = Arc::new(ImageBackend::new(
            &config.image_backend_url,
            config.media_root.join("backend_output"),
        ));
        let vision = Arc::new(VisionService::new(&config.inference_url));
        let llm = Arc::new(LlmService::new(
            LlmConfig::new(&config.llm_url).with_fallback(&config.inference_url),
        ));
        let gpu = GpuRouter::new(Arc::clone(&image_backend), Arc::clone(&vision));

        let assembler: Option<Arc<dyn VideoAssembler>> = config
            .assembler_command
            .as_deref()
            .map(|cmd| Arc::new(CommandAssembler::new(cmd)) as Arc<dyn VideoAssembler>);
        let library: Arc<dyn MediaLibrary> = Arc::new(JellyfinLibrary::new(
            config.library_root.clone(),
            config.jellyfin_api_key.clone(),
            None,
        ));
        let trainer: Arc<dyn LoraTrainer> = match config.trainer_url.as_deref() {
            Some(url) => Arc::new(HttpTrainer::new(url)),
            None => Arc::new(NullTrainer),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Director {
            audit: AuditLog::new(pool.clone()),
            char_cache: CharacterProjectCache::new(),
            bus: EventBus::new(),
            config,
            pool,
            image_backend,
            llm,
            vision,
            gpu,
            assembler,
            library,
            trainer,
            migration_error,
            enabled: AtomicBool::new(false),
            training_target: AtomicI64::new(DEFAULT_TRAINING_TARGET),
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            active_work: Mutex::new(HashMap::new()),
            replenish_enabled: AtomicBool::new(false),
            replenish: Mutex::new(ReplenishState {
                config: ReplenishmentConfig::default(),
                paused_until: HashMap::new(),
                in_flight: HashSet::new(),
            }),
            correction_enabled: AtomicBool::new(true),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Register bus handlers and spawn the background loops. Called once
    /// at daemon startup.
    pub fn start(self: &Arc<Self>) {
        anzu_learning::register_learning_handlers(&self.bus, self.pool.clone());
        self.register_orchestrator_handlers();
        self.register_correction_handlers();
        self.spawn_tick_loop();
        self.spawn_replenishment_loop();
        info!("Director started (orchestrator enabled: {})", self.is_enabled());
    }

    /// Signal the loops to exit on their next iteration. Running workers
    /// drain; they are not cancelled.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("Shutdown signalled; loops exit on next iteration");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
