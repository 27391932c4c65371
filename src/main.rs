//! Composition root for the ARISE Top Picks service.
//!
//! Everything the scheduler/engine/monitor/learning planes need is built
//! explicitly here and threaded through constructor arguments; nothing in
//! the library crate reaches for a global or a lazily-initialized
//! singleton. Mirrors the teacher's `main.rs` shape: load env, init
//! tracing, build shared state, spawn background workers, serve HTTP.

use anyhow::{Context, Result};
use arise_backend::agents::{self, Agent};
use arise_backend::config::{Config, ModeWeightsConfig, PerformanceHorizonsConfig};
use arise_backend::engine::{Broadcaster, TopPicksEngine};
use arise_backend::events::{EventLogger, EventLoggingConfig};
use arise_backend::kv::{InProcessKvStore, KvStore};
use arise_backend::learning::outcome_evaluator::OutcomeEvaluator;
use arise_backend::learning::policy_learner::PolicyLearner;
use arise_backend::monitor::scalping::ScalpingExitTracker;
use arise_backend::quotes::cache::HistoricalCandleCache;
use arise_backend::quotes::{ComposedQuoteProvider, QuoteProvider};
use arise_backend::scheduler::Scheduler;
use arise_backend::sentiment::{SentimentProvider, StubSentimentProvider};
use arise_backend::store::ai_recommendation_store::AiRecommendationStore;
use arise_backend::store::pick_event_log::PickEventLog;
use arise_backend::store::policy::PolicyRegistry;
use arise_backend::store::top_picks_store::TopPicksStore;
use arise_backend::strategy_exit_tracker::StrategyExitTracker;
use arise_backend::support_resistance::SupportResistanceService;
use arise_backend::ws;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "arise_backend=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn health_check() -> &'static str {
    "ARISE Top Picks Engine operational"
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("loading configuration")?;
    info!(data_dir = %config.data_dir.display(), db_path = %config.db_path.display(), "ARISE starting");

    let mode_weights = ModeWeightsConfig::load(&config.mode_weights_path).context("loading mode weights config")?;
    let performance_horizons = PerformanceHorizonsConfig::load(&config.performance_horizons_path).context("loading performance horizons config")?;

    let kv: Arc<dyn KvStore> = InProcessKvStore::new();
    let event_logger = EventLogger::spawn(config.data_dir.clone(), EventLoggingConfig::enabled_by_default());
    event_logger.log_event("service_start", "main", serde_json::json!({"ws_port": config.ws_port}));

    let policy_registry = Arc::new(PolicyRegistry::new(&config.db_path).context("opening policy registry")?);
    policy_registry.seed_default_if_absent().context("seeding default policy")?;

    let candle_cache = Arc::new(HistoricalCandleCache::new(config.cache_dir.clone()));
    let quote_provider: Arc<dyn QuoteProvider> = Arc::new(ComposedQuoteProvider::new_stub(candle_cache));
    let sentiment_provider: Arc<dyn SentimentProvider> = Arc::new(StubSentimentProvider);

    let agents: Vec<Arc<dyn Agent>> = agents::registered_agents().into_iter().map(Arc::from).collect();

    let top_picks_store = Arc::new(TopPicksStore::new(&config.db_path, config.top_picks_retention_days).context("opening top picks store")?);
    let pick_event_log = Arc::new(PickEventLog::new(&config.db_path).context("opening pick event log")?);
    let ai_recommendation_store = Arc::new(AiRecommendationStore::new(&config.db_path).context("opening AI recommendation store")?);

    let strategy_exit_tracker = Arc::new(StrategyExitTracker::new(&config.data_dir));
    let scalping_tracker = Arc::new(ScalpingExitTracker::new(&config.data_dir));
    let support_resistance = Arc::new(SupportResistanceService::new(&config.db_path).context("opening support/resistance service")?);

    let ws_hub = ws::WsHub::new();
    let broadcaster: Arc<dyn Broadcaster> = ws_hub.clone();

    let engine = Arc::new(TopPicksEngine::new(
        agents,
        quote_provider.clone(),
        kv.clone(),
        mode_weights,
        policy_registry.clone(),
        top_picks_store.clone(),
        pick_event_log.clone(),
        ai_recommendation_store.clone(),
        Some(broadcaster),
    ));

    let outcome_evaluator = Arc::new(OutcomeEvaluator::new(
        quote_provider.clone(),
        pick_event_log.clone(),
        ai_recommendation_store.clone(),
        policy_registry.clone(),
        performance_horizons,
    ));

    let policy_learner = Arc::new(PolicyLearner::new(ai_recommendation_store.clone(), policy_registry.clone(), quote_provider.clone()));

    let scheduler = Arc::new(Scheduler::new(
        engine,
        top_picks_store,
        outcome_evaluator,
        policy_learner,
        quote_provider,
        support_resistance,
        sentiment_provider,
        kv,
        scalping_tracker,
        strategy_exit_tracker,
        ai_recommendation_store,
        pick_event_log,
    ));
    scheduler.spawn_all();
    info!("scheduler plane started");

    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(ws::router(ws_hub))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.ws_port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "ARISE listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
