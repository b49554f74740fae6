//! Router assembly and process lifecycle: store initialization, background
//! worker spawn, and graceful shutdown (spec §6).
//!
//! Grounded on the teacher's `serve()` — sequential `Arc::new(...Store::new(
//! ...).await)` construction, background workers spawned inline, and a
//! final `Router::new().merge(...).layer(...).with_state(...)` handed to
//! `axum::serve(...).with_graceful_shutdown(...)` — restructured around this
//! system's six components instead of the teacher's agent-orchestration
//! state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::accounts::{AccountStore, SharedAccountStore};
use crate::adapters::AdapterRegistry;
use crate::cache::{ConcurrencyCounters, SessionStore, UnavailabilityMarks};
use crate::config::{Config, ConfigStore, SharedConfigStore};
use crate::dispatcher::Dispatcher;
use crate::packages::PackageStore;
use crate::pricing::PricingTable;
use crate::reconciler::Reconciler;
use crate::scheduler::Scheduler;
use crate::usage::UsageAccumulator;
use crate::users::UserStore;

use super::keys::ApiKeyStore;

/// Everything a handler needs, shared behind `Arc` across the router.
pub struct AppState {
    pub accounts: SharedAccountStore,
    pub config: SharedConfigStore,
    pub dispatcher: Arc<Dispatcher>,
    in_flight: Arc<AtomicU64>,
}

/// Decrements the in-flight counter on drop so a request that ends via an
/// early return, a panic, or a disconnected client is still accounted for
/// exactly once (mirrors the dispatcher's own exactly-once slot release).
pub struct InFlightGuard(Arc<AtomicU64>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AppState {
    pub fn track_request(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(&self.in_flight))
    }
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let accounts = AccountStore::new(&config.database_path).await?;
    let users = UserStore::new(&config.database_path).await?;
    let api_keys = ApiKeyStore::new(&config.database_path).await?;
    let packages = PackageStore::new(&config.database_path).await?;
    let usage = UsageAccumulator::new();
    let pricing = PricingTable::with_defaults();
    let config_store = ConfigStore::new();

    let sessions = SessionStore::new(Duration::from_secs(
        config_store.get_u64("session_ttl", 30).await * 60,
    ));
    let marks = UnavailabilityMarks::new();
    let concurrency = ConcurrencyCounters::new();
    let adapters = AdapterRegistry::new();

    let scheduler = Scheduler::new(accounts.clone(), Arc::clone(&sessions), Arc::clone(&marks));

    let dispatcher = Dispatcher::new(
        accounts.clone(),
        users,
        api_keys,
        packages,
        usage.clone(),
        pricing,
        Arc::clone(&scheduler),
        adapters,
        Arc::clone(&concurrency),
        Arc::clone(&marks),
        Arc::clone(&config_store),
    );

    let reconciler = Reconciler::new(
        accounts.clone(),
        Arc::clone(&sessions),
        Arc::clone(&marks),
        usage.clone(),
        Arc::clone(&config_store),
        &config.database_path,
    )?;
    reconciler.spawn_workers();

    let state = Arc::new(AppState {
        accounts,
        config: config_store,
        dispatcher,
        in_flight: Arc::new(AtomicU64::new(0)),
    });

    let app = Router::new()
        .route("/healthz", axum::routing::get(super::handlers::health))
        .route("/v1/messages", post(super::handlers::post_messages))
        .route("/v1/responses", post(super::handlers::post_responses))
        .route("/v1/chat/completions", post(super::handlers::post_chat_completions))
        .route("/v1beta/models/:model_and_action", post(super::handlers::gemini_generate))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let shutdown_state = Arc::clone(&state);
    let grace = Duration::from_secs(config.request_deadline_secs);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state, grace).await;
        })
        .await?;

    Ok(())
}

/// Waits for SIGINT/SIGTERM, then drains in-flight requests up to `grace`
/// before letting axum finish tearing the listener down (spec §6: "drain
/// in-flight requests up to a grace window").
async fn shutdown_signal(state: Arc<AppState>, grace: Duration) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining in-flight requests...");

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let remaining = state.in_flight.load(Ordering::SeqCst);
        if remaining == 0 || tokio::time::Instant::now() >= deadline {
            if remaining > 0 {
                tracing::warn!(remaining, "grace window elapsed with requests still in flight");
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::info!("Shutdown drain complete");
}
