use crate::config::Config;
use crate::error::SlowDownResult;
use crate::handlers::{delete_counter, delete_tag, fail, get_counter, health_check, index};
use crate::memory_store::MemoryStore;
use crate::middleware::{logging_middleware, slow_down_middleware};
use crate::options::SlowDownConfig;
use crate::redis::RedisStore;
use crate::slow_down::SlowDown;
use crate::store::CounterStore;
use axum::routing::{delete, get};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the router: demo routes behind the slow-down filter, health and
/// counter administration outside it.
pub fn create_app(slow_down: SlowDown) -> Router {
    let throttled = Router::new()
        .route("/", get(index))
        .route("/fail", get(fail))
        .route_layer(middleware::from_fn_with_state(
            slow_down.clone(),
            slow_down_middleware,
        ));

    let admin = Router::new()
        .route("/health", get(health_check))
        .route("/slow-down/tags/:tag", delete(delete_tag))
        .route("/slow-down/:key", get(get_counter).delete(delete_counter));

    throttled
        .merge(admin)
        .with_state(slow_down)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    memory_store: Option<Arc<MemoryStore>>,
    cleanup_interval: Duration,
}

impl Server {
    pub async fn new(config: Config, slow_down_config: SlowDownConfig) -> SlowDownResult<Self> {
        let mut memory_store = None;
        let store: Arc<dyn CounterStore> = match config.redis_url() {
            Some(url) => Arc::new(RedisStore::new(url).await?),
            None => {
                let memory = Arc::new(MemoryStore::new());
                memory_store = Some(memory.clone());
                memory
            }
        };

        tracing::info!(store = store.name(), "Counter store ready");

        let app = create_app(SlowDown::new(slow_down_config, store));

        Ok(Self {
            app,
            bind_addr: config.bind_addr,
            memory_store,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Slow-down server starting on {}", self.bind_addr);
        tracing::info!("Health check available at /health");

        if let Some(store) = self.memory_store {
            tokio::spawn(purge_expired_entries(store, self.cleanup_interval));
        }

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn purge_expired_entries(store: Arc<MemoryStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let purged = store.purge_expired().await;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired counter entries");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
