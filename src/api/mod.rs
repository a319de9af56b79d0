pub mod connection;
pub mod error;
mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::registry::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

/// Maximum accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub shutdown: ShutdownCoordinator,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: SessionRegistry::new(config.terminal.max_sessions),
            shutdown: ShutdownCoordinator::new(),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let config = state.config.clone();

    let limited = Router::new()
        .route("/api/terminal/sessions", get(list_sessions))
        .route("/api/system/info", get(system_info))
        .route("/api/terminal/execute", post(execute))
        .with_state(state.clone());

    // Rate limiting keys on the peer address, so the router must be served
    // with connect info (see `serve`).
    let limited = if config.rate_limit_per_minute > 0 {
        use tower_governor::{
            governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
        };
        let per_request_ms = (60_000 / u64::from(config.rate_limit_per_minute)).max(1);
        let governor_conf = GovernorConfigBuilder::default()
            .per_millisecond(per_request_ms)
            .burst_size(config.rate_limit_per_minute)
            .key_extractor(PeerIpKeyExtractor)
            .finish();
        match governor_conf {
            Some(conf) => limited.layer(GovernorLayer::new(Arc::new(conf))),
            None => {
                tracing::warn!("invalid rate limit configuration, rate limiting disabled");
                limited
            }
        }
    } else {
        limited
    };

    let router = Router::new()
        .route("/", get(ws_terminal))
        .route("/ws", get(ws_terminal))
        .route("/api/health", get(health))
        .with_state(state)
        .merge(limited)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-xss-protection"),
            HeaderValue::from_static("1; mode=block"),
        ));

    // Conditionally apply CORS if origins are configured.
    if config.allowed_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
    }
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// Time WebSocket handlers get to flush close frames before the process exits.
pub const CLOSE_FLUSH_DELAY: Duration = Duration::from_millis(100);
