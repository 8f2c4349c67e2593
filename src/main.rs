use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, response::IntoResponse, Router};
use http::HeaderValue;
use sqlx::SqlitePool;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod routes;
mod services;

use config::Config;
use error::AppError;
use services::{
    access::AccessResolver,
    access_requests::AccessRequestService,
    entities::EntityService,
    hierarchy::HierarchyResolver,
    init,
    invitations::{InvitationService, InvitationSettings},
    members::MemberService,
    notifier::InvitationNotifier,
};

/// Shared handles for the HTTP adapter. Built once at startup, never mutated.
pub struct AppState {
    pub db: SqlitePool,
    pub config: Config,
    pub access: AccessResolver,
    pub entities: EntityService,
    pub members: MemberService,
    pub invitations: InvitationService,
    pub access_requests: AccessRequestService,
}

impl AppState {
    pub fn new(db: SqlitePool, config: Config, notifier: Arc<dyn InvitationNotifier>) -> Self {
        let access = AccessResolver::new(db.clone(), HierarchyResolver::new(db.clone()));
        let invitations = InvitationService::new(
            db.clone(),
            access.clone(),
            notifier,
            InvitationSettings {
                app_url: config.server.app_url.clone(),
                default_ttl_hours: config.invitations.default_ttl_hours,
            },
        );

        Self {
            entities: EntityService::new(db.clone(), access.clone()),
            members: MemberService::new(db.clone(), access.clone()),
            access_requests: AccessRequestService::new(db.clone(), access.clone()),
            invitations,
            access,
            db,
            config,
        }
    }
}

/// 429 in the same JSON shape as every other error, plus `Retry-After`.
fn rate_limit_response(error: GovernorError) -> http::Response<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            let mut resp = AppError::RateLimited.into_response();
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            resp.headers_mut()
                .insert(http::header::RETRY_AFTER, HeaderValue::from(wait_time));
            resp
        }
        GovernorError::UnableToExtractKey => AppError::InvalidInput(
            "Unable to determine client IP for rate limiting".to_string(),
        )
        .into_response(),
        GovernorError::Other { msg, .. } => AppError::Internal(anyhow::anyhow!(
            msg.unwrap_or_else(|| "Rate limiting error".to_string())
        ))
        .into_response(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "workspace_access=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting workspace access service");

    let pool = init::init_db(&config).await?;
    let notifier = init::build_notifier(&config)?;
    let state = Arc::new(AppState::new(pool, config.clone(), notifier));

    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let mut bg_handles = vec![init::spawn_expiry_worker(
        state.invitations.clone(),
        shutdown_tx.clone(),
        Duration::from_secs(15 * 60),
    )];

    // Public link redemption is the only unauthenticated write; limit it per IP.
    let mut link_builder = GovernorConfigBuilder::default().key_extractor(SmartIpKeyExtractor);
    link_builder.per_second(config.invitations.link_redeem_per_second);
    link_builder.burst_size(config.invitations.link_redeem_burst);
    link_builder.error_handler(rate_limit_response);
    let link_gov_conf = Arc::new(
        link_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build link redemption governor config"))?,
    );

    {
        let limiter = link_gov_conf.limiter().clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        bg_handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        tracing::debug!("link rate limiter size: {}", limiter.len());
                        limiter.retain_recent();
                    }
                }
            }
        }));
    }

    let cors_origin = config
        .server
        .cors_origin
        .parse::<HeaderValue>()
        .map_err(|_| anyhow::anyhow!("Invalid CORS_ORIGIN: {}", config.server.cors_origin))?;

    let app: Router = routes::api_router()
        .nest(
            "/api/links",
            routes::links::redeem_router().layer(GovernorLayer {
                config: link_gov_conf.clone(),
            }),
        )
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(cors_origin)
                .allow_methods([
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::PUT,
                    http::Method::PATCH,
                    http::Method::DELETE,
                    http::Method::OPTIONS,
                ])
                .allow_headers([
                    http::header::CONTENT_TYPE,
                    http::header::AUTHORIZATION,
                    http::header::ACCEPT,
                ]),
        );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown_signal = {
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut term) => {
                        term.recv().await;
                    }
                    Err(e) => {
                        tracing::error!("Failed to bind SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {},
                _ = terminate => {},
            }

            tracing::info!("Shutdown signal received, notifying background workers");
            let _ = shutdown_tx.send(());
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );
    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    let _ = tokio::time::timeout(shutdown_wait, bg_wait).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
