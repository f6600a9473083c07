mod config;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use circle_api::mailer::LogMailer;
use circle_api::{AppState, AppStateInner, GatewaySettings};
use circle_auth::TokenService;
use circle_auth::cleanup::run_revocation_sweeper;
use circle_db::Database;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "circle=debug,circle_api=debug,circle_gateway=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("FATAL: {:#}", e);
            eprintln!("FATAL: {:#}", e);
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    let db = Arc::new(Database::open(&config.db_path)?);
    let tokens = Arc::new(TokenService::with_ttls(
        &config.jwt_secret,
        db,
        config.access_ttl,
        config.refresh_ttl,
    ));
    let shutdown = CancellationToken::new();
    let app_state: AppState = Arc::new(
        AppStateInner::new(tokens.clone(), Arc::new(LogMailer)).with_gateway(GatewaySettings {
            poll_interval: config.poll_interval,
            shutdown: shutdown.clone(),
        }),
    );

    let sweeper = tokio::spawn(run_revocation_sweeper(
        tokens,
        config.revocation_sweep,
        shutdown.clone(),
    ));

    let app = circle_api::router(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Circle server listening on {}", config.addr);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!("Revocation sweeper panicked: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
