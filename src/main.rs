use std::sync::Arc;

use axum::http::Method;
use clap::Parser;
use outsourcer::config::{Cli, Config, default_config_dir, default_config_path};
use outsourcer::db::Database;
use outsourcer::handler::AppState;
use outsourcer::outsourcer::Outsourcer;
use outsourcer::routes::routes;
use outsourcer::site::Site;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Cli::parse();

    // With --config the data lives next to the config file, otherwise in ~/.outsourcer/
    let (config_path, data_dir) = match args.config_path {
        Some(path) => {
            let path = std::path::PathBuf::from(path);
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| std::path::PathBuf::from("."));
            (path, dir)
        }
        None => (default_config_path(), default_config_dir()),
    };

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("failed to create data directory {:?}: {}", data_dir, e);
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("outsourcer.svc starting");

    let cfg = Config::new(&config_path.to_string_lossy()).unwrap_or_else(|e| {
        tracing::error!(error = %e, path = ?config_path, "failed to load config file");
        std::process::exit(1);
    });
    let db = Arc::new(Database::new(&cfg, &data_dir).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup database");
        std::process::exit(1);
    }));
    if let Err(e) = db.sync().await {
        tracing::warn!(error = %e, "initial database sync failed");
    }

    let mut site = Site::new(db.clone(), cfg.site.clone());
    if let Err(e) = site.install(Outsourcer::new(&cfg.site), cfg.plugin.enabled) {
        tracing::error!(error = %e, "failed to install stylesheet redirector");
        std::process::exit(1);
    }
    match site.is_route_active() {
        Ok(active) => tracing::info!(active, theme = %site.settings().theme, "stylesheet route"),
        Err(e) => tracing::warn!(error = %e, "failed to inspect route table"),
    }

    let address = format!("0.0.0.0:{}", cfg.app.get_port());
    let cancellation_token = CancellationToken::new();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = routes().layer(cors).with_state(AppState {
        db,
        site: Arc::new(site),
    });

    let listener = tokio::net::TcpListener::bind(&address).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup tcp listener");
        std::process::exit(1);
    });

    let shutdown_token = cancellation_token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl+c signal received, preparing to shutdown");
        }
        shutdown_token.cancel();
    });

    tracing::info!("outsourcer.svc running on {}", &address);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancellation_token.cancelled().await });
    if let Err(err) = server.await {
        tracing::error!(error = %err, "server error");
        std::process::exit(1);
    }

    tracing::info!("outsourcer.svc going off, graceful shutdown complete");
}
