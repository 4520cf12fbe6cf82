//! github-mirror - main entry point.
//!
//! Loads the configuration, starts the ingestion engine, and serves the
//! read-only HTTP API in front of the mirrored store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use github_mirror::config::MirrorConfig;
use github_mirror::engine::MirrorEngine;
use github_mirror::filter::PermissiveFilter;
use github_mirror::platform::octo::OctoPlatform;
use github_mirror::server::{AppState, build_router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "github_mirror=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("GITHUB_MIRROR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./mirror-config.json"));

    let config = match MirrorConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cannot load {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        server = %config.github_server,
        db_path = %config.db_path.display(),
        orgs = config.org_list.len(),
        users = config.user_repo_list.len(),
        individual_repos = config.individual_repo_list.len(),
        "starting github-mirror"
    );

    let platform = match OctoPlatform::connect(
        &config.github_server,
        &config.github_username,
        &config.github_password,
    ) {
        Ok(platform) => Arc::new(platform),
        Err(e) => {
            eprintln!("cannot connect to {}: {}", config.github_server, e);
            std::process::exit(1);
        }
    };

    let engine = match MirrorEngine::start(&config, Arc::new(PermissiveFilter), platform).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("engine failed to start: {}", e);
            std::process::exit(1);
        }
    };

    let listen_addr: SocketAddr = config
        .listen_addr
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let state = AppState::new(
        engine.store(),
        config.preshared_key.clone(),
        engine.full_scan_signal(),
    );
    let app = build_router(state);

    tracing::info!("listening on {}", listen_addr);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .expect("failed to bind listen address");

    axum::serve(listener, app)
        .await
        .expect("HTTP server failed");
}
