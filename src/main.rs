//! Letter Guard service
//!
//! This is the main entry point for the letter protection service.
//! It initializes the application components and starts the web server.

use actix_web::{web, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

use letter_guard::api::{build_app, configure_metrics, ApiState};
use letter_guard::config;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;

    // Initialize logging, RUST_LOG wins over the configured level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.logging.level)).init();

    info!("Starting Letter Guard...");

    // Initialize metrics
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    let prometheus = web::Data::new(prometheus);

    let bind = (config.server.host.clone(), config.server.port);
    let interval_seconds = config.maintenance.interval_seconds.max(1);

    // Create API state
    let state = web::Data::new(ApiState::from_config(config).context("Invalid protection settings")?);

    // Periodic maintenance
    let sweeper = state.clone();
    actix_rt::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweeper.sweep();
        }
    });

    info!("Listening on {}:{}", bind.0, bind.1);
    if state.config.security.admin_token.is_none() {
        warn!("No admin token configured; /api/admin/security and /metrics will refuse every request");
    }

    // Start HTTP server
    HttpServer::new(move || {
        build_app(state.clone()).configure(|cfg| configure_metrics(cfg, &state, prometheus.clone()))
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}
