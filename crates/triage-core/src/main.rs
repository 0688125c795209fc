use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use triage_core::server::{router, AppState};
use triage_core::{Config, PipelineState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "triage=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Triage service starting up...");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    info!("Configuration loaded");
    info!("  LLM API: {}", config.llm_api_url);
    info!("  Model: {}", config.llm_model);
    if config.llm_api_key.is_none() {
        warn!("TRIAGE_LLM_API_KEY not set - requests go out unauthenticated");
    }

    let pipeline = Arc::new(config.build_pipeline().await?);

    // Install the optimized state if one was saved
    let optimized = if Path::new(&config.state_path).exists() {
        let state = PipelineState::load_from_file(&config.state_path)?;
        pipeline.install(state)?;
        info!("Loaded optimized pipeline state from {}", config.state_path);
        true
    } else {
        warn!(
            "No optimized state at {} - serving default instructions",
            config.state_path
        );
        false
    };

    let app = router(Arc::new(AppState::new(pipeline, optimized)));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    info!("Listening on port {}", config.http_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;

    info!("Triage service has shut down.");
    Ok(())
}
