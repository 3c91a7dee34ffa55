//! Main Entrypoint for the Vaani API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Choosing the turn store: PostgreSQL when configured, memory otherwise.
//! 3. Building the stage adapters and the session manager.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and ending every call on shutdown.

use anyhow::Context;
use sqlx::PgPool;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use vaani_api::{
    config::{Config, GREETING_INSTRUCTION},
    db::PgGateway,
    provider::build_stages,
    router::create_router,
    state::AppState,
    transport::WsNegotiator,
};
use vaani_core::{
    SessionManager,
    persistence::{InMemoryGateway, PersistenceGateway},
};

/// Resolves when `Ctrl+C` is received. A failure to install the handler is
/// logged and treated as "never".
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in std::fs::read_dir(prompts_path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Storage ---
    let gateway: Arc<dyn PersistenceGateway> = match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to database")?;
            let db = PgGateway::new(pool);
            db.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            Arc::new(db)
        }
        None => {
            warn!("DATABASE_URL not set; conversation history lives in memory only.");
            Arc::new(InMemoryGateway::new())
        }
    };

    // --- 4. Initialize Stages and Sessions ---
    let prompts = load_prompts(&config.prompts_path)
        .with_context(|| format!("Failed to read prompts from {:?}", config.prompts_path))?;
    let system_prompt = prompts
        .get("system_prompt")
        .context("system_prompt.md not found in prompts directory")?
        .clone();
    // Kept alive for the whole run; see `Stages::transcript_feed`.
    let stages = build_stages(&config, system_prompt).await?;

    let negotiator = Arc::new(WsNegotiator::new(config.attach_timeout));
    let sessions = SessionManager::new(
        negotiator.clone(),
        stages.set.clone(),
        gateway,
        config.session_config(Some(GREETING_INSTRUCTION.to_string())),
    );

    let app_state = Arc::new(AppState {
        sessions: sessions.clone(),
        negotiator,
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        responder = ?config.responder_provider,
        speech = ?config.speech_provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sessions.shutdown().await;
    drop(stages);
    info!("Server has shut down.");
    Ok(())
}
