use anyhow::{Context, Result};
use relay_translator::call_control::TwilioCallControl;
use relay_translator::config::Config;
use relay_translator::openai::OpenAiEngine;
use relay_translator::registry::SessionRegistry;
use relay_translator::relay::{Relay, RelaySettings};
use relay_translator::server::{self, AppState};
use relay_translator::translation::Translator;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_translator=info".parse()?),
        )
        .init();

    info!("Starting relay translator");

    // Load configuration from environment
    let config = Config::from_env()?;

    let engine = OpenAiEngine::new(&config)?;
    let relay = Relay::new(
        Arc::new(SessionRegistry::new()),
        Translator::new(Arc::new(engine)),
        Arc::new(TwilioCallControl::new(&config)),
        RelaySettings::from_config(&config),
    );

    let address = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;

    info!(
        "Listening on {} (public domain {}, {} -> {})",
        address, config.public_domain, config.caller_language, config.agent_language
    );

    let state = AppState {
        relay: Arc::new(relay),
    };
    server::serve(listener, state, shutdown_signal()).await?;

    info!("Relay translator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until killed.
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
