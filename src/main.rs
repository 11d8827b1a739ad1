mod agent;
mod auth;
mod calendar;
mod config;
mod google_auth;
mod openai;
mod patterns;
mod server;
mod tools;

use anyhow::Result;
use config::Config;
use server::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config_path =
        std::env::var("GROUNDHOG_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)?;

    init_logging(&config.logging.level);
    log::info!("Starting Groundhog...");
    log::info!(
        "Model {} via {}",
        config.llm.model,
        config.llm.base_url.as_deref().unwrap_or(openai::DEFAULT_BASE_URL)
    );
    log::info!("Notes directory: {}", config.notes.dir);
    if config.uses_default_jwt_secret() {
        log::warn!("JWT_SECRET is not set; session cookies are signed with the default secret");
    }
    if !config.auth_enabled() {
        log::warn!("No login method configured; /ws is open to anyone who can reach it");
    }

    let state = AppState::new(config)?;
    if state.service_account.is_some() {
        log::info!("Calendar service account enabled");
    }
    if state.oauth.is_some() {
        log::info!("Google OAuth login enabled");
    }

    server::serve(state).await
}

/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(level: &str) {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.parse_filters(level),
    };
    builder.init();
}
