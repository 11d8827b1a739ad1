use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub notes: NotesConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotesConfig {
    #[serde(default)]
    pub dir: String,
    #[serde(default = "default_notes_limit")]
    pub default_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalendarConfig {
    pub credentials_file: Option<String>,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
    #[serde(default = "default_lookahead_hours")]
    pub lookahead_hours: i64,
    pub default_time_zone: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    pub master_password: Option<String>,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_model() -> String {
    "openai/gpt-oss-20b".to_string()
}

fn default_max_iterations() -> usize {
    8
}

fn default_notes_limit() -> usize {
    5
}

fn default_calendar_id() -> String {
    "primary".to_string()
}

fn default_lookahead_hours() -> i64 {
    72
}

fn default_jwt_secret() -> String {
    "change-me".to_string()
}

fn default_session_ttl_hours() -> i64 {
    24 * 7
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_index_file() -> String {
    "index.html".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            model: default_model(),
            temperature: 0.0,
            max_iterations: default_max_iterations(),
        }
    }
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            default_limit: default_notes_limit(),
        }
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            credentials_file: None,
            calendar_id: default_calendar_id(),
            lookahead_hours: default_lookahead_hours(),
            default_time_zone: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            master_password: None,
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            index_file: default_index_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl OAuthConfig {
    /// True when client id, secret and redirect url are all present.
    pub fn is_configured(&self) -> bool {
        [&self.client_id, &self.client_secret, &self.redirect_url]
            .iter()
            .all(|v| v.as_deref().is_some_and(|s| !s.is_empty()))
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse the TOML file. A missing file yields the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Override file values with environment variables.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("OPENAI_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = var("OPENAI_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Some(v) = var("OPENAI_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = var("NOTES_DIR") {
            self.notes.dir = v;
        }
        if let Some(v) = var("GOOGLE_CREDENTIALS_FILE") {
            self.calendar.credentials_file = Some(v);
        }
        if let Some(v) = var("GOOGLE_CLIENT_ID") {
            self.oauth.client_id = Some(v);
        }
        if let Some(v) = var("GOOGLE_SECRET") {
            self.oauth.client_secret = Some(v);
        }
        if let Some(v) = var("GOOGLE_REDIRECT_URL") {
            self.oauth.redirect_url = Some(v);
        }
        if let Some(v) = var("JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Some(v) = var("MASTER_PASSWORD") {
            self.auth.master_password = Some(v);
        }
        if let Some(v) = var("HOST") {
            self.server.host = v;
        }
        if let Some(v) = var("PORT") {
            match v.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => log::warn!("Ignoring invalid PORT value: {}", v),
            }
        }

        // A blank password in the file disables password login.
        if self.auth.master_password.as_deref().is_some_and(|p| p.trim().is_empty()) {
            self.auth.master_password = None;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.llm.api_key.trim().is_empty() {
            anyhow::bail!("OPENAI_API_KEY is required (env or [llm].api_key)");
        }
        if self.notes.dir.trim().is_empty() {
            anyhow::bail!("NOTES_DIR is required (env or [notes].dir)");
        }
        Ok(())
    }

    pub fn uses_default_jwt_secret(&self) -> bool {
        self.auth.jwt_secret == default_jwt_secret()
    }

    /// Whether any login method is enabled.
    pub fn auth_enabled(&self) -> bool {
        self.master_password().is_some() || self.oauth.is_configured()
    }

    /// The master password, unless it is unset or blank.
    pub fn master_password(&self) -> Option<&str> {
        self.auth.master_password.as_deref().filter(|p| !p.trim().is_empty())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
