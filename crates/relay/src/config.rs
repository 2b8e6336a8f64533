// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool reads its own sizing variables (db/pool.rs).

use std::net::SocketAddr;

use anyhow::{Context, Result};
use webinar_common::phone::{PhoneRules, DEFAULT_COUNTRY_CODE, DEFAULT_NATIONAL_NUMBER_LEN};
use webinar_common::webhook::TemplateRenderer;

const DEV_JWT_SECRET: &str = "webinar_local_development_jwt_secret_must_be_32_chars";

pub const DEFAULT_REACTION_KINDS: &[&str] = &["clap", "heart", "laugh", "thumbs_up", "fire"];

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret for host bearer tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `webinar_relay=debug`).
    pub log_filter: String,
    /// Emit JSON log lines instead of the human format.
    pub log_json: bool,
    pub phone_rules: PhoneRules,
    /// Allowlisted reaction kinds.
    pub reaction_kinds: Vec<String>,
    pub webhook_url: Option<String>,
    pub webhook_template: Option<String>,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `WEBINAR_RELAY_HOST` | `0.0.0.0` |
    /// | `WEBINAR_RELAY_PORT` | `8080` |
    /// | `WEBINAR_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `WEBINAR_RELAY_DATABASE_URL` | *(none, memory store)* |
    /// | `WEBINAR_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `WEBINAR_RELAY_LOG_FILTER` | `info` |
    /// | `WEBINAR_RELAY_LOG_JSON` | `false` |
    /// | `WEBINAR_RELAY_DEFAULT_COUNTRY_CODE` | `98` |
    /// | `WEBINAR_RELAY_NATIONAL_NUMBER_LEN` | `10` |
    /// | `WEBINAR_RELAY_REACTION_KINDS` | `clap,heart,laugh,thumbs_up,fire` |
    /// | `WEBINAR_RELAY_WEBHOOK_URL` | *(none, webhooks disabled)* |
    /// | `WEBINAR_RELAY_WEBHOOK_TEMPLATE` | *(none)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("WEBINAR_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("WEBINAR_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("WEBINAR_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url = env("WEBINAR_RELAY_DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let cors_origins = env("WEBINAR_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("WEBINAR_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("WEBINAR_RELAY_LOG_JSON")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let country_code = env("WEBINAR_RELAY_DEFAULT_COUNTRY_CODE")
            .ok()
            .map(|v| v.trim().trim_start_matches('+').to_string())
            .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or_else(|| DEFAULT_COUNTRY_CODE.into());
        let national_number_len = env("WEBINAR_RELAY_NATIONAL_NUMBER_LEN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_NATIONAL_NUMBER_LEN);

        let reaction_kinds = env("WEBINAR_RELAY_REACTION_KINDS")
            .ok()
            .map(|v| {
                v.split(',').map(str::trim).filter(|k| !k.is_empty()).map(String::from).collect()
            })
            .filter(|kinds: &Vec<String>| !kinds.is_empty())
            .unwrap_or_else(|| DEFAULT_REACTION_KINDS.iter().map(|k| k.to_string()).collect());

        let webhook_url = env("WEBINAR_RELAY_WEBHOOK_URL").ok().filter(|v| !v.trim().is_empty());
        let webhook_template = env("WEBINAR_RELAY_WEBHOOK_TEMPLATE").ok();

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            cors_origins,
            log_filter,
            log_json,
            phone_rules: PhoneRules { country_code, national_number_len },
            reaction_kinds,
            webhook_url,
            webhook_template,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    /// Compile the configured webhook template, failing on unknown variables.
    pub fn compiled_webhook_template(&self) -> Result<Option<TemplateRenderer>> {
        self.webhook_template
            .as_deref()
            .map(TemplateRenderer::compile)
            .transpose()
            .context("invalid WEBINAR_RELAY_WEBHOOK_TEMPLATE")
    }
}
