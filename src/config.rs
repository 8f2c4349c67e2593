use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub invitations: InvitationConfig,
    pub notifier: NotifierConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public URL of the web app; invite links are built from it.
    pub app_url: String,
    /// Allowed CORS origin. Defaults to `app_url`.
    pub cors_origin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvitationConfig {
    /// Lifetime of new invitations when the caller does not pick one.
    /// `INVITATION_TTL_HOURS=0` turns expiry off.
    pub default_ttl_hours: Option<i64>,
    /// Allowed redemptions per second (per IP) on the public link endpoint
    pub link_redeem_per_second: u64,
    /// Burst size for the public link endpoint
    pub link_redeem_burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Invitation notices are POSTed here; unset means log only.
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub json: bool,
}

fn flag(name: &str) -> Option<bool> {
    match env::var(name).ok()?.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        let app_url = env::var("APP_URL").unwrap_or(defaults.server.app_url);
        if url::Url::parse(&app_url).is_err() {
            return Err(ConfigError::InvalidValue("APP_URL".to_string()));
        }

        let default_ttl_hours = match env::var("INVITATION_TTL_HOURS") {
            Ok(v) => match v
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidValue("INVITATION_TTL_HOURS".to_string()))?
            {
                h if h < 0 => {
                    return Err(ConfigError::InvalidValue(
                        "INVITATION_TTL_HOURS".to_string(),
                    ))
                }
                0 => None,
                h => Some(h),
            },
            Err(_) => defaults.invitations.default_ttl_hours,
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                cors_origin: env::var("CORS_ORIGIN").unwrap_or_else(|_| app_url.clone()),
                app_url,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
            },
            invitations: InvitationConfig {
                default_ttl_hours,
                link_redeem_per_second: env::var("LINK_REDEEM_PER_SECOND")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                link_redeem_burst: env::var("LINK_REDEEM_BURST")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            notifier: NotifierConfig {
                webhook_url: env::var("NOTIFIER_WEBHOOK_URL")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
                timeout_secs: env::var("NOTIFIER_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            logging: LoggingConfig {
                json: flag("LOG_JSON").unwrap_or(false),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                app_url: "http://localhost:3000".to_string(),
                cors_origin: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/workspace_access.db".to_string(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: String::new(),
            },
            invitations: InvitationConfig {
                default_ttl_hours: Some(7 * 24),
                link_redeem_per_second: 2,
                link_redeem_burst: 10,
            },
            notifier: NotifierConfig {
                webhook_url: None,
                timeout_secs: 10,
            },
            logging: LoggingConfig { json: false },
        }
    }
}
