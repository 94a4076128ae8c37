use std::{env, sync::OnceLock};

use chrono::Duration;
use mongodb::{
    bson::doc,
    options::IndexOptions,
    Client, Database, IndexModel,
};

use crate::utils::email::Mailer;

static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Environment::Development,
            _ => Environment::Production,
        }
    }
}

/// Records the environment mode once at startup; later calls are ignored.
pub fn set_environment(environment: Environment) {
    let _ = ENVIRONMENT.set(environment);
}

/// Current environment mode, production until told otherwise.
pub fn environment() -> Environment {
    ENVIRONMENT.get().copied().unwrap_or(Environment::Production)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct JwtSettings {
    pub secret: String,
    pub expires_in: Duration,
    pub cookie_expires_in_days: i64,
}

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mongodb_uri: String,
    pub database_name: String,
    pub port: u16,
    pub environment: Environment,
    pub frontend_url: Option<String>,
    pub jwt: JwtSettings,
    pub email: EmailSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match optional("PORT") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                value,
            })?,
            None => 3000,
        };

        let expires_in = match optional("JWT_EXPIRES_IN") {
            Some(value) => parse_duration(&value).ok_or(ConfigError::Invalid {
                key: "JWT_EXPIRES_IN",
                value,
            })?,
            None => Duration::days(90),
        };

        let cookie_expires_in_days = match optional("JWT_COOKIE_EXPIRES_IN") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "JWT_COOKIE_EXPIRES_IN",
                value,
            })?,
            None => 90,
        };

        Ok(Config {
            mongodb_uri: required("MONGODB_URI")?,
            database_name: required("DATABASE_NAME")?,
            port,
            environment: optional("APP_ENV")
                .map(|value| Environment::parse(&value))
                .unwrap_or(Environment::Production),
            frontend_url: optional("FRONTEND_URL"),
            jwt: JwtSettings {
                secret: required("JWT_SECRET")?,
                expires_in,
                cookie_expires_in_days,
            },
            email: EmailSettings {
                api_url: optional("EMAIL_API_URL"),
                api_key: optional("EMAIL_API_KEY"),
                from: optional("EMAIL_FROM")
                    .unwrap_or_else(|| "Natours <no-reply@natours.io>".to_string()),
            },
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parses `90d`, `12h`, `30m`, `45s` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().last()? {
        (idx, c) if c.is_ascii_alphabetic() => (&value[..idx], Some(c)),
        _ => (value, None),
    };
    let amount: i64 = digits.trim().parse().ok()?;
    if amount <= 0 {
        return None;
    }

    match unit {
        None | Some('s') => Some(Duration::seconds(amount)),
        Some('m') => Some(Duration::minutes(amount)),
        Some('h') => Some(Duration::hours(amount)),
        Some('d') => Some(Duration::days(amount)),
        _ => None,
    }
}

/// Shared handler state: one database handle, the loaded config and the mailer.
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub mailer: Mailer,
}

pub async fn init_database(config: &Config) -> mongodb::error::Result<Database> {
    log::info!("Connecting to MongoDB database: {}", config.database_name);

    let client = Client::with_uri_str(&config.mongodb_uri).await?;
    let db = client.database(&config.database_name);

    match db.run_command(doc! { "ping": 1 }, None).await {
        Ok(_) => log::info!("Successfully connected to MongoDB"),
        Err(e) => log::error!("Failed to ping database: {}", e),
    }

    ensure_indexes(&db).await?;

    Ok(db)
}

async fn ensure_indexes(db: &Database) -> mongodb::error::Result<()> {
    let unique = || IndexOptions::builder().unique(true).build();

    db.collection::<mongodb::bson::Document>("tours")
        .create_index(
            IndexModel::builder()
                .keys(doc! { "name": 1 })
                .options(unique())
                .build(),
            None,
        )
        .await?;

    db.collection::<mongodb::bson::Document>("users")
        .create_index(
            IndexModel::builder()
                .keys(doc! { "email": 1 })
                .options(unique())
                .build(),
            None,
        )
        .await?;

    db.collection::<mongodb::bson::Document>("reviews")
        .create_index(IndexModel::builder().keys(doc! { "tour": 1 }).build(), None)
        .await?;

    log::info!("Database indexes are in place");
    Ok(())
}
