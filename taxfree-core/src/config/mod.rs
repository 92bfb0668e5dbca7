use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use secrecy::Secret;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Sections shared by every service configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct CommonConfig {
    pub service_name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// OTLP collector endpoint; tracing stays local when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

/// Load a typed configuration from the optional `configuration` file plus
/// `APP__`-prefixed environment variables (double underscore separates
/// nesting levels, e.g. `APP__DATABASE__URL`).
pub fn load<T: DeserializeOwned>() -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::with_name("configuration").required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    Ok(config.try_deserialize()?)
}
