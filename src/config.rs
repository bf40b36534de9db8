use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::geometry::SimplifyStrategy;

const DEFAULT_GEOCODER_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_GEOCODE_CONCURRENCY: usize = 12;
const MAX_GEOCODE_CONCURRENCY: usize = 64;
const DEFAULT_SAMPLE_LIMIT: usize = 150;
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub geocoder_endpoint: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_user_agent: String,
    pub geocode_concurrency: usize,
    pub geocode_result_limit: u32,
    pub geocode_timeout_secs: u64,
    pub simplify_strategy: SimplifyStrategy,
    pub telemetry_enabled: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub database_file_name: String,
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub geocode_concurrency: usize,
    pub geocode_result_limit: u32,
    pub geocode_timeout_secs: u64,
    pub simplify_strategy: String,
    pub telemetry_enabled: bool,
    pub has_geocoder_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            data_dir: env::var("REGION_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "region-cache.db".to_string()),
            geocoder_endpoint: env::var("GEOCODER_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODER_ENDPOINT.to_string()),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT").unwrap_or_else(|_| {
                format!("region-resolver/{}", env!("CARGO_PKG_VERSION"))
            }),
            geocode_concurrency: parse_usize("GEOCODE_CONCURRENCY", DEFAULT_GEOCODE_CONCURRENCY)
                .clamp(1, MAX_GEOCODE_CONCURRENCY),
            geocode_result_limit: parse_u32("GEOCODE_RESULT_LIMIT", 5).max(1),
            geocode_timeout_secs: parse_u64("GEOCODE_TIMEOUT_SECS", 30).max(1),
            simplify_strategy: parse_strategy(),
            telemetry_enabled: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", 25).max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            geocoder_user_agent: self.geocoder_user_agent.clone(),
            geocode_concurrency: self.geocode_concurrency,
            geocode_result_limit: self.geocode_result_limit,
            geocode_timeout_secs: self.geocode_timeout_secs,
            simplify_strategy: self.simplify_strategy.as_str().to_string(),
            telemetry_enabled: self.telemetry_enabled,
            has_geocoder_key: self.geocoder_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_strategy() -> SimplifyStrategy {
    let limit = parse_usize("SIMPLIFY_SAMPLE_LIMIT", DEFAULT_SAMPLE_LIMIT).max(1);
    match env::var("SIMPLIFY_STRATEGY") {
        Ok(value) => SimplifyStrategy::parse(&value, limit).unwrap_or_else(|| {
            debug!(value, "unknown simplify strategy; using quantize");
            SimplifyStrategy::default()
        }),
        Err(_) => SimplifyStrategy::default(),
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
