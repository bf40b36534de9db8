use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geometry::SimplifyStrategy;
use crate::model::{BoundaryCandidate, BoundingBox};

const BOUNDARY_CATEGORY: &str = "boundary";

/// Outcome of one provider request, keyed back to its query string.
pub type FetchOutcome = AppResult<Vec<BoundaryCandidate>>;

#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    /// Raw provider candidates for one free-text query.
    async fn search(&self, query: &str) -> AppResult<Vec<Value>>;
}

#[derive(Clone)]
pub struct GeocodeClient {
    lookup: Arc<dyn GeocodeLookup>,
    strategy: SimplifyStrategy,
    concurrency: usize,
}

impl GeocodeClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let lookup = HttpGeocoder::new(config)?;
        Ok(Self::with_lookup(
            Arc::new(lookup),
            config.simplify_strategy,
            config.geocode_concurrency,
        ))
    }

    pub fn with_lookup(
        lookup: Arc<dyn GeocodeLookup>,
        strategy: SimplifyStrategy,
        concurrency: usize,
    ) -> Self {
        Self {
            lookup,
            strategy,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Issues one request per query with at most `concurrency` in flight.
    /// Completions arrive in any order; each carries its query string so the
    /// result map never depends on position.
    pub async fn fetch_all(&self, queries: &[String]) -> HashMap<String, FetchOutcome> {
        let lookup = &self.lookup;
        let strategy = self.strategy;
        stream::iter(queries.iter().cloned().map(|query| async move {
            let outcome = lookup
                .search(&query)
                .await
                .map(|records| normalize_candidates(&query, records, &strategy));
            trace!(target: "geocode", query = %query, ok = outcome.is_ok(), "lookup completed");
            (query, outcome)
        }))
        .buffer_unordered(self.concurrency)
        .collect::<HashMap<_, _>>()
        .await
    }
}

/// Keeps administrative boundaries and turns each into a fixed-shape record.
/// Candidates that fail validation are dropped individually.
pub fn normalize_candidates(
    query: &str,
    records: Vec<Value>,
    strategy: &SimplifyStrategy,
) -> Vec<BoundaryCandidate> {
    let total = records.len();
    let candidates: Vec<BoundaryCandidate> = records
        .into_iter()
        .filter(|record| {
            record.get("category").and_then(Value::as_str) == Some(BOUNDARY_CATEGORY)
        })
        .filter_map(|record| match parse_candidate(record, strategy) {
            Ok(candidate) => Some(candidate),
            Err(err) => {
                warn!(target: "geocode", query, error = %err, "dropping boundary candidate");
                None
            }
        })
        .collect();
    debug!(
        target: "geocode",
        query,
        total,
        boundaries = candidates.len(),
        "normalized provider response"
    );
    candidates
}

fn parse_candidate(record: Value, strategy: &SimplifyStrategy) -> AppResult<BoundaryCandidate> {
    let raw: ProviderRecord = serde_json::from_value(record)
        .map_err(|err| AppError::Parse(format!("malformed candidate: {err}")))?;

    let importance = raw.importance.as_f64("importance")?;
    if importance < 0.0 {
        return Err(AppError::Parse(format!(
            "importance must be non-negative, got {importance}"
        )));
    }
    let [bottom, top, left, right] = raw.boundingbox;
    let simple_path = strategy.simplify_svg(&raw.svg)?;

    Ok(BoundaryCandidate {
        osm_id: raw.osm_id.as_i64("osm_id")?,
        name: raw.display_name,
        place_rank: raw.place_rank.as_i64("place_rank")?,
        simple_path: Some(simple_path).filter(|path| !path.is_empty()),
        lat: raw.lat.as_f64("lat")?,
        lon: raw.lon.as_f64("lon")?,
        bounding_box: BoundingBox::new(
            bottom.as_f64("boundingbox")?,
            top.as_f64("boundingbox")?,
            left.as_f64("boundingbox")?,
            right.as_f64("boundingbox")?,
        ),
        importance,
    })
}

#[derive(Deserialize)]
struct ProviderRecord {
    osm_id: Numeric,
    display_name: String,
    place_rank: Numeric,
    lat: Numeric,
    lon: Numeric,
    boundingbox: [Numeric; 4],
    importance: Numeric,
    svg: String,
}

/// Nominatim sends some numbers as JSON strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Numeric {
    fn as_f64(&self, field: &str) -> AppResult<f64> {
        let value = match self {
            Numeric::Integer(value) => Some(*value as f64),
            Numeric::Float(value) => Some(*value),
            Numeric::Text(text) => text.trim().parse::<f64>().ok(),
        };
        value
            .filter(|value| value.is_finite())
            .ok_or_else(|| AppError::Parse(format!("`{field}` is not a finite number")))
    }

    fn as_i64(&self, field: &str) -> AppResult<i64> {
        let value = match self {
            Numeric::Integer(value) => Some(*value),
            Numeric::Float(value) if value.fract() == 0.0 && in_i64_range(*value) => {
                Some(*value as i64)
            }
            Numeric::Float(_) => None,
            Numeric::Text(text) => text.trim().parse::<i64>().ok(),
        };
        value.ok_or_else(|| AppError::Parse(format!("`{field}` is not an integer")))
    }
}

fn in_i64_range(value: f64) -> bool {
    // i64::MAX rounds up to 2^63 as f64, so the upper bound is exclusive
    value >= i64::MIN as f64 && value < i64::MAX as f64
}

/// Nominatim-compatible search endpoint.
pub struct HttpGeocoder {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    limit: u32,
}

impl HttpGeocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        reqwest::Url::parse(&config.geocoder_endpoint).map_err(|err| {
            AppError::Config(format!(
                "invalid geocoder endpoint `{}`: {err}",
                config.geocoder_endpoint
            ))
        })?;
        let http = reqwest::Client::builder()
            .user_agent(config.geocoder_user_agent.clone())
            .timeout(Duration::from_secs(config.geocode_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.geocoder_endpoint.clone(),
            api_key: config.geocoder_api_key.clone(),
            limit: config.geocode_result_limit,
        })
    }
}

#[async_trait]
impl GeocodeLookup for HttpGeocoder {
    async fn search(&self, query: &str) -> AppResult<Vec<Value>> {
        let mut request = self
            .http
            .get(&self.endpoint)
            .query(&[("format", "jsonv2"), ("q", query), ("polygon_svg", "1")])
            .query(&[("limit", self.limit)]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.expose_secret())]);
        }

        let response = request.send().await?.error_for_status()?;
        let records: Vec<Value> = response.json().await?;
        Ok(records)
    }
}
