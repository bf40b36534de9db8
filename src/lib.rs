mod config;
mod consensus;
mod db;
mod errors;
mod geocode;
mod geometry;
mod ingestion;
mod model;
mod resolver;
mod store;
mod telemetry;

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::consensus::{best_region, modal_rank, select_regions, Selection};
pub use crate::db::{bootstrap, open_in_memory, DatabaseBootstrap, DatabaseContext};
pub use crate::errors::{AppError, AppResult};
pub use crate::geocode::{normalize_candidates, GeocodeClient, GeocodeLookup, HttpGeocoder};
pub use crate::geometry::{Outline, Point, Segment, SimplifyStrategy};
pub use crate::ingestion::{read_query_column, QueryColumn};
pub use crate::model::{
    batch_bounding_box, normalize_query, BoundaryCandidate, BoundingBox, CachedQuery, Region,
    RegionLink,
};
pub use crate::resolver::{QueryBatch, QueryResolver, ResolutionStats};
pub use crate::store::{RegionRepository, SqliteRegionStore};
pub use crate::telemetry::TelemetryClient;

/// Best region per query for one batch, ready to serialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedRegions {
    pub target_rank: Option<i64>,
    pub regions: HashMap<String, Option<Region>>,
    pub stats: ResolutionStats,
}

impl ResolvedRegions {
    /// Looks up a raw sheet value the same way it was normalized for resolution.
    pub fn region_for(&self, raw: &str) -> Option<&Region> {
        normalize_query(raw)
            .and_then(|query| self.regions.get(&query))
            .and_then(Option::as_ref)
    }

    pub fn bounding_box(&self) -> AppResult<BoundingBox> {
        batch_bounding_box(self.regions.values().flatten())
    }
}

pub struct RegionService {
    resolver: QueryResolver,
    repository: Arc<dyn RegionRepository>,
    telemetry: Option<TelemetryClient>,
}

impl RegionService {
    /// Opens the on-disk cache under `config.data_dir` and the HTTP provider.
    pub fn open(config: &AppConfig) -> AppResult<Self> {
        let DatabaseBootstrap {
            context: DatabaseContext { connection, .. },
            recovered,
        } = bootstrap(&config.data_dir, &config.database_file_name)?;
        let repository: Arc<dyn RegionRepository> =
            Arc::new(SqliteRegionStore::new(Arc::new(Mutex::new(connection))));
        let client = GeocodeClient::new(config)?;
        let telemetry = TelemetryClient::new(&config.data_dir, config)?;

        if let Err(err) = telemetry.record(
            "cache_open",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "recovered": recovered,
                "strategy": config.simplify_strategy.as_str(),
            }),
        ) {
            warn!(?err, "failed to queue telemetry bootstrap event");
        }

        Ok(Self::with_parts(repository, client, Some(telemetry)))
    }

    pub fn with_parts(
        repository: Arc<dyn RegionRepository>,
        client: GeocodeClient,
        telemetry: Option<TelemetryClient>,
    ) -> Self {
        Self {
            resolver: QueryResolver::new(Arc::clone(&repository), client),
            repository,
            telemetry,
        }
    }

    /// Resolves a column of place names to one region each. Names the provider
    /// could not match, or whose lookup failed, map to `None`.
    pub async fn resolve(&self, query_strings: &[String]) -> AppResult<ResolvedRegions> {
        let batch = self.resolver.resolve_queries(query_strings).await?;
        let Selection {
            target_rank,
            mut regions,
        } = select_regions(&batch.ordered());
        for query in &batch.failed {
            regions.insert(query.clone(), None);
        }

        self.record_batch(&batch.stats, target_rank);
        Ok(ResolvedRegions {
            target_rank,
            regions,
            stats: batch.stats,
        })
    }

    pub fn region_by_id(&self, osm_id: i64) -> AppResult<Option<Region>> {
        self.repository.region_by_id(osm_id)
    }

    fn record_batch(&self, stats: &ResolutionStats, target_rank: Option<i64>) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let recorded = telemetry
            .record(
                "resolve_batch",
                json!({ "stats": stats, "target_rank": target_rank }),
            )
            .and_then(|_| telemetry.flush());
        if let Err(err) = recorded {
            warn!(?err, "failed to record batch telemetry");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,region_resolver=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
