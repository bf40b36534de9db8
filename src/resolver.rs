use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::geocode::GeocodeClient;
use crate::model::{normalize_query, BoundaryCandidate, CachedQuery};
use crate::store::RegionRepository;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionStats {
    pub total: usize,
    pub cache_hits: usize,
    pub provider_calls: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub failed: usize,
}

/// Queries for one batch, keyed by normalized search string.
#[derive(Debug, Clone)]
pub struct QueryBatch {
    /// Distinct normalized strings in first-seen input order.
    pub order: Vec<String>,
    pub queries: HashMap<String, CachedQuery>,
    /// Strings whose provider request failed; nothing was cached for them.
    pub failed: Vec<String>,
    pub stats: ResolutionStats,
}

impl QueryBatch {
    pub fn ordered(&self) -> Vec<&CachedQuery> {
        self.order
            .iter()
            .filter_map(|query| self.queries.get(query))
            .collect()
    }
}

pub struct QueryResolver {
    repository: Arc<dyn RegionRepository>,
    client: GeocodeClient,
    guard: Arc<AsyncMutex<()>>,
}

impl QueryResolver {
    pub fn new(repository: Arc<dyn RegionRepository>, client: GeocodeClient) -> Self {
        Self {
            repository,
            client,
            guard: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Cache lookup, fetch on miss, then persist. Names already cached never
    /// reach the provider again, including ones that matched nothing. A failed
    /// lookup only fails the batch when no name in it could be answered.
    pub async fn resolve_queries(&self, query_strings: &[String]) -> AppResult<QueryBatch> {
        let _lock = self.guard.lock().await;
        let order = distinct_normalized(query_strings);
        let mut queries = self.repository.find_queries(&order)?;
        let misses: Vec<String> = order
            .iter()
            .filter(|query| !queries.contains_key(*query))
            .cloned()
            .collect();

        let mut stats = ResolutionStats {
            total: order.len(),
            cache_hits: order.len() - misses.len(),
            ..ResolutionStats::default()
        };
        let mut failed = Vec::new();

        if !misses.is_empty() {
            info!(
                target: "resolver",
                misses = misses.len(),
                concurrency = self.client.concurrency(),
                "querying geocoding provider"
            );
            let mut fetched = self.client.fetch_all(&misses).await;
            stats.provider_calls = misses.len();

            let mut fresh: Vec<(String, Vec<BoundaryCandidate>)> = Vec::with_capacity(misses.len());
            for query in &misses {
                match fetched.remove(query) {
                    Some(Ok(candidates)) => fresh.push((query.clone(), candidates)),
                    Some(Err(err)) => {
                        warn!(target: "resolver", query = %query, error = %err, "lookup failed; leaving uncached");
                        failed.push(query.clone());
                    }
                    None => failed.push(query.clone()),
                }
            }

            // With nothing cached and nothing fetched the provider is unreachable.
            if fresh.is_empty() && stats.cache_hits == 0 {
                return Err(AppError::ProviderUnavailable(format!(
                    "all {} lookups in the batch failed",
                    misses.len()
                )));
            }
            if !fresh.is_empty() {
                queries.extend(self.repository.record_queries(&fresh)?);
            }
        }

        stats.failed = failed.len();
        stats.resolved = queries.values().filter(|q| !q.is_unresolved()).count();
        stats.unresolved = queries.len() - stats.resolved;
        info!(
            target: "resolver",
            total = stats.total,
            cache_hits = stats.cache_hits,
            provider_calls = stats.provider_calls,
            resolved = stats.resolved,
            unresolved = stats.unresolved,
            failed = stats.failed,
            "batch resolved"
        );

        Ok(QueryBatch {
            order,
            queries,
            failed,
            stats,
        })
    }
}

fn distinct_normalized(query_strings: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    query_strings
        .iter()
        .filter_map(|raw| normalize_query(raw))
        .filter(|query| seen.insert(query.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use rusqlite::Connection;

    use super::*;
    use crate::db::open_in_memory;
    use crate::geocode::testing::{boundary, StaticLookup};
    use crate::geometry::SimplifyStrategy;
    use crate::store::SqliteRegionStore;

    fn resolver(lookup: Arc<StaticLookup>) -> (QueryResolver, Arc<SqliteRegionStore>) {
        let db: Arc<Mutex<Connection>> = Arc::new(Mutex::new(open_in_memory().unwrap()));
        let store = Arc::new(SqliteRegionStore::new(db));
        let client = GeocodeClient::with_lookup(lookup, SimplifyStrategy::default(), 12);
        (QueryResolver::new(store.clone(), client), store)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn second_resolution_is_served_from_cache() {
        let lookup = Arc::new(StaticLookup::default());
        lookup.respond("France", vec![boundary(1, 4, 0.9)]);
        let (resolver, _) = resolver(lookup.clone());

        let first = resolver.resolve_queries(&strings(&["France"])).await.unwrap();
        let second = resolver.resolve_queries(&strings(&["France"])).await.unwrap();

        assert_eq!(lookup.calls(), 1);
        assert_eq!(first.queries, second.queries);
        assert_eq!(first.stats.provider_calls, 1);
        assert_eq!(second.stats.cache_hits, 1);
        assert_eq!(second.stats.provider_calls, 0);
    }

    #[tokio::test]
    async fn unresolvable_name_is_not_fetched_twice() {
        let lookup = Arc::new(StaticLookup::default());
        lookup.respond("Atlantis", Vec::new());
        let (resolver, _) = resolver(lookup.clone());

        let first = resolver.resolve_queries(&strings(&["Atlantis"])).await.unwrap();
        assert!(first.queries["Atlantis"].is_unresolved());
        assert_eq!(first.stats.unresolved, 1);

        resolver.resolve_queries(&strings(&["Atlantis"])).await.unwrap();
        assert_eq!(lookup.calls(), 1);
    }

    #[tokio::test]
    async fn shared_boundary_is_identical_from_either_query() {
        let lookup = Arc::new(StaticLookup::default());
        lookup.respond("Georgia", vec![boundary(28699, 4, 0.8), boundary(161957, 8, 0.7)]);
        lookup.respond("Georgia USA", vec![boundary(161957, 8, 0.9)]);
        let (resolver, store) = resolver(lookup.clone());

        resolver.resolve_queries(&strings(&["Georgia"])).await.unwrap();
        let before = store.region_by_id(161957).unwrap().unwrap();
        let batch = resolver
            .resolve_queries(&strings(&["Georgia USA"]))
            .await
            .unwrap();

        assert_eq!(batch.queries["Georgia USA"].links[0].region, before);
        assert_eq!(batch.queries["Georgia USA"].links[0].importance, 0.9);
        assert_eq!(store.region_by_id(161957).unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn failed_lookup_is_retried_in_a_later_batch() {
        let lookup = Arc::new(StaticLookup::default());
        lookup.respond("Chile", vec![boundary(3, 4, 0.6)]);
        lookup.respond("Peru", vec![boundary(4, 4, 0.6)]);
        lookup.fail("Peru");
        let (resolver, _) = resolver(lookup.clone());

        let first = resolver
            .resolve_queries(&strings(&["Chile", "Peru"]))
            .await
            .unwrap();
        assert_eq!(first.failed, vec!["Peru".to_string()]);
        assert!(!first.queries.contains_key("Peru"));
        assert_eq!(first.stats.failed, 1);

        resolver.resolve_queries(&strings(&["Peru"])).await.unwrap_err();
        assert_eq!(lookup.calls(), 3);
    }

    #[tokio::test]
    async fn failed_miss_keeps_cache_hits_in_the_batch() {
        let lookup = Arc::new(StaticLookup::default());
        lookup.respond("Chile", vec![boundary(3, 4, 0.6)]);
        lookup.fail("Bolivia");
        let (resolver, _) = resolver(lookup.clone());

        resolver.resolve_queries(&strings(&["Chile"])).await.unwrap();
        let batch = resolver
            .resolve_queries(&strings(&["Chile", "Bolivia"]))
            .await
            .unwrap();

        assert_eq!(batch.failed, vec!["Bolivia".to_string()]);
        assert_eq!(batch.ordered().len(), 1);
        assert!(!batch.queries["Chile"].is_unresolved());
        assert_eq!(batch.stats.cache_hits, 1);
        assert_eq!(batch.stats.failed, 1);
        assert_eq!(lookup.calls(), 2);
    }

    #[tokio::test]
    async fn every_lookup_failing_is_a_hard_error() {
        let lookup = Arc::new(StaticLookup::default());
        lookup.fail("Nowhere");
        let (resolver, _) = resolver(lookup);

        let err = resolver
            .resolve_queries(&strings(&["Nowhere"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn normalizes_and_dedupes_input() {
        let lookup = Arc::new(StaticLookup::default());
        lookup.respond("New South Wales", vec![boundary(2316593, 8, 0.7)]);
        let (resolver, _) = resolver(lookup.clone());

        let batch = resolver
            .resolve_queries(&strings(&[" New South  Wales", "", "New South Wales ", "   "]))
            .await
            .unwrap();

        assert_eq!(lookup.calls(), 1);
        assert_eq!(batch.order, vec!["New South Wales".to_string()]);
        assert_eq!(batch.ordered().len(), 1);
        assert_eq!(batch.stats.total, 1);
    }
}
