use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use tracing::debug;

use crate::errors::AppResult;
use crate::model::{BoundaryCandidate, CachedQuery, Region, RegionLink};

const IN_CLAUSE_CHUNK: usize = 500;

/// Persistent cache of regions and resolved queries.
pub trait RegionRepository: Send + Sync {
    /// Cached queries for the given (normalized) search strings; misses are absent.
    fn find_queries(&self, search_strings: &[String]) -> AppResult<HashMap<String, CachedQuery>>;

    /// Stores each candidate's region unless its provider ID is already cached.
    /// Existing rows are never overwritten.
    fn upsert_regions(&self, candidates: &[BoundaryCandidate]) -> AppResult<HashMap<i64, Region>>;

    /// Persists regions, queries and links for a batch of fresh lookups as one
    /// transaction and returns the stored queries.
    fn record_queries(
        &self,
        resolved: &[(String, Vec<BoundaryCandidate>)],
    ) -> AppResult<HashMap<String, CachedQuery>>;

    fn region_by_id(&self, osm_id: i64) -> AppResult<Option<Region>>;
}

#[derive(Clone)]
pub struct SqliteRegionStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRegionStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

impl RegionRepository for SqliteRegionStore {
    fn find_queries(&self, search_strings: &[String]) -> AppResult<HashMap<String, CachedQuery>> {
        let conn = self.db.lock();
        load_queries(&conn, search_strings)
    }

    fn upsert_regions(&self, candidates: &[BoundaryCandidate]) -> AppResult<HashMap<i64, Region>> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let regions = upsert_in(&tx, candidates)?;
        tx.commit()?;
        Ok(regions)
    }

    fn record_queries(
        &self,
        resolved: &[(String, Vec<BoundaryCandidate>)],
    ) -> AppResult<HashMap<String, CachedQuery>> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let all_candidates: Vec<BoundaryCandidate> = resolved
            .iter()
            .flat_map(|(_, candidates)| candidates.iter().cloned())
            .collect();
        upsert_in(&tx, &all_candidates)?;
        let created = insert_queries(&tx, resolved)?;
        tx.commit()?;

        debug!(
            target: "region_store",
            queries = created,
            candidates = all_candidates.len(),
            "recorded query batch"
        );

        let search_strings: Vec<String> = resolved.iter().map(|(query, _)| query.clone()).collect();
        load_queries(&conn, &search_strings)
    }

    fn region_by_id(&self, osm_id: i64) -> AppResult<Option<Region>> {
        let conn = self.db.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM region WHERE osm_id = ?1",
                [osm_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload
            .map(|text| serde_json::from_str::<Region>(&text))
            .transpose()?)
    }
}

fn upsert_in(tx: &Transaction<'_>, candidates: &[BoundaryCandidate]) -> AppResult<HashMap<i64, Region>> {
    let mut insert = tx.prepare_cached(
        "INSERT INTO region (osm_id, place_rank, importance, payload)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(osm_id) DO NOTHING",
    )?;
    let mut existing = tx.prepare_cached("SELECT payload FROM region WHERE osm_id = ?1")?;

    let mut regions = HashMap::with_capacity(candidates.len());
    let mut created = 0_usize;
    for candidate in candidates {
        if regions.contains_key(&candidate.osm_id) {
            continue;
        }
        let region = Region::from(candidate);
        let inserted = insert.execute(params![
            region.osm_id,
            region.place_rank,
            region.importance,
            serde_json::to_string(&region)?
        ])?;
        let region = if inserted == 1 {
            created += 1;
            region
        } else {
            let payload: String = existing.query_row([candidate.osm_id], |row| row.get(0))?;
            serde_json::from_str(&payload)?
        };
        regions.insert(region.osm_id, region);
    }

    debug!(
        target: "region_store",
        created,
        reused = regions.len() - created,
        "upserted regions"
    );
    Ok(regions)
}

fn insert_queries(
    tx: &Transaction<'_>,
    resolved: &[(String, Vec<BoundaryCandidate>)],
) -> AppResult<usize> {
    let mut lookup = tx.prepare_cached("SELECT id FROM query WHERE search_string = ?1")?;
    let mut insert = tx.prepare_cached("INSERT INTO query (search_string) VALUES (?1)")?;
    let mut link = tx.prepare_cached(
        "INSERT INTO query_region (query_id, region_osm_id, importance)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(query_id, region_osm_id) DO NOTHING",
    )?;

    let mut created = 0;
    for (search_string, candidates) in resolved {
        let known: Option<i64> = lookup
            .query_row([search_string], |row| row.get(0))
            .optional()?;
        if known.is_some() {
            continue;
        }
        insert.execute([search_string])?;
        let query_id = tx.last_insert_rowid();
        for candidate in candidates {
            link.execute(params![query_id, candidate.osm_id, candidate.importance])?;
        }
        created += 1;
    }
    Ok(created)
}

fn load_queries(
    conn: &Connection,
    search_strings: &[String],
) -> AppResult<HashMap<String, CachedQuery>> {
    let mut found: HashMap<String, CachedQuery> = HashMap::new();
    for chunk in search_strings.chunks(IN_CLAUSE_CHUNK) {
        let sql = format!(
            "SELECT id, search_string FROM query WHERE search_string IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, search_string) in rows {
            found.insert(
                search_string.clone(),
                CachedQuery {
                    id,
                    search_string,
                    links: Vec::new(),
                },
            );
        }
    }

    let by_id: HashMap<i64, String> = found
        .values()
        .map(|query| (query.id, query.search_string.clone()))
        .collect();
    let ids: Vec<i64> = by_id.keys().copied().collect();
    for chunk in ids.chunks(IN_CLAUSE_CHUNK) {
        let sql = format!(
            "SELECT qr.query_id, qr.importance, r.payload
            FROM query_region qr
            JOIN region r ON r.osm_id = qr.region_osm_id
            WHERE qr.query_id IN ({})
            ORDER BY qr.rowid ASC",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (query_id, importance, payload) in rows {
            let region: Region = serde_json::from_str(&payload)?;
            if let Some(query) = by_id.get(&query_id).and_then(|key| found.get_mut(key)) {
                query.links.push(RegionLink { region, importance });
            }
        }
    }

    Ok(found)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
