//! Picks one administrative level for a whole batch, then one region per query.
//!
//! Spreadsheets usually name places at a single granularity, so the rank that
//! the most queries can resolve to is taken as the intended one.

use std::collections::{BTreeSet, HashMap};

use crate::model::{CachedQuery, Region, RegionLink};

/// Most common rank across the batch, counting each distinct rank once per
/// query. Ties go to the rank seen first when walking `queries` in order and
/// each query's ranks in ascending order.
pub fn modal_rank<'a, I>(queries: I) -> Option<i64>
where
    I: IntoIterator<Item = &'a CachedQuery>,
{
    let mut tally: Vec<(i64, usize)> = Vec::new();
    let mut slots: HashMap<i64, usize> = HashMap::new();
    for query in queries {
        let ranks: BTreeSet<i64> = query.links.iter().map(|link| link.region.place_rank).collect();
        for rank in ranks {
            let slot = *slots.entry(rank).or_insert_with(|| {
                tally.push((rank, 0));
                tally.len() - 1
            });
            tally[slot].1 += 1;
        }
    }

    let mut best: Option<(i64, usize)> = None;
    for (rank, votes) in tally {
        if best.map_or(true, |(_, top)| votes > top) {
            best = Some((rank, votes));
        }
    }
    best.map(|(rank, _)| rank)
}

/// Highest-importance link at `target_rank`, else the highest-importance link
/// overall. Equal importances keep the earlier link.
pub fn best_region(query: &CachedQuery, target_rank: Option<i64>) -> Option<&Region> {
    let at_target = target_rank.and_then(|rank| {
        most_important(query.links.iter().filter(|link| link.region.place_rank == rank))
    });
    at_target
        .or_else(|| most_important(query.links.iter()))
        .map(|link| &link.region)
}

fn most_important<'a>(links: impl Iterator<Item = &'a RegionLink>) -> Option<&'a RegionLink> {
    links.fold(None, |best: Option<&RegionLink>, link| match best {
        Some(current) if current.importance >= link.importance => Some(current),
        _ => Some(link),
    })
}

/// Result of consensus over one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub target_rank: Option<i64>,
    pub regions: HashMap<String, Option<Region>>,
}

pub fn select_regions(queries: &[&CachedQuery]) -> Selection {
    let target_rank = modal_rank(queries.iter().copied());
    let regions = queries
        .iter()
        .map(|query| {
            (
                query.search_string.clone(),
                best_region(query, target_rank).cloned(),
            )
        })
        .collect();
    Selection {
        target_rank,
        regions,
    }
}
