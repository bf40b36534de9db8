use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// Bounds in provider order: south, north, west, east.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub bottom: f64,
    pub top: f64,
    pub left: f64,
    pub right: f64,
}

impl BoundingBox {
    pub fn new(bottom: f64, top: f64, left: f64, right: f64) -> Self {
        Self {
            bottom,
            top,
            left,
            right,
        }
    }

    pub fn union(self, other: BoundingBox) -> Self {
        Self {
            bottom: self.bottom.min(other.bottom),
            top: self.top.max(other.top),
            left: self.left.min(other.left),
            right: self.right.max(other.right),
        }
    }
}

/// A boundary record as normalized from one provider candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryCandidate {
    pub osm_id: i64,
    pub name: String,
    pub place_rank: i64,
    pub simple_path: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub bounding_box: BoundingBox,
    pub importance: f64,
}

/// A cached administrative boundary, keyed by its provider ID.
///
/// `importance` is the value recorded when the region was first stored; the
/// per-query weight lives on [`RegionLink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub osm_id: i64,
    pub name: String,
    pub place_rank: i64,
    pub simple_path: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub bounding_box: BoundingBox,
    pub importance: f64,
}

impl From<&BoundaryCandidate> for Region {
    fn from(candidate: &BoundaryCandidate) -> Self {
        Self {
            osm_id: candidate.osm_id,
            name: candidate.name.clone(),
            place_rank: candidate.place_rank,
            simple_path: candidate.simple_path.clone(),
            lat: candidate.lat,
            lon: candidate.lon,
            bounding_box: candidate.bounding_box,
            importance: candidate.importance,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionLink {
    pub region: Region,
    pub importance: f64,
}

/// A resolved search string and the regions it plausibly names, in the order
/// the provider ranked them.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub id: i64,
    pub search_string: String,
    pub links: Vec<RegionLink>,
}

impl CachedQuery {
    pub fn is_unresolved(&self) -> bool {
        self.links.is_empty()
    }
}

/// Trims and collapses whitespace. Returns `None` for blank input.
pub fn normalize_query(raw: &str) -> Option<String> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

pub fn batch_bounding_box<'a, I>(regions: I) -> AppResult<BoundingBox>
where
    I: IntoIterator<Item = &'a Region>,
{
    regions
        .into_iter()
        .map(|region| region.bounding_box)
        .reduce(BoundingBox::union)
        .ok_or(AppError::EmptyRegionSet)
}
