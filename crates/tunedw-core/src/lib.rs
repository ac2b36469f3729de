//! Core data model shared by the discovery, enrichment and warehouse stages.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tunedw-core";

/// An artist name as returned by the discovery service, tagged with the group
/// (country) it was discovered under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredEntity {
    pub name: String,
    pub group: String,
}

/// First search candidate returned by the catalog service for a queried name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogMatch {
    pub name: String,
    pub popularity: i32,
    pub followers: i64,
    pub genres: BTreeSet<String>,
}

/// A discovered artist joined with its catalog metrics.
///
/// `canonical_name` is the catalog's spelling, which may differ from the name
/// that was queried. `group` always comes from the queried name's discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedEntity {
    pub canonical_name: String,
    pub popularity: i32,
    pub followers: i64,
    pub genres: BTreeSet<String>,
    pub group: String,
}

impl EnrichedEntity {
    pub fn from_match(catalog: CatalogMatch, group: impl Into<String>) -> Self {
        Self {
            canonical_name: catalog.name,
            popularity: catalog.popularity,
            followers: catalog.followers,
            genres: catalog.genres,
            group: group.into(),
        }
    }
}

/// Flat row persisted to the warehouse. `artist_name` is the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistRecord {
    pub artist_name: String,
    pub popularity: i32,
    pub followers: i64,
    pub country: String,
}

impl ArtistRecord {
    pub fn new(
        artist_name: impl Into<String>,
        popularity: i32,
        followers: i64,
        country: impl Into<String>,
    ) -> Self {
        Self {
            artist_name: artist_name.into(),
            popularity,
            followers,
            country: country.into(),
        }
    }
}

/// Counters gathered while collecting a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectStats {
    pub groups_requested: usize,
    pub groups_failed: usize,
    pub discovered_names: usize,
    pub unique_names: usize,
    pub matched: usize,
    pub no_match: usize,
    pub enrichment_errors: usize,
    pub canonical_collisions: usize,
    pub low_confidence_matches: usize,
}

/// Handoff payload between the fetch stage and the reconcile stage.
///
/// Owned by a single run and discarded once applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistBatch {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<ArtistRecord>,
    pub stats: CollectStats,
}

impl ArtistBatch {
    pub fn new(run_id: Uuid, records: Vec<ArtistRecord>, stats: CollectStats) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
            records,
            stats,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
