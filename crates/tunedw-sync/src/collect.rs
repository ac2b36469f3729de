//! Discovery fan-in, per-name enrichment and shaping into warehouse rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use strsim::jaro_winkler;
use tracing::{debug, warn};
use tunedw_adapters::{AdapterContext, AdapterError, DiscoverySource, EnrichmentSource};
use tunedw_core::{ArtistRecord, CatalogMatch, CollectStats, DiscoveredEntity, EnrichedEntity};

/// Result of enriching one discovered name.
#[derive(Debug)]
pub enum EnrichmentOutcome {
    Matched(CatalogMatch),
    NoMatch,
    Failed(AdapterError),
}

impl From<Result<Option<CatalogMatch>, AdapterError>> for EnrichmentOutcome {
    fn from(result: Result<Option<CatalogMatch>, AdapterError>) -> Self {
        match result {
            Ok(Some(found)) => Self::Matched(found),
            Ok(None) => Self::NoMatch,
            Err(err) => Self::Failed(err),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectOutcome {
    /// Ordered by canonical name.
    pub entities: Vec<EnrichedEntity>,
    pub stats: CollectStats,
}

/// Folds discoveries into one entry per name.
///
/// Names keep their first-seen position; the group is the one from the last
/// discovery of that name.
pub fn merge_discoveries(
    discovered: impl IntoIterator<Item = DiscoveredEntity>,
) -> Vec<DiscoveredEntity> {
    let mut merged: Vec<DiscoveredEntity> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for entity in discovered {
        match index.get(&entity.name) {
            Some(&i) => merged[i].group = entity.group,
            None => {
                index.insert(entity.name.clone(), merged.len());
                merged.push(entity);
            }
        }
    }
    merged
}

fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity between the queried name and the catalog's spelling, in `[0, 1]`.
pub fn match_confidence(queried: &str, canonical: &str) -> f64 {
    jaro_winkler(&normalize_name(queried), &normalize_name(canonical))
}

/// Projects enriched entities onto the persisted row shape.
pub fn shape(entities: Vec<EnrichedEntity>) -> Vec<ArtistRecord> {
    entities
        .into_iter()
        .map(|e| ArtistRecord::new(e.canonical_name, e.popularity, e.followers, e.group))
        .collect()
}

pub struct Collector {
    discovery: Arc<dyn DiscoverySource>,
    enrichment: Arc<dyn EnrichmentSource>,
    match_threshold: f64,
}

impl Collector {
    pub fn new(
        discovery: Arc<dyn DiscoverySource>,
        enrichment: Arc<dyn EnrichmentSource>,
        match_threshold: f64,
    ) -> Self {
        Self {
            discovery,
            enrichment,
            match_threshold,
        }
    }

    /// Discovers names per group, then enriches each unique name once.
    ///
    /// Calls are strictly sequential. A failed group or a failed lookup is
    /// logged, counted and skipped; nothing here aborts the run.
    pub async fn collect(
        &self,
        ctx: &AdapterContext,
        groups: &[String],
        per_group_limit: u32,
    ) -> CollectOutcome {
        let mut stats = CollectStats {
            groups_requested: groups.len(),
            ..Default::default()
        };

        let mut discovered = Vec::new();
        for group in groups {
            match self.discovery.discover(ctx, group, per_group_limit).await {
                Ok(names) => {
                    stats.discovered_names += names.len();
                    discovered.extend(names.into_iter().map(|name| DiscoveredEntity {
                        name,
                        group: group.clone(),
                    }));
                }
                Err(err) => {
                    stats.groups_failed += 1;
                    warn!(
                        group = group.as_str(),
                        source = self.discovery.source_id(),
                        error = %err,
                        "discovery failed; skipping group"
                    );
                }
            }
        }

        let unique = merge_discoveries(discovered);
        stats.unique_names = unique.len();

        let mut by_canonical: BTreeMap<String, EnrichedEntity> = BTreeMap::new();
        for entity in unique {
            let outcome = EnrichmentOutcome::from(self.enrichment.enrich(ctx, &entity.name).await);
            match outcome {
                EnrichmentOutcome::Matched(found) => {
                    stats.matched += 1;
                    let confidence = match_confidence(&entity.name, &found.name);
                    if confidence < self.match_threshold {
                        stats.low_confidence_matches += 1;
                        debug!(
                            queried = entity.name.as_str(),
                            canonical = found.name.as_str(),
                            confidence,
                            "low-confidence catalog match"
                        );
                    }
                    let enriched = EnrichedEntity::from_match(found, entity.group);
                    if let Some(previous) =
                        by_canonical.insert(enriched.canonical_name.clone(), enriched)
                    {
                        stats.canonical_collisions += 1;
                        debug!(
                            canonical = previous.canonical_name.as_str(),
                            replaced_group = previous.group.as_str(),
                            "canonical name collision; later result kept"
                        );
                    }
                }
                EnrichmentOutcome::NoMatch => {
                    stats.no_match += 1;
                    debug!(name = entity.name.as_str(), "no catalog match; dropped");
                }
                EnrichmentOutcome::Failed(err) => {
                    stats.enrichment_errors += 1;
                    warn!(
                        name = entity.name.as_str(),
                        source = self.enrichment.source_id(),
                        error = %err,
                        "enrichment failed; dropped"
                    );
                }
            }
        }

        CollectOutcome {
            entities: by_canonical.into_values().collect(),
            stats,
        }
    }
}
