use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use tunedw_storage::{HttpFetcher, TokenBucketConfig};

use crate::{parse_json, AdapterContext, AdapterError, DiscoverySource};

pub const MUSICBRAINZ_SOURCE_ID: &str = "musicbrainz";

/// Largest page the search endpoint will return.
pub const MUSICBRAINZ_MAX_LIMIT: u32 = 100;

const DEFAULT_BASE_URL: &str = "https://musicbrainz.org";

/// MusicBrainz allows one request per second per client.
pub fn musicbrainz_rate_limit() -> TokenBucketConfig {
    TokenBucketConfig::one_per(Duration::from_secs(1))
}

#[derive(Debug, Deserialize)]
struct ArtistSearchResponse {
    artists: Vec<ArtistSearchHit>,
}

#[derive(Debug, Deserialize)]
struct ArtistSearchHit {
    name: String,
}

/// Extracts artist names from a `/ws/2/artist` JSON search response.
pub fn parse_discovery_response(body: &[u8]) -> Result<Vec<String>, AdapterError> {
    let response: ArtistSearchResponse = parse_json(MUSICBRAINZ_SOURCE_ID, body)?;
    Ok(response.artists.into_iter().map(|hit| hit.name).collect())
}

/// Lucene query matching artists whose area is `group`. Quoted so multi-word
/// countries match as a phrase.
fn area_query(group: &str) -> String {
    format!("area:\"{}\"", group.trim().replace('"', "\\\""))
}

#[derive(Debug, Clone)]
pub struct MusicBrainzDiscovery {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl MusicBrainzDiscovery {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(http, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl DiscoverySource for MusicBrainzDiscovery {
    fn source_id(&self) -> &'static str {
        MUSICBRAINZ_SOURCE_ID
    }

    async fn discover(
        &self,
        ctx: &AdapterContext,
        group: &str,
        limit: u32,
    ) -> Result<Vec<String>, AdapterError> {
        if group.trim().is_empty() {
            return Err(AdapterError::InvalidInput("group must not be empty".into()));
        }
        if limit == 0 {
            return Err(AdapterError::InvalidInput("limit must be positive".into()));
        }

        let query = area_query(group);
        let limit = limit.min(MUSICBRAINZ_MAX_LIMIT).to_string();
        let request = self
            .http
            .client()
            .get(format!("{}/ws/2/artist", self.base_url))
            .query(&[
                ("query", query.as_str()),
                ("limit", limit.as_str()),
                ("fmt", "json"),
            ]);

        let response = self
            .http
            .send(ctx.run_id, MUSICBRAINZ_SOURCE_ID, request)
            .await?;
        let names = parse_discovery_response(&response.body)?;
        debug!(group, found = names.len(), "musicbrainz discovery");
        Ok(names)
    }
}
