//! Connector contracts for the discovery and enrichment services.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tunedw_core::CatalogMatch;
use tunedw_storage::FetchError;
use uuid::Uuid;

mod musicbrainz;
mod spotify;
#[cfg(test)]
mod stub_server;

pub use musicbrainz::{
    musicbrainz_rate_limit, parse_discovery_response, MusicBrainzDiscovery, MUSICBRAINZ_MAX_LIMIT,
    MUSICBRAINZ_SOURCE_ID,
};
pub use spotify::{
    parse_search_response, parse_token_response, SpotifyCatalog, SpotifyCredentials,
    SPOTIFY_MAX_SEARCH_LIMIT, SPOTIFY_SOURCE_ID,
};

pub const CRATE_NAME: &str = "tunedw-adapters";

/// Per-run context threaded through every connector call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {source_id} response: {source}")]
    Parse {
        source_id: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
}

/// Looks up entity names for a group (a country).
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn discover(
        &self,
        ctx: &AdapterContext,
        group: &str,
        limit: u32,
    ) -> Result<Vec<String>, AdapterError>;
}

/// Resolves a name against the catalog. The first search candidate is the match.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn enrich(
        &self,
        ctx: &AdapterContext,
        name: &str,
    ) -> Result<Option<CatalogMatch>, AdapterError>;
}

pub(crate) fn parse_json<T: DeserializeOwned>(
    source_id: &'static str,
    body: &[u8],
) -> Result<T, AdapterError> {
    serde_json::from_slice(body).map_err(|source| AdapterError::Parse { source_id, source })
}
