use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;
use tunedw_core::CatalogMatch;
use tunedw_storage::HttpFetcher;

use crate::{parse_json, AdapterContext, AdapterError, EnrichmentSource};

pub const SPOTIFY_SOURCE_ID: &str = "spotify";

/// Upper bound the search endpoint accepts for `limit`.
pub const SPOTIFY_MAX_SEARCH_LIMIT: u32 = 50;

const DEFAULT_API_BASE: &str = "https://api.spotify.com";
const DEFAULT_ACCOUNTS_BASE: &str = "https://accounts.spotify.com";

/// Tokens are refreshed this long before the server-side expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for SpotifyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpotifyCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl SpotifyCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Reads `SPOTIFY_CLIENT_ID` and `SPOTIFY_CLIENT_SECRET`.
    pub fn from_env() -> Result<Self, AdapterError> {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AdapterError::Auth(format!("{key} is not set")))
        };
        Ok(Self::new(
            read("SPOTIFY_CLIENT_ID")?,
            read("SPOTIFY_CLIENT_SECRET")?,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    artists: ArtistPage,
}

#[derive(Debug, Deserialize)]
struct ArtistPage {
    items: Vec<ArtistItem>,
}

#[derive(Debug, Deserialize)]
struct ArtistItem {
    name: String,
    #[serde(default)]
    popularity: i32,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    followers: Followers,
}

#[derive(Debug, Default, Deserialize)]
struct Followers {
    #[serde(default)]
    total: i64,
}

/// Access token and how long it stays valid, from a client-credentials response.
pub fn parse_token_response(body: &[u8]) -> Result<(String, Duration), AdapterError> {
    let token: TokenResponse = parse_json(SPOTIFY_SOURCE_ID, body)?;
    Ok((token.access_token, Duration::from_secs(token.expires_in)))
}

/// First artist candidate of a search response, if any.
pub fn parse_search_response(body: &[u8]) -> Result<Option<CatalogMatch>, AdapterError> {
    let response: SearchResponse = parse_json(SPOTIFY_SOURCE_ID, body)?;
    Ok(response.artists.items.into_iter().next().map(|item| CatalogMatch {
        name: item.name,
        popularity: item.popularity.max(0),
        followers: item.followers.total.max(0),
        genres: item.genres.into_iter().collect(),
    }))
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Catalog search client authenticated with the client-credentials flow.
///
/// The token lives inside the instance; build one client per pipeline and pass it
/// where it is needed.
#[derive(Debug)]
pub struct SpotifyCatalog {
    http: Arc<HttpFetcher>,
    credentials: SpotifyCredentials,
    api_base: String,
    accounts_base: String,
    search_limit: u32,
    token: Mutex<Option<CachedToken>>,
}

impl SpotifyCatalog {
    pub fn new(http: Arc<HttpFetcher>, credentials: SpotifyCredentials) -> Self {
        Self {
            http,
            credentials,
            api_base: DEFAULT_API_BASE.to_string(),
            accounts_base: DEFAULT_ACCOUNTS_BASE.to_string(),
            search_limit: 10,
            token: Mutex::new(None),
        }
    }

    pub fn with_endpoints(
        mut self,
        api_base: impl Into<String>,
        accounts_base: impl Into<String>,
    ) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self.accounts_base = accounts_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_search_limit(mut self, limit: u32) -> Self {
        self.search_limit = limit.clamp(1, SPOTIFY_MAX_SEARCH_LIMIT);
        self
    }

    async fn access_token(&self, ctx: &AdapterContext) -> Result<String, AdapterError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let request = self
            .http
            .client()
            .post(format!("{}/api/token", self.accounts_base))
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[("grant_type", "client_credentials")]);

        let response = match self.http.send(ctx.run_id, SPOTIFY_SOURCE_ID, request).await {
            Ok(response) => response,
            Err(err) if matches!(err.status(), Some(400 | 401 | 403)) => {
                return Err(AdapterError::Auth(err.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        let (value, lifetime) = parse_token_response(&response.body)?;
        debug!(expires_in = lifetime.as_secs(), "spotify access token refreshed");
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        Ok(value)
    }
}

#[async_trait]
impl EnrichmentSource for SpotifyCatalog {
    fn source_id(&self) -> &'static str {
        SPOTIFY_SOURCE_ID
    }

    async fn enrich(
        &self,
        ctx: &AdapterContext,
        name: &str,
    ) -> Result<Option<CatalogMatch>, AdapterError> {
        if name.trim().is_empty() {
            return Err(AdapterError::InvalidInput("name must not be empty".into()));
        }

        let token = self.access_token(ctx).await?;
        let limit = self.search_limit.to_string();
        let request = self
            .http
            .client()
            .get(format!("{}/v1/search", self.api_base))
            .bearer_auth(&token)
            .query(&[("q", name), ("type", "artist"), ("limit", limit.as_str())]);

        match self.http.send(ctx.run_id, SPOTIFY_SOURCE_ID, request).await {
            Ok(response) => parse_search_response(&response.body),
            Err(err) if err.status() == Some(401) => {
                self.token.lock().await.take();
                Err(AdapterError::Auth(err.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub_server::{serve, Route};
    use tunedw_storage::HttpClientConfig;
    use uuid::Uuid;

    fn catalog() -> SpotifyCatalog {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        SpotifyCatalog::new(Arc::new(http), SpotifyCredentials::new("id", "secret"))
            .with_endpoints("http://127.0.0.1:9/", "http://127.0.0.1:9")
    }

    #[test]
    fn negative_metrics_are_clamped_to_zero() {
        let body = br#"{"artists":{"items":[
            {"name":"X","popularity":-3,"genres":[],"followers":{"total":-1}}
        ]}}"#;
        let found = parse_search_response(body).unwrap().unwrap();
        assert_eq!(found.popularity, 0);
        assert_eq!(found.followers, 0);
    }

    #[test]
    fn missing_followers_default_to_zero() {
        let body = br#"{"artists":{"items":[{"name":"X","popularity":7}]}}"#;
        let found = parse_search_response(body).unwrap().unwrap();
        assert_eq!(found.followers, 0);
        assert!(found.genres.is_empty());
    }

    #[test]
    fn error_payload_is_a_parse_failure() {
        let body = br#"{"error":{"status":429,"message":"API rate limit exceeded"}}"#;
        assert!(matches!(
            parse_search_response(body),
            Err(AdapterError::Parse { .. })
        ));
    }

    #[test]
    fn search_limit_is_clamped() {
        assert_eq!(catalog().with_search_limit(0).search_limit, 1);
        assert_eq!(
            catalog().with_search_limit(500).search_limit,
            SPOTIFY_MAX_SEARCH_LIMIT
        );
    }

    #[test]
    fn credentials_debug_hides_the_secret() {
        let rendered = format!("{:?}", SpotifyCredentials::new("id", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn cached_token_is_reused_until_refresh_time() {
        let catalog = catalog();
        *catalog.token.lock().await = Some(CachedToken {
            value: "cached".into(),
            refresh_at: Instant::now() + Duration::from_secs(300),
        });

        let ctx = AdapterContext::new(Uuid::new_v4());
        assert_eq!(catalog.access_token(&ctx).await.unwrap(), "cached");
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let ctx = AdapterContext::new(Uuid::new_v4());
        let err = catalog().enrich(&ctx, "   ").await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidInput(_)));
    }

    const TOKEN_BODY: &str = include_str!("../../../fixtures/spotify/token.json");

    async fn catalog_against(search_status: u16, search_body: &'static str) -> SpotifyCatalog {
        let base = serve(vec![
            Route {
                prefix: "POST /api/token",
                status: 200,
                body: TOKEN_BODY,
            },
            Route {
                prefix: "GET /v1/search",
                status: search_status,
                body: search_body,
            },
        ])
        .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        SpotifyCatalog::new(Arc::new(http), SpotifyCredentials::new("id", "secret"))
            .with_endpoints(base.clone(), base)
    }

    #[tokio::test]
    async fn search_returns_the_first_candidate_and_caches_the_token() {
        let catalog = catalog_against(
            200,
            include_str!("../../../fixtures/spotify/search_soda_stereo.json"),
        )
        .await;
        let ctx = AdapterContext::new(Uuid::new_v4());

        let found = catalog.enrich(&ctx, "Soda Stereo").await.unwrap().unwrap();

        assert_eq!(found.name, "Soda Stereo");
        assert_eq!(found.followers, 3_912_874);
        let cached = catalog.token.lock().await;
        assert_eq!(cached.as_ref().map(|t| t.value.as_str()), Some("BQDdummy-token-value"));
    }

    #[tokio::test]
    async fn unauthorized_search_clears_the_cached_token() {
        let catalog = catalog_against(401, r#"{"error":{"status":401}}"#).await;
        let ctx = AdapterContext::new(Uuid::new_v4());

        let err = catalog.enrich(&ctx, "Soda Stereo").await.unwrap_err();

        assert!(matches!(err, AdapterError::Auth(_)));
        assert!(catalog.token.lock().await.is_none());
    }

    #[tokio::test]
    async fn rejected_credentials_are_an_auth_error() {
        let base = serve(vec![Route {
            prefix: "POST /api/token",
            status: 400,
            body: r#"{"error":"invalid_client"}"#,
        }])
        .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let catalog = SpotifyCatalog::new(Arc::new(http), SpotifyCredentials::new("id", "bad"))
            .with_endpoints(base.clone(), base);

        let err = catalog
            .enrich(&AdapterContext::new(Uuid::new_v4()), "Soda Stereo")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Auth(_)));
        assert!(catalog.token.lock().await.is_none());
    }
}
