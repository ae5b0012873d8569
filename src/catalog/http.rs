//! HTTP catalog client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use super::{CatalogError, CatalogPage, ContentCatalog};

/// Catalog connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Catalog request timeout; pages are small JSON documents.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Client for a JSON catalog served at `endpoint`.
///
/// - `GET {endpoint}/users/{user}/items?limit={n}&cursor={c}` → [`CatalogPage`]
/// - `{endpoint}/videos/{id}/stream` → video bytes
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpCatalog {
    /// Creates a client for `endpoint` with an optional bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidEndpoint`] if the endpoint is not an
    /// absolute http(s) URL, or [`CatalogError::Client`] if the HTTP client
    /// cannot be built.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self, CatalogError> {
        let endpoint = parse_base(endpoint)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("offline-cache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(CatalogError::Client)?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    /// Base URL this client talks to.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url_for(&self, segments: &[&str]) -> Result<Url, CatalogError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| CatalogError::invalid_endpoint(self.endpoint.as_str()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn parse_base(endpoint: &str) -> Result<Url, CatalogError> {
    let url = Url::parse(endpoint).map_err(|_| CatalogError::invalid_endpoint(endpoint))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(CatalogError::invalid_endpoint(endpoint));
    }
    Ok(url)
}

#[async_trait]
impl ContentCatalog for HttpCatalog {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn fetch_items(
        &self,
        user_id: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<CatalogPage, CatalogError> {
        let mut url = self.url_for(&["users", user_id, "items"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &page_size.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CatalogError::Timeout {
                    url: url.to_string(),
                }
            } else {
                CatalogError::Network {
                    url: url.to_string(),
                    source: e,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let page: CatalogPage = response
            .json()
            .await
            .map_err(|source| CatalogError::Decode {
                url: url.to_string(),
                source,
            })?;

        debug!(
            items = page.items.len(),
            has_more = page.next_cursor.is_some(),
            "fetched catalog page"
        );
        Ok(page)
    }

    fn stream_url(&self, media_item_id: &str) -> Result<Url, CatalogError> {
        self.url_for(&["videos", media_item_id, "stream"])
    }
}
