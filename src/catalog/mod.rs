//! Remote content catalog.
//!
//! The catalog is the source of playable items and of each user's watch
//! position. This module defines the [`ContentCatalog`] seam consumed by the
//! sync reconciler and the transfer worker, an HTTP implementation
//! ([`HttpCatalog`]), and an explicit client registry ([`CatalogRegistry`])
//! that owns one client per normalized endpoint.

mod http;
mod registry;

pub use http::HttpCatalog;
pub use registry::{CatalogRegistry, normalize_endpoint};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// A playable item as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    /// Global content id.
    pub id: String,
    /// Runtime in 100ns ticks.
    pub duration_ticks: i64,
    /// The requesting user's watch position (0..1).
    #[serde(default)]
    pub watched_fraction: f64,
    /// Catalog creation time (unix ms), when the server reports one.
    #[serde(default)]
    pub added_at: Option<i64>,
}

/// One page of catalog items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPage {
    /// Items on this page.
    pub items: Vec<CatalogItem>,
    /// Cursor for the next page; `None` on the last page.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Errors raised by catalog clients.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Network-level failure talking to the catalog.
    #[error("network error calling {url}: {source}")]
    Network {
        /// Request URL.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The catalog did not answer in time.
    #[error("timeout calling {url}")]
    Timeout {
        /// Request URL.
        url: String,
    },

    /// The catalog answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The response body was not a catalog page.
    #[error("invalid catalog response from {url}: {source}")]
    Decode {
        /// Request URL.
        url: String,
        /// Underlying decode error.
        #[source]
        source: reqwest::Error,
    },

    /// The configured endpoint is not a usable base URL.
    #[error("invalid catalog endpoint: {endpoint}")]
    InvalidEndpoint {
        /// The rejected endpoint.
        endpoint: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build catalog HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl CatalogError {
    /// Creates an invalid-endpoint error.
    pub fn invalid_endpoint(endpoint: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
        }
    }
}

/// Source of playable items and their stream locations.
#[async_trait]
pub trait ContentCatalog: Send + Sync {
    /// Fetches one page of the user's catalog.
    async fn fetch_items(
        &self,
        user_id: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<CatalogPage, CatalogError>;

    /// URL the transfer worker streams the item's video from.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidEndpoint`] if the URL cannot be built.
    fn stream_url(&self, media_item_id: &str) -> Result<Url, CatalogError>;
}
