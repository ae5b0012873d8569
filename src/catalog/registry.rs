//! Explicit registry of catalog clients keyed by normalized endpoint.
//!
//! Whoever constructs catalog clients owns a [`CatalogRegistry`]; asking for
//! the same server twice (even spelled differently, e.g. with a default port or
//! trailing slash) returns the same client and its connection pool.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use url::Url;

use super::{CatalogError, HttpCatalog};

/// Normalizes a catalog endpoint for use as a registry key.
///
/// Scheme and host are lower-cased and default ports dropped (by URL parsing),
/// query and fragment are removed, and trailing slashes are trimmed.
///
/// # Errors
///
/// Returns [`CatalogError::InvalidEndpoint`] if the endpoint does not parse.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, CatalogError> {
    let mut url =
        Url::parse(endpoint.trim()).map_err(|_| CatalogError::invalid_endpoint(endpoint))?;
    url.set_query(None);
    url.set_fragment(None);
    let normalized = url.as_str().trim_end_matches('/').to_string();
    Ok(normalized)
}

/// Owns one [`HttpCatalog`] per normalized endpoint.
#[derive(Debug, Default)]
pub struct CatalogRegistry {
    clients: DashMap<String, Arc<HttpCatalog>>,
    token: Option<String>,
}

impl CatalogRegistry {
    /// Creates an empty registry whose clients send `token` as bearer auth.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            clients: DashMap::new(),
            token,
        }
    }

    /// Returns the client for `endpoint`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if the endpoint is invalid or the client cannot be built.
    pub fn client_for(&self, endpoint: &str) -> Result<Arc<HttpCatalog>, CatalogError> {
        let key = normalize_endpoint(endpoint)?;
        if let Some(existing) = self.clients.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        let client = Arc::new(HttpCatalog::new(&key, self.token.clone())?);
        let entry = self.clients.entry(key.clone()).or_insert(client);
        debug!(endpoint = %key, "registered catalog client");
        Ok(Arc::clone(entry.value()))
    }

    /// Number of distinct endpoints with a client.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True when no client has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
