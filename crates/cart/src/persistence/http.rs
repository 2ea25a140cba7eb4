//! REST clients for the remote cart and catalog services.
//!
//! Uses `reqwest` with JSON bodies. Nothing here is cached: carts are mutable
//! state and catalog lookups exist precisely to see fresh prices and stock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use naked_pineapple_core::{LineId, UserId, VariantId};

use super::wire::{CatalogBatchRequest, CatalogEntry, LineInput, QuantityPatch, RemoteLine, SyncRequest};
use super::{CatalogService, RemoteCartService, RemoteError};
use crate::config::CartConfig;

/// Header carrying the customer the cart belongs to.
const CUSTOMER_HEADER: &str = "X-Customer-Id";

/// Characters of a failed response body kept for logs and errors.
const BODY_PREVIEW_CHARS: usize = 200;

// =============================================================================
// ApiClient
// =============================================================================

/// Shared request execution for both services.
#[derive(Clone)]
struct ApiClient {
    inner: Arc<ApiClientInner>,
}

struct ApiClientInner {
    client: reqwest::Client,
    base_url: Url,
    token: Option<SecretString>,
    timeout: Duration,
}

impl ApiClient {
    fn new(config: &CartConfig, base_url: Url) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(ApiClientInner {
                client,
                base_url,
                token: config.api_token.clone(),
                timeout: config.request_timeout,
            }),
        })
    }

    fn url(&self, path: &str) -> Result<Url, RemoteError> {
        self.inner
            .base_url
            .join(path)
            .map_err(|e| RemoteError::InvalidResponse(format!("bad request path {path}: {e}")))
    }

    /// Send a request and return the raw success body.
    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        user: Option<&UserId>,
        body: Option<&B>,
    ) -> Result<String, RemoteError> {
        let mut request = self
            .inner
            .client
            .request(method, self.url(path)?)
            .header("Accept", "application/json");

        if let Some(token) = &self.inner.token {
            request = request.bearer_auth(token.expose_secret());
        }
        if let Some(user) = user {
            request = request.header(CUSTOMER_HEADER, user.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout(self.inner.timeout)
            } else {
                RemoteError::Http(e)
            }
        })?;

        let status = response.status();

        // Check for rate limiting
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(RemoteError::RateLimited(retry_after));
        }

        // Get response body as text first for better error diagnostics
        let text = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(path.to_string()));
        }

        if !status.is_success() {
            let preview = text.chars().take(BODY_PREVIEW_CHARS).collect::<String>();
            tracing::error!(
                status = %status,
                path = %path,
                body = %preview,
                "Cart API returned non-success status"
            );
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: preview,
            });
        }

        Ok(text)
    }

    /// Send a request and parse the JSON response.
    async fn execute<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        user: Option<&UserId>,
        body: Option<&B>,
    ) -> Result<T, RemoteError> {
        let text = self.send(method, path, user, body).await?;
        serde_json::from_str(&text).map_err(|e| {
            tracing::error!(
                error = %e,
                path = %path,
                body = %text.chars().take(BODY_PREVIEW_CHARS).collect::<String>(),
                "Failed to parse cart API response"
            );
            RemoteError::Parse(e)
        })
    }
}

/// Path of a single cart line. Line ids may be GIDs, so they are escaped.
fn line_path(line_id: &LineId) -> String {
    format!("cart/{}", urlencoding::encode(line_id.as_str()))
}

// =============================================================================
// HttpCartClient
// =============================================================================

/// Client for the remote cart service.
#[derive(Clone)]
pub struct HttpCartClient {
    api: ApiClient,
}

impl HttpCartClient {
    /// Create a cart service client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &CartConfig) -> Result<Self, RemoteError> {
        Ok(Self {
            api: ApiClient::new(config, config.cart_api_url.clone())?,
        })
    }
}

#[async_trait]
impl RemoteCartService for HttpCartClient {
    #[instrument(skip(self), fields(user_id = %user))]
    async fn fetch(&self, user: &UserId) -> Result<Vec<RemoteLine>, RemoteError> {
        self.api
            .execute::<(), _>(Method::GET, "cart", Some(user), None)
            .await
    }

    #[instrument(skip(self, input), fields(user_id = %user, variant_id = %input.variant_id))]
    async fn create_line(&self, user: &UserId, input: &LineInput) -> Result<RemoteLine, RemoteError> {
        self.api
            .execute(Method::POST, "cart", Some(user), Some(input))
            .await
    }

    #[instrument(skip(self), fields(user_id = %user, line_id = %line_id))]
    async fn update_quantity(
        &self,
        user: &UserId,
        line_id: &LineId,
        quantity: u32,
    ) -> Result<RemoteLine, RemoteError> {
        self.api
            .execute(
                Method::PATCH,
                &line_path(line_id),
                Some(user),
                Some(&QuantityPatch { quantity }),
            )
            .await
    }

    #[instrument(skip(self), fields(user_id = %user, line_id = %line_id))]
    async fn delete_line(&self, user: &UserId, line_id: &LineId) -> Result<(), RemoteError> {
        match self
            .api
            .send::<()>(Method::DELETE, &line_path(line_id), Some(user), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(RemoteError::NotFound(_)) => {
                debug!("Line already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, lines), fields(user_id = %user, lines = lines.len()))]
    async fn sync(&self, user: &UserId, lines: &[LineInput]) -> Result<Vec<RemoteLine>, RemoteError> {
        let body = SyncRequest {
            lines: lines.to_vec(),
        };
        self.api
            .execute(Method::POST, "cart/sync", Some(user), Some(&body))
            .await
    }

    #[instrument(skip(self), fields(user_id = %user))]
    async fn clear(&self, user: &UserId) -> Result<(), RemoteError> {
        match self
            .api
            .send::<()>(Method::DELETE, "cart", Some(user), None)
            .await
        {
            Ok(_) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// HttpCatalogClient
// =============================================================================

/// Client for the catalog batch endpoint.
#[derive(Clone)]
pub struct HttpCatalogClient {
    api: ApiClient,
}

impl HttpCatalogClient {
    /// Create a catalog client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &CartConfig) -> Result<Self, RemoteError> {
        Ok(Self {
            api: ApiClient::new(config, config.catalog_api_url.clone())?,
        })
    }
}

#[async_trait]
impl CatalogService for HttpCatalogClient {
    #[instrument(skip(self, variant_ids), fields(variants = variant_ids.len()))]
    async fn batch(&self, variant_ids: &[VariantId]) -> Result<Vec<CatalogEntry>, RemoteError> {
        let body = CatalogBatchRequest {
            variant_ids: variant_ids.to_vec(),
        };
        self.api
            .execute(Method::POST, "catalog/batch", None, Some(&body))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> CartConfig {
        CartConfig::from_source(|key| match key {
            "CART_API_URL" => Some("https://cart.example.test/api".to_string()),
            "CATALOG_API_URL" => Some("https://catalog.example.test/v2/".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn test_line_path_encodes_gid() {
        assert_eq!(
            line_path(&LineId::new("gid://shop/CartLine/7")),
            "cart/gid%3A%2F%2Fshop%2FCartLine%2F7"
        );
        assert_eq!(line_path(&LineId::new("line-7")), "cart/line-7");
    }

    #[test]
    fn test_urls_join_under_base_path() {
        let cart = HttpCartClient::new(&config()).unwrap();
        assert_eq!(
            cart.api.url("cart/sync").unwrap().as_str(),
            "https://cart.example.test/api/cart/sync"
        );

        let catalog = HttpCatalogClient::new(&config()).unwrap();
        assert_eq!(
            catalog.api.url("catalog/batch").unwrap().as_str(),
            "https://catalog.example.test/v2/catalog/batch"
        );
    }
}
