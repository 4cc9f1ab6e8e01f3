//! HTTP plumbing shared by every APS call: endpoint construction, bearer
//! headers, status checking and JSON decoding.

use crate::auth::AuthContext;
use crate::config::AutomationConfig;
use crate::error::ApiError;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Builds URLs for the APS services this crate talks to.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: Url,
    da_region: String,
}

impl Endpoints {
    pub fn new(base_url: &str, da_region: &str) -> Result<Self, ApiError> {
        let base = Url::parse(base_url)
            .map_err(|e| ApiError::Invalid(format!("invalid base url '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::Invalid(format!("base url '{base_url}' cannot hold paths")));
        }
        Ok(Self {
            base,
            da_region: da_region.to_string(),
        })
    }

    /// Design Automation v3: `{base}/da/{region}/v3/{segments}`
    pub fn da(&self, segments: &[&str]) -> Url {
        self.join(&["da", self.da_region.as_str(), "v3"], segments)
    }

    /// Object Storage Service v2: `{base}/oss/v2/{segments}`
    pub fn oss(&self, segments: &[&str]) -> Url {
        self.join(&["oss", "v2"], segments)
    }

    /// Data Management v1: `{base}/data/v1/{segments}`
    pub fn data(&self, segments: &[&str]) -> Url {
        self.join(&["data", "v1"], segments)
    }

    // Each segment is percent-encoded on push, so ids containing `/`, `?`
    // or `#` stay a single segment.
    fn join(&self, prefix: &[&str], segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(prefix).extend(segments);
        }
        url
    }
}

/// Strip the query string so signed URLs never reach logs or error text.
pub(crate) fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

/// Client for the APS REST API.
///
/// Cloning is cheap; clones share the connection pool and credential context.
#[derive(Debug, Clone)]
pub struct ApsClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    auth: AuthContext,
    transfer_timeout: Duration,
}

impl ApsClient {
    pub fn new(config: &AutomationConfig, auth: AuthContext) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.http.timeout())
            .build()
            .map_err(|e| ApiError::Invalid(format!("http client error: {e}")))?;
        let endpoints = Endpoints::new(&config.api.base_url, &config.api.da_region)?;
        Ok(Self {
            http,
            endpoints,
            auth,
            transfer_timeout: config.http.transfer_timeout(),
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Request without credentials (signed URLs, report downloads).
    pub(crate) fn unauthorized(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url).timeout(self.transfer_timeout)
    }

    /// Request carrying the current bearer token.
    pub(crate) async fn authorized(&self, method: Method, url: Url) -> Result<RequestBuilder, ApiError> {
        let token = self.auth.bearer().await?;
        Ok(self
            .http
            .request(method, url)
            .header(AUTHORIZATION, token.header_value()))
    }

    /// Send a request and fail on any non-success status.
    ///
    /// A 401 on a credentialed request invalidates the shared auth context.
    pub(crate) async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let request = builder
            .build()
            .map_err(|e| ApiError::Invalid(format!("failed to build request: {e}")))?;
        let url = redact(request.url());
        let credentialed = request.headers().contains_key(AUTHORIZATION);
        tracing::debug!(method = %request.method(), url = %url, "APS request");

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| ApiError::Transport {
                url: url.clone(),
                source: e,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED && credentialed {
            self.auth.invalidate().await;
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Http {
            status: status.as_u16(),
            url,
            body,
        })
    }

    /// Send a request and decode its JSON body.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = self.send(builder).await?;
        let url = redact(response.url());
        let body = response.text().await.map_err(|e| ApiError::Transport {
            url: url.clone(),
            source: e,
        })?;
        serde_json::from_str(&body).map_err(|e| ApiError::Decode { url, body, source: e })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::auth::BearerToken;

    /// Serve `router` on an ephemeral local port and return its base URL.
    pub(crate) async fn spawn(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub(crate) fn client_for(base: &str) -> ApsClient {
        let mut config = AutomationConfig::default();
        config.api.base_url = base.to_string();
        ApsClient::new(&config, AuthContext::with_token(BearerToken::new("test-token"))).unwrap()
    }
}
