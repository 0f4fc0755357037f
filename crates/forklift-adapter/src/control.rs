//! Control endpoint of a source platform
//!
//! Inventory answers read-only questions; operations that change the source
//! (power, snapshots) or that need a live answer (current power state,
//! changed blocks) go through the platform's control API. Every call is
//! addressed by a [`ControlPath`] of raw segments which the transport
//! percent-encodes, since disk IDs such as `[ds1] vm/vm.vmdk` contain spaces
//! and slashes.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use forklift_common::crd::ProviderSettings;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::error::AdapterError;

/// Path of a control call, as unencoded segments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPath(Vec<String>);

impl ControlPath {
    /// Start at a VM
    pub fn vm(id: &str) -> Self {
        Self(vec!["vms".to_string(), id.to_string()])
    }

    /// Append a segment
    pub fn join(mut self, segment: impl Into<String>) -> Self {
        self.0.push(segment.into());
        self
    }

    /// Raw segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ControlPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

/// Transport to a platform control API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderControl: Send + Sync {
    /// GET a resource; `Ok(None)` when it does not exist
    async fn get(
        &self,
        path: &ControlPath,
        query: Vec<(String, String)>,
    ) -> Result<Option<Value>, AdapterError>;

    /// POST an action or a new resource
    async fn post(&self, path: &ControlPath, body: Value) -> Result<Value, AdapterError>;

    /// DELETE a resource; deleting a missing resource succeeds
    async fn delete(&self, path: &ControlPath) -> Result<(), AdapterError>;
}

/// Control API over HTTPS
pub struct HttpProviderControl {
    base: Url,
    http: reqwest::Client,
}

impl HttpProviderControl {
    /// Build a client for `url` authenticated with the provider's credentials
    pub fn new(
        url: &str,
        settings: &ProviderSettings,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let base = Url::parse(url)
            .map_err(|e| AdapterError::InvalidProvider(format!("invalid url '{url}': {e}")))?;

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(auth) = authorization(settings)? {
            let mut value = reqwest::header::HeaderValue::from_str(&auth)
                .map_err(|e| AdapterError::Credentials(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .default_headers(headers)
            .danger_accept_invalid_certs(settings.insecure_skip_tls);
        if let Some(ca) = &settings.ca {
            let cert = reqwest::Certificate::from_pem(ca.as_bytes())
                .map_err(|e| AdapterError::Credentials(format!("cacert: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| AdapterError::InvalidProvider(e.to_string()))?;
        Ok(Self { base, http })
    }

    /// Wrap an existing HTTP client
    pub fn with_http(base: Url, http: reqwest::Client) -> Self {
        Self { base, http }
    }

    fn url(&self, path: &ControlPath) -> Result<Url, AdapterError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AdapterError::InvalidProvider(format!("{} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(path.segments());
        Ok(url)
    }

    async fn send(
        &self,
        operation: String,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<Value>, AdapterError> {
        let response = request.send().await.map_err(|e| AdapterError::Control {
            operation: operation.clone(),
            status: None,
            message: e.to_string(),
        })?;
        let status = response.status();
        debug!(%operation, status = status.as_u16(), "control call");
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError::Control {
                operation,
                status: Some(status.as_u16()),
                message,
            });
        }
        let bytes = response.bytes().await.map_err(|e| AdapterError::Control {
            operation: operation.clone(),
            status: Some(status.as_u16()),
            message: e.to_string(),
        })?;
        if bytes.is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| AdapterError::Decode {
                operation,
                message: e.to_string(),
            })
    }
}

fn authorization(settings: &ProviderSettings) -> Result<Option<String>, AdapterError> {
    use base64::Engine;

    if let Some(token) = &settings.token {
        return Ok(Some(format!("Bearer {token}")));
    }
    match (&settings.username, &settings.password) {
        (Some(user), Some(password)) => {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
            Ok(Some(format!("Basic {encoded}")))
        }
        (Some(_), None) => Err(AdapterError::Credentials("password is required".into())),
        (None, Some(_)) => Err(AdapterError::Credentials("user is required".into())),
        (None, None) => Ok(None),
    }
}

#[async_trait]
impl ProviderControl for HttpProviderControl {
    #[instrument(skip(self), fields(path = %path))]
    async fn get(
        &self,
        path: &ControlPath,
        query: Vec<(String, String)>,
    ) -> Result<Option<Value>, AdapterError> {
        let mut url = self.url(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        self.send(format!("GET {path}"), self.http.get(url)).await
    }

    #[instrument(skip(self, body), fields(path = %path))]
    async fn post(&self, path: &ControlPath, body: Value) -> Result<Value, AdapterError> {
        let url = self.url(path)?;
        let operation = format!("POST {path}");
        self.send(operation.clone(), self.http.post(url).json(&body))
            .await?
            .ok_or(AdapterError::Control {
                operation,
                status: Some(404),
                message: "not found".into(),
            })
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete(&self, path: &ControlPath) -> Result<(), AdapterError> {
        let url = self.url(path)?;
        self.send(format!("DELETE {path}"), self.http.delete(url))
            .await
            .map(|_| ())
    }
}
