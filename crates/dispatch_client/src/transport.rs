use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Method};
use shared::{
    domain::{RequestMethod, ResourceId},
    protocol::{DispatchOptions, Response},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub resource: ResourceId,
    pub options: DispatchOptions,
}

/// The network call the dispatcher wraps. Implementations are expected to
/// watch `cancel` and return `TransportError::Cancelled` once it fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<Response, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    http: Client,
    base_url: Option<Url>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: Client) -> Self {
        Self {
            http,
            base_url: None,
        }
    }

    /// Resources are joined onto `server_url`, which is treated as a directory:
    /// `validate` under `http://host/api` resolves to `http://host/api/validate`,
    /// while `/validate` replaces the path.
    pub fn with_base_url(server_url: &str) -> Result<Self, TransportError> {
        let mut base_url = Url::parse(server_url).map_err(|source| TransportError::InvalidUrl {
            resource: server_url.to_string(),
            source,
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url: Some(base_url),
        })
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    pub(crate) fn resolve(&self, resource: &ResourceId) -> Result<Url, TransportError> {
        let resolved = match &self.base_url {
            Some(base) => base.join(resource.as_str()),
            None => Url::parse(resource.as_str()),
        };
        resolved.map_err(|source| TransportError::InvalidUrl {
            resource: resource.to_string(),
            source,
        })
    }

    async fn exchange(&self, request: TransportRequest) -> Result<Response, TransportError> {
        let url = self.resolve(&request.resource)?;
        let TransportRequest { options, .. } = request;

        let mut builder = self.http.request(reqwest_method(options.method), url);
        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = options.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<Response, TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.exchange(request) => result,
        }
    }
}

fn reqwest_method(method: RequestMethod) -> Method {
    match method {
        RequestMethod::Get => Method::GET,
        RequestMethod::Head => Method::HEAD,
        RequestMethod::Post => Method::POST,
        RequestMethod::Put => Method::PUT,
        RequestMethod::Patch => Method::PATCH,
        RequestMethod::Delete => Method::DELETE,
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
