use async_trait::async_trait;
use futures::TryStreamExt;
use http_body_util::BodyExt;
use kube::client::Body;
use kube::Client;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::TransportError;
use crate::k8s::types::ClusterCatalog;
use crate::transport::{content_url, service_from_url, ContentSource, ContentStream};
use crate::{Error, Result};

/// Fetches content through the API server's service proxy subresource.
#[derive(Clone)]
pub struct ProxyTransport {
    client: Client,
}

impl ProxyTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// `/api/v1/namespaces/{ns}/services/{scheme}:{name}:{port}/proxy{path}`
pub fn proxy_path(url: &reqwest::Url) -> Result<String> {
    let service = service_from_url(url)?;
    let mut path = format!(
        "/api/v1/namespaces/{}/services/{}:{}:{}/proxy{}",
        service.namespace,
        url.scheme(),
        service.name,
        service.port,
        url.path()
    );
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok(path)
}

#[async_trait]
impl ContentSource for ProxyTransport {
    #[instrument(skip_all, fields(catalog = %kube::ResourceExt::name_any(catalog)))]
    async fn fetch(&self, catalog: &ClusterCatalog, cancel: &CancellationToken) -> Result<ContentStream> {
        let url = content_url(catalog)?;
        let path = proxy_path(&url)?;
        debug!(path = %path, "fetching content through service proxy");

        let request = http::Request::get(&path)
            .body(Body::from(Vec::new()))
            .map_err(|e| TransportError::InvalidUrl {
                url: path.clone(),
                reason: e.to_string(),
            })?;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled.into()),
            response = self.client.send(request) => response.map_err(Error::Kube)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        let body = response
            .into_body()
            .into_data_stream()
            .map_err(std::io::Error::other);
        Ok(ContentStream::new(StreamReader::new(body)))
    }
}
