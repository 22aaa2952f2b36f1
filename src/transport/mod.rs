//! Retrieval of a catalog's content stream from inside the cluster.
//!
//! The content is served by a service that is normally unreachable from the
//! caller's network. Two strategies reach it behind one trait: the API
//! server's service proxy, or a self-built port-forward tunnel to one backend
//! pod. Both refuse to touch the network unless the catalog reports that it is
//! serving and exposes a content URL.

pub mod proxy;
pub mod stream;
pub mod tls;
pub mod tunnel;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::k8s::types::ClusterCatalog;
use crate::resolver::ServiceRef;
use crate::Result;

pub use proxy::ProxyTransport;
pub use stream::ContentStream;
pub use tunnel::{KubePortForwarder, PodForwarder, TunnelSession, TunnelTransport};

/// Path below a catalog's base URL that serves every content object.
pub const ALL_CONTENT_PATH: &str = "api/v1/all";

#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, catalog: &ClusterCatalog, cancel: &CancellationToken) -> Result<ContentStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Proxy,
    Tunnel,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Proxy => write!(f, "proxy"),
            TransportKind::Tunnel => write!(f, "tunnel"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "proxy" => Ok(TransportKind::Proxy),
            "tunnel" => Ok(TransportKind::Tunnel),
            other => Err(format!("unknown transport {other:?} (expected proxy or tunnel)")),
        }
    }
}

/// URL of the full content stream, if the catalog is in a state to serve it.
pub fn content_url(catalog: &ClusterCatalog) -> Result<Url> {
    let name = kube::ResourceExt::name_any(catalog);
    if !catalog.is_serving() {
        return Err(TransportError::NotServing(name).into());
    }
    let base = catalog
        .base_url()
        .ok_or_else(|| TransportError::NoContentUrl(name.clone()))?;

    let raw = format!("{}/{}", base.trim_end_matches('/'), ALL_CONTENT_PATH);
    Url::parse(&raw).map_err(|e| {
        TransportError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Recovers `service.namespace[.svc...]:port` from an in-cluster URL.
pub fn service_from_url(url: &Url) -> Result<ServiceRef> {
    let invalid = |reason: &str| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let mut labels = host.split('.');
    let name = labels.next().filter(|s| !s.is_empty());
    let namespace = labels.next().filter(|s| !s.is_empty());
    let (Some(name), Some(namespace)) = (name, namespace) else {
        return Err(invalid("host is not of the form <service>.<namespace>").into());
    };

    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("no port and no default for scheme"))?;

    Ok(ServiceRef {
        namespace: namespace.to_string(),
        name: name.to_string(),
        port,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::k8s::types::{
        condition, CatalogUrls, ClusterCatalog, ClusterCatalogStatus, STATUS_TRUE, TYPE_SERVING,
    };
    use crate::testing::catalog;

    pub(crate) fn serving_catalog(name: &str, base: &str) -> ClusterCatalog {
        let mut c = catalog(name);
        c.status = Some(ClusterCatalogStatus {
            conditions: vec![condition(TYPE_SERVING, STATUS_TRUE, "Available", "")],
            urls: Some(CatalogUrls {
                base: base.to_string(),
            }),
            ..Default::default()
        });
        c
    }

    pub(crate) fn unavailable_catalog(name: &str, base: &str) -> ClusterCatalog {
        let mut c = serving_catalog(name, base);
        if let Some(status) = c.status.as_mut() {
            status.conditions = vec![condition(TYPE_SERVING, "False", "Unavailable", "")];
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{serving_catalog, unavailable_catalog};
    use super::*;
    use crate::testing::catalog;
    use crate::Error;
    use assert_matches::assert_matches;

    #[test]
    fn test_content_url_appends_path() {
        let c = serving_catalog("hub", "https://catalogd-service.olmv1-system.svc/catalogs/hub/");
        assert_eq!(
            content_url(&c).unwrap().as_str(),
            "https://catalogd-service.olmv1-system.svc/catalogs/hub/api/v1/all"
        );
    }

    #[test]
    fn test_content_url_requires_serving_and_base() {
        let c = unavailable_catalog("hub", "https://catalogd-service.olmv1-system.svc/catalogs/hub");
        assert_matches!(
            content_url(&c),
            Err(Error::Transport(TransportError::NotServing(_)))
        );

        let mut c = serving_catalog("hub", "");
        assert_matches!(
            content_url(&c),
            Err(Error::Transport(TransportError::NoContentUrl(_)))
        );
        c.status = None;
        assert_matches!(
            content_url(&c),
            Err(Error::Transport(TransportError::NotServing(_)))
        );
        assert_matches!(
            content_url(&catalog("bare")),
            Err(Error::Transport(TransportError::NotServing(_)))
        );
    }

    #[test]
    fn test_service_from_url_defaults_port_by_scheme() {
        let url = Url::parse("https://catalogd-service.olmv1-system.svc/catalogs/hub").unwrap();
        let svc = service_from_url(&url).unwrap();
        assert_eq!(svc.name, "catalogd-service");
        assert_eq!(svc.namespace, "olmv1-system");
        assert_eq!(svc.port, 443);

        let url = Url::parse("http://catalogd-service.olmv1-system.svc.cluster.local:8080/x").unwrap();
        assert_eq!(service_from_url(&url).unwrap().port, 8080);

        let url = Url::parse("http://localhost/x").unwrap();
        assert!(service_from_url(&url).is_err());
    }
}
