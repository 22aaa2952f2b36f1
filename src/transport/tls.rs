//! Extra trust roots for talking to an in-cluster service over TLS.
//!
//! Serving certificates for in-cluster services are usually signed by a
//! cluster-local CA that the host's trust store knows nothing about. The CA is
//! published next to the certificate in a secret named after the service.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use reqwest::{Certificate, ClientBuilder};
use tracing::debug;

use crate::k8s::ops::List;
use crate::resolver::ServiceRef;

const CA_KEY: &str = "ca.crt";

/// Adds every CA found in `<service>-cert*` secrets. Never fails.
pub async fn with_cluster_roots<C>(mut builder: ClientBuilder, client: &C, service: &ServiceRef) -> ClientBuilder
where
    C: List<Secret> + ?Sized,
{
    let secrets: Vec<Secret> = match client.list(Some(&service.namespace), None).await {
        Ok(secrets) => secrets,
        Err(e) => {
            debug!(namespace = %service.namespace, error = %e, "cannot list secrets; using system roots only");
            return builder;
        }
    };

    for cert in cluster_roots(&secrets, &service.name) {
        builder = builder.add_root_certificate(cert);
    }
    builder
}

fn cluster_roots(secrets: &[Secret], service_name: &str) -> Vec<Certificate> {
    let prefix = format!("{service_name}-cert");
    secrets
        .iter()
        .filter(|s| s.name_any().starts_with(&prefix))
        .filter_map(|secret| {
            let pem = secret.data.as_ref()?.get(CA_KEY)?;
            match usable(&pem.0) {
                Ok(cert) => {
                    debug!(secret = %secret.name_any(), "trusting cluster CA");
                    Some(cert)
                }
                Err(e) => {
                    debug!(secret = %secret.name_any(), error = %e, "skipping unreadable CA");
                    None
                }
            }
        })
        .collect()
}

/// `from_pem` only stores the bytes; they are parsed when a client is built.
/// A trial build catches a corrupt CA before it can fail the real one.
fn usable(pem: &[u8]) -> reqwest::Result<Certificate> {
    let cert = Certificate::from_pem(pem)?;
    reqwest::Client::builder()
        .add_root_certificate(cert.clone())
        .build()?;
    Ok(cert)
}
