//! Maps a logical service to one ready backend pod and port.
//!
//! The service's declared port is looked up first, then the service's
//! EndpointSlices are scanned for the first ready endpoint backed by a pod.
//! There is no load balancing and no retry across candidates.

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, instrument};

use crate::error::TransportError;
use crate::k8s::ops::{Get, List};
use crate::{Error, Result};

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub pod_name: String,
    pub pod_port: u16,
}

#[instrument(skip_all, fields(service = %service))]
pub async fn resolve<C>(client: &C, service: &ServiceRef) -> Result<BackendEndpoint>
where
    C: Get<Service> + List<EndpointSlice> + ?Sized,
{
    let svc = client
        .get(&service.name, Some(&service.namespace))
        .await
        .map_err(|e| match e {
            Error::NotFound { .. } => resolve_error(service, "service not found"),
            other => resolve_error(service, &other.to_string()),
        })?;

    let ports = svc.spec.as_ref().and_then(|s| s.ports.as_deref()).unwrap_or(&[]);
    let service_port = ports
        .iter()
        .find(|p| p.port == i32::from(service.port))
        .ok_or_else(|| resolve_error(service, &format!("service has no port {}", service.port)))?;

    let selector = format!("{}={}", SERVICE_NAME_LABEL, service.name);
    let slices = client
        .list(Some(&service.namespace), Some(&selector))
        .await
        .map_err(|e| resolve_error(service, &e.to_string()))?;

    for slice in &slices {
        let Some(pod_port) = backend_port(slice, service_port) else {
            continue;
        };

        let ready_pod = slice.endpoints.iter().find_map(|endpoint| {
            let ready = endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);
            let target = endpoint.target_ref.as_ref()?;
            (ready && target.kind.as_deref() == Some("Pod"))
                .then(|| target.name.clone())
                .flatten()
        });

        if let Some(pod_name) = ready_pod {
            debug!(pod = %pod_name, port = pod_port, "selected backend");
            return Ok(BackendEndpoint { pod_name, pod_port });
        }
    }

    Err(resolve_error(service, "no ready backends"))
}

/// Port the backend actually listens on for `service_port`.
///
/// EndpointSlice ports carry the service port's name and the resolved target
/// port number, which also covers named target ports.
fn backend_port(slice: &EndpointSlice, service_port: &ServicePort) -> Option<u16> {
    let wanted = service_port.name.as_deref().unwrap_or("");
    let from_slice = slice
        .ports
        .iter()
        .flatten()
        .find(|p| p.name.as_deref().unwrap_or("") == wanted)
        .and_then(|p| p.port);

    let port = match (from_slice, &service_port.target_port) {
        (Some(port), _) => port,
        (None, Some(IntOrString::Int(port))) => *port,
        (None, Some(IntOrString::String(_))) => return None,
        (None, None) => service_port.port,
    };
    u16::try_from(port).ok()
}

fn resolve_error(service: &ServiceRef, reason: &str) -> Error {
    TransportError::Resolve {
        service: service.to_string(),
        reason: reason.to_string(),
    }
    .into()
}
