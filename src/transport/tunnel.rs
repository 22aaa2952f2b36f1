//! Content retrieval over a port-forward tunnel to one backend pod.
//!
//! A [`TunnelSession`] binds an ephemeral port on the loopback interface and
//! relays every accepted connection through a port-forward stream to the
//! selected pod. The session lives exactly as long as the content stream it
//! serves.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::Portforwarder;
use kube::{Api, Client, ResourceExt};
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::TransportError;
use crate::k8s::ops::{Get, List};
use crate::k8s::types::ClusterCatalog;
use crate::resolver::{resolve, BackendEndpoint, ServiceRef};
use crate::transport::{content_url, service_from_url, tls, ContentSource, ContentStream};
use crate::{Error, Result};

/// A bidirectional byte stream to a port inside a pod.
pub trait Forwarded: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Forwarded for T {}

/// Opens upgraded streams to a pod port.
#[async_trait]
pub trait PodForwarder: Send + Sync {
    async fn open(&self, namespace: &str, pod: &str, port: u16) -> Result<Box<dyn Forwarded>>;
}

/// Port-forwarding through the API server's `pods/portforward` subresource.
#[derive(Clone)]
pub struct KubePortForwarder {
    client: Client,
}

impl KubePortForwarder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodForwarder for KubePortForwarder {
    async fn open(&self, namespace: &str, pod: &str, port: u16) -> Result<Box<dyn Forwarded>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut forwarder = pods.portforward(pod, &[port]).await.map_err(|e| {
            TransportError::TunnelSetup(format!("port-forward to {namespace}/{pod}:{port}: {e}"))
        })?;
        let stream = forwarder.take_stream(port).ok_or_else(|| {
            TransportError::TunnelSetup(format!("no stream for port {port} on {namespace}/{pod}"))
        })?;

        Ok(Box::new(PortForwardStream { stream, forwarder }))
    }
}

/// Keeps the forwarder alive for as long as its stream is in use.
struct PortForwardStream<S> {
    stream: S,
    forwarder: Portforwarder,
}

impl<S> Drop for PortForwardStream<S> {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PortForwardStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PortForwardStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// A loopback listener forwarding to one backend pod.
///
/// Dropping the session stops the forwarding task; [`TunnelSession::close`]
/// also waits for it to finish.
pub struct TunnelSession {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TunnelSession {
    /// Starts forwarding and returns once the local port is accepting.
    ///
    /// Whichever comes first wins: the tunnel becoming ready, the forwarding
    /// task failing, or `cancel` firing.
    #[instrument(skip(forwarder, cancel), fields(pod = %backend.pod_name, port = backend.pod_port))]
    pub async fn open(
        forwarder: Arc<dyn PodForwarder>,
        namespace: &str,
        backend: BackendEndpoint,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let shutdown = cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut task = tokio::spawn(forward(
            forwarder,
            namespace.to_string(),
            backend,
            shutdown.clone(),
            ready_tx,
        ));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                shutdown.cancel();
                task.abort();
                Err(TransportError::Cancelled.into())
            }
            ready = ready_rx => match ready {
                Ok(Ok(local_addr)) => {
                    info!(local = %local_addr, "tunnel ready");
                    Ok(Self {
                        local_addr,
                        shutdown,
                        task: Some(task),
                    })
                }
                Ok(Err(e)) => {
                    let _ = task.await;
                    Err(setup_error(e))
                }
                Err(_) => {
                    let reason = match (&mut task).await {
                        Err(join) => join.to_string(),
                        Ok(()) => "forwarding task exited before the tunnel was ready".to_string(),
                    };
                    Err(TransportError::TunnelSetup(reason).into())
                }
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(local = %self.local_addr, "tunnel closed");
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(local = %self.local_addr, "tunnel torn down");
        }
    }
}

fn setup_error(err: Error) -> Error {
    match err {
        Error::Transport(_) => err,
        other => TransportError::TunnelSetup(other.to_string()).into(),
    }
}

/// Forwarding task: opens the first upstream eagerly so that setup failures
/// surface before readiness, then relays connections until shut down.
async fn forward(
    forwarder: Arc<dyn PodForwarder>,
    namespace: String,
    backend: BackendEndpoint,
    shutdown: CancellationToken,
    ready: oneshot::Sender<Result<SocketAddr>>,
) {
    let first = match forwarder.open(&namespace, &backend.pod_name, backend.pod_port).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    if ready.send(Ok(local_addr)).is_err() {
        return;
    }

    let mut upstream = Some(first);
    let mut connections = JoinSet::new();
    loop {
        let (mut socket, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "tunnel listener failed");
                    break;
                }
            },
        };
        debug!(peer = %peer, "tunnel connection accepted");

        let reused = upstream.take();
        let forwarder = forwarder.clone();
        let namespace = namespace.clone();
        let backend = backend.clone();
        let token = shutdown.clone();
        connections.spawn(async move {
            let mut remote = match reused {
                Some(stream) => stream,
                None => {
                    let opened = tokio::select! {
                        _ = token.cancelled() => return,
                        opened = forwarder.open(&namespace, &backend.pod_name, backend.pod_port) => opened,
                    };
                    match opened {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(error = %e, "cannot open upstream for tunnel connection");
                            return;
                        }
                    }
                }
            };

            tokio::select! {
                _ = token.cancelled() => {}
                copied = copy_bidirectional(&mut socket, &mut remote) => match copied {
                    Ok((sent, received)) => debug!(sent, received, "tunnel connection finished"),
                    Err(e) => debug!(error = %e, "tunnel connection ended"),
                },
            }
        });
    }

    connections.shutdown().await;
}

/// Fetches content through a [`TunnelSession`] to the service's backend.
pub struct TunnelTransport<C> {
    objects: C,
    forwarder: Arc<dyn PodForwarder>,
}

impl<C> TunnelTransport<C> {
    pub fn new(objects: C, forwarder: Arc<dyn PodForwarder>) -> Self {
        Self { objects, forwarder }
    }
}

#[async_trait]
impl<C> ContentSource for TunnelTransport<C>
where
    C: Get<Service> + List<EndpointSlice> + List<Secret> + Send + Sync,
{
    #[instrument(skip_all, fields(catalog = %catalog.name_any()))]
    async fn fetch(&self, catalog: &ClusterCatalog, cancel: &CancellationToken) -> Result<ContentStream> {
        let url = content_url(catalog)?;
        let service = service_from_url(&url)?;

        let backend = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled.into()),
            backend = resolve(&self.objects, &service) => backend?,
        };

        let session = TunnelSession::open(self.forwarder.clone(), &service.namespace, backend, cancel).await?;
        match self.request(&url, &service, session.local_addr(), cancel).await {
            Ok(response) => {
                let body = response.bytes_stream().map_err(std::io::Error::other);
                Ok(ContentStream::with_session(StreamReader::new(body), session))
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }
}

impl<C> TunnelTransport<C>
where
    C: List<Secret> + Send + Sync,
{
    /// Issues the GET through an open tunnel and checks the status.
    async fn request(
        &self,
        url: &reqwest::Url,
        service: &ServiceRef,
        local: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let host = url.host_str().unwrap_or_default().to_string();
        let mut builder = reqwest::Client::builder().no_proxy().resolve(&host, local);
        if url.scheme() == "https" {
            builder = tls::with_cluster_roots(builder, &self.objects, service).await;
        }
        let http = builder.build().map_err(TransportError::Http)?;

        // The resolver override ignores ports, so the URL itself must carry
        // the local one. The host stays intact for SNI and verification.
        let mut target = url.clone();
        target
            .set_port(Some(local.port()))
            .map_err(|()| TransportError::InvalidUrl {
                url: url.to_string(),
                reason: "cannot set port".to_string(),
            })?;

        debug!(url = %target, "fetching content through tunnel");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled.into()),
            response = http.get(target).send() => response.map_err(TransportError::Http)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }
        Ok(response)
    }
}
