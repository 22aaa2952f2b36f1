use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::k8s::ops::{Apply, Delete, DeletionTarget, Get, List, ObjectKind, Remove, Update, FIELD_MANAGER};
use crate::k8s::types::{ClusterCatalog, ClusterExtension};
use crate::{Error, Result};

/// Types the client knows how to address, and at which scope.
pub trait Scoped:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;

    fn kind_name() -> String {
        Self::kind(&()).to_string()
    }
}

macro_rules! cluster_scoped {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Scoped for $ty {
                fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

macro_rules! namespace_scoped {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Scoped for $ty {
                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

cluster_scoped!(ClusterCatalog, ClusterExtension, Namespace, ClusterRoleBinding);
namespace_scoped!(ServiceAccount, Service, EndpointSlice, Secret);

#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    field_manager: String,
}

impl K8sClient {
    pub async fn try_default() -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let client = Client::try_default()
            .await
            .map_err(|e| Error::Config(format!("Failed to create K8s client: {}", e)))?;

        info!("Connected to Kubernetes cluster");

        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: FIELD_MANAGER.to_string(),
        }
    }

    /// Attributes every write to `field_manager` instead of the default.
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn remove_typed<K: Scoped>(&self, target: &DeletionTarget) -> Result<()> {
        Delete::<K>::delete(self, &target.name, target.namespace.as_deref()).await
    }

    async fn exists_typed<K: Scoped>(&self, target: &DeletionTarget) -> Result<bool> {
        match Get::<K>::get(self, &target.name, target.namespace.as_deref()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn object_name<K: Scoped>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| Error::Validation(format!("{} has no name", K::kind_name())))
}

#[async_trait]
impl<K: Scoped> Apply<K> for K8sClient {
    async fn apply(&self, obj: &K, dry_run: bool) -> Result<K> {
        let name = object_name(obj)?;
        let mut params = PatchParams::apply(&self.field_manager).force();
        params.dry_run = dry_run;

        debug!(kind = %K::kind_name(), name = %name, dry_run, "applying object");

        K::api(self.client.clone(), obj.namespace().as_deref())
            .patch(&name, &params, &Patch::Apply(obj))
            .await
            .map_err(|e| Error::from_kube(e, &K::kind_name(), &name))
    }
}

#[async_trait]
impl<K: Scoped> Get<K> for K8sClient {
    async fn get(&self, name: &str, namespace: Option<&str>) -> Result<K> {
        K::api(self.client.clone(), namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, &K::kind_name(), name))
    }
}

#[async_trait]
impl<K: Scoped> Update<K> for K8sClient {
    async fn update(&self, obj: &K, dry_run: bool) -> Result<K> {
        let name = object_name(obj)?;
        let params = PostParams {
            dry_run,
            field_manager: Some(self.field_manager.clone()),
        };

        debug!(kind = %K::kind_name(), name = %name, dry_run, "updating object");

        K::api(self.client.clone(), obj.namespace().as_deref())
            .replace(&name, &params, obj)
            .await
            .map_err(|e| Error::from_kube(e, &K::kind_name(), &name))
    }
}

#[async_trait]
impl<K: Scoped> Delete<K> for K8sClient {
    async fn delete(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        debug!(kind = %K::kind_name(), name = %name, "deleting object");

        K::api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, &K::kind_name(), name))
    }
}

#[async_trait]
impl<K: Scoped> List<K> for K8sClient {
    async fn list(&self, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }

        let list = K::api(self.client.clone(), namespace)
            .list(&params)
            .await
            .map_err(Error::Kube)?;

        Ok(list.items)
    }
}

#[async_trait]
impl Remove for K8sClient {
    async fn remove(&self, target: &DeletionTarget) -> Result<()> {
        match target.kind {
            ObjectKind::ClusterCatalog => self.remove_typed::<ClusterCatalog>(target).await,
            ObjectKind::ClusterExtension => self.remove_typed::<ClusterExtension>(target).await,
            ObjectKind::Namespace => self.remove_typed::<Namespace>(target).await,
            ObjectKind::ServiceAccount => self.remove_typed::<ServiceAccount>(target).await,
            ObjectKind::ClusterRoleBinding => self.remove_typed::<ClusterRoleBinding>(target).await,
        }
    }

    async fn exists(&self, target: &DeletionTarget) -> Result<bool> {
        match target.kind {
            ObjectKind::ClusterCatalog => self.exists_typed::<ClusterCatalog>(target).await,
            ObjectKind::ClusterExtension => self.exists_typed::<ClusterExtension>(target).await,
            ObjectKind::Namespace => self.exists_typed::<Namespace>(target).await,
            ObjectKind::ServiceAccount => self.exists_typed::<ServiceAccount>(target).await,
            ObjectKind::ClusterRoleBinding => self.exists_typed::<ClusterRoleBinding>(target).await,
        }
    }
}
