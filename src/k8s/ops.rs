//! Capability traits over the cluster object API.
//!
//! Each operation is its own trait so that an action only asks for what it
//! uses, and tests can hand it a fake that implements exactly that much.

use std::fmt;

use async_trait::async_trait;

use crate::Result;

/// Name of the field manager attached to every write.
pub const FIELD_MANAGER: &str = "kubectl-operator";

/// Server-side apply of a complete desired object.
#[async_trait]
pub trait Apply<K>: Send + Sync
where
    K: Send + Sync,
{
    async fn apply(&self, obj: &K, dry_run: bool) -> Result<K>;
}

/// Fetch by identity. A missing object is `Error::NotFound`.
#[async_trait]
pub trait Get<K>: Send + Sync
where
    K: Send + Sync,
{
    async fn get(&self, name: &str, namespace: Option<&str>) -> Result<K>;
}

/// Replace an existing object, guarded by its resource version.
#[async_trait]
pub trait Update<K>: Send + Sync
where
    K: Send + Sync,
{
    async fn update(&self, obj: &K, dry_run: bool) -> Result<K>;
}

/// Issue a delete. A missing object is `Error::NotFound`.
#[async_trait]
pub trait Delete<K>: Send + Sync
where
    K: Send + Sync,
{
    async fn delete(&self, name: &str, namespace: Option<&str>) -> Result<()>;
}

#[async_trait]
pub trait List<K>: Send + Sync
where
    K: Send + Sync,
{
    async fn list(&self, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<K>>;
}

/// Kinds that can take part in a compensating deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ClusterCatalog,
    ClusterExtension,
    Namespace,
    ServiceAccount,
    ClusterRoleBinding,
}

impl ObjectKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::ClusterCatalog => "ClusterCatalog",
            ObjectKind::ClusterExtension => "ClusterExtension",
            ObjectKind::Namespace => "Namespace",
            ObjectKind::ServiceAccount => "ServiceAccount",
            ObjectKind::ClusterRoleBinding => "ClusterRoleBinding",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionTarget {
    pub kind: ObjectKind,
    pub name: String,
    pub namespace: Option<String>,
}

impl DeletionTarget {
    pub fn cluster(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
        }
    }

    pub fn namespaced(kind: ObjectKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }
}

impl fmt::Display for DeletionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {:?}", self.kind, self.name),
        }
    }
}

/// Kind-erased delete and existence check used by the deletion orchestrator.
#[async_trait]
pub trait Remove: Send + Sync {
    async fn remove(&self, target: &DeletionTarget) -> Result<()>;

    async fn exists(&self, target: &DeletionTarget) -> Result<bool>;
}
