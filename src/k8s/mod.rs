pub mod client;
pub mod ops;
pub mod selector;
pub mod types;

pub use client::{K8sClient, Scoped};
pub use ops::{Apply, Delete, DeletionTarget, Get, List, ObjectKind, Remove, Update, FIELD_MANAGER};
pub use types::{ClusterCatalog, ClusterExtension, Conditioned};
