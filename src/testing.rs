//! In-memory cluster used by unit tests.
//!
//! Implements every capability trait generically over the typed objects, keeps
//! objects as JSON, and records each call so tests can assert on what was (and
//! was not) written.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::ResourceExt;
use serde_json::Value;

use crate::k8s::ops::{Apply, Delete, DeletionTarget, Get, List, Remove, Update};
use crate::k8s::types::{
    CatalogFilter, CatalogSource, ClusterCatalog, ClusterCatalogSpec, ClusterExtension,
    ClusterExtensionSpec, ExtensionSource, ImageSource, ServiceAccountReference,
    SOURCE_TYPE_CATALOG, SOURCE_TYPE_IMAGE,
};
use crate::k8s::Scoped;
use crate::{Error, Result};

type Key = (String, Option<String>, String);
type Name = (String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
    pub dry_run: bool,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    calls: Vec<Call>,
    scripts: HashMap<Name, VecDeque<Vec<Condition>>>,
    failing_apply: HashSet<Name>,
    failing_delete: HashSet<Name>,
    stalled_delete: HashSet<Name>,
    failing_list: HashSet<String>,
    get_budget: HashMap<Name, usize>,
    lingering: HashMap<Name, usize>,
    terminating: HashMap<Name, usize>,
    namespaces_required: bool,
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

pub(crate) fn server_error(message: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn name_of(kind: &str, name: &str) -> Name {
    (kind.to_string(), name.to_string())
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Scoped>(&self, obj: &K) {
        let key = (K::kind_name(), obj.namespace(), obj.name_any());
        let value = serde_json::to_value(obj).expect("serializable object");
        self.state.lock().unwrap().objects.insert(key, value);
    }

    pub fn contains(&self, kind: &str, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.objects.keys().any(|(k, _, n)| k == kind && n == name)
    }

    /// Each successive `get` sees the next condition set; the last one sticks.
    pub fn script_conditions(&self, kind: &str, name: &str, steps: Vec<Vec<Condition>>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(name_of(kind, name), steps.into());
    }

    pub fn fail_apply(&self, kind: &str, name: &str) {
        self.state.lock().unwrap().failing_apply.insert(name_of(kind, name));
    }

    pub fn fail_delete(&self, kind: &str, name: &str) {
        self.state.lock().unwrap().failing_delete.insert(name_of(kind, name));
    }

    /// Rejects namespaced writes, dry runs included, into a namespace that
    /// is not stored, as an API server does.
    pub fn require_namespaces(&self) {
        self.state.lock().unwrap().namespaces_required = true;
    }

    /// Makes every delete of the object hang without an answer.
    pub fn stall_delete(&self, kind: &str, name: &str) {
        self.state.lock().unwrap().stalled_delete.insert(name_of(kind, name));
    }

    pub fn fail_list(&self, kind: &str) {
        self.state.lock().unwrap().failing_list.insert(kind.to_string());
    }

    /// Lets `successes` gets through, then fails every later one.
    pub fn fail_get_after(&self, kind: &str, name: &str, successes: usize) {
        self.state
            .lock()
            .unwrap()
            .get_budget
            .insert(name_of(kind, name), successes);
    }

    /// Keeps a deleted object visible for `reads` more reads.
    pub fn linger(&self, kind: &str, name: &str, reads: usize) {
        self.state.lock().unwrap().lingering.insert(name_of(kind, name), reads);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn get_count(&self, kind: &str, name: &str) -> usize {
        self.count(|c| c.verb == "get" && c.kind == kind && c.name == name)
    }

    pub fn write_count(&self) -> usize {
        self.count(|c| matches!(c.verb, "apply" | "update" | "delete") && !c.dry_run)
    }

    pub fn verbs(&self, verb: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.verb == verb)
            .map(|c| format!("{}/{}", c.kind, c.name))
            .collect()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(state: &mut State, verb: &'static str, kind: &str, name: &str, dry_run: bool) {
        state.calls.push(Call {
            verb,
            kind: kind.to_string(),
            name: name.to_string(),
            dry_run,
        });
    }

    fn check_namespace(state: &State, namespace: Option<&str>) -> Result<()> {
        match namespace {
            Some(ns) if state.namespaces_required => {
                let key = ("Namespace".to_string(), None, ns.to_string());
                if state.objects.contains_key(&key) {
                    Ok(())
                } else {
                    Err(not_found("Namespace", ns))
                }
            }
            _ => Ok(()),
        }
    }

    fn read(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Value> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        Self::record(state, "get", kind, name, false);

        let id = name_of(kind, name);
        if let Some(budget) = state.get_budget.get_mut(&id) {
            if *budget == 0 {
                return Err(server_error("etcd unavailable"));
            }
            *budget -= 1;
        }

        let key = (kind.to_string(), namespace.map(str::to_string), name.to_string());
        let expired = match state.terminating.get_mut(&id) {
            Some(remaining) if *remaining == 0 => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        };
        if expired {
            state.terminating.remove(&id);
            state.objects.remove(&key);
        }

        let next = match state.scripts.get_mut(&id) {
            Some(steps) if steps.len() > 1 => steps.pop_front(),
            Some(steps) => steps.front().cloned(),
            None => None,
        };

        let value = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| not_found(kind, name))?;
        if let Some(conditions) = next {
            value["status"]["conditions"] =
                serde_json::to_value(conditions).expect("serializable conditions");
        }
        Ok(value.clone())
    }

    fn erase(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        Self::record(state, "delete", kind, name, false);

        let id = name_of(kind, name);
        if state.failing_delete.contains(&id) {
            return Err(server_error("admission webhook denied the request"));
        }

        let key = (kind.to_string(), namespace.map(str::to_string), name.to_string());
        if !state.objects.contains_key(&key) || state.terminating.contains_key(&id) {
            return Err(not_found(kind, name));
        }

        match state.lingering.remove(&id) {
            Some(reads) => {
                state.terminating.insert(id, reads);
            }
            None => {
                state.objects.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<K: Scoped> Apply<K> for FakeCluster {
    async fn apply(&self, obj: &K, dry_run: bool) -> Result<K> {
        let kind = K::kind_name();
        let name = obj.name_any();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        Self::record(state, "apply", &kind, &name, dry_run);

        if state.failing_apply.contains(&name_of(&kind, &name)) {
            return Err(server_error("apply rejected"));
        }
        Self::check_namespace(state, obj.namespace().as_deref())?;

        let mut value = serde_json::to_value(obj)?;
        let key = (kind, obj.namespace(), name);
        if let Some(existing) = state.objects.get(&key) {
            if value.get("status").map_or(true, Value::is_null) {
                if let Some(status) = existing.get("status") {
                    value["status"] = status.clone();
                }
            }
        }
        if !dry_run {
            state.objects.insert(key, value.clone());
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl<K: Scoped> Get<K> for FakeCluster {
    async fn get(&self, name: &str, namespace: Option<&str>) -> Result<K> {
        let value = self.read(&K::kind_name(), name, namespace)?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl<K: Scoped> Update<K> for FakeCluster {
    async fn update(&self, obj: &K, dry_run: bool) -> Result<K> {
        let kind = K::kind_name();
        let name = obj.name_any();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        Self::record(state, "update", &kind, &name, dry_run);
        Self::check_namespace(state, obj.namespace().as_deref())?;

        let key = (kind.clone(), obj.namespace(), name.clone());
        if !state.objects.contains_key(&key) {
            return Err(not_found(&kind, &name));
        }
        let value = serde_json::to_value(obj)?;
        if !dry_run {
            state.objects.insert(key, value.clone());
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl<K: Scoped> Delete<K> for FakeCluster {
    async fn delete(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        self.erase(&K::kind_name(), name, namespace)
    }
}

#[async_trait]
impl<K: Scoped> List<K> for FakeCluster {
    async fn list(&self, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<K>> {
        let kind = K::kind_name();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        Self::record(state, "list", &kind, "", false);

        if state.failing_list.contains(&kind) {
            return Err(server_error("list failed"));
        }

        let wanted: Vec<(&str, &str)> = selector
            .into_iter()
            .flat_map(|s| s.split(','))
            .filter_map(|term| term.split_once('='))
            .collect();

        state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (namespace.is_none() || ns.as_deref() == namespace))
            .filter(|(_, value)| {
                wanted.iter().all(|(key, expected)| {
                    value["metadata"]["labels"][*key].as_str() == Some(*expected)
                })
            })
            .map(|(_, value)| serde_json::from_value(value.clone()).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl Remove for FakeCluster {
    async fn remove(&self, target: &DeletionTarget) -> Result<()> {
        let stalled = {
            let state = self.state.lock().unwrap();
            state.stalled_delete.contains(&name_of(target.kind.as_str(), &target.name))
        };
        if stalled {
            return std::future::pending().await;
        }
        self.erase(target.kind.as_str(), &target.name, target.namespace.as_deref())
    }

    async fn exists(&self, target: &DeletionTarget) -> Result<bool> {
        match self.read(target.kind.as_str(), &target.name, target.namespace.as_deref()) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn catalog(name: &str) -> ClusterCatalog {
    ClusterCatalog::new(
        name,
        ClusterCatalogSpec {
            source: CatalogSource {
                source_type: SOURCE_TYPE_IMAGE.to_string(),
                image: Some(ImageSource {
                    reference: format!("quay.io/catalogs/{name}:latest"),
                    poll_interval_minutes: None,
                }),
            },
            priority: 0,
            availability_mode: None,
        },
    )
}

pub(crate) fn extension(name: &str, package: &str) -> ClusterExtension {
    ClusterExtension::new(
        name,
        ClusterExtensionSpec {
            namespace: format!("{name}-system"),
            service_account: ServiceAccountReference {
                name: format!("{name}-installer"),
            },
            source: ExtensionSource {
                source_type: SOURCE_TYPE_CATALOG.to_string(),
                catalog: Some(CatalogFilter {
                    package_name: package.to_string(),
                    ..Default::default()
                }),
            },
        },
    )
}
