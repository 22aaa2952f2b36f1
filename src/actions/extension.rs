use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::actions::{
    compensate, delete_many, delete_one, exists, version_range, BulkDeletion, Created, DeleteScope, UpdateOutcome,
};
use crate::config::Settings;
use crate::convergence::{apply_and_wait, cancellable, describe, wait_for, ConvergencePolicy};
use crate::k8s::ops::{Apply, DeletionTarget, Get, List, ObjectKind, Remove, Update};
use crate::k8s::selector;
use crate::k8s::types::{
    CatalogFilter, ClusterExtension, ClusterExtensionSpec, ExtensionSource, ServiceAccountReference,
    UpgradeConstraintPolicy, SOURCE_TYPE_CATALOG,
};
use crate::k8s::Scoped;
use crate::{Error, Result};

const CLUSTER_ADMIN: &str = "cluster-admin";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// Everything an install writes to.
pub trait InstallClient:
    Apply<ClusterExtension>
    + Get<ClusterExtension>
    + Apply<Namespace>
    + Get<Namespace>
    + Apply<ServiceAccount>
    + Get<ServiceAccount>
    + Apply<ClusterRoleBinding>
    + Get<ClusterRoleBinding>
    + Remove
{
}

impl<T> InstallClient for T where
    T: Apply<ClusterExtension>
        + Get<ClusterExtension>
        + Apply<Namespace>
        + Get<Namespace>
        + Apply<ServiceAccount>
        + Get<ServiceAccount>
        + Apply<ClusterRoleBinding>
        + Get<ClusterRoleBinding>
        + Remove
        + ?Sized
{
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub name: String,
    pub package: String,
    pub namespace: String,
    pub service_account: String,
    pub version: Option<String>,
    pub channels: Vec<String>,
    pub catalog_selector: Option<String>,
    pub upgrade_constraint_policy: UpgradeConstraintPolicy,
    /// Binds the service account to `cluster-admin`. Unsafe; opt-in only.
    pub cluster_admin: bool,
    pub labels: BTreeMap<String, String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub name: String,
    pub version: Option<String>,
    pub channels: Option<Vec<String>>,
    pub catalog_selector: Option<String>,
    pub upgrade_constraint_policy: Option<UpgradeConstraintPolicy>,
    pub labels: BTreeMap<String, String>,
    /// Unset options keep the value on the cluster instead of the default.
    pub ignore_unset: bool,
    pub dry_run: bool,
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}

fn parse_selector(input: Option<&str>) -> Result<Option<LabelSelector>> {
    input.map(selector::parse).transpose()
}

pub fn build(opts: &InstallOptions) -> Result<ClusterExtension> {
    let mut extension = ClusterExtension::new(
        &opts.name,
        ClusterExtensionSpec {
            namespace: opts.namespace.clone(),
            service_account: ServiceAccountReference {
                name: opts.service_account.clone(),
            },
            source: ExtensionSource {
                source_type: SOURCE_TYPE_CATALOG.to_string(),
                catalog: Some(CatalogFilter {
                    package_name: opts.package.clone(),
                    version: opts.version.clone(),
                    channels: opts.channels.clone(),
                    selector: parse_selector(opts.catalog_selector.as_deref())?,
                    upgrade_constraint_policy: Some(opts.upgrade_constraint_policy),
                }),
            },
        },
    );
    if !opts.labels.is_empty() {
        extension.metadata.labels = Some(opts.labels.clone());
    }
    Ok(extension)
}

fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn service_account(name: &str, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn cluster_admin_binding_name(opts: &InstallOptions) -> String {
    format!("{}-{}-{}", opts.name, opts.service_account, CLUSTER_ADMIN)
}

fn cluster_admin_binding(opts: &InstallOptions) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(cluster_admin_binding_name(opts)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ADMIN.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: opts.service_account.clone(),
            namespace: Some(opts.namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// Applies a prerequisite, remembering it for cleanup if this call created
/// it. Returns whether it was already present.
async fn ensure<K, C>(
    client: &C,
    obj: &K,
    target: DeletionTarget,
    dry_run: bool,
    created: &mut Created,
    cancel: &CancellationToken,
) -> Result<bool>
where
    K: Scoped,
    C: Apply<K> + Get<K> + ?Sized,
{
    let described = target.to_string();
    let existed = cancellable(
        cancel,
        &described,
        exists::<K, _>(client, &obj.name_any(), obj.namespace().as_deref()),
    )
    .await?;
    cancellable(cancel, &described, client.apply(obj, dry_run)).await?;
    if existed {
        debug!(target = %target, "prerequisite already present");
    } else if !dry_run {
        info!(target = %target, "created prerequisite");
        created.prerequisite(target);
    }
    Ok(existed)
}

/// Installs an extension and waits until it reports `Installed`.
///
/// Prerequisites go first: the install namespace, the service account, and
/// the cluster-admin binding when asked for. If anything fails after the
/// first write, every object this call created is removed again, the
/// extension first.
#[instrument(skip_all, fields(extension = %opts.name, package = %opts.package))]
pub async fn install<C>(
    client: &C,
    opts: &InstallOptions,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<ClusterExtension>
where
    C: InstallClient + ?Sized,
{
    require(&opts.name, "extension name")?;
    require(&opts.package, "package name")?;
    require(&opts.namespace, "namespace")?;
    require(&opts.service_account, "service account")?;
    if let Some(version) = &opts.version {
        version_range::validate(version)?;
    }
    let desired = build(opts)?;
    if opts.cluster_admin {
        warn!(
            service_account = %opts.service_account,
            "binding the installer service account to cluster-admin"
        );
    }

    let mut created = Created::default();
    let result: Result<ClusterExtension> = async {
        let namespace_existed = ensure(
            client,
            &namespace(&opts.namespace),
            DeletionTarget::cluster(ObjectKind::Namespace, &opts.namespace),
            opts.dry_run,
            &mut created,
            cancel,
        )
        .await?;
        // A dry-run namespace is never persisted, so the API server would
        // reject anything placed inside it.
        if opts.dry_run && !namespace_existed {
            info!(
                namespace = %opts.namespace,
                "namespace does not exist yet; skipping dry run of the service account"
            );
        } else {
            ensure(
                client,
                &service_account(&opts.service_account, &opts.namespace),
                DeletionTarget::namespaced(ObjectKind::ServiceAccount, &opts.service_account, &opts.namespace),
                opts.dry_run,
                &mut created,
                cancel,
            )
            .await?;
        }
        if opts.cluster_admin {
            ensure(
                client,
                &cluster_admin_binding(opts),
                DeletionTarget::cluster(ObjectKind::ClusterRoleBinding, cluster_admin_binding_name(opts)),
                opts.dry_run,
                &mut created,
                cancel,
            )
            .await?;
        }

        let target = describe::<ClusterExtension>(&opts.name);
        if opts.dry_run {
            return cancellable(cancel, &target, Apply::<ClusterExtension>::apply(client, &desired, true)).await;
        }

        if !cancellable(cancel, &target, exists::<ClusterExtension, _>(client, &opts.name, None)).await? {
            created.primary(DeletionTarget::cluster(ObjectKind::ClusterExtension, &opts.name));
        }
        let policy = ConvergencePolicy::installed(settings.poll_interval, settings.timeout);
        apply_and_wait(client, &desired, &policy, cancel).await
    }
    .await;

    match result {
        Ok(extension) => {
            if let Some(bundle) = extension.installed_bundle() {
                info!(bundle = %bundle.name, version = %bundle.version, "extension installed");
            }
            Ok(extension)
        }
        Err(err) => Err(compensate(client, created, err, settings).await),
    }
}

/// Applies the requested changes to an existing extension.
#[instrument(skip_all, fields(extension = %opts.name))]
pub async fn update<C>(
    client: &C,
    opts: &UpdateOptions,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<UpdateOutcome<ClusterExtension>>
where
    C: Get<ClusterExtension> + Update<ClusterExtension> + ?Sized,
{
    require(&opts.name, "extension name")?;
    if let Some(version) = &opts.version {
        version_range::validate(version)?;
    }
    let requested_selector = parse_selector(opts.catalog_selector.as_deref())?;

    let target = describe::<ClusterExtension>(&opts.name);
    let current: ClusterExtension = cancellable(cancel, &target, client.get(&opts.name, None)).await?;
    let Some(current_filter) = current
        .catalog_filter()
        .filter(|_| current.spec.source.source_type == SOURCE_TYPE_CATALOG)
    else {
        return Err(Error::Validation(format!(
            "extension {:?} has source type {:?}, only {:?} extensions can be updated",
            opts.name, current.spec.source.source_type, SOURCE_TYPE_CATALOG
        )));
    };

    let keep = opts.ignore_unset;
    let filter = CatalogFilter {
        package_name: current_filter.package_name.clone(),
        version: match &opts.version {
            Some(v) => Some(v.clone()),
            None if keep => current_filter.version.clone(),
            None => None,
        },
        channels: match &opts.channels {
            Some(channels) => channels.clone(),
            None if keep => current_filter.channels.clone(),
            None => Vec::new(),
        },
        selector: match requested_selector {
            Some(sel) => Some(sel),
            None if keep => current_filter.selector.clone(),
            None => None,
        },
        upgrade_constraint_policy: match opts.upgrade_constraint_policy {
            Some(policy) => Some(policy),
            None if keep => current_filter.upgrade_constraint_policy,
            None => Some(UpgradeConstraintPolicy::default()),
        },
    };

    let mut labels = if keep {
        current.metadata.labels.clone().unwrap_or_default()
    } else {
        BTreeMap::new()
    };
    labels.extend(opts.labels.clone());

    if !filter_changed(current_filter, &filter) && labels == current.metadata.labels.clone().unwrap_or_default() {
        info!("extension already matches; nothing to update");
        return Ok(UpdateOutcome::Unchanged(current));
    }

    let mut desired = current.clone();
    desired.spec.source.catalog = Some(filter);
    desired.metadata.labels = if labels.is_empty() && current.metadata.labels.is_none() {
        None
    } else {
        Some(labels)
    };

    if opts.dry_run {
        return cancellable(cancel, &target, client.update(&desired, true))
            .await
            .map(UpdateOutcome::DryRun);
    }

    let written = cancellable(cancel, &target, client.update(&desired, false)).await?;
    debug!("extension updated");

    let policy = ConvergencePolicy::installed(settings.poll_interval, settings.timeout);
    let converged = wait_for(client, &written.name_any(), None, &policy, policy.deadline(), cancel).await?;
    Ok(UpdateOutcome::Updated(converged))
}

/// Compares every mutable field, ignoring spelling differences that mean
/// the same thing: channel order, selector term order, an absent policy.
fn filter_changed(current: &CatalogFilter, desired: &CatalogFilter) -> bool {
    let sorted = |channels: &[String]| {
        let mut channels = channels.to_vec();
        channels.sort();
        channels.dedup();
        channels
    };

    current.version != desired.version
        || sorted(&current.channels) != sorted(&desired.channels)
        || selector::normalize(current.selector.as_ref()) != selector::normalize(desired.selector.as_ref())
        || current.upgrade_constraint_policy.unwrap_or_default()
            != desired.upgrade_constraint_policy.unwrap_or_default()
}

/// Deletes one extension, or every extension.
#[instrument(skip_all, fields(scope = ?scope))]
pub async fn uninstall<C>(
    client: &C,
    scope: &DeleteScope,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<BulkDeletion>
where
    C: List<ClusterExtension> + Remove + ?Sized,
{
    match scope {
        DeleteScope::One(name) => {
            delete_one(client, DeletionTarget::cluster(ObjectKind::ClusterExtension, name), settings, cancel).await
        }
        DeleteScope::All => {
            let extensions: Vec<ClusterExtension> = client.list(None, None).await?;
            let targets = extensions
                .iter()
                .map(|e| DeletionTarget::cluster(ObjectKind::ClusterExtension, e.name_any()))
                .collect();
            Ok(delete_many(client, targets, settings, cancel).await)
        }
    }
}

/// One named extension, or every extension matching `selector`.
pub async fn get<C>(client: &C, name: Option<&str>, label_selector: Option<&str>) -> Result<Vec<ClusterExtension>>
where
    C: Get<ClusterExtension> + List<ClusterExtension> + ?Sized,
{
    if let Some(sel) = label_selector {
        selector::parse(sel)?;
    }
    match name {
        Some(name) => {
            let extension: ClusterExtension = client.get(name, None).await?;
            Ok(vec![extension])
        }
        None => {
            let mut extensions: Vec<ClusterExtension> = client.list(None, label_selector).await?;
            extensions.sort_by_key(|e| e.name_any());
            Ok(extensions)
        }
    }
}
