use std::collections::BTreeMap;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::actions::{
    compensate, delete_many, delete_one, exists, BulkDeletion, Created, DeleteScope, UpdateOutcome,
};
use crate::config::Settings;
use crate::convergence::{apply_and_wait, cancellable, describe, wait_for, ConvergencePolicy};
use crate::k8s::ops::{Apply, DeletionTarget, Get, List, ObjectKind, Remove, Update};
use crate::k8s::selector;
use crate::k8s::types::{
    AvailabilityMode, CatalogSource, ClusterCatalog, ClusterCatalogSpec, ImageSource, SOURCE_TYPE_IMAGE,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub name: String,
    pub image: String,
    pub priority: i32,
    /// `None` or `Some(0)` leaves polling off.
    pub poll_interval_minutes: Option<i32>,
    pub labels: BTreeMap<String, String>,
    pub available: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub name: String,
    pub image: Option<String>,
    pub priority: Option<i32>,
    pub poll_interval_minutes: Option<i32>,
    pub availability: Option<AvailabilityMode>,
    pub labels: BTreeMap<String, String>,
    /// Unset options keep the value on the cluster instead of the default.
    pub ignore_unset: bool,
    pub dry_run: bool,
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("catalog name must not be empty".to_string()));
    }
    Ok(())
}

fn validate_poll_interval(minutes: Option<i32>) -> Result<()> {
    match minutes {
        Some(m) if m < 0 => Err(Error::Validation(format!(
            "poll interval must not be negative, got {m}"
        ))),
        _ => Ok(()),
    }
}

/// Zero disables polling, which the API expresses as an absent field.
fn poll_interval(minutes: Option<i32>) -> Option<i32> {
    minutes.filter(|m| *m > 0)
}

pub fn build(opts: &AddOptions) -> ClusterCatalog {
    let mut catalog = ClusterCatalog::new(
        &opts.name,
        ClusterCatalogSpec {
            source: CatalogSource {
                source_type: SOURCE_TYPE_IMAGE.to_string(),
                image: Some(ImageSource {
                    reference: opts.image.clone(),
                    poll_interval_minutes: poll_interval(opts.poll_interval_minutes),
                }),
            },
            priority: opts.priority,
            availability_mode: Some(if opts.available {
                AvailabilityMode::Available
            } else {
                AvailabilityMode::Unavailable
            }),
        },
    );
    if !opts.labels.is_empty() {
        catalog.metadata.labels = Some(opts.labels.clone());
    }
    catalog
}

/// Creates a catalog and waits until it serves content.
///
/// A catalog created by this call is removed again if it never starts
/// serving. An unavailable catalog never serves, so there is nothing to wait
/// for.
#[instrument(skip_all, fields(catalog = %opts.name))]
pub async fn add<C>(client: &C, opts: &AddOptions, settings: &Settings, cancel: &CancellationToken) -> Result<ClusterCatalog>
where
    C: Apply<ClusterCatalog> + Get<ClusterCatalog> + Remove + ?Sized,
{
    validate_name(&opts.name)?;
    if opts.image.trim().is_empty() {
        return Err(Error::Validation("catalog image must not be empty".to_string()));
    }
    validate_poll_interval(opts.poll_interval_minutes)?;

    let desired = build(opts);
    let target = describe::<ClusterCatalog>(&opts.name);
    if opts.dry_run {
        return cancellable(cancel, &target, client.apply(&desired, true)).await;
    }
    if !opts.available {
        info!("catalog is unavailable; not waiting for it to serve");
        return cancellable(cancel, &target, client.apply(&desired, false)).await;
    }

    let mut created = Created::default();
    if !exists::<ClusterCatalog, _>(client, &opts.name, None).await? {
        created.primary(DeletionTarget::cluster(ObjectKind::ClusterCatalog, &opts.name));
    }

    let policy = ConvergencePolicy::serving(settings.poll_interval, settings.timeout);
    match apply_and_wait(client, &desired, &policy, cancel).await {
        Ok(catalog) => {
            info!("catalog is serving");
            Ok(catalog)
        }
        Err(err) => Err(compensate(client, created, err, settings).await),
    }
}

/// Applies the requested changes to an existing catalog.
#[instrument(skip_all, fields(catalog = %opts.name))]
pub async fn update<C>(
    client: &C,
    opts: &UpdateOptions,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<UpdateOutcome<ClusterCatalog>>
where
    C: Get<ClusterCatalog> + Update<ClusterCatalog> + ?Sized,
{
    validate_name(&opts.name)?;
    validate_poll_interval(opts.poll_interval_minutes)?;

    let target = describe::<ClusterCatalog>(&opts.name);
    let current: ClusterCatalog = cancellable(cancel, &target, client.get(&opts.name, None)).await?;
    if current.spec.source.source_type != SOURCE_TYPE_IMAGE {
        return Err(Error::Validation(format!(
            "catalog {:?} has source type {:?}, only {:?} catalogs can be updated",
            opts.name, current.spec.source.source_type, SOURCE_TYPE_IMAGE
        )));
    }

    let desired = merge(&current, opts);
    if desired == current {
        info!("catalog already matches; nothing to update");
        return Ok(UpdateOutcome::Unchanged(current));
    }

    if opts.dry_run {
        return cancellable(cancel, &target, client.update(&desired, true))
            .await
            .map(UpdateOutcome::DryRun);
    }

    let written = cancellable(cancel, &target, client.update(&desired, false)).await?;
    debug!("catalog updated");
    if written.availability() == AvailabilityMode::Unavailable {
        return Ok(UpdateOutcome::Updated(written));
    }

    let policy = ConvergencePolicy::serving(settings.poll_interval, settings.timeout);
    let converged = wait_for(client, &written.name_any(), None, &policy, policy.deadline(), cancel).await?;
    Ok(UpdateOutcome::Updated(converged))
}

/// The current object with the requested changes laid over it.
///
/// Unset options either keep their current value or fall back to the
/// defaults a fresh catalog would get. The image has no default and is
/// always kept unless given.
fn merge(current: &ClusterCatalog, opts: &UpdateOptions) -> ClusterCatalog {
    let mut desired = current.clone();
    let keep = opts.ignore_unset;

    let current_image = current.spec.source.image.clone().unwrap_or_default();
    desired.spec.source.image = Some(ImageSource {
        reference: opts.image.clone().unwrap_or(current_image.reference),
        poll_interval_minutes: match opts.poll_interval_minutes {
            Some(minutes) => poll_interval(Some(minutes)),
            None if keep => current_image.poll_interval_minutes,
            None => None,
        },
    });

    desired.spec.priority = match opts.priority {
        Some(priority) => priority,
        None if keep => current.spec.priority,
        None => 0,
    };

    let availability = match opts.availability {
        Some(mode) => mode,
        None if keep => current.availability(),
        None => AvailabilityMode::default(),
    };
    // An absent mode already means Available; keep the spelling the cluster has.
    if current.spec.availability_mode.is_some() || availability != AvailabilityMode::Available {
        desired.spec.availability_mode = Some(availability);
    }

    let mut labels = if keep { current.labels() } else { BTreeMap::new() };
    labels.extend(opts.labels.clone());
    desired.metadata.labels = if labels.is_empty() && current.metadata.labels.is_none() {
        None
    } else {
        Some(labels)
    };

    desired
}

/// Deletes one catalog, or every catalog.
#[instrument(skip_all, fields(scope = ?scope))]
pub async fn remove<C>(
    client: &C,
    scope: &DeleteScope,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<BulkDeletion>
where
    C: List<ClusterCatalog> + Remove + ?Sized,
{
    match scope {
        DeleteScope::One(name) => {
            delete_one(client, DeletionTarget::cluster(ObjectKind::ClusterCatalog, name), settings, cancel).await
        }
        DeleteScope::All => {
            let catalogs: Vec<ClusterCatalog> = client.list(None, None).await?;
            let targets = catalogs
                .iter()
                .map(|c| DeletionTarget::cluster(ObjectKind::ClusterCatalog, c.name_any()))
                .collect();
            Ok(delete_many(client, targets, settings, cancel).await)
        }
    }
}

/// One named catalog, or every catalog matching `selector`.
pub async fn list<C>(client: &C, name: Option<&str>, label_selector: Option<&str>) -> Result<Vec<ClusterCatalog>>
where
    C: Get<ClusterCatalog> + List<ClusterCatalog> + ?Sized,
{
    if let Some(sel) = label_selector {
        selector::parse(sel)?;
    }
    match name {
        Some(name) => {
            let catalog: ClusterCatalog = client.get(name, None).await?;
            Ok(vec![catalog])
        }
        None => {
            let mut catalogs: Vec<ClusterCatalog> = client.list(None, label_selector).await?;
            catalogs.sort_by_key(|c| c.name_any());
            Ok(catalogs)
        }
    }
}
