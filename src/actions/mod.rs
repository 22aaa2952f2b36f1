//! Lifecycle actions: the orchestration behind each command.
//!
//! Every action validates its input before the first write, talks to the
//! cluster only through the capability traits it names, and threads the
//! caller's cancellation token through each blocking step.

pub mod catalog;
pub mod content;
pub mod extension;
pub mod version_range;

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::compensation::{delete_and_wait_all, delete_and_wait_each, issue_delete, wait_absent};
use crate::config::Settings;
use crate::k8s::ops::{DeletionTarget, Get, Remove};
use crate::k8s::Scoped;
use crate::{Error, Result};

/// Result of an update that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome<K> {
    /// Written and converged.
    Updated(K),
    /// Desired state already matched; nothing was written.
    Unchanged(K),
    /// Accepted by a dry-run write; nothing was persisted.
    DryRun(K),
}

impl<K> UpdateOutcome<K> {
    pub fn object(&self) -> &K {
        match self {
            UpdateOutcome::Updated(obj) | UpdateOutcome::Unchanged(obj) | UpdateOutcome::DryRun(obj) => obj,
        }
    }
}

/// Which objects a delete command addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteScope {
    One(String),
    All,
}

impl DeleteScope {
    pub fn new(name: Option<String>, all: bool) -> Result<Self> {
        match (name, all) {
            (Some(_), true) => Err(Error::Validation(
                "a name and --all are mutually exclusive".to_string(),
            )),
            (Some(name), false) => Ok(DeleteScope::One(name)),
            (None, true) => Ok(DeleteScope::All),
            (None, false) => Err(Error::Validation(
                "either a name or --all is required".to_string(),
            )),
        }
    }
}

/// Names a delete attempted, those confirmed gone, and every failure.
#[derive(Debug)]
pub struct BulkDeletion {
    pub attempted: Vec<String>,
    pub deleted: Vec<String>,
    pub result: Result<()>,
}

/// Whether `name` exists, treating only `NotFound` as absence.
pub(crate) async fn exists<K, C>(client: &C, name: &str, namespace: Option<&str>) -> Result<bool>
where
    K: Scoped,
    C: Get<K> + ?Sized,
{
    match client.get(name, namespace).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Objects an install created, in creation order.
#[derive(Debug, Default)]
pub(crate) struct Created {
    prerequisites: Vec<DeletionTarget>,
    primary: Option<DeletionTarget>,
}

impl Created {
    pub(crate) fn prerequisite(&mut self, target: DeletionTarget) {
        self.prerequisites.push(target);
    }

    pub(crate) fn primary(&mut self, target: DeletionTarget) {
        self.primary = Some(target);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.prerequisites.is_empty() && self.primary.is_none()
    }
}

/// Removes what a failed install created and folds cleanup failures into `err`.
///
/// The primary object goes first, then the prerequisites. Cleanup runs under
/// its own deadline and a fresh token, so it still happens when the install
/// itself was cancelled.
pub(crate) async fn compensate<C>(client: &C, created: Created, err: Error, settings: &Settings) -> Error
where
    C: Remove + ?Sized,
{
    if created.is_empty() {
        return err;
    }

    warn!(error = %err, "install failed; removing created objects");
    let cleanup = CancellationToken::new();
    let mut failures = Vec::new();

    if let Some(primary) = created.primary {
        if let Err(e) = delete_and_wait_all(
            client,
            &[primary],
            settings.poll_interval,
            settings.cleanup_timeout,
            &cleanup,
        )
        .await
        {
            failures.push(e);
        }
    }

    let mut prerequisites = created.prerequisites;
    prerequisites.reverse();
    if let Err(e) = delete_and_wait_all(
        client,
        &prerequisites,
        settings.poll_interval,
        settings.cleanup_timeout,
        &cleanup,
    )
    .await
    {
        failures.push(e);
    }

    let result = Error::join(failures.into_iter().flat_map(flatten));
    if result.is_ok() {
        info!("created objects removed");
    }
    err.with_cleanup(result)
}

fn flatten(err: Error) -> Vec<Error> {
    match err {
        Error::Aggregate(agg) => agg.0,
        other => vec![other],
    }
}

/// Deletes one object, surfacing `NotFound`, and waits until it is gone.
pub(crate) async fn delete_one<C>(
    client: &C,
    target: DeletionTarget,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<BulkDeletion>
where
    C: Remove + ?Sized,
{
    let deadline = tokio::time::Instant::now() + settings.timeout;
    issue_delete(client, &target, settings.poll_interval, deadline, cancel).await?;
    info!(target = %target, "delete issued");
    wait_absent(client, &target, settings.poll_interval, deadline, cancel).await?;

    Ok(BulkDeletion {
        attempted: vec![target.name.clone()],
        deleted: vec![target.name],
        result: Ok(()),
    })
}

/// Deletes every target without stopping at the first failure.
pub(crate) async fn delete_many<C>(
    client: &C,
    targets: Vec<DeletionTarget>,
    settings: &Settings,
    cancel: &CancellationToken,
) -> BulkDeletion
where
    C: Remove + ?Sized,
{
    let results = delete_and_wait_each(client, &targets, settings.poll_interval, settings.timeout, cancel).await;
    let mut deleted = Vec::new();
    let mut failures = Vec::new();
    for (target, result) in targets.iter().zip(results) {
        match result {
            Ok(()) => deleted.push(target.name.clone()),
            Err(e) => failures.push(e),
        }
    }
    BulkDeletion {
        attempted: targets.into_iter().map(|t| t.name).collect(),
        deleted,
        result: Error::join(failures),
    }
}

/// Parses `key=value` pairs given on the command line.
pub fn parse_labels(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Validation(format!("label {pair:?} is not of the form key=value")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Validation(format!("label {pair:?} has an empty key")));
            }
            Ok((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_delete_scope_requires_exactly_one() {
        assert_eq!(
            DeleteScope::new(Some("a".to_string()), false).unwrap(),
            DeleteScope::One("a".to_string())
        );
        assert_eq!(DeleteScope::new(None, true).unwrap(), DeleteScope::All);
        assert_matches!(DeleteScope::new(Some("a".to_string()), true), Err(Error::Validation(_)));
        assert_matches!(DeleteScope::new(None, false), Err(Error::Validation(_)));
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels(&["team=olm".to_string(), "tier = gold".to_string()]).unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("olm"));
        assert_eq!(labels.get("tier").map(String::as_str), Some("gold"));
        assert!(parse_labels(&["nokey".to_string()]).is_err());
        assert!(parse_labels(&["=v".to_string()]).is_err());
    }
}
