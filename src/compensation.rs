//! Compensating deletion.
//!
//! Deletes a set of objects concurrently and waits until each one is gone.
//! Every target runs to completion; per-target failures are collected rather
//! than short-circuiting, and a target that is already absent counts as done.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::convergence::Ticker;
use crate::error::StopCause;
use crate::k8s::ops::{DeletionTarget, Remove};
use crate::{Error, Result};

/// Deletes every target and joins all failures into one aggregate.
pub async fn delete_and_wait_all<C>(
    client: &C,
    targets: &[DeletionTarget],
    poll_interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: Remove + ?Sized,
{
    let results = delete_and_wait_each(client, targets, poll_interval, timeout, cancel).await;
    Error::join(results.into_iter().filter_map(Result::err))
}

/// Deletes every target; the result at index `i` belongs to `targets[i]`.
pub async fn delete_and_wait_each<C>(
    client: &C,
    targets: &[DeletionTarget],
    poll_interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Vec<Result<()>>
where
    C: Remove + ?Sized,
{
    if targets.is_empty() {
        return Vec::new();
    }

    let deadline = Instant::now() + timeout;
    info!(count = targets.len(), "deleting objects");

    let results = join_all(
        targets
            .iter()
            .map(|target| delete_and_wait(client, target, poll_interval, deadline, cancel)),
    )
    .await;

    for (target, result) in targets.iter().zip(&results) {
        if let Err(e) = result {
            warn!(target = %target, error = %e, "failed to delete");
        }
    }
    results
}

/// Deletes one target, then waits until it can no longer be fetched.
pub async fn delete_and_wait<C>(
    client: &C,
    target: &DeletionTarget,
    poll_interval: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: Remove + ?Sized,
{
    match issue_delete(client, target, poll_interval, deadline, cancel).await {
        Ok(()) => debug!(target = %target, "delete issued"),
        Err(e) if e.is_not_found() => {
            debug!(target = %target, "already absent");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    wait_absent(client, target, poll_interval, deadline, cancel).await
}

/// Issues the delete call itself, bounded by `deadline` and `cancel`.
/// `NotFound` is passed through for the caller to judge.
pub async fn issue_delete<C>(
    client: &C,
    target: &DeletionTarget,
    poll_interval: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: Remove + ?Sized,
{
    Ticker::new(poll_interval, deadline)
        .guard(cancel, client.remove(target))
        .await
        .map_err(|cause| deletion_stopped(target, cause))?
}

pub async fn wait_absent<C>(
    client: &C,
    target: &DeletionTarget,
    poll_interval: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: Remove + ?Sized,
{
    let mut ticker = Ticker::new(poll_interval, deadline);
    let stopped = |cause| deletion_stopped(target, cause);

    loop {
        ticker.tick(cancel).await.map_err(stopped)?;

        let exists = ticker
            .guard(cancel, client.exists(target))
            .await
            .map_err(stopped)??;
        if !exists {
            debug!(target = %target, "confirmed absent");
            return Ok(());
        }
    }
}

fn deletion_stopped(target: &DeletionTarget, cause: StopCause) -> Error {
    Error::ConvergenceTimeout {
        target: format!("{} to be deleted", target),
        diagnostic: None,
        cause,
    }
}
