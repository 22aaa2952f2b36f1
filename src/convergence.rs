//! Convergence engine.
//!
//! Applies a desired object once, then polls it at a fixed interval until the
//! success condition holds. The first check happens immediately. A failed
//! fetch ends the wait at once; a non-success diagnostic condition does not,
//! but its message is kept and becomes the timeout error if the deadline
//! passes or the caller cancels first.

use std::future::Future;
use std::time::Duration;

use kube::ResourceExt;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::StopCause;
use crate::k8s::ops::{Apply, Get};
use crate::k8s::types::{Conditioned, REASON_SUCCEEDED, STATUS_TRUE, TYPE_INSTALLED, TYPE_PROGRESSING, TYPE_SERVING};
use crate::k8s::Scoped;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ConvergencePolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub success_type: &'static str,
    pub success_status: &'static str,
    pub diagnostic_type: &'static str,
}

impl ConvergencePolicy {
    /// `Serving=True`, diagnosing through `Progressing`.
    pub fn serving(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
            success_type: TYPE_SERVING,
            success_status: STATUS_TRUE,
            diagnostic_type: TYPE_PROGRESSING,
        }
    }

    /// `Installed=True`, diagnosing through `Progressing`.
    pub fn installed(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
            success_type: TYPE_INSTALLED,
            success_status: STATUS_TRUE,
            diagnostic_type: TYPE_PROGRESSING,
        }
    }

    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }
}

/// Fixed-interval ticker bounded by a deadline and a cancellation token.
pub(crate) struct Ticker {
    interval: Interval,
    deadline: Instant,
}

impl Ticker {
    pub(crate) fn new(period: Duration, deadline: Instant) -> Self {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, deadline }
    }

    /// Waits for the next tick. The first tick completes immediately.
    pub(crate) async fn tick(&mut self, cancel: &CancellationToken) -> std::result::Result<(), StopCause> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StopCause::Cancelled),
            _ = time::sleep_until(self.deadline) => Err(StopCause::Deadline),
            _ = self.interval.tick() => Ok(()),
        }
    }

    /// Runs `fut` unless the deadline or cancellation comes first.
    pub(crate) async fn guard<F: Future>(
        &self,
        cancel: &CancellationToken,
        fut: F,
    ) -> std::result::Result<F::Output, StopCause> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StopCause::Cancelled),
            _ = time::sleep_until(self.deadline) => Err(StopCause::Deadline),
            out = fut => Ok(out),
        }
    }
}

/// Applies `desired` and waits until it satisfies `policy`.
///
/// The deadline counts from the call, so it covers the apply as well.
#[instrument(skip_all, fields(kind = %K::kind_name(), name = %desired.name_any()))]
pub async fn apply_and_wait<K, C>(
    client: &C,
    desired: &K,
    policy: &ConvergencePolicy,
    cancel: &CancellationToken,
) -> Result<K>
where
    K: Scoped + Conditioned,
    C: Apply<K> + Get<K> + ?Sized,
{
    let deadline = policy.deadline();
    let target = describe::<K>(&desired.name_any());

    let applied = cancellable(cancel, &target, client.apply(desired, false)).await?;
    debug!("applied desired object");

    wait_for(
        client,
        &applied.name_any(),
        applied.namespace().as_deref(),
        policy,
        deadline,
        cancel,
    )
    .await
}

/// Polls an existing object until it satisfies `policy` or `deadline` passes.
pub async fn wait_for<K, C>(
    client: &C,
    name: &str,
    namespace: Option<&str>,
    policy: &ConvergencePolicy,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<K>
where
    K: Scoped + Conditioned,
    C: Get<K> + ?Sized,
{
    let target = describe::<K>(name);
    let mut ticker = Ticker::new(policy.poll_interval, deadline);
    let mut diagnostic: Option<String> = None;

    loop {
        if let Err(cause) = ticker.tick(cancel).await {
            return Err(stopped(target, diagnostic, cause));
        }

        let observed = match ticker.guard(cancel, client.get(name, namespace)).await {
            Ok(fetched) => fetched?,
            Err(cause) => return Err(stopped(target, diagnostic, cause)),
        };

        if let Some(condition) = observed.condition(policy.diagnostic_type) {
            if condition.reason != REASON_SUCCEEDED && !condition.message.is_empty() {
                debug!(reason = %condition.reason, message = %condition.message, "still progressing");
                diagnostic = Some(condition.message.clone());
            }
        }

        if observed.condition_holds(policy.success_type, policy.success_status) {
            debug!(condition = policy.success_type, "converged");
            return Ok(observed);
        }
    }
}

/// Runs a single API call unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, target: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(stopped(target.to_string(), None, StopCause::Cancelled)),
        out = call => out,
    }
}

pub(crate) fn describe<K: Scoped>(name: &str) -> String {
    format!("{} {:?}", K::kind_name(), name)
}

fn stopped(target: String, diagnostic: Option<String>, cause: StopCause) -> Error {
    Error::ConvergenceTimeout {
        target,
        diagnostic,
        cause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::types::{condition, ClusterCatalog, TYPE_PROGRESSING, TYPE_SERVING};
    use crate::testing::{catalog, FakeCluster};
    use assert_matches::assert_matches;

    const POLL: Duration = Duration::from_millis(250);

    fn serving(status: &str) -> Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition> {
        vec![condition(TYPE_SERVING, status, "Available", "")]
    }

    fn progressing(message: &str) -> Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition> {
        vec![
            condition(TYPE_SERVING, "False", "Unavailable", ""),
            condition(TYPE_PROGRESSING, "True", "Retrying", message),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_on_first_satisfying_tick() {
        let cluster = FakeCluster::new();
        cluster.script_conditions(
            "ClusterCatalog",
            "foo",
            vec![progressing("unpacking"), serving("True"), serving("True")],
        );

        let policy = ConvergencePolicy::serving(POLL, Duration::from_secs(5));
        let start = Instant::now();
        let observed: ClusterCatalog =
            apply_and_wait(&cluster, &catalog("foo"), &policy, &CancellationToken::new())
                .await
                .unwrap();

        assert!(observed.is_serving());
        assert_eq!(cluster.get_count("ClusterCatalog", "foo"), 2);
        assert_eq!(start.elapsed(), POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_diagnostic() {
        let cluster = FakeCluster::new();
        cluster.script_conditions(
            "ClusterCatalog",
            "foo",
            vec![progressing("pulling image"), progressing("image not found")],
        );

        let policy = ConvergencePolicy::serving(POLL, Duration::from_secs(1));
        let err = apply_and_wait::<ClusterCatalog, _>(
            &cluster,
            &catalog("foo"),
            &policy,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "image not found");
        assert_matches!(
            err,
            Error::ConvergenceTimeout {
                cause: StopCause::Deadline,
                ..
            }
        );
        assert_eq!(cluster.get_count("ClusterCatalog", "foo"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_diagnostic_reports_cause() {
        let cluster = FakeCluster::new();
        cluster.script_conditions("ClusterCatalog", "foo", vec![serving("False")]);

        let policy = ConvergencePolicy::serving(POLL, Duration::from_secs(1));
        let err = apply_and_wait::<ClusterCatalog, _>(
            &cluster,
            &catalog("foo"),
            &policy,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "timed out waiting for ClusterCatalog \"foo\"");
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_failure_skips_polling() {
        let cluster = FakeCluster::new();
        cluster.fail_apply("ClusterCatalog", "foo");

        let policy = ConvergencePolicy::serving(POLL, Duration::from_secs(1));
        let result = apply_and_wait::<ClusterCatalog, _>(
            &cluster,
            &catalog("foo"),
            &policy,
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(cluster.get_count("ClusterCatalog", "foo"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_aborts_wait() {
        let cluster = FakeCluster::new();
        cluster.script_conditions("ClusterCatalog", "foo", vec![progressing("unpacking")]);
        cluster.fail_get_after("ClusterCatalog", "foo", 1);

        let policy = ConvergencePolicy::serving(POLL, Duration::from_secs(5));
        let err = apply_and_wait::<ClusterCatalog, _>(
            &cluster,
            &catalog("foo"),
            &policy,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_matches!(err, Error::Kube(_));
        assert_eq!(cluster.get_count("ClusterCatalog", "foo"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_sleep() {
        let cluster = FakeCluster::new();
        cluster.script_conditions("ClusterCatalog", "foo", vec![progressing("unpacking")]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let policy = ConvergencePolicy::serving(POLL, Duration::from_secs(60));
        let start = Instant::now();
        let err = apply_and_wait::<ClusterCatalog, _>(&cluster, &catalog("foo"), &policy, &cancel)
            .await
            .unwrap_err();

        assert_matches!(
            err,
            Error::ConvergenceTimeout {
                cause: StopCause::Cancelled,
                ..
            }
        );
        assert_eq!(err.to_string(), "unpacking");
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_a_pending_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let err = cancellable(
            &cancel,
            "ClusterCatalog \"foo\"",
            std::future::pending::<Result<ClusterCatalog>>(),
        )
        .await
        .unwrap_err();

        assert_matches!(
            err,
            Error::ConvergenceTimeout {
                cause: StopCause::Cancelled,
                ref target,
                ..
            } if target == "ClusterCatalog \"foo\""
        );
    }
}
