//! Timed, bounded polling of a [`CorrelationStore`].
//!
//! The gate never mutates a store. Consuming a record after [`PollOutcome::Ready`] is the
//! caller's job. Polling runs at a fixed interval; the vendor test environment expects
//! exactly that cadence, so there is no backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::store::{CorrelationStore, Milestone};

/// Default polling interval for the fingerprint sub-flow.
pub const FINGERPRINT_POLL_INTERVAL: Duration = Duration::from_millis(5_000);

/// Default polling interval for the challenge sub-flow.
pub const CHALLENGE_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// Result of polling a store for a transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PollOutcome {
    /// The identifier is present. The caller should consume it.
    Ready,
    /// The deadline elapsed first. Not an error: the caller may poll again.
    TimedOut,
    /// The caller stopped polling before either of the above.
    Stopped,
}

/// Interval and optional deadline of a polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Time between two evaluations of the predicate.
    pub interval: Duration,
    /// Time after which the run gives up. `None` polls until stopped.
    pub deadline: Option<Duration>,
}

impl PollPolicy {
    /// Polls every `interval` with no deadline.
    #[must_use]
    pub const fn every(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Sets the deadline of the run.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Protocol default for `milestone`.
    #[must_use]
    pub const fn for_milestone(milestone: Milestone) -> Self {
        match milestone {
            Milestone::Fingerprint => Self::every(FINGERPRINT_POLL_INTERVAL),
            Milestone::Challenge => Self::every(CHALLENGE_POLL_INTERVAL),
        }
    }
}

/// Waits for a transaction identifier to appear in a [`CorrelationStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingGate;

impl PollingGate {
    /// Evaluates the predicate once, as a run whose deadline has already passed.
    ///
    /// This is the tick a caller-driven timer invokes on every poll request. It blocks
    /// only for a single store lookup.
    #[must_use]
    pub fn check(store: &CorrelationStore, server_transaction_id: &str) -> PollOutcome {
        let outcome = if store.contains(server_transaction_id) {
            PollOutcome::Ready
        } else {
            PollOutcome::TimedOut
        };
        debug!(
            milestone = %store.milestone(),
            server_transaction_id,
            ?outcome,
            "poll tick"
        );
        outcome
    }

    /// Re-evaluates the predicate every `policy.interval` until it holds, the deadline
    /// elapses or `stop` resolves.
    ///
    /// The first evaluation happens immediately. `stop` is only observed between ticks, so
    /// an evaluation in progress always finishes.
    pub async fn wait<F>(
        store: &CorrelationStore,
        server_transaction_id: &str,
        policy: PollPolicy,
        stop: F,
    ) -> PollOutcome
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                biased;
                () = &mut stop => return PollOutcome::Stopped,
                _ = ticker.tick() => {}
            }
            if Self::check(store, server_transaction_id) == PollOutcome::Ready {
                return PollOutcome::Ready;
            }
            if policy
                .deadline
                .is_some_and(|deadline| started.elapsed() >= deadline)
            {
                return PollOutcome::TimedOut;
            }
        }
    }

    /// Runs [`PollingGate::wait`] on a background task.
    ///
    /// Dropping the returned [`PollTask`] stops the run.
    #[must_use]
    pub fn spawn(
        store: Arc<CorrelationStore>,
        server_transaction_id: String,
        policy: PollPolicy,
    ) -> PollTask {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let stop = async move {
                // A dropped sender means the owner went away: stop as well.
                let _ = stop_rx.await;
            };
            Self::wait(&store, &server_transaction_id, policy, stop).await
        });
        PollTask {
            stop: Some(stop_tx),
            handle,
        }
    }
}

/// Handle to a polling run started with [`PollingGate::spawn`].
#[derive(Debug)]
pub struct PollTask {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<PollOutcome>,
}

impl PollTask {
    /// Asks the run to stop before its next tick.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Waits for the run to finish and returns its outcome.
    pub async fn outcome(self) -> PollOutcome {
        let Self { stop, handle } = self;
        let outcome = handle.await.unwrap_or(PollOutcome::Stopped);
        drop(stop);
        outcome
    }
}
