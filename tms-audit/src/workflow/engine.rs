//! Activity execution and schedules

use dashmap::DashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Activity, ActivityContext, ActivityOptions};
use crate::error::{Error, Result};

/// A running schedule
#[derive(Debug)]
pub struct ScheduleHandle {
    name: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ScheduleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Executes activities and owns timer-driven schedules.
///
/// Every schedule runs on a child of the engine's root token, so
/// [`shutdown`](Self::shutdown) stops all of them.
#[derive(Debug)]
pub struct WorkflowEngine {
    root: CancellationToken,
    schedules: DashMap<String, ScheduleHandle>,
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            schedules: DashMap::new(),
        }
    }

    /// Run `activity` to completion under `options`.
    pub async fn execute_activity<A: Activity>(
        &self,
        activity: &A,
        input: &A::Input,
        options: &ActivityOptions,
    ) -> Result<A::Output> {
        let policy = &options.retry_policy;
        let mut attempt: u32 = 1;

        loop {
            let ctx = ActivityContext::new(A::NAME, attempt, self.root.child_token());
            let err = match self.run_attempt(activity, input, options, &ctx).await {
                Ok(output) => {
                    if attempt > 1 {
                        tracing::info!(activity = A::NAME, attempt, "Activity succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(e) => e,
            };

            if self.root.is_cancelled() {
                return Err(Error::Workflow(format!("{} cancelled: {}", A::NAME, err)));
            }

            if !policy.should_retry(err.kind(), attempt) {
                if err.is_retryable() {
                    tracing::error!(activity = A::NAME, attempt, error = %err, "Activity failed");
                    return Err(Error::MaxRetriesExceeded {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                tracing::warn!(activity = A::NAME, kind = %err.kind(), error = %err, "Activity failed permanently");
                return Err(err);
            }

            let delay = policy.delay_for(attempt);
            tracing::warn!(
                activity = A::NAME,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Activity attempt failed, retrying"
            );

            tokio::select! {
                biased;
                () = self.root.cancelled() => {
                    return Err(Error::Workflow(format!("{} cancelled during retry backoff", A::NAME)));
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn run_attempt<A: Activity>(
        &self,
        activity: &A,
        input: &A::Input,
        options: &ActivityOptions,
        ctx: &ActivityContext,
    ) -> Result<A::Output> {
        let heartbeat_timeout = options.heartbeat_timeout;
        let check_every = (heartbeat_timeout / 2).max(Duration::from_millis(1));

        let watchdog = async {
            loop {
                tokio::time::sleep(check_every).await;
                if ctx.since_heartbeat() > heartbeat_timeout {
                    return;
                }
            }
        };

        let outcome = tokio::time::timeout(options.start_to_close_timeout, async {
            tokio::select! {
                result = activity.execute(ctx, input) => result,
                () = watchdog => {
                    Err(Error::DeadlineExceeded(format!(
                        "{} missed its heartbeat for {:?}",
                        A::NAME, heartbeat_timeout
                    )))
                }
            }
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded(format!(
                "{} exceeded start-to-close timeout of {:?}",
                A::NAME,
                options.start_to_close_timeout
            ))),
        };
        if result.is_err() {
            ctx.cancellation().cancel();
        }
        result
    }

    /// Run `task` repeatedly; each run returns the delay before the next one.
    ///
    /// Cancellation is observed between runs; a run in progress finishes.
    /// Replaces any schedule already registered under `name`.
    pub fn schedule<F, Fut>(&self, name: impl Into<String>, initial_delay: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Duration> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.root.child_token();
        let token = cancel.clone();
        let task_name = name.clone();

        let join = tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        tracing::debug!(schedule = %task_name, "Schedule cancelled");
                        break;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                delay = task().await;
            }
        });

        tracing::info!(schedule = %name, initial_delay_ms = initial_delay.as_millis() as u64, "Schedule started");
        let handle = ScheduleHandle {
            name: name.clone(),
            cancel,
            join,
        };
        if let Some(previous) = self.schedules.insert(name, handle) {
            previous.cancel.cancel();
        }
    }

    /// Fixed-period variant of [`schedule`](Self::schedule).
    pub fn schedule_periodic<F, Fut>(&self, name: impl Into<String>, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(name, period, move || {
            let run = task();
            async move {
                run.await;
                period
            }
        });
    }

    /// Stop one schedule. Returns false if no schedule has that name.
    pub fn cancel_schedule(&self, name: &str) -> bool {
        match self.schedules.remove(name) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn schedule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schedules.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    /// Cancel every schedule and wait until `timeout` for running tasks.
    ///
    /// Tasks still running at the deadline are aborted; by the time this
    /// returns no schedule task is alive.
    pub async fn shutdown(&self, timeout: Duration) {
        self.root.cancel();
        let deadline = tokio::time::Instant::now() + timeout;

        let names: Vec<String> = self.schedules.iter().map(|s| s.key().clone()).collect();
        for name in names {
            let Some((_, mut handle)) = self.schedules.remove(&name) else {
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut handle.join).await {
                Ok(Ok(())) => {
                    tracing::debug!(schedule = %name, "Schedule shutdown complete");
                }
                Ok(Err(e)) => {
                    tracing::warn!(schedule = %name, error = %e, "Schedule panicked during shutdown");
                }
                Err(_) => {
                    handle.join.abort();
                    let _ = handle.join.await;
                    tracing::warn!(schedule = %name, "Schedule aborted after shutdown timeout");
                }
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn cancellation(&self) -> CancellationToken {
        self.root.clone()
    }
}
