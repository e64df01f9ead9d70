//! Adaptive Timeout Manager: grows the timeout allowed for a retried
//! operation geometrically instead of using one fixed deadline, tracks
//! which operations are currently in flight so a health check can report
//! on them, and extends a still-running operation's deadline when it
//! reports it's making progress rather than killing work that's almost
//! done. The backoff formula and its cap are copied, field-for-field,
//! from `copilot-workflow::execution::RetryConfig::calculate_backoff`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};
use vibe_core::{EventBus, OrchestratorError, OrchestratorEvent, OrchestratorResult, TaskId, TimeoutConfig};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub backoff_factor: f64,
    pub max_retries: u32,
}

impl From<&TimeoutConfig> for BackoffPolicy {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            base_timeout_ms: config.base_timeout_ms,
            max_timeout_ms: config.max_timeout_ms,
            backoff_factor: config.backoff_factor,
            max_retries: config.max_retries,
        }
    }
}

impl BackoffPolicy {
    /// `baseTimeoutMs * factor^attempt`, capped at `maxTimeoutMs`.
    pub fn calculate_timeout(&self, attempt: u32) -> Duration {
        let scaled = self.base_timeout_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = scaled.min(self.max_timeout_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }
}

/// A one-shot cancellation latch shared between whoever wants to abort an
/// in-flight operation and the task actually running it. Cloning shares
/// the same underlying latch; cancelling from any clone wakes every
/// `on_cancelled` waiter exactly once.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Idempotent: cancelling an already-cancelled token is a no-op.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, otherwise waits for the
    /// next `cancel()` call.
    pub async fn on_cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A progress sample an in-flight operation can push out through a
/// `watch` channel so the timeout manager can extend its deadline and
/// detect stagnation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub fraction_complete: f64,
    pub estimated_remaining: Option<Duration>,
}

impl Default for ProgressUpdate {
    fn default() -> Self {
        Self {
            fraction_complete: 0.0,
            estimated_remaining: None,
        }
    }
}

/// Handed to the code producing progress updates; `execute_with_timeout`
/// holds the paired receiver.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: watch::Sender<ProgressUpdate>,
}

impl ProgressHandle {
    pub fn report(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }
}

pub fn progress_channel() -> (ProgressHandle, watch::Receiver<ProgressUpdate>) {
    let (tx, rx) = watch::channel(ProgressUpdate::default());
    (ProgressHandle { tx }, rx)
}

/// Tunables for a single `execute_with_timeout` call. `T` is the
/// operation's success type, needed only so `partial_extractor` can
/// return one.
pub struct TimeoutOptions<T> {
    pub cancellation: Option<CancellationToken>,
    pub progress: Option<watch::Receiver<ProgressUpdate>>,
    pub stagnation_after: Option<Duration>,
    /// Fraction of completion (from the last progress update) above which
    /// a timed-out operation's partial result is worth keeping instead of
    /// discarding the attempt outright.
    pub partial_result_threshold: f64,
    pub partial_extractor: Option<Arc<dyn Fn() -> Option<T> + Send + Sync>>,
    pub max_internal_retries: u32,
}

impl<T> Default for TimeoutOptions<T> {
    fn default() -> Self {
        Self {
            cancellation: None,
            progress: None,
            stagnation_after: None,
            partial_result_threshold: 0.8,
            partial_extractor: None,
            max_internal_retries: 0,
        }
    }
}

/// Outcome of `execute_with_timeout`: unlike the plain `run_with_timeout`
/// wrapper, a timeout here isn't necessarily a hard failure if a partial
/// result could be salvaged.
#[derive(Debug, Clone)]
pub struct TimeoutResult<T> {
    pub success: bool,
    pub result: Option<T>,
    pub partial_result: Option<T>,
    pub timeout_occurred: bool,
    pub cancelled: bool,
    pub retry_count: u32,
    pub elapsed: Duration,
}

impl<T> TimeoutResult<T> {
    fn ok(value: T, retry_count: u32, elapsed: Duration) -> Self {
        Self {
            success: true,
            result: Some(value),
            partial_result: None,
            timeout_occurred: false,
            cancelled: false,
            retry_count,
            elapsed,
        }
    }

    fn timed_out(partial_result: Option<T>, retry_count: u32, elapsed: Duration) -> Self {
        Self {
            success: false,
            result: None,
            partial_result,
            timeout_occurred: true,
            cancelled: false,
            retry_count,
            elapsed,
        }
    }

    fn cancelled(retry_count: u32, elapsed: Duration) -> Self {
        Self {
            success: false,
            result: None,
            partial_result: None,
            timeout_occurred: false,
            cancelled: true,
            retry_count,
            elapsed,
        }
    }
}

struct ActiveOperation {
    #[allow(dead_code)]
    task_id: TaskId,
    started_at: Instant,
    attempt: AtomicU32,
}

/// Tracks in-flight operations and runs futures under an adaptively
/// growing deadline. One manager is typically shared across the whole
/// Execution Coordinator.
pub struct AdaptiveTimeoutManager {
    policy: BackoffPolicy,
    active: DashMap<TaskId, Arc<ActiveOperation>>,
    events: EventBus,
}

impl AdaptiveTimeoutManager {
    pub fn new(policy: BackoffPolicy, events: EventBus) -> Self {
        Self {
            policy,
            active: DashMap::new(),
            events,
        }
    }

    pub fn active_operation_count(&self) -> usize {
        self.active.len()
    }

    /// Runs `future` under a timeout computed from `attempt`'s position in
    /// the backoff schedule. On timeout, emits a `TaskTimedOut` event and
    /// returns `AgentTimeout`; the caller decides whether to retry with
    /// `attempt + 1`. A thin convenience wrapper over
    /// `execute_with_timeout` for callers that don't need cancellation,
    /// progress reporting, or partial results.
    pub async fn run_with_timeout<F, T>(
        &self,
        task_id: &str,
        attempt: u32,
        future: F,
    ) -> OrchestratorResult<T>
    where
        F: std::future::Future<Output = OrchestratorResult<T>>,
    {
        let start = Instant::now();
        let op = Arc::new(ActiveOperation {
            task_id: task_id.to_string(),
            started_at: start,
            attempt: AtomicU32::new(attempt),
        });
        self.active.insert(task_id.to_string(), op);

        let timeout_duration = self.policy.calculate_timeout(attempt);
        let deadline = Instant::now() + timeout_duration;
        debug!(task_id, attempt, timeout_ms = timeout_duration.as_millis() as u64, "running operation under adaptive timeout");

        let outcome = self
            .run_one_round(task_id, deadline, start, future, None, None, &CancellationToken::new())
            .await;

        self.active.remove(task_id);

        match outcome {
            RoundOutcome::Success(value) => Ok(value),
            RoundOutcome::Failed(err) => Err(err),
            RoundOutcome::Cancelled => Err(OrchestratorError::cancelled(task_id.to_string())),
            RoundOutcome::TimedOut => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                self.events.publish(OrchestratorEvent::TaskTimedOut {
                    task_id: task_id.to_string(),
                    elapsed_ms,
                });
                Err(OrchestratorError::AgentTimeout {
                    task_id: task_id.to_string(),
                    elapsed_ms,
                })
            }
        }
    }

    /// The full adaptive-timeout contract: grows the deadline when
    /// `options.progress` reports enough estimated remaining time to
    /// justify it, watches for stagnation (no progress update for
    /// `stagnation_after`, purely advisory - emits an event but doesn't
    /// abort), retries internally up to `max_internal_retries` times on a
    /// recoverable error, and on final timeout tries
    /// `options.partial_extractor` if the last reported completion
    /// fraction cleared `partial_result_threshold`.
    pub async fn execute_with_timeout<MkFut, Fut, T>(
        &self,
        task_id: &str,
        attempt: u32,
        mut make_future: MkFut,
        mut options: TimeoutOptions<T>,
    ) -> TimeoutResult<T>
    where
        MkFut: FnMut() -> Fut,
        Fut: std::future::Future<Output = OrchestratorResult<T>>,
    {
        let start = Instant::now();
        let op = Arc::new(ActiveOperation {
            task_id: task_id.to_string(),
            started_at: start,
            attempt: AtomicU32::new(attempt),
        });
        self.active.insert(task_id.to_string(), op.clone());

        let cancellation = options.cancellation.clone().unwrap_or_default();
        let mut retry_count = 0;
        let mut last_progress = options
            .progress
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or_default();

        let outcome = loop {
            op.attempt.store(attempt + retry_count, Ordering::SeqCst);
            let timeout_duration = self.policy.calculate_timeout(attempt + retry_count);
            let deadline = Instant::now() + timeout_duration;

            let round = self
                .run_one_round(
                    task_id,
                    deadline,
                    start,
                    make_future(),
                    options.progress.clone(),
                    options.stagnation_after,
                    &cancellation,
                )
                .await;

            match round {
                RoundOutcome::Success(value) => {
                    break TimeoutResult::ok(value, retry_count, start.elapsed());
                }
                RoundOutcome::Cancelled => {
                    break TimeoutResult::cancelled(retry_count, start.elapsed());
                }
                RoundOutcome::Failed(err) if err.recoverable() && retry_count < options.max_internal_retries => {
                    warn!(task_id, retry_count, error = %err, "retrying internally after recoverable error");
                    retry_count += 1;
                    continue;
                }
                RoundOutcome::Failed(_err) => {
                    break TimeoutResult::timed_out(None, retry_count, start.elapsed());
                }
                RoundOutcome::TimedOut => {
                    if let Some(rx) = &options.progress {
                        last_progress = *rx.borrow();
                    }
                    let partial = if last_progress.fraction_complete >= options.partial_result_threshold {
                        options.partial_extractor.take().and_then(|f| f())
                    } else {
                        None
                    };

                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    self.events.publish(OrchestratorEvent::TaskTimedOut {
                        task_id: task_id.to_string(),
                        elapsed_ms,
                    });

                    if partial.is_none() && retry_count < options.max_internal_retries {
                        warn!(task_id, retry_count, "retrying internally after timeout");
                        retry_count += 1;
                        continue;
                    }

                    break TimeoutResult::timed_out(partial, retry_count, start.elapsed());
                }
            }
        };

        self.active.remove(task_id);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_round<Fut, T>(
        &self,
        task_id: &str,
        mut deadline: Instant,
        operation_start: Instant,
        future: Fut,
        mut progress: Option<watch::Receiver<ProgressUpdate>>,
        stagnation_after: Option<Duration>,
        cancellation: &CancellationToken,
    ) -> RoundOutcome<T>
    where
        Fut: std::future::Future<Output = OrchestratorResult<T>>,
    {
        tokio::pin!(future);
        let mut last_progress_change = Instant::now();
        let mut stagnation_reported = false;
        let mut sleep = Box::pin(tokio::time::sleep_until(deadline.into()));

        loop {
            tokio::select! {
                biased;

                _ = cancellation.on_cancelled() => {
                    debug!(task_id, "operation cancelled");
                    return RoundOutcome::Cancelled;
                }

                res = &mut future => {
                    return match res {
                        Ok(value) => RoundOutcome::Success(value),
                        Err(err) => RoundOutcome::Failed(err),
                    };
                }

                _ = &mut sleep => {
                    let elapsed_ms = operation_start.elapsed().as_millis() as u64;
                    warn!(task_id, elapsed_ms, "operation exceeded adaptive timeout");
                    return RoundOutcome::TimedOut;
                }

                changed = wait_for_progress(&mut progress) => {
                    if let Some(update) = changed {
                        last_progress_change = Instant::now();
                        stagnation_reported = false;
                        if let Some(etr) = update.estimated_remaining {
                            let candidate = Instant::now() + etr;
                            if candidate > deadline {
                                deadline = candidate;
                                sleep.as_mut().reset(deadline.into());
                                debug!(task_id, "extended deadline based on reported progress");
                            }
                        }
                    }
                }

                _ = stagnation_tick(stagnation_after) => {
                    if !stagnation_reported {
                        if let Some(threshold) = stagnation_after {
                            if last_progress_change.elapsed() >= threshold {
                                stagnation_reported = true;
                                self.events.publish(OrchestratorEvent::Stagnation {
                                    task_id: task_id.to_string(),
                                    stalled_for_ms: last_progress_change.elapsed().as_millis() as u64,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        !self.policy.exhausted(attempt)
    }

    pub fn elapsed_for(&self, task_id: &str) -> Option<Duration> {
        self.active.get(task_id).map(|op| op.started_at.elapsed())
    }
}

enum RoundOutcome<T> {
    Success(T),
    Failed(OrchestratorError),
    TimedOut,
    Cancelled,
}

/// Awaits the next change on `progress`, or never resolves if there's no
/// channel to watch - keeps the `tokio::select!` branch well-formed when
/// the caller didn't ask for progress reporting.
async fn wait_for_progress(progress: &mut Option<watch::Receiver<ProgressUpdate>>) -> Option<ProgressUpdate> {
    match progress {
        Some(rx) => {
            if rx.changed().await.is_ok() {
                Some(*rx.borrow())
            } else {
                std::future::pending().await
            }
        }
        None => std::future::pending().await,
    }
}

/// A periodic tick used to poll for stagnation, or never resolves if the
/// caller didn't configure a stagnation threshold.
async fn stagnation_tick(stagnation_after: Option<Duration>) {
    match stagnation_after {
        Some(threshold) => {
            let tick = (threshold / 4).max(Duration::from_millis(10));
            tokio::time::sleep(tick).await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_timeout_ms: 1_000,
            max_timeout_ms: 10_000,
            backoff_factor: 2.0,
            max_retries: 3,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.calculate_timeout(0), Duration::from_millis(1_000));
        assert_eq!(p.calculate_timeout(1), Duration::from_millis(2_000));
        assert_eq!(p.calculate_timeout(2), Duration::from_millis(4_000));
    }

    #[test]
    fn backoff_is_capped_at_max_timeout() {
        let p = policy();
        assert_eq!(p.calculate_timeout(10), Duration::from_millis(10_000));
    }

    #[test]
    fn exhausted_once_max_retries_reached() {
        let p = policy();
        assert!(!p.exhausted(2));
        assert!(p.exhausted(3));
    }

    #[tokio::test]
    async fn fast_future_completes_before_timeout() {
        let manager = AdaptiveTimeoutManager::new(policy(), EventBus::new());
        let result = manager
            .run_with_timeout("t1", 0, async { Ok::<_, OrchestratorError>(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(manager.active_operation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_future_is_timed_out() {
        let manager = AdaptiveTimeoutManager::new(
            BackoffPolicy {
                base_timeout_ms: 10,
                max_timeout_ms: 100,
                backoff_factor: 2.0,
                max_retries: 3,
            },
            EventBus::new(),
        );

        let result = manager
            .run_with_timeout("t1", 0, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, OrchestratorError>(1)
            })
            .await;

        assert!(matches!(result, Err(OrchestratorError::AgentTimeout { .. })));
        assert_eq!(manager.active_operation_count(), 0);
    }

    #[test]
    fn cancellation_token_is_idempotent_and_reports_state() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn on_cancelled_resolves_once_cancel_is_called() {
        let token = CancellationToken::new();
        let waiter_token = token.clone();
        let waiter = tokio::spawn(async move {
            waiter_token.on_cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        token.cancel();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn progress_reporting_extends_the_deadline_past_the_base_timeout() {
        let manager = AdaptiveTimeoutManager::new(
            BackoffPolicy {
                base_timeout_ms: 50,
                max_timeout_ms: 50,
                backoff_factor: 1.0,
                max_retries: 0,
            },
            EventBus::new(),
        );
        let (progress, rx) = progress_channel();

        let outcome = manager
            .execute_with_timeout(
                "t1",
                0,
                || async move {
                    progress.report(ProgressUpdate {
                        fraction_complete: 0.5,
                        estimated_remaining: Some(Duration::from_millis(200)),
                    });
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok::<_, OrchestratorError>("done")
                },
                TimeoutOptions {
                    progress: Some(rx),
                    ..TimeoutOptions::default()
                },
            )
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.result, Some("done"));
        assert!(!outcome.timeout_occurred);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_sufficient_progress_yields_a_partial_result() {
        let manager = AdaptiveTimeoutManager::new(
            BackoffPolicy {
                base_timeout_ms: 20,
                max_timeout_ms: 20,
                backoff_factor: 1.0,
                max_retries: 0,
            },
            EventBus::new(),
        );
        let (progress, rx) = progress_channel();
        progress.report(ProgressUpdate {
            fraction_complete: 0.9,
            estimated_remaining: None,
        });

        let outcome = manager
            .execute_with_timeout(
                "t1",
                0,
                || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, OrchestratorError>("unreachable")
                },
                TimeoutOptions {
                    progress: Some(rx),
                    partial_result_threshold: 0.8,
                    partial_extractor: Some(Arc::new(|| Some("partial-output"))),
                    ..TimeoutOptions::default()
                },
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.timeout_occurred);
        assert_eq!(outcome.partial_result, Some("partial-output"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_short_circuits_the_operation() {
        let manager = AdaptiveTimeoutManager::new(policy(), EventBus::new());
        let token = CancellationToken::new();
        token.cancel();

        let outcome = manager
            .execute_with_timeout(
                "t1",
                0,
                || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, OrchestratorError>(1)
                },
                TimeoutOptions {
                    cancellation: Some(token),
                    ..TimeoutOptions::default()
                },
            )
            .await;

        assert!(outcome.cancelled);
        assert!(!outcome.success);
    }

    #[tokio::test(start_paused = true)]
    async fn internal_retry_recovers_from_a_recoverable_error() {
        let manager = AdaptiveTimeoutManager::new(
            BackoffPolicy {
                base_timeout_ms: 1_000,
                max_timeout_ms: 1_000,
                backoff_factor: 1.0,
                max_retries: 3,
            },
            EventBus::new(),
        );

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let outcome = manager
            .execute_with_timeout(
                "t1",
                0,
                move || {
                    let calls = calls_clone.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(OrchestratorError::LlmUnavailable {
                                message: "transient".to_string(),
                            })
                        } else {
                            Ok::<_, OrchestratorError>("recovered")
                        }
                    }
                },
                TimeoutOptions {
                    max_internal_retries: 2,
                    ..TimeoutOptions::default()
                },
            )
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.result, Some("recovered"));
        assert_eq!(outcome.retry_count, 1);
    }
}
