//! Task Runtime (C1): an in-process stand-in for a distributed job runner.
//!
//! Models "distributed, multi-queue" execution with `tokio::spawn`ed worker
//! pools draining per-queue `mpsc` channels, the same way the teacher models
//! distributed agent forking with in-process `tokio::spawn` rather than a
//! real scheduler (`parallel::fork_agent_parallel`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Canonical queue names named by the scenario pipeline.
pub mod queue {
    pub const INGESTION: &str = "ingestion";
    pub const PROCESSING: &str = "processing";
    pub const SCENARIO_INGESTION: &str = "scenario_ingestion";
    pub const SCENARIO_PROCESSING: &str = "scenario_processing";
    pub const SCENARIO_SCANNING: &str = "scenario_scanning";
    pub const SONAR_SCAN: &str = "sonar_scan";
    pub const TRIVY_SCAN: &str = "trivy_scan";
}

/// Why a task failed, and whether the runtime should retry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient I/O or a 5xx response; retried under the queue's policy.
    Retryable,
    /// Rate limited by an external API; retried with a floor-60s backoff.
    RateLimited,
    /// Expected data loss (e.g. expired CI logs); never retried.
    MissingResource,
    /// Bug or contract violation; never retried, surfaced as-is.
    Fatal,
}

#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Retryable, message: message.into() }
    }
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::RateLimited, message: message.into() }
    }
    pub fn missing_resource(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::MissingResource, message: message.into() }
    }
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Fatal, message: message.into() }
    }

    fn is_retryable(&self) -> bool {
        matches!(self.kind, FailureKind::Retryable | FailureKind::RateLimited)
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Exponential backoff schedule, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Default policy for `Retryable` failures: 10-minute backoff cap.
    pub fn default_retryable() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(600),
        }
    }

    /// Rate-limited floor is 60s per the runtime's failure-kind contract.
    pub fn default_rate_limited() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(600),
        }
    }

    /// Backoff for the given zero-indexed attempt number.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_backoff.saturating_mul(2u32.saturating_pow(attempt));
        scaled.min(self.max_backoff)
    }
}

/// Correlation context propagated through Chain/Group/Chord and attached to
/// every log record. Every top-level orchestrator task generates one; nested
/// tasks inherit it.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub correlation_id: Uuid,
}

impl TaskContext {
    pub fn new() -> Self {
        Self { correlation_id: Uuid::new_v4() }
    }

    pub fn child(&self) -> Self {
        Self { correlation_id: self.correlation_id }
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A pure function from a typed JSON payload to a typed JSON outcome.
///
/// Payloads are `serde_json::Value` rather than generics so tasks can be
/// boxed and queued uniformly; callers serialize/deserialize their typed
/// input/output at the call site (same boundary discipline as
/// `buildrisk_state::storage_traits`).
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, ctx: &TaskContext, payload: Value) -> Result<Value, TaskFailure>;
}

/// Opaque handle returned by `Runtime::submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(pub Uuid);

struct Envelope {
    ctx: TaskContext,
    task: Arc<dyn Task>,
    payload: Value,
    policy: RetryPolicy,
    reply: oneshot::Sender<Result<Value, TaskFailure>>,
}

/// Shared append-only result list keyed by correlation id, for chord
/// callbacks that need to see every group member's intermediate output.
#[derive(Default)]
pub struct ResultStore {
    items: Mutex<HashMap<Uuid, Vec<Value>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, correlation_id: Uuid, payload: Value) {
        self.items.lock().await.entry(correlation_id).or_default().push(payload);
    }

    /// Drain and delete the accumulated list for a correlation id.
    pub async fn drain(&self, correlation_id: Uuid) -> Vec<Value> {
        self.items.lock().await.remove(&correlation_id).unwrap_or_default()
    }
}

/// In-process multi-queue runtime: one bounded worker pool per named queue,
/// each draining an `mpsc` channel of `Envelope`s.
pub struct Runtime {
    senders: HashMap<String, mpsc::Sender<Envelope>>,
    pub results: Arc<ResultStore>,
}

impl Runtime {
    /// Spin up worker pools for the given `(queue_name, pool_size)` pairs.
    pub fn start(pools: &[(&str, usize)]) -> Self {
        let results = Arc::new(ResultStore::new());
        let mut senders = HashMap::new();

        for &(name, pool_size) in pools {
            let (tx, rx) = mpsc::channel::<Envelope>(1024);
            let rx = Arc::new(Mutex::new(rx));
            for worker in 0..pool_size.max(1) {
                let rx = Arc::clone(&rx);
                let queue_name = name.to_string();
                tokio::spawn(async move {
                    loop {
                        let envelope = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        let Some(envelope) = envelope else { break };
                        debug!(queue = %queue_name, worker, "running task");
                        let outcome = run_with_retry(&envelope.ctx, &envelope.task, &envelope.payload, &envelope.policy).await;
                        let _ = envelope.reply.send(outcome);
                    }
                });
            }
            senders.insert(name.to_string(), tx);
        }

        Self { senders, results }
    }

    /// Submit one task to its queue; returns a future resolving once the
    /// task reaches a terminal state (after exhausting retries if needed).
    pub async fn submit(
        &self,
        queue_name: &str,
        ctx: TaskContext,
        task: Arc<dyn Task>,
        payload: Value,
        policy: RetryPolicy,
    ) -> Result<Value, TaskFailure> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sender = self.senders.get(queue_name).ok_or_else(|| {
            TaskFailure::fatal(format!("no worker pool registered for queue '{queue_name}'"))
        })?;
        sender
            .send(Envelope { ctx, task, payload, policy, reply: reply_tx })
            .await
            .map_err(|_| TaskFailure::fatal("runtime queue closed"))?;
        reply_rx.await.map_err(|_| TaskFailure::fatal("task worker dropped reply"))?
    }

    /// **Group(t1, ..., tn)**: run tasks concurrently, collect results in
    /// submission order. Completes when every task reaches a terminal state.
    pub async fn group(
        &self,
        queue_name: &str,
        ctx: &TaskContext,
        task: Arc<dyn Task>,
        payloads: Vec<Value>,
        policy: RetryPolicy,
    ) -> Vec<Result<Value, TaskFailure>> {
        let futures = payloads.into_iter().map(|payload| {
            let ctx = ctx.child();
            let task = Arc::clone(&task);
            let policy = policy.clone();
            self.submit(queue_name, ctx, task, payload, policy)
        });
        futures::future::join_all(futures).await
    }

    /// **Chain(t1, t2, ...)**: sequential composition; the result of tᵢ
    /// feeds tᵢ₊₁. Aborts on the first failure unless `ignore_result` is set
    /// for that stage.
    pub async fn chain(
        &self,
        ctx: &TaskContext,
        stages: Vec<(&str, Arc<dyn Task>, RetryPolicy, bool)>,
        initial: Value,
    ) -> Result<Value, TaskFailure> {
        let mut current = initial;
        for (queue_name, task, policy, ignore_result) in stages {
            match self.submit(queue_name, ctx.child(), task, current.clone(), policy).await {
                Ok(result) => current = result,
                Err(failure) if ignore_result => {
                    warn!(%failure, "chain stage failed but ignore_result set, continuing");
                }
                Err(failure) => return Err(failure),
            }
        }
        Ok(current)
    }

    /// **Chord(group, callback)**: like `group`, but once every member
    /// terminates (success or failure, never hangs), invoke `callback` with
    /// the full result list.
    pub async fn chord(
        &self,
        queue_name: &str,
        ctx: &TaskContext,
        task: Arc<dyn Task>,
        payloads: Vec<Value>,
        policy: RetryPolicy,
        callback: impl FnOnce(Vec<Result<Value, TaskFailure>>) -> Result<Value, TaskFailure>,
    ) -> Result<Value, TaskFailure> {
        let results = self.group(queue_name, ctx, task, payloads, policy).await;
        callback(results)
    }
}

async fn run_with_retry(
    ctx: &TaskContext,
    task: &Arc<dyn Task>,
    payload: &Value,
    policy: &RetryPolicy,
) -> Result<Value, TaskFailure> {
    let mut attempt = 0;
    loop {
        match task.run(ctx, payload.clone()).await {
            Ok(value) => return Ok(value),
            Err(failure) if failure.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff_for(attempt);
                warn!(correlation_id = %ctx.correlation_id, attempt, ?delay, %failure, "retrying task");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(failure) => return Err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoTask;
    #[async_trait]
    impl Task for EchoTask {
        async fn run(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskFailure> {
            Ok(payload)
        }
    }

    struct FlakyTask {
        failures_remaining: AtomicU32,
    }
    #[async_trait]
    impl Task for FlakyTask {
        async fn run(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskFailure> {
            if self.failures_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(TaskFailure::retryable("flaky"))
            } else {
                Ok(payload)
            }
        }
    }

    #[tokio::test]
    async fn submit_runs_task_and_returns_its_result() {
        let runtime = Runtime::start(&[(queue::INGESTION, 2)]);
        let result = runtime
            .submit(
                queue::INGESTION,
                TaskContext::new(),
                Arc::new(EchoTask),
                serde_json::json!({"a": 1}),
                RetryPolicy::default_retryable(),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_until_success() {
        let runtime = Runtime::start(&[(queue::PROCESSING, 1)]);
        let task = Arc::new(FlakyTask { failures_remaining: AtomicU32::new(2) });
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
        };
        let result = runtime
            .submit(queue::PROCESSING, TaskContext::new(), task, serde_json::json!(null), policy)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn fatal_failure_is_never_retried() {
        struct AlwaysFatal;
        #[async_trait]
        impl Task for AlwaysFatal {
            async fn run(&self, _ctx: &TaskContext, _payload: Value) -> Result<Value, TaskFailure> {
                Err(TaskFailure::fatal("contract violation"))
            }
        }
        let runtime = Runtime::start(&[(queue::PROCESSING, 1)]);
        let result = runtime
            .submit(
                queue::PROCESSING,
                TaskContext::new(),
                Arc::new(AlwaysFatal),
                serde_json::json!(null),
                RetryPolicy::default_retryable(),
            )
            .await;
        assert!(matches!(result, Err(TaskFailure { kind: FailureKind::Fatal, .. })));
    }

    #[tokio::test]
    async fn group_runs_tasks_concurrently_and_preserves_order() {
        let runtime = Runtime::start(&[(queue::INGESTION, 4)]);
        let payloads: Vec<Value> = (0..5).map(|i| serde_json::json!(i)).collect();
        let results = runtime
            .group(
                queue::INGESTION,
                &TaskContext::new(),
                Arc::new(EchoTask),
                payloads.clone(),
                RetryPolicy::default_retryable(),
            )
            .await;
        let values: Vec<Value> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, payloads);
    }

    #[tokio::test]
    async fn chord_invokes_callback_after_all_group_members_terminate() {
        let runtime = Runtime::start(&[(queue::INGESTION, 4)]);
        let payloads: Vec<Value> = (0..3).map(|i| serde_json::json!(i)).collect();
        let sum = runtime
            .chord(
                queue::INGESTION,
                &TaskContext::new(),
                Arc::new(EchoTask),
                payloads,
                RetryPolicy::default_retryable(),
                |results| {
                    let total: i64 = results
                        .into_iter()
                        .filter_map(|r| r.ok())
                        .filter_map(|v| v.as_i64())
                        .sum();
                    Ok(serde_json::json!(total))
                },
            )
            .await
            .unwrap();
        assert_eq!(sum, serde_json::json!(3));
    }

    #[tokio::test]
    async fn result_store_appends_and_drains_per_correlation_id() {
        let store = ResultStore::new();
        let correlation_id = Uuid::new_v4();
        store.append(correlation_id, serde_json::json!(1)).await;
        store.append(correlation_id, serde_json::json!(2)).await;
        let drained = store.drain(correlation_id).await;
        assert_eq!(drained, vec![serde_json::json!(1), serde_json::json!(2)]);
        assert!(store.drain(correlation_id).await.is_empty());
    }
}
