//! Graph Composer (C2): builds the higher-order task graphs the
//! orchestrator needs from C1's Chain/Group/Chord combinators.
//!
//! This layer owns graph *shapes*, not execution — it is a thin builder
//! over `runtime::Runtime`, grounded in the same `aivcs-core::parallel`
//! module that models deterministic role ordering and parallel-plan
//! validation.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::runtime::{queue, RetryPolicy, Runtime, Task, TaskContext, TaskFailure};

/// Identifies one in-flight submission so re-submission of an
/// already-committed scenario short-circuits instead of duplicating work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptEpoch {
    pub scenario_id: Uuid,
    pub build_id: Uuid,
    pub epoch: u32,
}

impl AttemptEpoch {
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.scenario_id, self.build_id, self.epoch)
    }
}

/// Linear ingestion chain for one repository: `clone -> worktrees -> logs`.
/// Each stage's sole input is the previous stage's output plus the shared
/// `args` payload merged in by the caller's task implementation.
pub async fn ingestion_chain(
    runtime: &Runtime,
    ctx: &TaskContext,
    clone_task: Arc<dyn Task>,
    worktree_task: Arc<dyn Task>,
    logs_task: Arc<dyn Task>,
    args: Value,
) -> Result<Value, TaskFailure> {
    runtime
        .chain(
            ctx,
            vec![
                (queue::INGESTION, clone_task, RetryPolicy::default_retryable(), false),
                (queue::INGESTION, worktree_task, RetryPolicy::default_retryable(), false),
                (queue::INGESTION, logs_task, RetryPolicy::default_retryable(), false),
            ],
            args,
        )
        .await
}

/// Parallel repo fan-out: `group(chain_repo1, chain_repo2, ...)`. Each
/// element of `repo_args` carries one repository's ingestion-chain input.
pub async fn parallel_repo_fanout(
    runtime: &Runtime,
    ctx: &TaskContext,
    chain_task: Arc<dyn Task>,
    repo_args: Vec<Value>,
) -> Vec<Result<Value, TaskFailure>> {
    runtime
        .group(queue::SCENARIO_INGESTION, ctx, chain_task, repo_args, RetryPolicy::default_retryable())
        .await
}

/// Ingestion chord: a parallel repo fan-out followed by an aggregate
/// callback that parses per-resource outcomes and transitions the scenario.
pub async fn ingestion_chord(
    runtime: &Runtime,
    ctx: &TaskContext,
    chain_task: Arc<dyn Task>,
    repo_args: Vec<Value>,
    aggregate: impl FnOnce(Vec<Result<Value, TaskFailure>>) -> Result<Value, TaskFailure>,
) -> Result<Value, TaskFailure> {
    runtime
        .chord(
            queue::SCENARIO_INGESTION,
            ctx,
            chain_task,
            repo_args,
            RetryPolicy::default_retryable(),
            aggregate,
        )
        .await
}

/// Sequential feature-extraction chain: strictly sequential so temporal
/// features referencing prior builds see consistent state.
pub async fn feature_extraction_chain(
    runtime: &Runtime,
    ctx: &TaskContext,
    process_build_task: Arc<dyn Task>,
    finalize_task: Arc<dyn Task>,
    build_args: Vec<Value>,
    finalize_args: Value,
) -> Result<Value, TaskFailure> {
    let mut stages: Vec<(&str, Arc<dyn Task>, RetryPolicy, bool)> = build_args
        .iter()
        .map(|_| (queue::SCENARIO_PROCESSING, Arc::clone(&process_build_task), RetryPolicy::default_retryable(), false))
        .collect();
    stages.push((queue::SCENARIO_PROCESSING, finalize_task, RetryPolicy::default_retryable(), false));

    let initial = build_args.into_iter().next().unwrap_or(finalize_args);
    runtime.chain(ctx, stages, initial).await
}

/// Parallel scan batches: `group(batch1, batch2, ...)` where each batch
/// sequentially dispatches fire-and-forget scan tasks to respect rate
/// limits.
pub async fn parallel_scan_batches(
    runtime: &Runtime,
    ctx: &TaskContext,
    batch_task: Arc<dyn Task>,
    batches: Vec<Value>,
) -> Vec<Result<Value, TaskFailure>> {
    runtime
        .group(queue::SCENARIO_SCANNING, ctx, batch_task, batches, RetryPolicy::default_retryable())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoTask;
    #[async_trait]
    impl Task for EchoTask {
        async fn run(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskFailure> {
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn ingestion_chain_threads_result_through_three_stages() {
        let runtime = Runtime::start(&[(queue::INGESTION, 2)]);
        let result = ingestion_chain(
            &runtime,
            &TaskContext::new(),
            Arc::new(EchoTask),
            Arc::new(EchoTask),
            Arc::new(EchoTask),
            serde_json::json!({"repo": "a/b"}),
        )
        .await
        .unwrap();
        assert_eq!(result, serde_json::json!({"repo": "a/b"}));
    }

    #[tokio::test]
    async fn parallel_repo_fanout_runs_all_repos() {
        let runtime = Runtime::start(&[(queue::SCENARIO_INGESTION, 4)]);
        let repos: Vec<Value> = (0..3).map(|i| serde_json::json!({"repo": i})).collect();
        let results = parallel_repo_fanout(&runtime, &TaskContext::new(), Arc::new(EchoTask), repos).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn ingestion_chord_invokes_aggregate_after_all_repos_terminate() {
        let runtime = Runtime::start(&[(queue::SCENARIO_INGESTION, 4)]);
        let repos: Vec<Value> = (0..3).map(|i| serde_json::json!(i)).collect();
        let outcome = ingestion_chord(&runtime, &TaskContext::new(), Arc::new(EchoTask), repos, |results| {
            Ok(serde_json::json!(results.len()))
        })
        .await
        .unwrap();
        assert_eq!(outcome, serde_json::json!(3));
    }

    #[test]
    fn attempt_epoch_key_distinguishes_epochs() {
        let scenario_id = Uuid::new_v4();
        let build_id = Uuid::new_v4();
        let a = AttemptEpoch { scenario_id, build_id, epoch: 1 };
        let b = AttemptEpoch { scenario_id, build_id, epoch: 2 };
        assert_ne!(a.idempotency_key(), b.idempotency_key());
    }
}
