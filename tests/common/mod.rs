//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use refgen::{
    generator_fn, GeneratorContext, GeneratorError, GeneratorFn, RefHandle, Result, Runtime,
    RuntimeConfig, TaskId,
};

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Reference deletion is asynchronous, so tests observing the table poll
/// instead of asserting right after a drop.
pub async fn wait_for_condition<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Runs `future`, failing the test if it does not finish within [`TIMEOUT`].
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("operation timed out")
}

/// Runtime with default settings and no retries.
pub fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default().with_max_task_retries(0)).unwrap()
}

/// Runtime whose payloads all live on worker nodes, so removing a node
/// loses them.
pub fn remote_runtime(retries: u32) -> Runtime {
    Runtime::new(
        RuntimeConfig::default()
            .with_worker_nodes(["worker-1", "worker-2"])
            .with_max_inline_bytes(0)
            .with_max_task_retries(retries),
    )
    .unwrap()
}

/// Yields `0..n`.
pub fn counting(n: u32) -> Arc<dyn GeneratorFn> {
    generator_fn(move |mut ctx: GeneratorContext| async move {
        for i in 0..n {
            ctx.yield_value(i).await?;
        }
        Ok(())
    })
}

/// Yields `0..n`, then raises.
pub fn counting_then_raise(n: u32, message: &'static str) -> Arc<dyn GeneratorFn> {
    generator_fn(move |mut ctx: GeneratorContext| async move {
        for i in 0..n {
            ctx.yield_value(i).await?;
        }
        Err(GeneratorError::new(message))
    })
}

/// Yields `0..n`, then blocks until the attempt is killed.
pub fn counting_then_hang(n: u32) -> Arc<dyn GeneratorFn> {
    generator_fn(move |mut ctx: GeneratorContext| async move {
        for i in 0..n {
            ctx.yield_value(i).await?;
        }
        std::future::pending::<()>().await;
        Ok(())
    })
}

/// First attempt yields `0..5` and blocks until killed; every later attempt
/// yields `10, 11, 12`.
pub fn shrinking_on_retry() -> Arc<dyn GeneratorFn> {
    generator_fn(|mut ctx: GeneratorContext| async move {
        if ctx.attempt() == 0 {
            for i in 0..5u32 {
                ctx.yield_value(i).await?;
            }
            std::future::pending::<()>().await;
        }
        for i in 10..13u32 {
            ctx.yield_value(i).await?;
        }
        Ok(())
    })
}

/// Waits until `task_id` has committed at least `n` outputs.
pub async fn wait_for_committed(runtime: &Runtime, task_id: &TaskId, n: u32) {
    let reached = wait_for_condition(TIMEOUT, || {
        runtime
            .task_state(task_id)
            .is_some_and(|state| state.committed >= n)
    })
    .await;
    assert!(reached, "task never committed {n} outputs");
}

/// Waits until `task_id` has reached a terminal outcome.
pub async fn wait_for_terminal(runtime: &Runtime, task_id: &TaskId) {
    let reached = wait_for_condition(TIMEOUT, || {
        runtime
            .task_state(task_id)
            .is_some_and(|state| state.is_terminal())
    })
    .await;
    assert!(reached, "task never finished");
}

/// Fetches and decodes a `u32` output.
pub async fn fetch_u32(runtime: &Runtime, handle: &RefHandle) -> Result<u32> {
    within(runtime.get_as::<u32>(handle)).await
}
