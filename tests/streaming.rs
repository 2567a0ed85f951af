//! Integration tests for streaming return mode.

mod common;

use std::sync::Arc;

use common::*;
use futures::StreamExt;
use refgen::{
    generator_fn, Error, GeneratorContext, GeneratorError, ObjectError, ObjectRefStream,
    ReturnMode, Runtime, TaskRequest,
};
use tokio::sync::Notify;

fn submit_stream(runtime: &Runtime, body: Arc<dyn refgen::GeneratorFn>) -> ObjectRefStream {
    runtime
        .submit(TaskRequest::new("stream", body).return_mode(ReturnMode::StreamingIterator))
        .unwrap()
        .into_stream()
        .unwrap()
}

mod consumption_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_surfaces_outputs_in_order() {
        let runtime = runtime();
        let mut stream = submit_stream(&runtime, counting(5));

        let mut values = Vec::new();
        while let Some(handle) = within(stream.next_ref()).await {
            values.push(fetch_u32(&runtime, &handle).await.unwrap());
        }
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(stream.surfaced(), 5);
        assert!(within(stream.next_ref()).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_output_is_available_before_task_ends() {
        let runtime = runtime();
        let gate = Arc::new(Notify::new());
        let body = {
            let gate = Arc::clone(&gate);
            generator_fn(move |mut ctx: GeneratorContext| {
                let gate = Arc::clone(&gate);
                async move {
                    ctx.yield_value("first").await?;
                    gate.notified().await;
                    ctx.yield_value("second").await?;
                    Ok(())
                }
            })
        };
        let mut stream = submit_stream(&runtime, body);

        let first = within(stream.next_ref()).await.unwrap();
        let value: String = within(runtime.get_as(&first)).await.unwrap();
        assert_eq!(value, "first");
        assert!(!runtime.task_state(&stream.task_id()).unwrap().is_terminal());

        gate.notify_one();
        let second = within(stream.next_ref()).await.unwrap();
        let value: String = within(runtime.get_as(&second)).await.unwrap();
        assert_eq!(value, "second");
        assert!(within(stream.next_ref()).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_futures_stream_adapter() {
        let runtime = runtime();
        let stream = submit_stream(&runtime, counting(3)).into_stream();

        let handles: Vec<_> = within(stream.collect::<Vec<_>>()).await;
        let indices: Vec<u32> = handles.iter().map(|h| h.output_index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}

mod failure_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_raise_ends_stream_with_error_reference() {
        let runtime = runtime();
        let mut stream = submit_stream(&runtime, counting_then_raise(2, "stop"));

        let mut handles = Vec::new();
        while let Some(handle) = within(stream.next_ref()).await {
            handles.push(handle);
        }
        assert_eq!(handles.len(), 3);
        assert_eq!(fetch_u32(&runtime, &handles[1]).await.unwrap(), 1);
        assert!(matches!(
            fetch_u32(&runtime, &handles[2]).await,
            Err(Error::Object(ObjectError::TaskRaised { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crash_ends_stream_with_crash_reference() {
        let runtime = runtime();
        let mut stream = submit_stream(&runtime, counting_then_hang(2));
        let task_id = stream.task_id();

        wait_for_committed(&runtime, &task_id, 2).await;
        runtime.kill_task(&task_id);

        let mut handles = Vec::new();
        while let Some(handle) = within(stream.next_ref()).await {
            handles.push(handle);
        }
        assert_eq!(handles.len(), 3);
        assert_eq!(fetch_u32(&runtime, &handles[0]).await.unwrap(), 0);
        assert!(matches!(
            fetch_u32(&runtime, &handles[2]).await,
            Err(Error::Object(ObjectError::WorkerCrashed { .. }))
        ));
    }
}

mod release_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_stream_releases_unconsumed_outputs() {
        let runtime = runtime();
        let mut stream = submit_stream(&runtime, counting(6));
        let task_id = stream.task_id();

        let kept = within(stream.next_ref()).await.unwrap();
        wait_for_terminal(&runtime, &task_id).await;
        drop(stream);

        // Only the surfaced output stays referenced.
        let converged = wait_for_condition(TIMEOUT, || {
            let counts = runtime.reference_counts();
            counts.len() == 1 && counts.contains_key(&kept.id())
        })
        .await;
        assert!(converged);
        assert_eq!(fetch_u32(&runtime, &kept).await.unwrap(), 0);

        drop(kept);
        assert!(wait_for_condition(TIMEOUT, || runtime.task_count() == 0).await);
        assert_eq!(runtime.lineage_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_does_not_wait_for_producer() {
        let runtime = runtime();
        let gate = Arc::new(Notify::new());
        let body = {
            let gate = Arc::clone(&gate);
            generator_fn(move |mut ctx: GeneratorContext| {
                let gate = Arc::clone(&gate);
                async move {
                    ctx.yield_value(0).await?;
                    gate.notified().await;
                    for i in 1..4 {
                        ctx.yield_value(i).await?;
                    }
                    Ok::<(), GeneratorError>(())
                }
            })
        };
        let stream = submit_stream(&runtime, body);
        let task_id = stream.task_id();
        wait_for_committed(&runtime, &task_id, 1).await;

        drop(stream);
        gate.notify_one();

        // Outputs committed after the drop are never held, so the finished
        // task is dropped entirely.
        assert!(wait_for_condition(TIMEOUT, || runtime.task_count() == 0).await);
        assert!(runtime.reference_counts().is_empty());
        assert_eq!(runtime.lineage_count(), 0);
    }
}
