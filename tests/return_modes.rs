//! Behaviour shared by all return modes, checked per mode.

mod common;

use common::*;
use refgen::{Error, ObjectError, RefHandle, ReturnMode, Runtime, Submission, TaskRequest};
use rstest::rstest;

/// Collects every reference a submission hands out, waiting for the task
/// to end where the mode requires it.
async fn collect_refs(runtime: &Runtime, submission: Submission) -> Vec<RefHandle> {
    match submission {
        Submission::Fixed(refs) => refs,
        Submission::Dynamic(wrapper) => within(runtime.resolve_dynamic(&wrapper))
            .await
            .unwrap()
            .into_vec(),
        Submission::Streaming(mut stream) => {
            let mut refs = Vec::new();
            while let Some(handle) = within(stream.next_ref()).await {
                refs.push(handle);
            }
            refs
        },
    }
}

#[rstest]
#[case::fixed(ReturnMode::Fixed(4))]
#[case::dynamic(ReturnMode::Dynamic)]
#[case::streaming(ReturnMode::StreamingIterator)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_values_arrive_in_yield_order(#[case] mode: ReturnMode) {
    let runtime = runtime();
    let submission = runtime
        .submit(TaskRequest::new("count", counting(4)).return_mode(mode))
        .unwrap();

    let refs = collect_refs(&runtime, submission).await;
    let mut values = Vec::new();
    for handle in &refs {
        values.push(fetch_u32(&runtime, handle).await.unwrap());
    }
    pretty_assertions::assert_eq!(values, vec![0, 1, 2, 3]);
}

#[rstest]
#[case::fixed(ReturnMode::Fixed(3))]
#[case::dynamic(ReturnMode::Dynamic)]
#[case::streaming(ReturnMode::StreamingIterator)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raise_surfaces_as_task_raised(#[case] mode: ReturnMode) {
    let runtime = runtime();
    let submission = runtime
        .submit(TaskRequest::new("raise", counting_then_raise(2, "boom")).return_mode(mode))
        .unwrap();

    // Fixed mode declares the third output; the other modes append it.
    let refs = collect_refs(&runtime, submission).await;
    pretty_assertions::assert_eq!(refs.len(), 3);
    assert_eq!(fetch_u32(&runtime, &refs[1]).await.unwrap(), 1);
    assert!(matches!(
        fetch_u32(&runtime, &refs[2]).await,
        Err(Error::Object(ObjectError::TaskRaised { .. }))
    ));
}

#[rstest]
#[case::fixed(ReturnMode::Fixed(2))]
#[case::dynamic(ReturnMode::Dynamic)]
#[case::streaming(ReturnMode::StreamingIterator)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_everything_is_collected_after_use(#[case] mode: ReturnMode) {
    let runtime = runtime();
    let submission = runtime
        .submit(TaskRequest::new("count", counting(2)).return_mode(mode))
        .unwrap();

    let refs = collect_refs(&runtime, submission).await;
    for handle in &refs {
        fetch_u32(&runtime, handle).await.unwrap();
    }
    drop(refs);

    assert!(wait_for_condition(TIMEOUT, || runtime.reference_counts().is_empty()).await);
    assert!(wait_for_condition(TIMEOUT, || runtime.task_count() == 0).await);
    pretty_assertions::assert_eq!(runtime.lineage_count(), 0);
}
