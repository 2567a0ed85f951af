//! Integration tests for fixed-count return mode.
//!
//! Covers in-order fetches, under-production, raises after partial output,
//! over-production diagnostics and exceptions yielded as plain data.

mod common;

use common::*;
use refgen::types::ExceptionValue;
use refgen::{generator_fn, Error, GeneratorContext, ObjectError, ReturnMode, TaskRequest};

mod fetch_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_outputs_fetch_in_order() {
        let runtime = runtime();
        let refs = runtime
            .submit(TaskRequest::new("count", counting(3)).return_mode(ReturnMode::Fixed(3)))
            .unwrap()
            .into_fixed()
            .unwrap();

        assert_eq!(refs.len(), 3);
        for (i, handle) in refs.iter().enumerate() {
            assert_eq!(handle.output_index(), i as u32);
            assert_eq!(fetch_u32(&runtime, handle).await.unwrap(), i as u32);
        }
    }

    #[tokio::test]
    async fn test_zero_outputs_yields_no_refs() {
        let runtime = runtime();
        let refs = runtime
            .submit(TaskRequest::new("empty", counting(0)).return_mode(ReturnMode::Fixed(0)))
            .unwrap()
            .into_fixed()
            .unwrap();
        assert!(refs.is_empty());
    }

    #[tokio::test]
    async fn test_default_mode_is_single_output() {
        let runtime = runtime();
        let body = generator_fn(|mut ctx: GeneratorContext| async move {
            ctx.yield_value("only").await?;
            Ok(())
        });
        let refs = runtime
            .submit(TaskRequest::new("single", body))
            .unwrap()
            .into_fixed()
            .unwrap();
        assert_eq!(refs.len(), 1);
        let value: String = within(runtime.get_as(&refs[0])).await.unwrap();
        assert_eq!(value, "only");
    }

    #[tokio::test]
    async fn test_inline_arguments_reach_the_body() {
        let runtime = runtime();
        let body = generator_fn(|mut ctx: GeneratorContext| async move {
            let base: u32 = ctx.arg(0)?;
            let times: u32 = ctx.arg(1)?;
            for i in 0..times {
                ctx.yield_value(base + i).await?;
            }
            Ok(())
        });
        let refs = runtime
            .submit(
                TaskRequest::new("offset", body)
                    .arg(100)
                    .arg(2)
                    .return_mode(ReturnMode::Fixed(2)),
            )
            .unwrap()
            .into_fixed()
            .unwrap();

        assert_eq!(fetch_u32(&runtime, &refs[0]).await.unwrap(), 100);
        assert_eq!(fetch_u32(&runtime, &refs[1]).await.unwrap(), 101);
    }
}

mod failure_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_raise_fails_only_unproduced_indices() {
        let runtime = runtime();
        let refs = runtime
            .submit(
                TaskRequest::new("raise", counting_then_raise(2, "boom"))
                    .return_mode(ReturnMode::Fixed(3)),
            )
            .unwrap()
            .into_fixed()
            .unwrap();

        assert_eq!(fetch_u32(&runtime, &refs[0]).await.unwrap(), 0);
        assert_eq!(fetch_u32(&runtime, &refs[1]).await.unwrap(), 1);
        match fetch_u32(&runtime, &refs[2]).await {
            Err(Error::Object(ObjectError::TaskRaised { cause, .. })) => {
                assert_eq!(cause, "boom");
            },
            other => panic!("expected TaskRaised, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_raise_after_all_outputs_keeps_them_fetchable() {
        let runtime = runtime();
        let refs = runtime
            .submit(
                TaskRequest::new("late-raise", counting_then_raise(3, "late"))
                    .return_mode(ReturnMode::Fixed(3)),
            )
            .unwrap()
            .into_fixed()
            .unwrap();

        for (i, handle) in refs.iter().enumerate() {
            assert_eq!(fetch_u32(&runtime, handle).await.unwrap(), i as u32);
        }
    }

    #[tokio::test]
    async fn test_over_production_is_discarded() {
        let runtime = runtime();
        let refs = runtime
            .submit(TaskRequest::new("over", counting(5)).return_mode(ReturnMode::Fixed(2)))
            .unwrap()
            .into_fixed()
            .unwrap();
        let task_id = refs[0].task_id();

        assert_eq!(fetch_u32(&runtime, &refs[1]).await.unwrap(), 1);
        wait_for_terminal(&runtime, &task_id).await;

        let state = runtime.task_state(&task_id).unwrap();
        assert_eq!(state.committed, 2);
        assert_eq!(state.produced_count, 5);
        assert!(state.terminal.as_ref().unwrap().error().is_none());
    }

    #[tokio::test]
    async fn test_exception_yielded_as_data_is_a_value() {
        let runtime = runtime();
        let body = generator_fn(|mut ctx: GeneratorContext| async move {
            ctx.yield_value(ExceptionValue::new("ValueError", "not raised"))
                .await?;
            ctx.yield_value(1).await?;
            Ok(())
        });
        let refs = runtime
            .submit(TaskRequest::new("exc-data", body).return_mode(ReturnMode::Fixed(2)))
            .unwrap()
            .into_fixed()
            .unwrap();

        let exc: ExceptionValue = within(runtime.get_as(&refs[0])).await.unwrap();
        assert_eq!(exc, ExceptionValue::new("ValueError", "not raised"));
        assert_eq!(fetch_u32(&runtime, &refs[1]).await.unwrap(), 1);
    }
}

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn exact_production_fetches_every_index(n in 0u32..8) {
            let values = block_on(async move {
                let runtime = runtime();
                let refs = runtime
                    .submit(TaskRequest::new("exact", counting(n)).return_mode(ReturnMode::Fixed(n)))
                    .unwrap()
                    .into_fixed()
                    .unwrap();
                let mut values = Vec::new();
                for handle in &refs {
                    values.push(fetch_u32(&runtime, handle).await.unwrap());
                }
                values
            });
            prop_assert_eq!(values, (0..n).collect::<Vec<_>>());
        }

        #[test]
        fn short_production_fails_only_the_last_index(n in 1u32..8) {
            let (values, last) = block_on(async move {
                let runtime = runtime();
                let refs = runtime
                    .submit(TaskRequest::new("short", counting(n - 1)).return_mode(ReturnMode::Fixed(n)))
                    .unwrap()
                    .into_fixed()
                    .unwrap();
                let mut values = Vec::new();
                for handle in &refs[..refs.len() - 1] {
                    values.push(fetch_u32(&runtime, handle).await.unwrap());
                }
                let last = fetch_u32(&runtime, &refs[refs.len() - 1]).await;
                (values, last)
            });
            prop_assert_eq!(values, (0..n - 1).collect::<Vec<_>>());
            let is_under_production = matches!(
                last,
                Err(Error::Object(ObjectError::UnderProduction { expected, produced, .. }))
                    if expected == n && produced == n - 1
            );
            prop_assert!(is_under_production);
        }
    }
}
