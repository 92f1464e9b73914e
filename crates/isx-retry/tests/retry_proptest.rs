// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property-based tests for backoff bounds and attempt accounting.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use isx_error::{ErrorCode, PipelineError};
use isx_retry::{retry_with_policy, RetryPolicy};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn delay_for_never_exceeds_max_delay(
        initial_ms in 1u64..1000,
        multiplier in 1.0f64..8.0,
        max_ms in 1u64..5000,
        retry_index in 0u32..50,
    ) {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(initial_ms))
            .multiplier(multiplier)
            .max_delay(Duration::from_millis(max_ms))
            .build();
        prop_assert!(policy.delay_for(retry_index) <= Duration::from_millis(max_ms));
    }

    #[test]
    fn total_attempts_equals_failures_before_success_plus_one(
        max_attempts in 1u32..6,
        failures_before_success in 0u32..6,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let policy = RetryPolicy::builder()
                .max_attempts(max_attempts)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(1))
                .build();
            let calls = AtomicU32::new(0);
            let result = retry_with_policy(&policy, |_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < failures_before_success {
                        Err(PipelineError::new(ErrorCode::ExecutionRetryable, "flaky"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

            let expected_attempts = (failures_before_success + 1).min(max_attempts);
            prop_assert_eq!(calls.load(Ordering::SeqCst), expected_attempts);

            if failures_before_success < max_attempts {
                let outcome = result.unwrap();
                prop_assert_eq!(outcome.total_attempts, expected_attempts);
                prop_assert_eq!(outcome.failed_attempts.len() as u32, failures_before_success);
            } else {
                let err = result.unwrap_err();
                prop_assert_eq!(err.code, ErrorCode::ExecutionRetryable);
            }
            Ok(())
        })?;
    }
}
