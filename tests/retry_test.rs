//! Backoff helpers used inside work functions

use std::cell::Cell;
use std::time::Duration;
use taskforge::core::retry::{is_retryable_message, retry_with_classifier};
use taskforge::{retry_with_backoff, retry_with_backoff_async, RetryPolicy};

fn quick(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
}

#[test]
fn test_transient_errors_are_retried_until_success() {
    let calls = Cell::new(0);
    let result: Result<&str, String> = retry_with_backoff(&quick(5), |attempt| {
        calls.set(calls.get() + 1);
        if attempt < 2 {
            Err("429 Too Many Requests".to_string())
        } else {
            Ok("generated")
        }
    });
    assert_eq!(result, Ok("generated"));
    assert_eq!(calls.get(), 3);
}

#[test]
fn test_permanent_error_stops_after_second_attempt() {
    let calls = Cell::new(0);
    let result: Result<(), String> = retry_with_backoff(&quick(5), |_| {
        calls.set(calls.get() + 1);
        Err("invalid prompt".to_string())
    });
    assert_eq!(result, Err("invalid prompt".to_string()));
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_gives_up_after_max_attempts() {
    let calls = Cell::new(0);
    let result: Result<(), String> = retry_with_backoff(&quick(3), |_| {
        calls.set(calls.get() + 1);
        Err("upstream 503".to_string())
    });
    assert!(result.is_err());
    assert_eq!(calls.get(), 3);
}

#[test]
fn test_custom_classifier() {
    let calls = Cell::new(0);
    let result: Result<u32, u32> = retry_with_classifier(
        &quick(4),
        |code: &u32| *code >= 500,
        |attempt| {
            calls.set(calls.get() + 1);
            if attempt == 0 { Err(503) } else { Err(400) }
        },
    );
    assert_eq!(result, Err(400));
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_delay_schedule_is_capped() {
    let policy = RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(10));
    assert_eq!(policy.delay_for(0), Duration::from_secs(2));
    assert_eq!(policy.delay_for(1), Duration::from_secs(4));
    assert_eq!(policy.delay_for(3), Duration::from_secs(10));
    assert!(policy.validate().is_ok());

    let jittered = policy.clone().with_jitter(true).delay_for(1);
    assert!(jittered >= Duration::from_secs(2) && jittered <= Duration::from_secs(4));
    assert!(is_retryable_message("Connection reset by peer"));
}

#[tokio::test]
async fn test_async_retry() {
    let calls = Cell::new(0);
    let result: Result<u32, String> = retry_with_backoff_async(&quick(4), |attempt| {
        calls.set(calls.get() + 1);
        async move {
            if attempt == 0 {
                Err("request timeout".to_string())
            } else {
                Ok(attempt)
            }
        }
    })
    .await;
    assert_eq!(result, Ok(1));
    assert_eq!(calls.get(), 2);
}
