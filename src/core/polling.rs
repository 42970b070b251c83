//! Bounded polling with distinguishable exhaustion and abort outcomes.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingOptions {
    pub max_attempts: u32,
    pub sleep_time: Duration,
}

impl PollingOptions {
    pub fn new(max_attempts: u32, sleep_time: Duration) -> Self {
        Self {
            max_attempts,
            sleep_time,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollingError {
    #[error("value not found after {attempts} polling attempts")]
    Exhausted { attempts: u32 },
    #[error("polling aborted before a value was found")]
    Aborted,
}

/// Evaluates `get_value` until `found` accepts its output.
///
/// Sleeps `sleep_time` between attempts, never after the last one. A
/// cancelled `cancel` token wins over both the next attempt and any sleep in
/// progress, so an abort before the first attempt calls `get_value` zero times.
pub async fn with_polling<T, F, Fut, P>(
    options: PollingOptions,
    cancel: Option<&CancellationToken>,
    mut get_value: F,
    mut found: P,
) -> Result<T, PollingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: FnMut(&T) -> bool,
{
    for attempt in 1..=options.max_attempts {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(PollingError::Aborted);
        }

        let value = get_value().await;
        if found(&value) {
            return Ok(value);
        }
        debug!(
            attempt,
            max_attempts = options.max_attempts,
            "Polled value not ready"
        );

        if attempt == options.max_attempts {
            break;
        }
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(PollingError::Aborted),
                    _ = tokio::time::sleep(options.sleep_time) => {}
                }
            }
            None => tokio::time::sleep(options.sleep_time).await,
        }
    }

    Err(PollingError::Exhausted {
        attempts: options.max_attempts,
    })
}

/// Polls a producer of `Option<T>` until it yields `Some`.
pub async fn poll_until_some<T, F, Fut>(
    options: PollingOptions,
    cancel: Option<&CancellationToken>,
    get_value: F,
) -> Result<T, PollingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    with_polling(options, cancel, get_value, Option::is_some)
        .await?
        .ok_or(PollingError::Exhausted {
            attempts: options.max_attempts,
        })
}
