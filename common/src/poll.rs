// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for polling for some condition to become true
//!
//! Orchestration code uses [`wait_for_condition`] whenever it has kicked off
//! something asynchronous on a remote system (a manager starting up, hosts
//! registering, a long-running request, nodes draining) and needs to block
//! until the remote side reports that it is done.  The wait is always
//! bounded: there is no way to poll forever.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Result of one check of the condition
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// the condition is not yet true
    NotYet,
    /// the condition is not yet true; the string describes what was observed
    /// and is reported if the poll eventually times out
    Pending(String),
    /// the condition check failed in a way that polling again will not fix
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(error: E) -> Self {
        CondCheckError::Failed(error)
    }
}

/// Error returned by [`wait_for_condition`]
#[derive(Debug, Error)]
pub enum Error<E> {
    #[error("timed out after {elapsed:?}{}", last_seen_suffix(.last_state))]
    TimedOut { elapsed: Duration, last_state: Option<String> },
    #[error("non-retryable error while polling on condition")]
    PermanentError(#[source] E),
}

fn last_seen_suffix(last_state: &Option<String>) -> String {
    match last_state {
        Some(state) => format!(" (last seen: {state})"),
        None => String::new(),
    }
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// `poll_max` has elapsed since the first check.
///
/// `cond` is invoked immediately.  Between attempts the calling task sleeps
/// for `poll_interval` (or for whatever is left of `poll_max`, if that is
/// shorter).  Errors other than [`CondCheckError::NotYet`] and
/// [`CondCheckError::Pending`] abort the poll immediately.
///
/// # Panics
///
/// Panics if `poll_interval` is zero, which would turn this into a busy loop.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    assert!(!poll_interval.is_zero(), "poll interval must be non-zero");

    let poll_start = Instant::now();
    let mut last_state = None;
    loop {
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::Pending(state)) => last_state = Some(state),
            Err(CondCheckError::NotYet) => (),
        }

        let elapsed = poll_start.elapsed();
        if elapsed >= *poll_max {
            return Err(Error::TimedOut { elapsed, last_state });
        }

        let remaining = *poll_max - elapsed;
        tokio::time::sleep(std::cmp::min(*poll_interval, remaining)).await;
    }
}
