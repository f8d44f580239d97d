// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fan-out of independent units of work onto tokio tasks
//!
//! [`ParallelTaskSet`] runs futures on distinct tokio tasks with a bound on
//! how many execute at once.  [`TaskGroup`] builds on it to run one labelled
//! task per unit of work (usually one instance of a cluster), wait for all of
//! them, and report every failure rather than only the first.

use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::task::JoinSet;

/// The default number of parallel tasks used by [ParallelTaskSet].
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

/// A collection of tokio tasks which execute in parallel on distinct tokio
/// tasks, up to a user-specified maximum amount of parallelism.
///
/// This parallelism is achieved by spawning tasks on a [JoinSet],
/// and may be further limited by the underlying machine's ability
/// to execute many tokio tasks.
///
/// # Why not just use a JoinSet?
///
/// The tokio [JoinSet] has no limit on the "maximum number of tasks".
/// Fanning out across every instance of a large cluster at once would open
/// that many SSH sessions or HTTP connections at the same time, which the
/// remote side may not tolerate.
pub struct ParallelTaskSet<T> {
    semaphore: Arc<Semaphore>,
    set: JoinSet<T>,
}

impl<T: 'static + Send> Default for ParallelTaskSet<T> {
    fn default() -> Self {
        ParallelTaskSet::new()
    }
}

impl<T: 'static + Send> ParallelTaskSet<T> {
    /// Creates a new [ParallelTaskSet], with [DEFAULT_MAX_PARALLELISM] as the
    /// maximum number of tasks to run in parallel.
    pub fn new() -> ParallelTaskSet<T> {
        Self::new_with_parallelism(DEFAULT_MAX_PARALLELISM)
    }

    /// Creates a new [ParallelTaskSet], with `max_parallelism` as the
    /// maximum number of tasks to run in parallel.
    ///
    /// A `max_parallelism` of zero is treated as one.
    pub fn new_with_parallelism(max_parallelism: usize) -> ParallelTaskSet<T> {
        let semaphore = Arc::new(Semaphore::new(max_parallelism.max(1)));
        let set = JoinSet::new();

        Self { semaphore, set }
    }

    /// Spawn a task immediately, but only allow it to execute if the task
    /// set is within the maximum parallelism constraint.
    pub fn spawn<F>(&mut self, command: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let _abort_handle = self.set.spawn(async move {
            // Hold onto the permit until the command finishes executing.  We
            // never close the semaphore, so acquiring can only fail if that
            // changes; run the command anyway rather than dropping it.
            let _permit = semaphore.acquire_owned().await.ok();
            command.await
        });
    }

    /// Returns the number of tasks that have not yet been joined.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Waits for the next task to complete and return its output.
    ///
    /// Returns `None` once every task has been joined.
    pub async fn join_next(&mut self) -> Option<Result<T, JoinError>> {
        self.set.join_next().await
    }
}

/// One failed unit of work within a [`TaskGroup`]
#[derive(Debug)]
pub struct TaskFailure {
    /// position of the task in spawn order
    pub index: usize,
    /// label given when the task was spawned
    pub label: String,
    pub error: anyhow::Error,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.label, self.error)
    }
}

/// Error returned when one or more tasks in a [`TaskGroup`] failed
///
/// Every failure is kept, ordered by the position of the task in the group.
#[derive(Debug, thiserror::Error)]
pub struct GroupError {
    pub group: String,
    pub total: usize,
    pub failures: Vec<TaskFailure>,
}

impl GroupError {
    /// Labels of the tasks that failed, in spawn order
    pub fn failed_labels(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.label.as_str()).collect()
    }
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} tasks in {:?} failed: ",
            self.failures.len(),
            self.total,
            self.group
        )?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// A named set of labelled tasks with a join barrier
///
/// Tasks start running as soon as they are spawned (subject to the
/// parallelism bound).  A failing or panicking task never cancels its
/// siblings: [`TaskGroup::join_all`] waits for every task and then reports
/// all failures together.
pub struct TaskGroup<T> {
    name: String,
    labels: Vec<String>,
    tasks: ParallelTaskSet<(usize, Result<T, anyhow::Error>)>,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new(name: impl Into<String>) -> TaskGroup<T> {
        Self::new_with_parallelism(name, DEFAULT_MAX_PARALLELISM)
    }

    pub fn new_with_parallelism(
        name: impl Into<String>,
        max_parallelism: usize,
    ) -> TaskGroup<T> {
        TaskGroup {
            name: name.into(),
            labels: Vec::new(),
            tasks: ParallelTaskSet::new_with_parallelism(max_parallelism),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks spawned so far
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Spawn one labelled task
    pub fn spawn<F, E>(&mut self, label: impl Into<String>, future: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let index = self.labels.len();
        self.labels.push(label.into());
        self.tasks.spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(error)) => Err(error.into()),
                Err(payload) => Err(anyhow::anyhow!(
                    "task panicked: {}",
                    panic_message(&*payload)
                )),
            };
            (index, result)
        });
    }

    /// Wait for every task to finish
    ///
    /// On success, returns the task outputs in spawn order.
    pub async fn join_all(self) -> Result<Vec<T>, GroupError> {
        let joined = self.join_all_partial().await;
        match joined.failures {
            None => Ok(joined.outputs.into_iter().flatten().collect()),
            Some(failures) => Err(failures),
        }
    }

    /// Wait for every task to finish, keeping the outputs of the tasks that
    /// succeeded even if others failed
    pub async fn join_all_partial(self) -> PartialJoin<T> {
        let TaskGroup { name, labels, mut tasks } = self;
        let total = labels.len();
        let mut outputs: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut failed = vec![false; total];
        let mut failures = Vec::new();
        let mut join_errors = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(output))) => outputs[index] = Some(output),
                Ok((index, Err(error))) => {
                    failed[index] = true;
                    failures.push(TaskFailure {
                        index,
                        label: labels[index].clone(),
                        error,
                    });
                }
                // Panics are caught inside the task, so this only happens if
                // the runtime is shutting down underneath us.
                Err(error) => join_errors.push(error.to_string()),
            }
        }

        // Anything that neither produced output nor reported a failure was
        // lost to a join error; attribute it by elimination.
        for index in 0..total {
            if outputs[index].is_none() && !failed[index] {
                failures.push(TaskFailure {
                    index,
                    label: labels[index].clone(),
                    error: anyhow::anyhow!(
                        "task did not run to completion: {}",
                        join_errors.join(", ")
                    ),
                });
            }
        }

        let failures = if failures.is_empty() {
            None
        } else {
            failures.sort_by_key(|f| f.index);
            Some(GroupError { group: name, total, failures })
        };
        PartialJoin { outputs, failures }
    }
}

/// Result of [`TaskGroup::join_all_partial`]
#[derive(Debug)]
pub struct PartialJoin<T> {
    /// one entry per task in spawn order; `None` where the task failed
    pub outputs: Vec<Option<T>>,
    pub failures: Option<GroupError>,
}

/// Run one task per `(label, unit, operation)` triple and wait for all of
/// them
///
/// This is the one-shot form of [`TaskGroup`]: every operation is invoked
/// with its unit, at most `max_parallelism` run at once, and the call returns
/// only after all have finished.
pub async fn run_group<U, T, E, F, Fut, I>(
    group: &str,
    max_parallelism: usize,
    named_tasks: I,
) -> Result<Vec<T>, GroupError>
where
    I: IntoIterator<Item = (String, U, F)>,
    F: FnOnce(U) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<anyhow::Error>,
    T: Send + 'static,
{
    let mut tasks = TaskGroup::new_with_parallelism(group, max_parallelism);
    for (label, unit, operation) in named_tasks {
        tasks.spawn(label, operation(unit));
    }
    tasks.join_all().await
}

/// Extracts the message from a panic payload, as caught by
/// [`std::panic::catch_unwind`] or [`FutureExt::catch_unwind`]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("(non-string panic payload)")
    }
}
