// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running one tracked provisioning step across many units of work
//!
//! A [`StepRunner`] opens a step that expects one event per unit, fans the
//! operation out with a [`TaskGroup`], and has every task record its own
//! outcome before the join barrier.  What happens when some units failed is
//! the caller's choice, expressed as a [`FailurePolicy`].

use futures::FutureExt;
use parallel_task_set::panic_message;
use parallel_task_set::GroupError;
use parallel_task_set::TaskGroup;
use provisioner_common::api::external::Error;
use provisioner_db::model::Instance;
use provisioner_db::model::ProvisionEventCreate;
use provisioner_db::DataStore;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use uuid::Uuid;

/// What to do once the barrier is reached and some units failed
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailurePolicy {
    /// the step's failure is the caller's failure
    Abort,
    /// hand the failures back to the caller alongside the outputs
    Continue,
}

/// Names a step and says how to treat its failures
#[derive(Clone, Debug)]
pub struct StepSpec {
    pub name: String,
    pub step_type: String,
    pub on_failure: FailurePolicy,
}

impl StepSpec {
    pub fn new(
        name: impl Into<String>,
        step_type: impl Into<String>,
        on_failure: FailurePolicy,
    ) -> StepSpec {
        StepSpec {
            name: name.into(),
            step_type: step_type.into(),
            on_failure,
        }
    }
}

/// Something a step does work on
pub trait StepUnit {
    /// Label used in logs and aggregated errors
    fn label(&self) -> String;

    /// The event recording the outcome of the work done on this unit
    fn event(
        &self,
        successful: bool,
        info: Option<String>,
    ) -> ProvisionEventCreate;
}

impl StepUnit for Instance {
    fn label(&self) -> String {
        self.name.clone()
    }

    fn event(
        &self,
        successful: bool,
        info: Option<String>,
    ) -> ProvisionEventCreate {
        ProvisionEventCreate {
            info,
            successful,
            ..ProvisionEventCreate::success_for(self)
        }
    }
}

/// A unit of work that covers a whole batch rather than one instance
#[derive(Clone, Debug)]
pub struct BatchUnit(pub String);

impl StepUnit for BatchUnit {
    fn label(&self) -> String {
        self.0.clone()
    }

    fn event(
        &self,
        successful: bool,
        info: Option<String>,
    ) -> ProvisionEventCreate {
        ProvisionEventCreate::for_batch(successful, info)
    }
}

/// Result of a step whose failures did not abort the caller
#[derive(Debug)]
pub struct StepOutcome<T> {
    pub step_id: Uuid,
    /// outputs of the units that succeeded, in unit order
    pub outputs: Vec<T>,
    pub failures: Option<GroupError>,
}

impl<T> StepOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.failures.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("failed to begin step {name:?}")]
    Begin {
        name: String,
        #[source]
        err: Error,
    },
    #[error("step {step_name:?} ({step_id}) failed")]
    TasksFailed {
        step_name: String,
        step_id: Uuid,
        #[source]
        failures: GroupError,
    },
}

/// Runs tracked steps with bounded fan-out
#[derive(Clone)]
pub struct StepRunner {
    log: Logger,
    datastore: Arc<DataStore>,
    max_parallelism: usize,
}

impl StepRunner {
    pub fn new(
        log: &Logger,
        datastore: Arc<DataStore>,
        max_parallelism: usize,
    ) -> StepRunner {
        StepRunner {
            log: log.new(o!("component" => "StepRunner")),
            datastore,
            max_parallelism,
        }
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    /// Run `op` once per unit as step `spec` of cluster `cluster_id`.
    ///
    /// Every unit records exactly one event whether it succeeds, fails or
    /// panics.  Failing to record an event fails that unit.
    pub async fn run<U, T, F, Fut>(
        &self,
        cluster_id: Uuid,
        spec: &StepSpec,
        units: Vec<U>,
        op: F,
    ) -> Result<StepOutcome<T>, StepError>
    where
        U: StepUnit,
        F: Fn(U) -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        T: Send + 'static,
    {
        let total = i64::try_from(units.len()).map_err(|_| StepError::Begin {
            name: spec.name.clone(),
            err: Error::invalid_request("too many units in one step"),
        })?;
        let step = self
            .datastore
            .provision_step_begin(cluster_id, &spec.name, &spec.step_type, total)
            .await
            .map_err(|err| StepError::Begin { name: spec.name.clone(), err })?;
        let step_id = step.id();
        let log = self.log.new(o!(
            "cluster_id" => cluster_id.to_string(),
            "step" => spec.name.clone(),
            "step_id" => step_id.to_string(),
        ));
        info!(log, "starting step"; "units" => total);

        let mut tasks = TaskGroup::new_with_parallelism(
            spec.name.clone(),
            self.max_parallelism,
        );
        for unit in units {
            let label = unit.label();
            // Both events are built up front; `unit` moves into `op`.
            let success = unit.event(true, None);
            let failure_base = unit.event(false, None);
            // A panic while building the future fails this unit like a
            // panic while running it.
            let work =
                std::panic::catch_unwind(AssertUnwindSafe(|| op(unit)));
            let datastore = Arc::clone(&self.datastore);
            let task_log = log.new(o!("unit" => label.clone()));
            tasks.spawn(label, async move {
                let outcome = match work {
                    Ok(work) => AssertUnwindSafe(work).catch_unwind().await,
                    Err(payload) => Err(payload),
                };
                let result = match outcome {
                    Ok(result) => result,
                    Err(payload) => Err(anyhow::anyhow!(
                        "task panicked: {}",
                        panic_message(&*payload)
                    )),
                };
                let event = match &result {
                    Ok(_) => success,
                    Err(e) => ProvisionEventCreate {
                        info: Some(format!("{e:#}")),
                        ..failure_base
                    },
                };
                let recorded =
                    datastore.provision_event_record(step_id, event).await;
                match (result, recorded) {
                    (Ok(output), Ok(_)) => Ok(output),
                    (Ok(_), Err(e)) => {
                        error!(task_log, "failed to record success"; "error" => %e);
                        Err(anyhow::Error::new(e)
                            .context("recording provision event"))
                    }
                    (Err(op_error), Ok(_)) => {
                        warn!(task_log, "unit failed";
                            "error" => format!("{op_error:#}"),
                        );
                        Err(op_error)
                    }
                    (Err(op_error), Err(e)) => {
                        error!(task_log, "unit failed and its failure could not be recorded";
                            "error" => format!("{op_error:#}"),
                            "record_error" => %e,
                        );
                        Err(op_error)
                    }
                }
            });
        }

        let joined = tasks.join_all_partial().await;
        let outputs: Vec<T> = joined.outputs.into_iter().flatten().collect();
        match joined.failures {
            None => {
                info!(log, "step complete");
                Ok(StepOutcome { step_id, outputs, failures: None })
            }
            Some(failures) => {
                warn!(log, "step failed";
                    "failed" => failures.failures.len(),
                    "error" => %failures,
                );
                match spec.on_failure {
                    FailurePolicy::Abort => Err(StepError::TasksFailed {
                        step_name: spec.name.clone(),
                        step_id,
                        failures,
                    }),
                    FailurePolicy::Continue => Ok(StepOutcome {
                        step_id,
                        outputs,
                        failures: Some(failures),
                    }),
                }
            }
        }
    }
}
