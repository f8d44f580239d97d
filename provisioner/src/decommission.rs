// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Removing instances from a running cluster
//!
//! Decommissioning moves through a fixed sequence of states:
//!
//! ```text
//! MarkForExclusion -> DrainWait -> FinalizeMembership -> Teardown -> Decommissioned
//! ```
//!
//! and any of the first four may end in `Failed`.  Each state is recorded as
//! a provisioning step so that callers can follow along.  Inventory rows are
//! only removed once the targets have drained.
//!
//! How hosts are excluded, drained and forgotten depends on the product
//! running on the cluster and is delegated to a [`DecommissionBackend`].

use crate::remote::DrainState;
use crate::step::BatchUnit;
use crate::step::FailurePolicy;
use crate::step::StepError;
use crate::step::StepRunner;
use crate::step::StepSpec;
use async_trait::async_trait;
use provisioner_common::api::external::ClusterStatus;
use provisioner_common::api::external::Error;
use provisioner_common::api::external::ResourceType;
use provisioner_common::poll;
use provisioner_common::poll::wait_for_condition;
use provisioner_common::poll::CondCheckError;
use provisioner_db::model::Instance;
use provisioner_db::model::NodeGroup;
use provisioner_db::model::ProvisionEventCreate;
use provisioner_db::DataStore;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

pub const STEP_EXCLUDE: &str = "Exclude instances";
pub const STEP_DRAIN: &str = "Wait for drain";
pub const STEP_FINALIZE: &str = "Finalize membership";
pub const STEP_REMOVE: &str = "Remove instances";
const STEP_TYPE: &str = "decommission";

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DecommissionState {
    MarkForExclusion,
    DrainWait,
    FinalizeMembership,
    Teardown,
    Decommissioned,
    Failed,
}

/// Everything a backend may need to know about the cluster being shrunk
#[derive(Clone, Debug)]
pub struct ClusterMembers {
    pub cluster_id: Uuid,
    pub node_groups: Vec<NodeGroup>,
    /// every instance in the cluster, including the ones being removed
    pub instances: Vec<Instance>,
}

/// Drain state of each instance being removed, keyed by instance id
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DrainReport {
    /// instance id -> (instance name, state)
    states: BTreeMap<Uuid, (String, DrainState)>,
}

impl DrainReport {
    /// Builds a report covering exactly `targets` from states reported per
    /// host name
    ///
    /// Targets whose name is missing from `reported` are `Unknown`; extra
    /// entries are ignored.  Instances that share a host name share its
    /// state.
    pub fn from_host_states(
        targets: &[Instance],
        reported: &BTreeMap<String, DrainState>,
    ) -> DrainReport {
        let states = targets
            .iter()
            .map(|t| {
                let state = reported
                    .get(&t.name)
                    .copied()
                    .unwrap_or(DrainState::Unknown);
                (t.id(), (t.name.clone(), state))
            })
            .collect();
        DrainReport { states }
    }

    /// State of one instance, if it is covered by this report
    pub fn state(&self, instance_id: Uuid) -> Option<DrainState> {
        self.states.get(&instance_id).map(|(_, state)| *state)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Names of the instances not yet known to be drained, in name order
    pub fn still_draining(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .states
            .values()
            .filter(|(_, state)| *state != DrainState::Drained)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn is_complete(&self) -> bool {
        self.states.values().all(|(_, s)| *s == DrainState::Drained)
    }
}

/// Product-specific half of decommissioning
#[async_trait]
pub trait DecommissionBackend: Send + Sync {
    /// Tell the cluster to stop placing work on `target` and move its work
    /// elsewhere.  Must be idempotent.
    async fn mark_excluded(
        &self,
        members: &ClusterMembers,
        target: &Instance,
    ) -> anyhow::Result<()>;

    /// Report how far along `targets` are in handing off their work.
    async fn drain_status(
        &self,
        members: &ClusterMembers,
        targets: &[Instance],
    ) -> anyhow::Result<DrainReport>;

    /// Make the cluster's membership consist of exactly `survivors`.
    async fn finalize_membership(
        &self,
        members: &ClusterMembers,
        survivors: &[Instance],
        removed: &[Instance],
    ) -> anyhow::Result<()>;

    /// Forget `target` entirely.  A target that is already gone is not an
    /// error.
    async fn unregister(
        &self,
        members: &ClusterMembers,
        target: &Instance,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum DecommissionError {
    #[error("invalid decommission request")]
    Invalid(#[source] Error),
    #[error("decommission failed during {state}")]
    StepFailed {
        state: DecommissionState,
        #[source]
        err: StepError,
    },
    #[error(
        "decommission failed during drain_wait: {} still draining after \
         {elapsed:?}",
        join_names(.still_draining)
    )]
    DrainTimedOut { elapsed: Duration, still_draining: Vec<String> },
    #[error("decommission failed during drain_wait: checking drain status")]
    DrainCheck(#[source] anyhow::Error),
    #[error("decommission failed during {state}")]
    Internal {
        state: DecommissionState,
        #[source]
        err: Error,
    },
}

fn join_names(names: &[String]) -> String {
    names.join(", ")
}

impl DecommissionError {
    /// The state the decommission was in when it failed
    pub fn state(&self) -> DecommissionState {
        match self {
            DecommissionError::Invalid(_) => {
                DecommissionState::MarkForExclusion
            }
            DecommissionError::StepFailed { state, .. }
            | DecommissionError::Internal { state, .. } => *state,
            DecommissionError::DrainTimedOut { .. }
            | DecommissionError::DrainCheck(_) => DecommissionState::DrainWait,
        }
    }
}

/// What a successful decommission did
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecommissionSummary {
    pub cluster_id: Uuid,
    /// names of the removed instances
    pub removed: Vec<String>,
    /// steps recorded, in the order they ran
    pub step_ids: Vec<Uuid>,
}

pub struct Decommissioner {
    log: Logger,
    datastore: Arc<DataStore>,
    backend: Arc<dyn DecommissionBackend>,
    steps: StepRunner,
    poll_interval: Duration,
    timeout: Duration,
}

impl Decommissioner {
    pub fn new(
        log: &Logger,
        steps: StepRunner,
        backend: Arc<dyn DecommissionBackend>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Decommissioner {
        Decommissioner {
            log: log.new(o!("component" => "Decommissioner")),
            datastore: Arc::clone(steps.datastore()),
            backend,
            steps,
            poll_interval,
            timeout,
        }
    }

    /// Remove the instances `targets` from cluster `cluster_id`.
    ///
    /// On failure the cluster is left in status `error`.  Callers are
    /// expected to have claimed the cluster (see
    /// [`DataStore::cluster_transition_status`]) so that no other structural
    /// operation runs at the same time.
    pub async fn decommission(
        &self,
        cluster_id: Uuid,
        targets: &[Uuid],
    ) -> Result<DecommissionSummary, DecommissionError> {
        let log = self.log.new(o!("cluster_id" => cluster_id.to_string()));
        let target_ids: BTreeSet<Uuid> = targets.iter().copied().collect();
        if target_ids.is_empty() {
            info!(log, "nothing to decommission");
            return Ok(DecommissionSummary {
                cluster_id,
                removed: Vec::new(),
                step_ids: Vec::new(),
            });
        }

        let (members, removed, survivors) =
            self.load_members(cluster_id, &target_ids).await?;
        info!(log, "decommissioning instances";
            "removing" => removed.len(),
            "remaining" => survivors.len(),
        );

        match self.run(&log, members, &removed, &survivors).await {
            Ok(step_ids) => {
                info!(log, "decommission complete";
                    "state" => %DecommissionState::Decommissioned,
                );
                Ok(DecommissionSummary {
                    cluster_id,
                    removed: removed.into_iter().map(|i| i.name).collect(),
                    step_ids,
                })
            }
            Err(err) => {
                error!(log, "decommission failed";
                    "state" => %err.state(),
                    "error" => %err,
                );
                if let Err(e) = self
                    .datastore
                    .cluster_update_status(cluster_id, ClusterStatus::Error)
                    .await
                {
                    error!(log, "failed to mark cluster as failed"; "error" => %e);
                }
                Err(err)
            }
        }
    }

    /// Returns the cluster's members and the instances to remove and keep.
    async fn load_members(
        &self,
        cluster_id: Uuid,
        target_ids: &BTreeSet<Uuid>,
    ) -> Result<(ClusterMembers, Vec<Instance>, Vec<Instance>), DecommissionError>
    {
        let lookup_error = |err: Error| match err {
            Error::ObjectNotFound { .. } => DecommissionError::Invalid(err),
            err => DecommissionError::Internal {
                state: DecommissionState::MarkForExclusion,
                err,
            },
        };
        self.datastore.cluster_fetch(cluster_id).await.map_err(lookup_error)?;
        let node_groups = self
            .datastore
            .node_group_list(cluster_id)
            .await
            .map_err(lookup_error)?;
        let instances = self
            .datastore
            .instance_list_for_cluster(cluster_id)
            .await
            .map_err(lookup_error)?;

        let known: BTreeSet<Uuid> = instances.iter().map(|i| i.id()).collect();
        if let Some(missing) = target_ids.iter().find(|id| !known.contains(id))
        {
            return Err(DecommissionError::Invalid(Error::not_found_by_id(
                ResourceType::Instance,
                missing,
            )));
        }

        let (removed, survivors): (Vec<_>, Vec<_>) = instances
            .iter()
            .cloned()
            .partition(|i| target_ids.contains(&i.id()));
        let members = ClusterMembers { cluster_id, node_groups, instances };
        Ok((members, removed, survivors))
    }

    async fn run(
        &self,
        log: &Logger,
        members: ClusterMembers,
        removed: &[Instance],
        survivors: &[Instance],
    ) -> Result<Vec<Uuid>, DecommissionError> {
        let cluster_id = members.cluster_id;
        let members = Arc::new(members);
        let mut step_ids = Vec::new();

        // Tell the cluster to move work off the targets.
        let state = DecommissionState::MarkForExclusion;
        info!(log, "decommission state"; "state" => %state);
        let outcome = self
            .steps
            .run(
                cluster_id,
                &StepSpec::new(STEP_EXCLUDE, STEP_TYPE, FailurePolicy::Abort),
                removed.to_vec(),
                |target| {
                    let backend = Arc::clone(&self.backend);
                    let members = Arc::clone(&members);
                    async move { backend.mark_excluded(&members, &target).await }
                },
            )
            .await
            .map_err(|err| DecommissionError::StepFailed { state, err })?;
        step_ids.push(outcome.step_id);

        let state = DecommissionState::DrainWait;
        info!(log, "decommission state"; "state" => %state);
        step_ids.push(self.wait_for_drain(log, &members, removed).await?);

        let state = DecommissionState::FinalizeMembership;
        info!(log, "decommission state"; "state" => %state);
        let outcome = self
            .steps
            .run(
                cluster_id,
                &StepSpec::new(STEP_FINALIZE, STEP_TYPE, FailurePolicy::Abort),
                vec![BatchUnit(String::from("membership"))],
                |_| {
                    let backend = Arc::clone(&self.backend);
                    let members = Arc::clone(&members);
                    let survivors = survivors.to_vec();
                    let removed = removed.to_vec();
                    async move {
                        backend
                            .finalize_membership(&members, &survivors, &removed)
                            .await
                    }
                },
            )
            .await
            .map_err(|err| DecommissionError::StepFailed { state, err })?;
        step_ids.push(outcome.step_id);

        let state = DecommissionState::Teardown;
        info!(log, "decommission state"; "state" => %state);
        let outcome = self
            .steps
            .run(
                cluster_id,
                &StepSpec::new(STEP_REMOVE, STEP_TYPE, FailurePolicy::Abort),
                removed.to_vec(),
                |target| {
                    let backend = Arc::clone(&self.backend);
                    let datastore = Arc::clone(&self.datastore);
                    let members = Arc::clone(&members);
                    async move {
                        backend.unregister(&members, &target).await?;
                        datastore.instance_delete_and_shrink(target.id()).await?;
                        Ok::<_, anyhow::Error>(())
                    }
                },
            )
            .await
            .map_err(|err| DecommissionError::StepFailed { state, err })?;
        step_ids.push(outcome.step_id);

        Ok(step_ids)
    }

    /// Poll the backend until every target has drained, recording the wait
    /// as a single-event step.
    async fn wait_for_drain(
        &self,
        log: &Logger,
        members: &ClusterMembers,
        targets: &[Instance],
    ) -> Result<Uuid, DecommissionError> {
        let internal = |err: Error| DecommissionError::Internal {
            state: DecommissionState::DrainWait,
            err,
        };
        let step = self
            .datastore
            .provision_step_begin(members.cluster_id, STEP_DRAIN, STEP_TYPE, 1)
            .await
            .map_err(internal)?;

        let last_draining: Mutex<Vec<String>> =
            Mutex::new(targets.iter().map(|t| t.name.clone()).collect());
        let result = wait_for_condition(
            || async {
                let report =
                    match self.backend.drain_status(members, targets).await {
                        Ok(report) => report,
                        Err(e) => return Err(CondCheckError::Failed(e)),
                    };
                if report.is_complete() {
                    return Ok(());
                }
                let draining: Vec<String> = report
                    .still_draining()
                    .into_iter()
                    .map(String::from)
                    .collect();
                let state = format!(
                    "{} of {} still draining",
                    draining.len(),
                    targets.len()
                );
                if let Ok(mut last) = last_draining.lock() {
                    *last = draining;
                }
                Err(CondCheckError::Pending(state))
            },
            &self.poll_interval,
            &self.timeout,
        )
        .await;

        let (event, outcome) = match result {
            Ok(()) => {
                info!(log, "all targets drained");
                (ProvisionEventCreate::for_batch(true, None), Ok(step.id()))
            }
            Err(poll::Error::TimedOut { elapsed, .. }) => {
                let still_draining = last_draining
                    .into_inner()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let err =
                    DecommissionError::DrainTimedOut { elapsed, still_draining };
                warn!(log, "targets did not drain in time"; "error" => %err);
                (
                    ProvisionEventCreate::for_batch(false, Some(err.to_string())),
                    Err(err),
                )
            }
            Err(poll::Error::PermanentError(e)) => {
                let info = format!("{e:#}");
                (
                    ProvisionEventCreate::for_batch(false, Some(info)),
                    Err(DecommissionError::DrainCheck(e)),
                )
            }
        };
        self.datastore
            .provision_event_record(step.id(), event)
            .await
            .map_err(internal)?;
        outcome
    }
}
