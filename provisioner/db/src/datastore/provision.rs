// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods for tracking provisioning progress
//!
//! A [`ProvisionStep`] expects `total` events, one per unit of work.  Its
//! `successful` column is derived from the events as they arrive:
//!
//! * the first failed event makes the step `false`, and the events are kept
//!   so the cause can be inspected;
//! * once `total` events have arrived and none failed, the step becomes
//!   `true` and its events are deleted.
//!
//! Both the insert and the derivation happen inside one `BEGIN IMMEDIATE`
//! transaction, so concurrent recorders for the same step are serialized by
//! SQLite and exactly one of them observes the final count.

use super::DataStore;
use crate::error::ErrorHandler;
use crate::error::TransactionError;
use crate::model::DbTimestamp;
use crate::model::DbUuid;
use crate::model::ProvisionEvent;
use crate::model::ProvisionEventCreate;
use crate::model::ProvisionStep;
use crate::schema;
use crate::views;
use diesel::prelude::*;
use diesel::SqliteConnection;
use provisioner_common::api::external::CreateResult;
use provisioner_common::api::external::Error;
use provisioner_common::api::external::ListResultVec;
use provisioner_common::api::external::LookupResult;
use provisioner_common::api::external::LookupType;
use provisioner_common::api::external::ResourceType;
use slog::debug;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use uuid::Uuid;

/// What recording an event did to its step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepTransition {
    Unchanged,
    Succeeded,
    Failed,
}

fn step_not_found(step_id: Uuid) -> ErrorHandler<'static> {
    ErrorHandler::NotFoundByLookup(
        ResourceType::ProvisionStep,
        LookupType::ById(step_id),
    )
}

fn step_fetch_on_connection(
    conn: &mut SqliteConnection,
    step_id: Uuid,
) -> Result<ProvisionStep, TransactionError<Error>> {
    use schema::provision_step::dsl;
    dsl::provision_step
        .filter(dsl::id.eq(DbUuid(step_id)))
        .first::<ProvisionStep>(conn)
        .optional()?
        .ok_or_else(|| {
            TransactionError::CustomError(Error::not_found_by_id(
                ResourceType::ProvisionStep,
                &step_id,
            ))
        })
}

/// Loads the surviving events of `step_ids`, grouped by step.
fn events_for_steps(
    conn: &mut SqliteConnection,
    step_ids: Vec<DbUuid>,
) -> Result<BTreeMap<DbUuid, Vec<views::ProvisionEvent>>, TransactionError<Error>>
{
    use schema::provision_event::dsl;
    let events = dsl::provision_event
        .filter(dsl::step_id.eq_any(step_ids))
        .order((dsl::time_created.asc(), dsl::id.asc()))
        .load::<ProvisionEvent>(conn)?;

    let mut by_step: BTreeMap<DbUuid, Vec<views::ProvisionEvent>> =
        BTreeMap::new();
    for event in events {
        by_step.entry(event.step_id).or_default().push(event.into());
    }
    Ok(by_step)
}

fn attach_events(
    conn: &mut SqliteConnection,
    steps: Vec<ProvisionStep>,
    with_events: bool,
) -> Result<Vec<views::ProvisionStep>, TransactionError<Error>> {
    let mut by_step = if with_events {
        events_for_steps(conn, steps.iter().map(|s| s.id).collect())?
    } else {
        BTreeMap::new()
    };
    Ok(steps
        .into_iter()
        .map(|step| {
            let events = with_events
                .then(|| by_step.remove(&step.id).unwrap_or_default());
            views::ProvisionStep { events, ..views::ProvisionStep::from(step) }
        })
        .collect())
}

/// Loads a cluster's steps in creation order.
///
/// The caller is responsible for checking that the cluster exists.
pub(super) fn cluster_progress_on_connection(
    conn: &mut SqliteConnection,
    cluster_id: Uuid,
    with_events: bool,
) -> Result<Vec<views::ProvisionStep>, TransactionError<Error>> {
    use schema::provision_step::dsl;
    let steps = dsl::provision_step
        .filter(dsl::cluster_id.eq(DbUuid(cluster_id)))
        .order((dsl::time_created.asc(), dsl::id.asc()))
        .load::<ProvisionStep>(conn)?;
    attach_events(conn, steps, with_events)
}

impl DataStore {
    /// Open a new step for a cluster, expecting `total` events
    ///
    /// A step that expects no events is successful from the start.
    pub async fn provision_step_begin(
        &self,
        cluster_id: Uuid,
        step_name: &str,
        step_type: &str,
        total: i64,
    ) -> CreateResult<ProvisionStep> {
        use schema::provision_step::dsl;

        if total < 0 {
            return Err(Error::invalid_request(&format!(
                "provision step {:?} cannot expect {} events",
                step_name, total
            )));
        }

        let step_name = step_name.to_string();
        let step_type = step_type.to_string();
        let step = self
            .transaction(move |conn| {
                let cluster =
                    super::cluster::cluster_fetch_on_connection(conn, cluster_id)?;
                let step = ProvisionStep {
                    id: DbUuid(Uuid::new_v4()),
                    cluster_id: cluster.id,
                    tenant_id: cluster.tenant_id,
                    step_name,
                    step_type,
                    total,
                    successful: if total == 0 { Some(true) } else { None },
                    time_created: DbTimestamp::now(),
                };
                diesel::insert_into(dsl::provision_step)
                    .values(&step)
                    .execute(conn)?;
                Ok(step)
            })
            .await
            .map_err(|e| e.into_public(ErrorHandler::Server))?;

        info!(self.log, "began provision step";
            "cluster_id" => %cluster_id,
            "step_id" => %step.id,
            "step_name" => &step.step_name,
            "total" => step.total,
        );
        Ok(step)
    }

    /// Record the outcome of one unit of work in a step
    ///
    /// Fails with [`Error::Conflict`] if the step already succeeded: nothing
    /// may be added to a step whose events were pruned.  Events for a step
    /// that already failed are stored without changing the step.
    pub async fn provision_event_record(
        &self,
        step_id: Uuid,
        params: ProvisionEventCreate,
    ) -> CreateResult<Uuid> {
        use schema::provision_event::dsl as event_dsl;
        use schema::provision_step::dsl as step_dsl;

        let event = ProvisionEvent::new(step_id, params);
        let event_id = event.id();
        let successful = event.successful;
        let (step, transition) = self
            .transaction(move |conn| {
                let step = step_fetch_on_connection(conn, step_id)?;
                if step.successful == Some(true) {
                    return Err(Error::conflict(format!(
                        "provision step {} ({:?}) has already completed \
                         successfully",
                        step_id, step.step_name
                    ))
                    .into());
                }

                diesel::insert_into(event_dsl::provision_event)
                    .values(&event)
                    .execute(conn)?;

                let transition = match (event.successful, step.successful) {
                    (false, None) => {
                        diesel::update(
                            step_dsl::provision_step
                                .filter(step_dsl::id.eq(step.id)),
                        )
                        .set(step_dsl::successful.eq(Some(false)))
                        .execute(conn)?;
                        StepTransition::Failed
                    }
                    (true, None) => {
                        let recorded = event_dsl::provision_event
                            .filter(event_dsl::step_id.eq(step.id))
                            .count()
                            .get_result::<i64>(conn)?;
                        if recorded >= step.total {
                            diesel::update(
                                step_dsl::provision_step
                                    .filter(step_dsl::id.eq(step.id)),
                            )
                            .set(step_dsl::successful.eq(Some(true)))
                            .execute(conn)?;
                            diesel::delete(
                                event_dsl::provision_event
                                    .filter(event_dsl::step_id.eq(step.id)),
                            )
                            .execute(conn)?;
                            StepTransition::Succeeded
                        } else {
                            StepTransition::Unchanged
                        }
                    }
                    // The step already failed; keep the event alongside the
                    // failure but leave the step alone.
                    (_, Some(_)) => StepTransition::Unchanged,
                };
                Ok((step, transition))
            })
            .await
            .map_err(|e| e.into_public(step_not_found(step_id)))?;

        let log = self.log.new(slog::o!(
            "step_id" => step_id.to_string(),
            "step_name" => step.step_name.clone(),
            "event_id" => event_id.to_string(),
        ));
        match transition {
            StepTransition::Succeeded => {
                info!(log, "provision step succeeded"; "total" => step.total)
            }
            StepTransition::Failed => warn!(log, "provision step failed"),
            StepTransition::Unchanged => {
                debug!(log, "recorded provision event"; "successful" => successful)
            }
        }
        Ok(event_id)
    }

    /// Fetch one step, optionally with its surviving events
    pub async fn provision_step_fetch(
        &self,
        step_id: Uuid,
        with_events: bool,
    ) -> LookupResult<views::ProvisionStep> {
        self.read(move |conn| {
            let step = step_fetch_on_connection(conn, step_id)?;
            let mut steps = attach_events(conn, vec![step], with_events)?;
            steps.pop().ok_or_else(|| {
                Error::internal_error("provision step vanished while reading")
                    .into()
            })
        })
        .await
        .map_err(|e| e.into_public(step_not_found(step_id)))
    }

    /// Every step recorded for a cluster, oldest first
    pub async fn cluster_provision_progress(
        &self,
        cluster_id: Uuid,
        with_events: bool,
    ) -> ListResultVec<views::ProvisionStep> {
        self.read(move |conn| {
            super::cluster::cluster_fetch_on_connection(conn, cluster_id)?;
            cluster_progress_on_connection(conn, cluster_id, with_events)
        })
        .await
        .map_err(|e| {
            e.into_public(ErrorHandler::NotFoundByLookup(
                ResourceType::Cluster,
                LookupType::ById(cluster_id),
            ))
        })
    }
}

#[cfg(test)]
mod test {
    use crate::model::Cluster;
    use crate::model::ClusterCreate;
    use crate::model::ProvisionEventCreate;
    use crate::pub_test_utils::TestDatabase;
    use crate::views::StepStatus;
    use crate::DataStore;
    use assert_matches::assert_matches;
    use provisioner_common::api::external::Error;
    use provisioner_common::api::external::ResourceType;
    use provisioner_test_utils::dev;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn create_cluster(datastore: &DataStore) -> Cluster {
        datastore
            .cluster_create(ClusterCreate {
                tenant_id: Uuid::new_v4(),
                name: String::from("c1"),
                plugin_version: String::from("generic-1.0"),
            })
            .await
            .unwrap()
    }

    fn unit_event(successful: bool, name: &str) -> ProvisionEventCreate {
        ProvisionEventCreate {
            node_group_id: Some(Uuid::new_v4()),
            instance_id: Some(Uuid::new_v4()),
            instance_name: Some(name.to_string()),
            info: (!successful).then(|| format!("{name}: exit status 1")),
            successful,
        }
    }

    #[tokio::test]
    async fn test_step_begin() {
        let logctx = dev::test_setup_log("test_step_begin");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();
        let cluster = create_cluster(datastore).await;

        let error = datastore
            .provision_step_begin(Uuid::new_v4(), "Configure", "configure", 3)
            .await
            .unwrap_err();
        assert_matches!(
            error,
            Error::ObjectNotFound { type_name: ResourceType::Cluster, .. }
        );

        let step = datastore
            .provision_step_begin(cluster.id(), "Configure", "configure", 3)
            .await
            .unwrap();
        assert_eq!(step.successful, None);
        assert_eq!(step.tenant_id, cluster.tenant_id);

        // Nothing to wait for: done immediately, with no events.
        let empty = datastore
            .provision_step_begin(cluster.id(), "Start", "start", 0)
            .await
            .unwrap();
        assert_eq!(empty.successful, Some(true));
        let fetched =
            datastore.provision_step_fetch(empty.id(), true).await.unwrap();
        assert_eq!(fetched.status(), StepStatus::Succeeded);
        assert_eq!(fetched.events, Some(vec![]));

        assert_matches!(
            datastore
                .provision_step_begin(cluster.id(), "Bogus", "bogus", -1)
                .await,
            Err(Error::InvalidRequest { .. })
        );

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_step_in_progress_until_total() {
        let logctx = dev::test_setup_log("test_step_in_progress_until_total");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();
        let cluster = create_cluster(datastore).await;
        let step = datastore
            .provision_step_begin(cluster.id(), "Configure", "configure", 3)
            .await
            .unwrap();

        for (i, name) in ["n0", "n1"].iter().enumerate() {
            datastore
                .provision_event_record(step.id(), unit_event(true, name))
                .await
                .unwrap();
            let fetched =
                datastore.provision_step_fetch(step.id(), true).await.unwrap();
            assert_eq!(fetched.successful, None);
            assert_eq!(fetched.events.unwrap().len(), i + 1);
        }

        datastore
            .provision_event_record(step.id(), unit_event(true, "n2"))
            .await
            .unwrap();
        let fetched =
            datastore.provision_step_fetch(step.id(), true).await.unwrap();
        assert_eq!(fetched.successful, Some(true));
        // Success prunes every event.
        assert_eq!(fetched.events, Some(vec![]));

        // The step is terminal.
        let error = datastore
            .provision_event_record(step.id(), unit_event(true, "n3"))
            .await
            .unwrap_err();
        assert_matches!(error, Error::Conflict { .. });

        let error = datastore
            .provision_event_record(Uuid::new_v4(), unit_event(true, "n0"))
            .await
            .unwrap_err();
        assert_matches!(
            error,
            Error::ObjectNotFound { type_name: ResourceType::ProvisionStep, .. }
        );

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_step_failure_is_immediate_and_sticky() {
        let logctx =
            dev::test_setup_log("test_step_failure_is_immediate_and_sticky");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();
        let cluster = create_cluster(datastore).await;
        let step = datastore
            .provision_step_begin(cluster.id(), "Configure", "configure", 2)
            .await
            .unwrap();

        datastore
            .provision_event_record(step.id(), unit_event(false, "n0"))
            .await
            .unwrap();
        // Failed before the second event ever arrives.
        let fetched =
            datastore.provision_step_fetch(step.id(), true).await.unwrap();
        assert_eq!(fetched.successful, Some(false));

        // A late success is kept but does not revive the step, even though
        // the count now matches the total.
        datastore
            .provision_event_record(step.id(), unit_event(true, "n1"))
            .await
            .unwrap();
        // Repeated failures are harmless.
        datastore
            .provision_event_record(step.id(), unit_event(false, "n0"))
            .await
            .unwrap();

        let fetched =
            datastore.provision_step_fetch(step.id(), true).await.unwrap();
        assert_eq!(fetched.successful, Some(false));
        let events = fetched.events.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().filter(|e| e.successful).count(), 1);
        assert_eq!(
            events
                .iter()
                .find(|e| !e.successful)
                .and_then(|e| e.info.as_deref()),
            Some("n0: exit status 1")
        );

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_concurrent_events_complete_step() {
        let logctx = dev::test_setup_log("test_concurrent_events_complete_step");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();
        let cluster = create_cluster(datastore).await;
        let step = datastore
            .provision_step_begin(cluster.id(), "Configure", "configure", 3)
            .await
            .unwrap();

        let recorders = (0..3).map(|i| {
            let datastore = Arc::clone(datastore);
            let step_id = step.id();
            tokio::spawn(async move {
                datastore
                    .provision_event_record(
                        step_id,
                        unit_event(true, &format!("n{i}")),
                    )
                    .await
            })
        });
        for result in futures::future::join_all(recorders).await {
            result.unwrap().unwrap();
        }

        let fetched =
            datastore.provision_step_fetch(step.id(), true).await.unwrap();
        assert_eq!(fetched.successful, Some(true));
        assert_eq!(fetched.events, Some(vec![]));

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_many_concurrent_events() {
        let logctx = dev::test_setup_log("test_many_concurrent_events");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();
        let cluster = create_cluster(datastore).await;
        let total = 40;
        let ok = datastore
            .provision_step_begin(cluster.id(), "Start", "start", total)
            .await
            .unwrap();
        let bad = datastore
            .provision_step_begin(cluster.id(), "Configure", "configure", total)
            .await
            .unwrap();

        let mut recorders = Vec::new();
        for i in 0..total {
            for (step_id, successful) in
                [(ok.id(), true), (bad.id(), i != 17)]
            {
                let datastore = Arc::clone(datastore);
                recorders.push(tokio::spawn(async move {
                    datastore
                        .provision_event_record(
                            step_id,
                            unit_event(successful, &format!("n{i}")),
                        )
                        .await
                }));
            }
        }
        for result in futures::future::join_all(recorders).await {
            result.unwrap().unwrap();
        }

        let progress = datastore
            .cluster_provision_progress(cluster.id(), true)
            .await
            .unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].id, ok.id());
        assert_eq!(progress[0].successful, Some(true));
        assert_eq!(progress[0].events, Some(vec![]));
        assert_eq!(progress[1].id, bad.id());
        assert_eq!(progress[1].successful, Some(false));
        // Every event of a failed step is retained.
        assert_eq!(progress[1].events.as_ref().unwrap().len(), 40);

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_cluster_progress() {
        let logctx = dev::test_setup_log("test_cluster_progress");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();
        let cluster = create_cluster(datastore).await;
        let other = datastore
            .cluster_create(ClusterCreate {
                tenant_id: cluster.tenant_id.into(),
                name: String::from("c2"),
                plugin_version: String::from("generic-1.0"),
            })
            .await
            .unwrap();

        let first = datastore
            .provision_step_begin(cluster.id(), "Wait for instances", "boot", 1)
            .await
            .unwrap();
        let second = datastore
            .provision_step_begin(cluster.id(), "Configure", "configure", 2)
            .await
            .unwrap();
        datastore
            .provision_step_begin(other.id(), "Configure", "configure", 2)
            .await
            .unwrap();
        datastore
            .provision_event_record(second.id(), unit_event(false, "n1"))
            .await
            .unwrap();

        let without = datastore
            .cluster_provision_progress(cluster.id(), false)
            .await
            .unwrap();
        let ids: Vec<_> = without.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
        assert!(without.iter().all(|s| s.events.is_none()));

        let with = datastore
            .cluster_provision_progress(cluster.id(), true)
            .await
            .unwrap();
        assert_eq!(with[0].events, Some(vec![]));
        let events = with[1].events.as_ref().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].instance_name.as_deref(), Some("n1"));

        assert_matches!(
            datastore.cluster_provision_progress(Uuid::new_v4(), false).await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Cluster, .. })
        );

        db.terminate().await;
        logctx.cleanup_successful();
    }
}
