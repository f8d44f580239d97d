// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`Cluster`]s.

use super::DataStore;
use crate::error::public_error_from_diesel;
use crate::error::ErrorHandler;
use crate::error::TransactionError;
use crate::model::Cluster;
use crate::model::ClusterCreate;
use crate::model::ClusterState;
use crate::model::DbTimestamp;
use crate::model::DbUuid;
use crate::model::Instance;
use crate::model::NodeGroup;
use crate::schema;
use crate::views;
use diesel::prelude::*;
use diesel::SqliteConnection;
use provisioner_common::api::external::ClusterStatus;
use provisioner_common::api::external::CreateResult;
use provisioner_common::api::external::DeleteResult;
use provisioner_common::api::external::Error;
use provisioner_common::api::external::ListResultVec;
use provisioner_common::api::external::LookupResult;
use provisioner_common::api::external::LookupType;
use provisioner_common::api::external::ResourceType;
use provisioner_common::api::external::UpdateResult;
use slog::info;
use uuid::Uuid;

fn not_found(cluster_id: Uuid) -> ErrorHandler<'static> {
    ErrorHandler::NotFoundByLookup(
        ResourceType::Cluster,
        LookupType::ById(cluster_id),
    )
}

/// Fetches one cluster on an existing connection.
pub(super) fn cluster_fetch_on_connection(
    conn: &mut SqliteConnection,
    cluster_id: Uuid,
) -> Result<Cluster, TransactionError<Error>> {
    use schema::cluster::dsl;
    dsl::cluster
        .filter(dsl::id.eq(DbUuid(cluster_id)))
        .first::<Cluster>(conn)
        .optional()?
        .ok_or_else(|| {
            TransactionError::CustomError(Error::not_found_by_id(
                ResourceType::Cluster,
                &cluster_id,
            ))
        })
}

impl DataStore {
    /// Create a cluster, initially in the `creating` state
    pub async fn cluster_create(
        &self,
        params: ClusterCreate,
    ) -> CreateResult<Cluster> {
        use schema::cluster::dsl;

        let cluster = Cluster::new(params);
        let name = cluster.name.clone();
        let row = cluster.clone();
        self.transaction(move |conn| {
            diesel::insert_into(dsl::cluster).values(&row).execute(conn)?;
            Ok(())
        })
        .await
        .map_err(|e| {
            e.into_public(ErrorHandler::Conflict(ResourceType::Cluster, &name))
        })?;

        info!(self.log, "created cluster";
            "cluster_id" => %cluster.id,
            "tenant_id" => %cluster.tenant_id,
            "name" => &cluster.name,
        );
        Ok(cluster)
    }

    pub async fn cluster_fetch(&self, cluster_id: Uuid) -> LookupResult<Cluster> {
        self.read(move |conn| cluster_fetch_on_connection(conn, cluster_id))
            .await
            .map_err(|e| e.into_public(not_found(cluster_id)))
    }

    /// List a tenant's clusters, ordered by name
    pub async fn cluster_list_for_tenant(
        &self,
        tenant_id: Uuid,
    ) -> ListResultVec<Cluster> {
        use schema::cluster::dsl;
        self.read(move |conn| {
            Ok(dsl::cluster
                .filter(dsl::tenant_id.eq(DbUuid(tenant_id)))
                .order(dsl::name.asc())
                .load::<Cluster>(conn)?)
        })
        .await
        .map_err(|e| e.into_public(ErrorHandler::Server))
    }

    /// Unconditionally set a cluster's status
    pub async fn cluster_update_status(
        &self,
        cluster_id: Uuid,
        status: ClusterStatus,
    ) -> UpdateResult<Cluster> {
        use schema::cluster::dsl;
        let cluster = self
            .transaction(move |conn| {
                let updated = diesel::update(
                    dsl::cluster.filter(dsl::id.eq(DbUuid(cluster_id))),
                )
                .set((
                    dsl::status.eq(ClusterState(status)),
                    dsl::time_modified.eq(DbTimestamp::now()),
                ))
                .execute(conn)?;
                if updated == 0 {
                    return Err(Error::not_found_by_id(
                        ResourceType::Cluster,
                        &cluster_id,
                    )
                    .into());
                }
                cluster_fetch_on_connection(conn, cluster_id)
            })
            .await
            .map_err(|e| e.into_public(not_found(cluster_id)))?;

        info!(self.log, "updated cluster status";
            "cluster_id" => %cluster_id,
            "status" => %status,
        );
        Ok(cluster)
    }

    /// Move a cluster from `from` to `to`, failing with
    /// [`Error::Conflict`] if it is not currently in `from`
    ///
    /// This is how an operation claims a cluster: two operations racing to
    /// move it out of `active` cannot both succeed.
    pub async fn cluster_transition_status(
        &self,
        cluster_id: Uuid,
        from: ClusterStatus,
        to: ClusterStatus,
    ) -> UpdateResult<Cluster> {
        use schema::cluster::dsl;
        let cluster = self
            .transaction(move |conn| {
                let updated = diesel::update(
                    dsl::cluster
                        .filter(dsl::id.eq(DbUuid(cluster_id)))
                        .filter(dsl::status.eq(ClusterState(from))),
                )
                .set((
                    dsl::status.eq(ClusterState(to)),
                    dsl::time_modified.eq(DbTimestamp::now()),
                ))
                .execute(conn)?;
                let cluster = cluster_fetch_on_connection(conn, cluster_id)?;
                if updated == 0 {
                    return Err(Error::conflict(format!(
                        "cluster {} is {} (expected {})",
                        cluster_id,
                        cluster.status(),
                        from
                    ))
                    .into());
                }
                Ok(cluster)
            })
            .await
            .map_err(|e| e.into_public(not_found(cluster_id)))?;

        info!(self.log, "cluster status transition";
            "cluster_id" => %cluster_id,
            "from" => %from,
            "to" => %to,
        );
        Ok(cluster)
    }

    /// Delete a cluster along with its node groups, instances and
    /// provisioning progress
    pub async fn cluster_delete(&self, cluster_id: Uuid) -> DeleteResult {
        use schema::cluster::dsl;
        self.transaction(move |conn| {
            let deleted = diesel::delete(
                dsl::cluster.filter(dsl::id.eq(DbUuid(cluster_id))),
            )
            .execute(conn)?;
            if deleted == 0 {
                return Err(Error::not_found_by_id(
                    ResourceType::Cluster,
                    &cluster_id,
                )
                .into());
            }
            Ok(())
        })
        .await
        .map_err(|e| e.into_public(not_found(cluster_id)))?;

        info!(self.log, "deleted cluster"; "cluster_id" => %cluster_id);
        Ok(())
    }

    /// Build the externally visible representation of a cluster
    pub async fn cluster_view(
        &self,
        cluster_id: Uuid,
        with_events: bool,
    ) -> LookupResult<views::Cluster> {
        self.read(move |conn| {
            let cluster = cluster_fetch_on_connection(conn, cluster_id)?;

            let groups = {
                use schema::node_group::dsl;
                dsl::node_group
                    .filter(dsl::cluster_id.eq(DbUuid(cluster_id)))
                    .order(dsl::name.asc())
                    .load::<NodeGroup>(conn)?
            };
            let instances = {
                use schema::instance::dsl;
                dsl::instance
                    .filter(
                        dsl::node_group_id
                            .eq_any(groups.iter().map(|g| g.id).collect::<Vec<_>>()),
                    )
                    .order(dsl::name.asc())
                    .load::<Instance>(conn)?
            };
            let node_groups = groups
                .into_iter()
                .map(|group| views::NodeGroup {
                    id: group.id(),
                    name: group.name,
                    count: group.count,
                    instances: instances
                        .iter()
                        .filter(|i| i.node_group_id == group.id)
                        .cloned()
                        .map(views::Instance::from)
                        .collect(),
                })
                .collect();

            let provision_progress = super::provision::cluster_progress_on_connection(
                conn,
                cluster_id,
                with_events,
            )?;

            Ok(views::Cluster {
                id: cluster.id(),
                tenant_id: cluster.tenant_id.into(),
                name: cluster.name,
                plugin_version: cluster.plugin_version,
                status: cluster.status.0,
                time_created: cluster.time_created.into(),
                time_modified: cluster.time_modified.into(),
                node_groups,
                provision_progress,
            })
        })
        .await
        .map_err(|e| e.into_public(not_found(cluster_id)))
    }
}

#[cfg(test)]
mod test {
    use crate::model::ClusterCreate;
    use crate::model::InstanceCreate;
    use crate::pub_test_utils::TestDatabase;
    use assert_matches::assert_matches;
    use provisioner_common::api::external::ClusterStatus;
    use provisioner_common::api::external::Error;
    use provisioner_common::api::external::ResourceType;
    use provisioner_test_utils::dev;
    use uuid::Uuid;

    fn create_params(tenant_id: Uuid, name: &str) -> ClusterCreate {
        ClusterCreate {
            tenant_id,
            name: name.to_string(),
            plugin_version: String::from("generic-1.0"),
        }
    }

    #[tokio::test]
    async fn test_cluster_create_fetch_list() {
        let logctx = dev::test_setup_log("test_cluster_create_fetch_list");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();
        let tenant_id = Uuid::new_v4();

        let b = datastore
            .cluster_create(create_params(tenant_id, "beta"))
            .await
            .unwrap();
        let a = datastore
            .cluster_create(create_params(tenant_id, "alpha"))
            .await
            .unwrap();
        datastore
            .cluster_create(create_params(Uuid::new_v4(), "alpha"))
            .await
            .unwrap();
        assert_eq!(b.status(), ClusterStatus::Creating);

        let fetched = datastore.cluster_fetch(a.id()).await.unwrap();
        assert_eq!(fetched.name, "alpha");
        assert_eq!(fetched.tenant_id, a.tenant_id);
        assert_eq!(fetched.time_created, a.time_created);

        let names: Vec<_> = datastore
            .cluster_list_for_tenant(tenant_id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        // Names are unique per tenant.
        let error = datastore
            .cluster_create(create_params(tenant_id, "alpha"))
            .await
            .unwrap_err();
        assert_matches!(
            error,
            Error::ObjectAlreadyExists { type_name: ResourceType::Cluster, .. }
        );

        let error = datastore.cluster_fetch(Uuid::new_v4()).await.unwrap_err();
        assert_matches!(
            error,
            Error::ObjectNotFound { type_name: ResourceType::Cluster, .. }
        );

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_cluster_transition_status() {
        let logctx = dev::test_setup_log("test_cluster_transition_status");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();
        let cluster = datastore
            .cluster_create(create_params(Uuid::new_v4(), "c1"))
            .await
            .unwrap();
        let id = cluster.id();

        datastore
            .cluster_update_status(id, ClusterStatus::Active)
            .await
            .unwrap();
        let claimed = datastore
            .cluster_transition_status(
                id,
                ClusterStatus::Active,
                ClusterStatus::Decommissioning,
            )
            .await
            .unwrap();
        assert_eq!(claimed.status(), ClusterStatus::Decommissioning);

        // A second claim from the same starting state loses.
        let error = datastore
            .cluster_transition_status(
                id,
                ClusterStatus::Active,
                ClusterStatus::Scaling,
            )
            .await
            .unwrap_err();
        assert_matches!(error, Error::Conflict { message } => {
            assert!(message.contains("is decommissioning"), "{message}");
        });

        let error = datastore
            .cluster_update_status(Uuid::new_v4(), ClusterStatus::Error)
            .await
            .unwrap_err();
        assert_matches!(error, Error::ObjectNotFound { .. });

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_cluster_delete_cascades() {
        let logctx = dev::test_setup_log("test_cluster_delete_cascades");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();
        let cluster = datastore
            .cluster_create(create_params(Uuid::new_v4(), "c1"))
            .await
            .unwrap();
        let group = datastore
            .node_group_create(cluster.id(), "workers")
            .await
            .unwrap();
        let instance = datastore
            .instance_create(
                group.id(),
                InstanceCreate {
                    name: String::from("worker-0"),
                    management_ip: Some(String::from("10.0.0.5")),
                },
            )
            .await
            .unwrap();
        let step = datastore
            .provision_step_begin(cluster.id(), "Configure", "configure", 2)
            .await
            .unwrap();

        datastore.cluster_delete(cluster.id()).await.unwrap();

        assert_matches!(
            datastore.node_group_fetch(group.id()).await,
            Err(Error::ObjectNotFound { .. })
        );
        assert_matches!(
            datastore.instance_fetch(instance.id()).await,
            Err(Error::ObjectNotFound { .. })
        );
        assert_matches!(
            datastore.provision_step_fetch(step.id(), false).await,
            Err(Error::ObjectNotFound { .. })
        );
        assert_matches!(
            datastore.cluster_delete(cluster.id()).await,
            Err(Error::ObjectNotFound { .. })
        );

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_cluster_view() {
        let logctx = dev::test_setup_log("test_cluster_view");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();
        let cluster = datastore
            .cluster_create(create_params(Uuid::new_v4(), "c1"))
            .await
            .unwrap();
        let masters = datastore
            .node_group_create(cluster.id(), "masters")
            .await
            .unwrap();
        let workers = datastore
            .node_group_create(cluster.id(), "workers")
            .await
            .unwrap();
        for (group, name) in
            [(&masters, "master-0"), (&workers, "worker-0"), (&workers, "worker-1")]
        {
            datastore
                .instance_create(
                    group.id(),
                    InstanceCreate {
                        name: name.to_string(),
                        management_ip: None,
                    },
                )
                .await
                .unwrap();
        }
        datastore
            .provision_step_begin(cluster.id(), "Wait for drain", "drain", 0)
            .await
            .unwrap();

        let view = datastore.cluster_view(cluster.id(), true).await.unwrap();
        assert_eq!(view.name, "c1");
        assert_eq!(view.node_groups.len(), 2);
        assert_eq!(view.node_groups[0].name, "masters");
        assert_eq!(view.node_groups[0].count, 1);
        assert_eq!(view.node_groups[1].count, 2);
        let names: Vec<_> = view.node_groups[1]
            .instances
            .iter()
            .map(|i| i.name.as_str())
            .collect();
        assert_eq!(names, vec!["worker-0", "worker-1"]);
        assert_eq!(view.provision_progress.len(), 1);
        assert_eq!(view.provision_progress[0].successful, Some(true));
        assert_eq!(view.provision_progress[0].events, Some(vec![]));

        db.terminate().await;
        logctx.cleanup_successful();
    }
}
