// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`NodeGroup`]s.

use super::cluster::cluster_fetch_on_connection;
use super::DataStore;
use crate::error::ErrorHandler;
use crate::model::DbUuid;
use crate::model::NodeGroup;
use crate::schema;
use diesel::prelude::*;
use provisioner_common::api::external::CreateResult;
use provisioner_common::api::external::DeleteResult;
use provisioner_common::api::external::Error;
use provisioner_common::api::external::ListResultVec;
use provisioner_common::api::external::LookupResult;
use provisioner_common::api::external::LookupType;
use provisioner_common::api::external::ResourceType;
use slog::info;
use uuid::Uuid;

fn not_found(node_group_id: Uuid) -> ErrorHandler<'static> {
    ErrorHandler::NotFoundByLookup(
        ResourceType::NodeGroup,
        LookupType::ById(node_group_id),
    )
}

impl DataStore {
    /// Create an empty node group in a cluster
    pub async fn node_group_create(
        &self,
        cluster_id: Uuid,
        name: &str,
    ) -> CreateResult<NodeGroup> {
        use schema::node_group::dsl;

        let group = NodeGroup::new(cluster_id, name.to_string());
        let row = group.clone();
        self.transaction(move |conn| {
            cluster_fetch_on_connection(conn, cluster_id)?;
            diesel::insert_into(dsl::node_group).values(&row).execute(conn)?;
            Ok(())
        })
        .await
        .map_err(|e| {
            e.into_public(ErrorHandler::Conflict(ResourceType::NodeGroup, name))
        })?;

        info!(self.log, "created node group";
            "cluster_id" => %cluster_id,
            "node_group_id" => %group.id,
            "name" => name,
        );
        Ok(group)
    }

    pub async fn node_group_fetch(
        &self,
        node_group_id: Uuid,
    ) -> LookupResult<NodeGroup> {
        use schema::node_group::dsl;
        self.read(move |conn| {
            Ok(dsl::node_group
                .filter(dsl::id.eq(DbUuid(node_group_id)))
                .first::<NodeGroup>(conn)?)
        })
        .await
        .map_err(|e| e.into_public(not_found(node_group_id)))
    }

    /// List a cluster's node groups, ordered by name
    pub async fn node_group_list(
        &self,
        cluster_id: Uuid,
    ) -> ListResultVec<NodeGroup> {
        use schema::node_group::dsl;
        self.read(move |conn| {
            Ok(dsl::node_group
                .filter(dsl::cluster_id.eq(DbUuid(cluster_id)))
                .order(dsl::name.asc())
                .load::<NodeGroup>(conn)?)
        })
        .await
        .map_err(|e| e.into_public(ErrorHandler::Server))
    }

    /// Delete an empty node group
    ///
    /// Fails with [`Error::DeletionBlocked`] while the group still has
    /// instances.
    pub async fn node_group_delete(&self, node_group_id: Uuid) -> DeleteResult {
        use schema::instance::dsl as instance_dsl;
        use schema::node_group::dsl;

        self.transaction(move |conn| {
            let remaining = instance_dsl::instance
                .filter(instance_dsl::node_group_id.eq(DbUuid(node_group_id)))
                .count()
                .get_result::<i64>(conn)?;
            if remaining > 0 {
                return Err(Error::DeletionBlocked {
                    type_name: ResourceType::NodeGroup,
                    message: format!(
                        "node group {} still has {} instance(s)",
                        node_group_id, remaining
                    ),
                }
                .into());
            }
            let deleted = diesel::delete(
                dsl::node_group.filter(dsl::id.eq(DbUuid(node_group_id))),
            )
            .execute(conn)?;
            if deleted == 0 {
                return Err(Error::not_found_by_id(
                    ResourceType::NodeGroup,
                    &node_group_id,
                )
                .into());
            }
            Ok(())
        })
        .await
        .map_err(|e| e.into_public(not_found(node_group_id)))?;

        info!(self.log, "deleted node group"; "node_group_id" => %node_group_id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::model::ClusterCreate;
    use crate::model::InstanceCreate;
    use crate::pub_test_utils::TestDatabase;
    use assert_matches::assert_matches;
    use provisioner_common::api::external::Error;
    use provisioner_common::api::external::ResourceType;
    use provisioner_test_utils::dev;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_node_group_lifecycle() {
        let logctx = dev::test_setup_log("test_node_group_lifecycle");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();

        let error = datastore
            .node_group_create(Uuid::new_v4(), "workers")
            .await
            .unwrap_err();
        assert_matches!(
            error,
            Error::ObjectNotFound { type_name: ResourceType::Cluster, .. }
        );

        let cluster = datastore
            .cluster_create(ClusterCreate {
                tenant_id: Uuid::new_v4(),
                name: String::from("c1"),
                plugin_version: String::from("generic-1.0"),
            })
            .await
            .unwrap();
        let workers = datastore
            .node_group_create(cluster.id(), "workers")
            .await
            .unwrap();
        datastore.node_group_create(cluster.id(), "masters").await.unwrap();
        assert_matches!(
            datastore.node_group_create(cluster.id(), "workers").await,
            Err(Error::ObjectAlreadyExists { .. })
        );

        let names: Vec<_> = datastore
            .node_group_list(cluster.id())
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["masters", "workers"]);

        let instance = datastore
            .instance_create(
                workers.id(),
                InstanceCreate {
                    name: String::from("worker-0"),
                    management_ip: None,
                },
            )
            .await
            .unwrap();

        // Not while it has an instance.
        let error = datastore.node_group_delete(workers.id()).await.unwrap_err();
        assert_matches!(
            error,
            Error::DeletionBlocked { type_name: ResourceType::NodeGroup, .. }
        );

        datastore.instance_delete_and_shrink(instance.id()).await.unwrap();
        datastore.node_group_delete(workers.id()).await.unwrap();
        assert_matches!(
            datastore.node_group_fetch(workers.id()).await,
            Err(Error::ObjectNotFound { type_name: ResourceType::NodeGroup, .. })
        );

        db.terminate().await;
        logctx.cleanup_successful();
    }
}
