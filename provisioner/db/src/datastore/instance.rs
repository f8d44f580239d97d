// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`Instance`]s.
//!
//! A node group's `count` is kept equal to the number of its instances by
//! changing both in the same transaction.

use super::DataStore;
use crate::error::ErrorHandler;
use crate::error::TransactionError;
use crate::model::DbUuid;
use crate::model::Instance;
use crate::model::InstanceCreate;
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

fn not_found(instance_id: Uuid) -> ErrorHandler<'static> {
    ErrorHandler::NotFoundByLookup(
        ResourceType::Instance,
        LookupType::ById(instance_id),
    )
}

impl DataStore {
    /// Add an instance to a node group, growing the group's count by one
    pub async fn instance_create(
        &self,
        node_group_id: Uuid,
        params: InstanceCreate,
    ) -> CreateResult<Instance> {
        use schema::instance::dsl;
        use schema::node_group::dsl as group_dsl;

        let instance = Instance::new(node_group_id, params);
        let row = instance.clone();
        self.transaction(move |conn| {
            let grown = diesel::update(
                group_dsl::node_group
                    .filter(group_dsl::id.eq(DbUuid(node_group_id))),
            )
            .set(group_dsl::count.eq(group_dsl::count + 1i64))
            .execute(conn)?;
            if grown == 0 {
                return Err(Error::not_found_by_id(
                    ResourceType::NodeGroup,
                    &node_group_id,
                )
                .into());
            }
            diesel::insert_into(dsl::instance).values(&row).execute(conn)?;
            Ok(())
        })
        .await
        .map_err(|e| e.into_public(ErrorHandler::Server))?;

        info!(self.log, "created instance";
            "node_group_id" => %node_group_id,
            "instance_id" => %instance.id,
            "name" => &instance.name,
        );
        Ok(instance)
    }

    pub async fn instance_fetch(
        &self,
        instance_id: Uuid,
    ) -> LookupResult<Instance> {
        use schema::instance::dsl;
        self.read(move |conn| {
            Ok(dsl::instance
                .filter(dsl::id.eq(DbUuid(instance_id)))
                .first::<Instance>(conn)?)
        })
        .await
        .map_err(|e| e.into_public(not_found(instance_id)))
    }

    /// List every instance in a cluster, ordered by name
    pub async fn instance_list_for_cluster(
        &self,
        cluster_id: Uuid,
    ) -> ListResultVec<Instance> {
        use schema::instance::dsl;
        use schema::node_group::dsl as group_dsl;
        self.read(move |conn| {
            Ok(dsl::instance
                .inner_join(group_dsl::node_group)
                .filter(group_dsl::cluster_id.eq(DbUuid(cluster_id)))
                .order(dsl::name.asc())
                .select(schema::instance::all_columns)
                .load::<Instance>(conn)?)
        })
        .await
        .map_err(|e| e.into_public(ErrorHandler::Server))
    }

    /// Delete an instance and shrink its node group's count by one
    ///
    /// Only call this once the instance is gone from the cluster it was part
    /// of; the row is the record that the instance still exists.
    pub async fn instance_delete_and_shrink(
        &self,
        instance_id: Uuid,
    ) -> DeleteResult {
        use schema::instance::dsl;
        use schema::node_group::dsl as group_dsl;

        let instance = self
            .transaction(move |conn| {
                let instance = dsl::instance
                    .filter(dsl::id.eq(DbUuid(instance_id)))
                    .first::<Instance>(conn)
                    .optional()?
                    .ok_or_else(|| {
                        TransactionError::CustomError(Error::not_found_by_id(
                            ResourceType::Instance,
                            &instance_id,
                        ))
                    })?;
                diesel::delete(dsl::instance.filter(dsl::id.eq(instance.id)))
                    .execute(conn)?;
                diesel::update(
                    group_dsl::node_group
                        .filter(group_dsl::id.eq(instance.node_group_id)),
                )
                .set(group_dsl::count.eq(group_dsl::count - 1i64))
                .execute(conn)?;
                Ok(instance)
            })
            .await
            .map_err(|e| e.into_public(not_found(instance_id)))?;

        info!(self.log, "deleted instance";
            "instance_id" => %instance_id,
            "node_group_id" => %instance.node_group_id,
            "name" => &instance.name,
        );
        Ok(())
    }
}
