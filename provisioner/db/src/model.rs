// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structures stored to the database.

use crate::schema::cluster;
use crate::schema::instance;
use crate::schema::node_group;
use crate::schema::provision_event;
use crate::schema::provision_step;
use chrono::DateTime;
use chrono::Utc;
use diesel::backend::Backend;
use diesel::deserialize;
use diesel::deserialize::FromSql;
use diesel::prelude::*;
use diesel::serialize;
use diesel::serialize::IsNull;
use diesel::serialize::Output;
use diesel::serialize::ToSql;
use diesel::sql_types::BigInt;
use diesel::sql_types::Text;
use diesel::sqlite::Sqlite;
use diesel::AsExpression;
use diesel::FromSqlRow;
use provisioner_common::api::external::ClusterStatus;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A UUID, stored as its hyphenated text form
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
pub struct DbUuid(pub Uuid);

impl From<Uuid> for DbUuid {
    fn from(id: Uuid) -> Self {
        DbUuid(id)
    }
}

impl From<DbUuid> for Uuid {
    fn from(id: DbUuid) -> Self {
        id.0
    }
}

impl fmt::Display for DbUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl ToSql<Text, Sqlite> for DbUuid {
    fn to_sql<'b>(
        &'b self,
        out: &mut Output<'b, '_, Sqlite>,
    ) -> serialize::Result {
        out.set_value(self.0.to_string());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for DbUuid {
    fn from_sql(
        bytes: <Sqlite as Backend>::RawValue<'_>,
    ) -> deserialize::Result<Self> {
        let s = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        Ok(DbUuid(Uuid::parse_str(&s)?))
    }
}

/// A UTC timestamp, stored as microseconds since the Unix epoch
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = BigInt)]
pub struct DbTimestamp(pub DateTime<Utc>);

impl DbTimestamp {
    pub fn now() -> DbTimestamp {
        DbTimestamp(Utc::now())
    }
}

impl From<DbTimestamp> for DateTime<Utc> {
    fn from(t: DbTimestamp) -> Self {
        t.0
    }
}

impl ToSql<BigInt, Sqlite> for DbTimestamp {
    fn to_sql<'b>(
        &'b self,
        out: &mut Output<'b, '_, Sqlite>,
    ) -> serialize::Result {
        out.set_value(self.0.timestamp_micros());
        Ok(IsNull::No)
    }
}

impl FromSql<BigInt, Sqlite> for DbTimestamp {
    fn from_sql(
        bytes: <Sqlite as Backend>::RawValue<'_>,
    ) -> deserialize::Result<Self> {
        let micros = <i64 as FromSql<BigInt, Sqlite>>::from_sql(bytes)?;
        let time = DateTime::<Utc>::from_timestamp_micros(micros)
            .ok_or("timestamp out of range")?;
        Ok(DbTimestamp(time))
    }
}

/// Database representation of [`ClusterStatus`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
pub struct ClusterState(pub ClusterStatus);

impl From<ClusterStatus> for ClusterState {
    fn from(status: ClusterStatus) -> Self {
        ClusterState(status)
    }
}

impl ToSql<Text, Sqlite> for ClusterState {
    fn to_sql<'b>(
        &'b self,
        out: &mut Output<'b, '_, Sqlite>,
    ) -> serialize::Result {
        out.set_value(self.0.to_string());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for ClusterState {
    fn from_sql(
        bytes: <Sqlite as Backend>::RawValue<'_>,
    ) -> deserialize::Result<Self> {
        let s = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        Ok(ClusterState(ClusterStatus::from_str(&s)?))
    }
}

/// A cluster: the root of everything provisioned for one tenant request
#[derive(Clone, Debug, Queryable, Insertable)]
#[diesel(table_name = cluster)]
pub struct Cluster {
    pub id: DbUuid,
    pub tenant_id: DbUuid,
    pub name: String,
    pub plugin_version: String,
    pub status: ClusterState,
    pub time_created: DbTimestamp,
    pub time_modified: DbTimestamp,
}

impl Cluster {
    pub fn new(params: ClusterCreate) -> Cluster {
        let now = DbTimestamp::now();
        Cluster {
            id: DbUuid(Uuid::new_v4()),
            tenant_id: DbUuid(params.tenant_id),
            name: params.name,
            plugin_version: params.plugin_version,
            status: ClusterState(ClusterStatus::Creating),
            time_created: now,
            time_modified: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id.0
    }

    pub fn status(&self) -> ClusterStatus {
        self.status.0
    }
}

/// Create-time parameters for a [`Cluster`]
#[derive(Clone, Debug)]
pub struct ClusterCreate {
    pub tenant_id: Uuid,
    pub name: String,
    pub plugin_version: String,
}

/// A set of identically-configured instances within a cluster
#[derive(Clone, Debug, Queryable, Insertable)]
#[diesel(table_name = node_group)]
pub struct NodeGroup {
    pub id: DbUuid,
    pub cluster_id: DbUuid,
    pub name: String,
    /// number of instances currently in the group
    pub count: i64,
    pub time_created: DbTimestamp,
}

impl NodeGroup {
    pub fn new(cluster_id: Uuid, name: String) -> NodeGroup {
        NodeGroup {
            id: DbUuid(Uuid::new_v4()),
            cluster_id: DbUuid(cluster_id),
            name,
            count: 0,
            time_created: DbTimestamp::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id.0
    }
}

/// One VM belonging to a node group
#[derive(Clone, Debug, Queryable, Insertable)]
#[diesel(table_name = instance)]
pub struct Instance {
    pub id: DbUuid,
    pub node_group_id: DbUuid,
    pub name: String,
    pub management_ip: Option<String>,
    pub time_created: DbTimestamp,
}

impl Instance {
    pub fn new(node_group_id: Uuid, params: InstanceCreate) -> Instance {
        Instance {
            id: DbUuid(Uuid::new_v4()),
            node_group_id: DbUuid(node_group_id),
            name: params.name,
            management_ip: params.management_ip,
            time_created: DbTimestamp::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id.0
    }

    pub fn node_group_id(&self) -> Uuid {
        self.node_group_id.0
    }
}

/// Create-time parameters for an [`Instance`]
#[derive(Clone, Debug)]
pub struct InstanceCreate {
    pub name: String,
    pub management_ip: Option<String>,
}

/// A phase of a cluster operation whose progress is tracked per unit of work
///
/// `successful` is `None` while the step is in progress.  Once it is set the
/// step is terminal.
#[derive(Clone, Debug, Queryable, Insertable)]
#[diesel(table_name = provision_step)]
pub struct ProvisionStep {
    pub id: DbUuid,
    pub cluster_id: DbUuid,
    pub tenant_id: DbUuid,
    pub step_name: String,
    pub step_type: String,
    /// number of events that complete the step
    pub total: i64,
    pub successful: Option<bool>,
    pub time_created: DbTimestamp,
}

impl ProvisionStep {
    pub fn id(&self) -> Uuid {
        self.id.0
    }

    pub fn is_terminal(&self) -> bool {
        self.successful.is_some()
    }
}

/// The outcome of one unit of work within a [`ProvisionStep`]
#[derive(Clone, Debug, Queryable, Insertable)]
#[diesel(table_name = provision_event)]
pub struct ProvisionEvent {
    pub id: DbUuid,
    pub step_id: DbUuid,
    pub node_group_id: Option<DbUuid>,
    pub instance_id: Option<DbUuid>,
    pub instance_name: Option<String>,
    pub info: Option<String>,
    pub successful: bool,
    pub time_created: DbTimestamp,
}

impl ProvisionEvent {
    pub fn new(step_id: Uuid, params: ProvisionEventCreate) -> ProvisionEvent {
        ProvisionEvent {
            id: DbUuid(Uuid::new_v4()),
            step_id: DbUuid(step_id),
            node_group_id: params.node_group_id.map(DbUuid),
            instance_id: params.instance_id.map(DbUuid),
            instance_name: params.instance_name,
            info: params.info,
            successful: params.successful,
            time_created: DbTimestamp::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id.0
    }
}

/// Parameters for recording a [`ProvisionEvent`]
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionEventCreate {
    pub node_group_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
    pub instance_name: Option<String>,
    pub info: Option<String>,
    pub successful: bool,
}

impl ProvisionEventCreate {
    /// A successful event for work done on `instance`
    pub fn success_for(instance: &Instance) -> ProvisionEventCreate {
        ProvisionEventCreate {
            node_group_id: Some(instance.node_group_id()),
            instance_id: Some(instance.id()),
            instance_name: Some(instance.name.clone()),
            info: None,
            successful: true,
        }
    }

    /// A failed event for work done on `instance`
    pub fn failure_for(
        instance: &Instance,
        info: impl Into<String>,
    ) -> ProvisionEventCreate {
        ProvisionEventCreate {
            info: Some(info.into()),
            successful: false,
            ..Self::success_for(instance)
        }
    }

    /// An event for a unit of work that is not tied to one instance
    pub fn for_batch(successful: bool, info: Option<String>) -> Self {
        ProvisionEventCreate {
            node_group_id: None,
            instance_id: None,
            instance_name: None,
            info,
            successful,
        }
    }
}
