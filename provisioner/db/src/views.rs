// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Externally visible representations of stored objects
//!
//! These are what callers (and the status CLI) see.  They are built from the
//! database models and carry plain [`Uuid`]s and timestamps.

use crate::model;
use chrono::DateTime;
use chrono::Utc;
use provisioner_common::api::external::ClusterStatus;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Derived state of a provision step
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl From<Option<bool>> for StepStatus {
    fn from(successful: Option<bool>) -> Self {
        match successful {
            None => StepStatus::InProgress,
            Some(true) => StepStatus::Succeeded,
            Some(false) => StepStatus::Failed,
        }
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ProvisionEvent {
    pub id: Uuid,
    pub step_id: Uuid,
    pub node_group_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
    pub instance_name: Option<String>,
    pub info: Option<String>,
    pub successful: bool,
    pub time_created: DateTime<Utc>,
}

impl From<model::ProvisionEvent> for ProvisionEvent {
    fn from(event: model::ProvisionEvent) -> Self {
        ProvisionEvent {
            id: event.id.into(),
            step_id: event.step_id.into(),
            node_group_id: event.node_group_id.map(Uuid::from),
            instance_id: event.instance_id.map(Uuid::from),
            instance_name: event.instance_name,
            info: event.info,
            successful: event.successful,
            time_created: event.time_created.into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ProvisionStep {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub tenant_id: Uuid,
    pub step_name: String,
    pub step_type: String,
    pub total: i64,
    /// `None` while the step is in progress
    pub successful: Option<bool>,
    pub time_created: DateTime<Utc>,
    /// Events that survive on the step (only present when requested)
    ///
    /// A successful step keeps no events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<ProvisionEvent>>,
}

impl ProvisionStep {
    pub fn status(&self) -> StepStatus {
        StepStatus::from(self.successful)
    }
}

impl From<model::ProvisionStep> for ProvisionStep {
    fn from(step: model::ProvisionStep) -> Self {
        ProvisionStep {
            id: step.id.into(),
            cluster_id: step.cluster_id.into(),
            tenant_id: step.tenant_id.into(),
            step_name: step.step_name,
            step_type: step.step_type,
            total: step.total,
            successful: step.successful,
            time_created: step.time_created.into(),
            events: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub management_ip: Option<String>,
}

impl From<model::Instance> for Instance {
    fn from(instance: model::Instance) -> Self {
        Instance {
            id: instance.id.into(),
            name: instance.name,
            management_ip: instance.management_ip,
        }
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct NodeGroup {
    pub id: Uuid,
    pub name: String,
    pub count: i64,
    pub instances: Vec<Instance>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Cluster {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub plugin_version: String,
    pub status: ClusterStatus,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
    pub node_groups: Vec<NodeGroup>,
    pub provision_progress: Vec<ProvisionStep>,
}

/// One row of a cluster listing
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub id: Uuid,
    pub name: String,
    pub plugin_version: String,
    pub status: ClusterStatus,
    pub time_created: DateTime<Utc>,
}

impl From<model::Cluster> for ClusterSummary {
    fn from(cluster: model::Cluster) -> Self {
        ClusterSummary {
            id: cluster.id.into(),
            name: cluster.name,
            plugin_version: cluster.plugin_version,
            status: cluster.status.0,
            time_created: cluster.time_created.into(),
        }
    }
}
