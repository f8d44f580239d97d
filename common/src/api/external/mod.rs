// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and related facilities for representing provisioner
//! resources to callers
//!
//! The contents here are transport-agnostic.

mod error;
pub use error::*;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FormatResult;

// The type aliases below exist primarily to ensure consistency among return
// types for functions in the `DataStore` and the orchestration layer.

/// Result of a create operation for the specified type
pub type CreateResult<T> = Result<T, Error>;
/// Result of a delete operation for the specified type
pub type DeleteResult = Result<(), Error>;
/// Result of a list operation that returns a vector
pub type ListResultVec<T> = Result<Vec<T>, Error>;
/// Result of a lookup operation for the specified type
pub type LookupResult<T> = Result<T, Error>;
/// Result of an update operation for the specified type
pub type UpdateResult<T> = Result<T, Error>;

/// Identifies a type of provisioner resource
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ResourceType {
    Cluster,
    NodeGroup,
    Instance,
    ProvisionStep,
    ProvisionEvent,
    Plugin,
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(
            f,
            "{}",
            match self {
                ResourceType::Cluster => "cluster",
                ResourceType::NodeGroup => "node group",
                ResourceType::Instance => "instance",
                ResourceType::ProvisionStep => "provision step",
                ResourceType::ProvisionEvent => "provision event",
                ResourceType::Plugin => "plugin",
            }
        )
    }
}

/// Lifecycle status of a cluster, as seen by callers
///
/// `Scaling` and `Decommissioning` are the "busy" states: while a cluster is
/// in one of them, exactly one structural operation owns it.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClusterStatus {
    Creating,
    Active,
    Scaling,
    Decommissioning,
    Error,
    Deleting,
}

impl ClusterStatus {
    /// Returns true if a structural operation currently owns the cluster
    pub fn is_busy(&self) -> bool {
        match self {
            ClusterStatus::Creating
            | ClusterStatus::Scaling
            | ClusterStatus::Decommissioning
            | ClusterStatus::Deleting => true,
            ClusterStatus::Active | ClusterStatus::Error => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::ClusterStatus;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_cluster_status_string_forms_agree() {
        for status in ClusterStatus::iter() {
            let display = status.to_string();
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", display));
            assert_eq!(ClusterStatus::from_str(&display).unwrap(), status);
        }
    }

    #[test]
    fn test_busy_states() {
        assert!(ClusterStatus::Decommissioning.is_busy());
        assert!(ClusterStatus::Scaling.is_busy());
        assert!(!ClusterStatus::Active.is_busy());
        assert!(!ClusterStatus::Error.is_busy());
    }
}
