// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence for the cluster provisioner
//!
//! Clusters, their node groups and instances, and the provisioning progress
//! (steps and per-unit events) recorded while orchestrations run.  Everything
//! lives in one SQLite database accessed through [`DataStore`].

pub mod config;
mod datastore;
pub mod error;
pub mod model;
mod pool;
pub mod schema;
pub mod views;

#[cfg(any(test, feature = "testing"))]
pub mod pub_test_utils;

pub use config::Config;
pub use datastore::DataStore;
