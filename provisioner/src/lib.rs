// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster provisioning orchestration
//!
//! The pieces, bottom-up:
//!
//! * [`step::StepRunner`] fans one operation out over many instances and
//!   records each outcome as an event of a tracked provisioning step.
//! * [`decommission::Decommissioner`] removes instances from a running
//!   cluster through a sequence of such steps, using a
//!   [`decommission::DecommissionBackend`] for the product-specific parts.
//! * [`remote`] defines how the provisioner reaches instances and cluster
//!   managers, along with the waits built on them.
//! * [`context::ServerContext`] ties configuration, the datastore and the
//!   [`registry::PluginRegistry`] together.

pub mod config;
pub mod context;
pub mod decommission;
pub mod registry;
pub mod remote;
pub mod status;
pub mod step;

pub use config::Config;
pub use context::ServerContext;
