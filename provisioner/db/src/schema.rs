// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes the Diesel database schema.
//!
//! NOTE: Should be kept up-to-date with schema/dbinit.sql.

diesel::table! {
    cluster (id) {
        id -> Text,
        tenant_id -> Text,
        name -> Text,
        plugin_version -> Text,
        status -> Text,
        time_created -> BigInt,
        time_modified -> BigInt,
    }
}

diesel::table! {
    node_group (id) {
        id -> Text,
        cluster_id -> Text,
        name -> Text,
        count -> BigInt,
        time_created -> BigInt,
    }
}

diesel::table! {
    instance (id) {
        id -> Text,
        node_group_id -> Text,
        name -> Text,
        management_ip -> Nullable<Text>,
        time_created -> BigInt,
    }
}

diesel::table! {
    provision_step (id) {
        id -> Text,
        cluster_id -> Text,
        tenant_id -> Text,
        step_name -> Text,
        step_type -> Text,
        total -> BigInt,
        successful -> Nullable<Bool>,
        time_created -> BigInt,
    }
}

diesel::table! {
    provision_event (id) {
        id -> Text,
        step_id -> Text,
        node_group_id -> Nullable<Text>,
        instance_id -> Nullable<Text>,
        instance_name -> Nullable<Text>,
        info -> Nullable<Text>,
        successful -> Bool,
        time_created -> BigInt,
    }
}

diesel::joinable!(node_group -> cluster (cluster_id));
diesel::joinable!(instance -> node_group (node_group_id));
diesel::joinable!(provision_step -> cluster (cluster_id));
diesel::joinable!(provision_event -> provision_step (step_id));

diesel::allow_tables_to_appear_in_same_query!(
    cluster,
    node_group,
    instance,
    provision_step,
    provision_event,
);
