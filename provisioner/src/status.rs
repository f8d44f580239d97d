// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Human-readable rendering of cluster and step status

use provisioner_db::views;
use provisioner_db::views::StepStatus;

/// Renders a cluster's steps as a table, followed by each step's events if
/// they were loaded.
pub fn render_progress(steps: &[views::ProvisionStep]) -> String {
    if steps.is_empty() {
        return String::from("no provisioning steps recorded\n");
    }

    let name_width = steps
        .iter()
        .map(|s| s.step_name.len())
        .max()
        .unwrap_or(0)
        .max("STEP".len());
    let mut out = String::new();
    out.push_str(&format!(
        "{:<name_width$}  {:<12}  {:>5}  {:<11}  {}\n",
        "STEP", "TYPE", "TOTAL", "STATUS", "STARTED"
    ));
    for step in steps {
        out.push_str(&format!(
            "{:<name_width$}  {:<12}  {:>5}  {:<11}  {}\n",
            step.step_name,
            step.step_type,
            step.total,
            step.status().to_string(),
            step.time_created.format("%Y-%m-%dT%H:%M:%SZ"),
        ));
        for event in step.events.iter().flatten() {
            let outcome = if event.successful { "ok" } else { "FAILED" };
            let subject = event.instance_name.as_deref().unwrap_or("(batch)");
            out.push_str(&format!("    {outcome:<6}  {subject}"));
            if let Some(info) = &event.info {
                out.push_str(&format!(": {info}"));
            }
            out.push('\n');
        }
    }
    out
}

/// One line per cluster
pub fn render_clusters(clusters: &[views::ClusterSummary]) -> String {
    if clusters.is_empty() {
        return String::from("no clusters\n");
    }
    let name_width = clusters
        .iter()
        .map(|c| c.name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());
    let mut out = String::new();
    out.push_str(&format!(
        "{:<36}  {:<name_width$}  {:<15}  {:<16}\n",
        "ID", "NAME", "STATUS", "PLUGIN"
    ));
    for cluster in clusters {
        out.push_str(&format!(
            "{:<36}  {:<name_width$}  {:<15}  {:<16}\n",
            cluster.id,
            cluster.name,
            cluster.status.to_string(),
            cluster.plugin_version,
        ));
    }
    out
}

/// Overall state of a list of steps: failed if any failed, in progress if
/// any is still running, succeeded otherwise
pub fn overall_status(steps: &[views::ProvisionStep]) -> StepStatus {
    let statuses: Vec<_> = steps.iter().map(|s| s.status()).collect();
    if statuses.contains(&StepStatus::Failed) {
        StepStatus::Failed
    } else if statuses.contains(&StepStatus::InProgress) {
        StepStatus::InProgress
    } else {
        StepStatus::Succeeded
    }
}
