// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the systems a cluster operation acts on
//!
//! [`RemoteExecutor`] runs a command on one instance (normally over SSH) and
//! [`ManagerClient`] talks to the cluster's management service.  Neither
//! encodes a particular product's protocol; plugins provide implementations.
//! The `wait_for_*` helpers build the common convergence waits out of
//! [`wait_for_condition`].

use crate::decommission::ClusterMembers;
use crate::decommission::DecommissionBackend;
use crate::decommission::DrainReport;
use anyhow::Context;
use async_trait::async_trait;
use provisioner_common::poll;
use provisioner_common::poll::wait_for_condition;
use provisioner_common::poll::CondCheckError;
use provisioner_db::model::Instance;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result of a command that ran to completion on an instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turns a non-zero exit status into an error.
    pub fn check(
        self,
        instance: &Instance,
        command: &str,
    ) -> Result<CommandOutput, RemoteCommandError> {
        if self.exit_code == 0 {
            Ok(self)
        } else {
            Err(RemoteCommandError::NonZeroExit {
                instance: instance.name.clone(),
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteCommandError {
    #[error("failed to reach instance {instance}")]
    Connect {
        instance: String,
        #[source]
        err: anyhow::Error,
    },
    #[error(
        "command {command:?} on {instance} exited with status {exit_code}: \
         {stderr}"
    )]
    NonZeroExit { instance: String, command: String, exit_code: i32, stderr: String },
    #[error("command {command:?} on {instance} did not finish within {timeout:?}")]
    TimedOut { instance: String, command: String, timeout: Duration },
}

/// Runs shell commands on instances
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        instance: &Instance,
        command: &str,
    ) -> Result<CommandOutput, RemoteCommandError>;
}

/// Runs `command` on `instance` and fails unless it exits successfully.
pub async fn execute_checked(
    executor: &dyn RemoteExecutor,
    instance: &Instance,
    command: &str,
) -> Result<CommandOutput, RemoteCommandError> {
    executor.execute(instance, command).await?.check(instance, command)
}

/// Quotes `s` for use as one word in a POSIX shell command.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[derive(Debug, Error)]
pub enum ManagerApiError {
    #[error("cluster manager is unreachable")]
    Unreachable(#[source] anyhow::Error),
    #[error("cluster manager returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected response from cluster manager")]
    Parse(#[source] anyhow::Error),
}

impl ManagerApiError {
    /// Whether asking again later could plausibly give a different answer
    pub fn is_transient(&self) -> bool {
        match self {
            ManagerApiError::Unreachable(_) => true,
            ManagerApiError::Api { status, .. } => *status >= 500,
            ManagerApiError::Parse(_) => false,
        }
    }
}

/// State of an asynchronous request submitted to the cluster manager
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RequestStatus {
    Pending,
    InProgress { percent_complete: Option<u8> },
    Completed,
    Failed { message: String },
    Aborted,
}

/// Whether one host is still handing off its work
#[derive(
    Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DrainState {
    /// still serving, or still moving its data elsewhere
    Draining,
    /// safe to remove
    Drained,
    /// the manager could not say
    Unknown,
}

/// The management service of one cluster
#[async_trait]
pub trait ManagerClient: Send + Sync {
    /// Succeeds once the service is accepting requests.
    async fn ping(&self) -> Result<(), ManagerApiError>;

    /// Names of the hosts that have registered with the service
    async fn registered_hosts(&self) -> Result<BTreeSet<String>, ManagerApiError>;

    async fn request_status(
        &self,
        request_id: &str,
    ) -> Result<RequestStatus, ManagerApiError>;

    /// Drain state of each of `hosts`
    ///
    /// Hosts the service does not know about may be left out.
    async fn drain_status(
        &self,
        hosts: &[String],
    ) -> Result<BTreeMap<String, DrainState>, ManagerApiError>;

    async fn unregister_host(&self, host: &str) -> Result<(), ManagerApiError>;
}

/// Wait until the cluster manager accepts requests.
pub async fn wait_for_manager(
    log: &Logger,
    client: &dyn ManagerClient,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), poll::Error<ManagerApiError>> {
    wait_for_condition(
        || async {
            match client.ping().await {
                Ok(()) => Ok(()),
                Err(error) if error.is_transient() => {
                    debug!(log, "cluster manager not ready"; "error" => %error);
                    Err(CondCheckError::Pending(error.to_string()))
                }
                Err(error) => Err(CondCheckError::Failed(error)),
            }
        },
        &poll_interval,
        &timeout,
    )
    .await?;
    info!(log, "cluster manager is up");
    Ok(())
}

/// Wait until every host in `expected` has registered with the cluster
/// manager.
pub async fn wait_for_hosts_registered(
    log: &Logger,
    client: &dyn ManagerClient,
    expected: &BTreeSet<String>,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), poll::Error<ManagerApiError>> {
    wait_for_condition(
        || async {
            let registered = match client.registered_hosts().await {
                Ok(registered) => registered,
                Err(error) if error.is_transient() => {
                    return Err(CondCheckError::Pending(error.to_string()));
                }
                Err(error) => return Err(CondCheckError::Failed(error)),
            };
            let missing: Vec<&str> = expected
                .difference(&registered)
                .map(|h| h.as_str())
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                debug!(log, "waiting for hosts to register";
                    "missing" => missing.len(),
                    "expected" => expected.len(),
                );
                Err(CondCheckError::Pending(format!(
                    "{} of {} hosts not registered: {}",
                    missing.len(),
                    expected.len(),
                    missing.join(", ")
                )))
            }
        },
        &poll_interval,
        &timeout,
    )
    .await?;
    info!(log, "all hosts registered"; "count" => expected.len());
    Ok(())
}

#[derive(Debug, Error)]
pub enum RequestWaitError {
    #[error(transparent)]
    Api(#[from] ManagerApiError),
    #[error("request {request_id} failed: {message}")]
    Failed { request_id: String, message: String },
    #[error("request {request_id} was aborted")]
    Aborted { request_id: String },
}

/// Wait for an asynchronous cluster manager request to finish.
///
/// A request that fails or is aborted ends the wait immediately.
pub async fn wait_for_request(
    log: &Logger,
    client: &dyn ManagerClient,
    request_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), poll::Error<RequestWaitError>> {
    wait_for_condition(
        || async {
            let status = match client.request_status(request_id).await {
                Ok(status) => status,
                Err(error) if error.is_transient() => {
                    return Err(CondCheckError::Pending(error.to_string()));
                }
                Err(error) => {
                    return Err(CondCheckError::Failed(error.into()));
                }
            };
            match status {
                RequestStatus::Completed => Ok(()),
                RequestStatus::Failed { message } => {
                    Err(CondCheckError::Failed(RequestWaitError::Failed {
                        request_id: request_id.to_string(),
                        message,
                    }))
                }
                RequestStatus::Aborted => {
                    Err(CondCheckError::Failed(RequestWaitError::Aborted {
                        request_id: request_id.to_string(),
                    }))
                }
                RequestStatus::Pending => {
                    Err(CondCheckError::Pending(String::from("pending")))
                }
                RequestStatus::InProgress { percent_complete } => {
                    let state = match percent_complete {
                        Some(p) => format!("{p}% complete"),
                        None => String::from("in progress"),
                    };
                    Err(CondCheckError::Pending(state))
                }
            }
        },
        &poll_interval,
        &timeout,
    )
    .await?;
    info!(log, "cluster manager request completed"; "request_id" => request_id);
    Ok(())
}

/// Where the exclude-list decommission protocol keeps its files
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExcludeListSpec {
    /// Node groups whose instances run the cluster's controller services
    pub controller_groups: Vec<String>,
    /// File on each controller naming the hosts that must stop serving
    pub exclude_file: String,
    /// File on each controller naming the hosts allowed to serve, if the
    /// product uses one
    pub include_file: Option<String>,
    /// Command run on each controller after either file changes
    pub refresh_command: String,
}

/// A [`DecommissionBackend`] for products that decommission hosts by listing
/// them in an exclude file on their controllers
///
/// Excluded hosts are drained by the product itself; the cluster manager
/// reports drain progress and forgets the hosts once they are removed.
pub struct ExcludeListBackend {
    log: Logger,
    spec: ExcludeListSpec,
    executor: Arc<dyn RemoteExecutor>,
    manager: Arc<dyn ManagerClient>,
}

impl ExcludeListBackend {
    pub fn new(
        log: &Logger,
        spec: ExcludeListSpec,
        executor: Arc<dyn RemoteExecutor>,
        manager: Arc<dyn ManagerClient>,
    ) -> ExcludeListBackend {
        ExcludeListBackend {
            log: log.new(o!("component" => "ExcludeListBackend")),
            spec,
            executor,
            manager,
        }
    }

    /// Ids of the node groups that host controllers
    fn controller_groups(&self, members: &ClusterMembers) -> BTreeSet<Uuid> {
        members
            .node_groups
            .iter()
            .filter(|g| self.spec.controller_groups.contains(&g.name))
            .map(|g| g.id())
            .collect()
    }

    fn controllers<'a>(
        &self,
        members: &'a ClusterMembers,
        removed: &[&Instance],
    ) -> Vec<&'a Instance> {
        let controller_groups = self.controller_groups(members);
        members
            .instances
            .iter()
            .filter(|i| controller_groups.contains(&i.node_group_id()))
            .filter(|i| !removed.iter().any(|r| r.id == i.id))
            .collect()
    }

    /// Runs `command` and then the refresh command on every controller.
    async fn on_controllers(
        &self,
        controllers: &[&Instance],
        command: &str,
    ) -> anyhow::Result<()> {
        if controllers.is_empty() {
            anyhow::bail!(
                "no controller instances found in node groups {:?}",
                self.spec.controller_groups
            );
        }
        for controller in controllers {
            execute_checked(&*self.executor, controller, command).await?;
            execute_checked(
                &*self.executor,
                controller,
                &self.spec.refresh_command,
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DecommissionBackend for ExcludeListBackend {
    async fn mark_excluded(
        &self,
        members: &ClusterMembers,
        target: &Instance,
    ) -> anyhow::Result<()> {
        let host = shell_quote(&target.name);
        let file = shell_quote(&self.spec.exclude_file);
        let command =
            format!("grep -qxF {host} {file} || echo {host} >> {file}");
        let controllers = self.controllers(members, &[target]);
        self.on_controllers(&controllers, &command)
            .await
            .with_context(|| format!("excluding {}", target.name))?;
        info!(self.log, "excluded host"; "host" => &target.name);
        Ok(())
    }

    async fn drain_status(
        &self,
        _members: &ClusterMembers,
        targets: &[Instance],
    ) -> anyhow::Result<DrainReport> {
        let hosts: Vec<String> = targets
            .iter()
            .map(|t| t.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let states = match self.manager.drain_status(&hosts).await {
            Ok(states) => states,
            Err(error) if error.is_transient() => {
                warn!(self.log, "failed to read drain status";
                    "error" => format!("{:#}", anyhow::Error::from(error)),
                );
                BTreeMap::new()
            }
            Err(error) => {
                return Err(error).context("reading drain status");
            }
        };
        Ok(DrainReport::from_host_states(targets, &states))
    }

    async fn finalize_membership(
        &self,
        members: &ClusterMembers,
        survivors: &[Instance],
        removed: &[Instance],
    ) -> anyhow::Result<()> {
        // Removed hosts are gone from the include list, so the exclusion
        // list has nothing left to do.
        let mut command =
            format!(": > {}", shell_quote(&self.spec.exclude_file));
        if let Some(include_file) = &self.spec.include_file {
            let controller_groups = self.controller_groups(members);
            let hosts: Vec<String> = survivors
                .iter()
                .filter(|s| !controller_groups.contains(&s.node_group_id()))
                .map(|s| shell_quote(&s.name))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let include_file = shell_quote(include_file);
            if hosts.is_empty() {
                command.push_str(&format!(" && : > {include_file}"));
            } else {
                command.push_str(&format!(
                    " && printf '%s\\n' {} > {include_file}",
                    hosts.join(" "),
                ));
            }
        }
        let removed_refs: Vec<&Instance> = removed.iter().collect();
        let controllers = self.controllers(members, &removed_refs);
        self.on_controllers(&controllers, &command)
            .await
            .context("rewriting membership files")?;
        info!(self.log, "finalized membership";
            "survivors" => survivors.len(),
            "removed" => removed.len(),
        );
        Ok(())
    }

    async fn unregister(
        &self,
        _members: &ClusterMembers,
        target: &Instance,
    ) -> anyhow::Result<()> {
        match self.manager.unregister_host(&target.name).await {
            Ok(()) => (),
            // Already gone.
            Err(ManagerApiError::Api { status: 404, .. }) => {
                debug!(self.log, "host was not registered"; "host" => &target.name);
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("unregistering {}", target.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    //! Scriptable fakes of the remote interfaces

    use super::*;
    use std::sync::Mutex;

    /// Records every command and answers from a table of canned results
    #[derive(Default)]
    pub struct FakeExecutor {
        pub commands: Mutex<Vec<(String, String)>>,
        /// instance name -> exit code for every command run there
        pub failures: Mutex<BTreeMap<String, i32>>,
    }

    #[async_trait]
    impl RemoteExecutor for FakeExecutor {
        async fn execute(
            &self,
            instance: &Instance,
            command: &str,
        ) -> Result<CommandOutput, RemoteCommandError> {
            self.commands
                .lock()
                .unwrap()
                .push((instance.name.clone(), command.to_string()));
            let exit_code = self
                .failures
                .lock()
                .unwrap()
                .get(&instance.name)
                .copied()
                .unwrap_or(0);
            Ok(CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: if exit_code == 0 {
                    String::new()
                } else {
                    String::from("permission denied")
                },
            })
        }
    }

    /// A cluster manager whose answers are driven by the test
    #[derive(Default)]
    pub struct FakeManager {
        pub up: Mutex<bool>,
        pub pings: Mutex<usize>,
        pub registered: Mutex<BTreeSet<String>>,
        pub requests: Mutex<BTreeMap<String, RequestStatus>>,
        /// hosts that are still draining; everything else is drained
        pub draining: Mutex<BTreeSet<String>>,
        pub unreachable_drain_checks: Mutex<usize>,
        pub unregistered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ManagerClient for FakeManager {
        async fn ping(&self) -> Result<(), ManagerApiError> {
            *self.pings.lock().unwrap() += 1;
            if *self.up.lock().unwrap() {
                Ok(())
            } else {
                Err(ManagerApiError::Unreachable(anyhow::anyhow!(
                    "connection refused"
                )))
            }
        }

        async fn registered_hosts(
            &self,
        ) -> Result<BTreeSet<String>, ManagerApiError> {
            Ok(self.registered.lock().unwrap().clone())
        }

        async fn request_status(
            &self,
            request_id: &str,
        ) -> Result<RequestStatus, ManagerApiError> {
            self.requests.lock().unwrap().get(request_id).cloned().ok_or_else(
                || ManagerApiError::Api {
                    status: 404,
                    message: format!("no request {request_id}"),
                },
            )
        }

        async fn drain_status(
            &self,
            hosts: &[String],
        ) -> Result<BTreeMap<String, DrainState>, ManagerApiError> {
            {
                let mut unreachable =
                    self.unreachable_drain_checks.lock().unwrap();
                if *unreachable > 0 {
                    *unreachable -= 1;
                    return Err(ManagerApiError::Unreachable(anyhow::anyhow!(
                        "connection reset"
                    )));
                }
            }
            let draining = self.draining.lock().unwrap();
            Ok(hosts
                .iter()
                .map(|h| {
                    let state = if draining.contains(h) {
                        DrainState::Draining
                    } else {
                        DrainState::Drained
                    };
                    (h.clone(), state)
                })
                .collect())
        }

        async fn unregister_host(
            &self,
            host: &str,
        ) -> Result<(), ManagerApiError> {
            self.unregistered.lock().unwrap().push(host.to_string());
            Ok(())
        }
    }
}
