// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state used by provisioning operations

use crate::config::Config;
use crate::decommission::DecommissionError;
use crate::decommission::DecommissionState;
use crate::decommission::DecommissionSummary;
use crate::decommission::Decommissioner;
use crate::registry::PluginCapabilities;
use crate::registry::PluginRegistry;
use crate::step::StepRunner;
use provisioner_common::api::external::ClusterStatus;
use provisioner_common::api::external::Error;
use provisioner_db::DataStore;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a provisioning operation needs, passed explicitly
pub struct ServerContext {
    /// debug log
    pub log: Logger,
    /// provisioning state
    pub datastore: Arc<DataStore>,
    pub config: Config,
    /// per-product behavior
    pub registry: PluginRegistry,
}

impl ServerContext {
    /// Opens the database named in `config`.
    pub async fn new(
        log: &Logger,
        config: Config,
        registry: PluginRegistry,
    ) -> Result<ServerContext, Error> {
        let datastore = DataStore::new(log, &config.database).await?;
        Ok(Self::with_datastore(log, config, registry, Arc::new(datastore)))
    }

    pub fn with_datastore(
        log: &Logger,
        config: Config,
        registry: PluginRegistry,
        datastore: Arc<DataStore>,
    ) -> ServerContext {
        ServerContext {
            log: log.new(o!("component" => "ServerContext")),
            datastore,
            config,
            registry,
        }
    }

    pub fn step_runner(&self) -> StepRunner {
        StepRunner::new(
            &self.log,
            Arc::clone(&self.datastore),
            self.config.fanout.max_parallelism,
        )
    }

    pub fn decommissioner(
        &self,
        capabilities: &PluginCapabilities,
    ) -> Decommissioner {
        Decommissioner::new(
            &self.log,
            self.step_runner(),
            Arc::clone(&capabilities.decommission),
            self.config.decommission.poll_interval(),
            self.config.decommission.timeout(),
        )
    }

    /// Decommission `targets` from an active cluster
    ///
    /// The cluster is claimed by moving it from `active` to
    /// `decommissioning`, so this fails with a conflict if another
    /// structural operation is running.  It returns to `active` on success
    /// or if the request was rejected before anything changed, and is left
    /// in `error` otherwise.
    pub async fn decommission_instances(
        &self,
        cluster_id: Uuid,
        targets: &[Uuid],
    ) -> Result<DecommissionSummary, DecommissionError> {
        let log = self.log.new(o!("cluster_id" => cluster_id.to_string()));
        let cluster = self
            .datastore
            .cluster_fetch(cluster_id)
            .await
            .map_err(DecommissionError::Invalid)?;
        let capabilities = self
            .registry
            .lookup(&cluster.plugin_version)
            .map_err(DecommissionError::Invalid)?;

        self.datastore
            .cluster_transition_status(
                cluster_id,
                ClusterStatus::Active,
                ClusterStatus::Decommissioning,
            )
            .await
            .map_err(DecommissionError::Invalid)?;

        let result = self
            .decommissioner(capabilities)
            .decommission(cluster_id, targets)
            .await;
        match &result {
            Ok(_) => {
                self.datastore
                    .cluster_transition_status(
                        cluster_id,
                        ClusterStatus::Decommissioning,
                        ClusterStatus::Active,
                    )
                    .await
                    .map_err(|err| DecommissionError::Internal {
                        state: DecommissionState::Decommissioned,
                        err,
                    })?;
                info!(log, "cluster is active again");
            }
            Err(DecommissionError::Invalid(_)) => {
                if let Err(e) = self
                    .datastore
                    .cluster_transition_status(
                        cluster_id,
                        ClusterStatus::Decommissioning,
                        ClusterStatus::Active,
                    )
                    .await
                {
                    warn!(log, "failed to release cluster"; "error" => %e);
                }
            }
            Err(_) => (),
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DecommissionConfig;
    use crate::config::FanoutConfig;
    use crate::decommission::test_helpers::FakeBackend;
    use assert_matches::assert_matches;
    use provisioner_common::api::external::ResourceType;
    use provisioner_common::logging::ConfigLogging;
    use provisioner_common::logging::ConfigLoggingLevel;
    use provisioner_db::model::ClusterCreate;
    use provisioner_db::model::InstanceCreate;
    use provisioner_db::pub_test_utils::TestDatabase;
    use provisioner_test_utils::dev;

    #[tokio::test]
    async fn test_decommission_claims_cluster() {
        let logctx = dev::test_setup_log("test_decommission_claims_cluster");
        let db = TestDatabase::new(&logctx.log).await;
        let datastore = db.datastore();

        let backend = Arc::new(FakeBackend::default());
        let mut registry = PluginRegistry::new();
        registry
            .register(
                "kv-2.0",
                PluginCapabilities { decommission: backend.clone() },
            )
            .unwrap();
        let config = Config {
            log: ConfigLogging::StderrTerminal {
                level: ConfigLoggingLevel::Info,
            },
            database: db.config(),
            fanout: FanoutConfig { max_parallelism: 2 },
            decommission: DecommissionConfig {
                poll_interval_secs: 1,
                timeout_secs: 5,
            },
        };
        let context = ServerContext::with_datastore(
            &logctx.log,
            config,
            registry,
            Arc::clone(datastore),
        );

        let cluster = datastore
            .cluster_create(ClusterCreate {
                tenant_id: Uuid::new_v4(),
                name: String::from("kv"),
                plugin_version: String::from("kv-2.0"),
            })
            .await
            .unwrap();
        let group = datastore.node_group_create(cluster.id(), "data").await.unwrap();
        let mut ids = Vec::new();
        for name in ["kv-0", "kv-1", "kv-2"] {
            let instance = datastore
                .instance_create(
                    group.id(),
                    InstanceCreate { name: name.to_string(), management_ip: None },
                )
                .await
                .unwrap();
            ids.push(instance.id());
        }

        // Still being created: not ours to take.
        let error = context
            .decommission_instances(cluster.id(), &ids[..1])
            .await
            .unwrap_err();
        assert_matches!(error, DecommissionError::Invalid(Error::Conflict { .. }));

        datastore
            .cluster_update_status(cluster.id(), ClusterStatus::Active)
            .await
            .unwrap();

        // A bad target is rejected and the cluster released.
        let error = context
            .decommission_instances(cluster.id(), &[Uuid::new_v4()])
            .await
            .unwrap_err();
        assert_matches!(
            error,
            DecommissionError::Invalid(Error::ObjectNotFound {
                type_name: ResourceType::Instance,
                ..
            })
        );
        let fetched = datastore.cluster_fetch(cluster.id()).await.unwrap();
        assert_eq!(fetched.status(), ClusterStatus::Active);

        let summary = context
            .decommission_instances(cluster.id(), &ids[..1])
            .await
            .unwrap();
        assert_eq!(summary.removed, vec!["kv-0"]);
        let fetched = datastore.cluster_fetch(cluster.id()).await.unwrap();
        assert_eq!(fetched.status(), ClusterStatus::Active);
        assert_eq!(
            datastore.node_group_fetch(group.id()).await.unwrap().count,
            2
        );
        assert_eq!(*backend.excluded.lock().unwrap(), vec!["kv-0"]);

        // Unknown plugin version
        let other = datastore
            .cluster_create(ClusterCreate {
                tenant_id: Uuid::new_v4(),
                name: String::from("legacy"),
                plugin_version: String::from("kv-1.0"),
            })
            .await
            .unwrap();
        let error = context
            .decommission_instances(other.id(), &ids[1..])
            .await
            .unwrap_err();
        assert_matches!(error, DecommissionError::Invalid(Error::InvalidRequest { .. }));

        db.terminate().await;
        logctx.cleanup_successful();
    }
}
