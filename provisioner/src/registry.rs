// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-product behavior, selected by a cluster's plugin version

use crate::decommission::DecommissionBackend;
use provisioner_common::api::external::Error;
use provisioner_common::api::external::ResourceType;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// What a plugin can do for the clusters it manages
#[derive(Clone)]
pub struct PluginCapabilities {
    pub decommission: Arc<dyn DecommissionBackend>,
}

impl fmt::Debug for PluginCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCapabilities").finish_non_exhaustive()
    }
}

/// Maps plugin version keys to their capabilities
#[derive(Clone, Debug, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, PluginCapabilities>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    pub fn register(
        &mut self,
        key: impl Into<String>,
        capabilities: PluginCapabilities,
    ) -> Result<(), Error> {
        let key = key.into();
        if self.plugins.contains_key(&key) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Plugin,
                object_name: key,
            });
        }
        self.plugins.insert(key, capabilities);
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Result<&PluginCapabilities, Error> {
        self.plugins.get(key).ok_or_else(|| {
            Error::invalid_request(&format!("no plugin registered for {key:?}"))
        })
    }

    /// Registered keys, in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decommission::test_helpers::FakeBackend;
    use assert_matches::assert_matches;

    fn capabilities() -> PluginCapabilities {
        PluginCapabilities { decommission: Arc::new(FakeBackend::default()) }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = PluginRegistry::new();
        registry.register("hdfs-3.3", capabilities()).unwrap();
        registry.register("cassandra-4.1", capabilities()).unwrap();
        assert_eq!(
            registry.keys().collect::<Vec<_>>(),
            vec!["cassandra-4.1", "hdfs-3.3"]
        );
        registry.lookup("hdfs-3.3").unwrap();

        assert_matches!(
            registry.register("hdfs-3.3", capabilities()),
            Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Plugin,
                object_name
            }) if object_name == "hdfs-3.3"
        );
        assert_matches!(
            registry.lookup("hdfs-2.7"),
            Err(Error::InvalidRequest { message }) => {
                assert_eq!(message, "no plugin registered for \"hdfs-2.7\"");
            }
        );
    }
}
