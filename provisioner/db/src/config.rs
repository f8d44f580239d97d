// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Database configuration (the `[database]` section of a provisioner
//! configuration file)

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

fn default_pool_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// SQLite database file, created if it does not exist
    pub path: Utf8PathBuf,
    /// maximum number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// how long a writer waits for another writer's transaction to finish
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Config {
    pub fn new(path: Utf8PathBuf) -> Config {
        Config {
            path,
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
