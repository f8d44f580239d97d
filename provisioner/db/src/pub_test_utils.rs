// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test support code that can be enabled by dependencies via this crate's
//! `testing` feature.
//!
//! This feature should only be enabled under `dev-dependencies` to avoid this
//! test support code leaking into release binaries.

use crate::config::Config as DbConfig;
use crate::DataStore;
use camino_tempfile::Utf8TempDir;
use slog::Logger;
use std::sync::Arc;

/// A [`DataStore`] backed by a database file in a fresh temporary directory
///
/// SQLite's `:memory:` databases are private to one connection, so a pooled
/// test database has to live in a real file.
pub struct TestDatabase {
    dir: Utf8TempDir,
    datastore: Arc<DataStore>,
}

impl TestDatabase {
    pub async fn new(log: &Logger) -> TestDatabase {
        let dir = Utf8TempDir::new().expect("failed to create temp dir");
        let config = DbConfig::new(dir.path().join("provisioner.db"));
        let datastore = Arc::new(
            DataStore::new(log, &config)
                .await
                .expect("failed to create test datastore"),
        );
        TestDatabase { dir, datastore }
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    /// Configuration that opens this same database file
    pub fn config(&self) -> DbConfig {
        DbConfig::new(self.dir.path().join("provisioner.db"))
    }

    /// Opens a second, independent [`DataStore`] on the same file.
    pub async fn reopen(&self, log: &Logger) -> DataStore {
        DataStore::new(log, &self.config())
            .await
            .expect("failed to reopen test datastore")
    }

    /// Closes the database and removes its directory.
    pub async fn terminate(self) {
        let TestDatabase { dir, datastore } = self;
        drop(datastore);
        dir.close().expect("failed to remove test database directory");
    }
}
