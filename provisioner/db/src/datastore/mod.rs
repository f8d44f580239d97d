// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary control plane interface for database read and write operations

// TODO-scalability Every operation claims a pooled connection on a blocking
// thread; callers that issue many reads in a row would benefit from a way to
// reuse one connection.

use crate::config::Config as DbConfig;
use crate::error::public_error_from_diesel;
use crate::error::ErrorHandler;
use crate::error::TransactionError;
use crate::pool::Pool;
use diesel::connection::SimpleConnection;
use diesel::Connection;
use diesel::SqliteConnection;
use provisioner_common::api::external::Error;
use slog::info;
use slog::o;
use slog::Logger;

mod cluster;
mod instance;
mod node_group;
mod provision;

/// The schema applied every time a database is opened
const DBINIT: &str = include_str!("../../schema/dbinit.sql");

pub struct DataStore {
    log: Logger,
    pool: Pool,
}

impl DataStore {
    /// Opens the database named by `config`, creating and initializing it if
    /// necessary.
    pub async fn new(log: &Logger, config: &DbConfig) -> Result<Self, Error> {
        let log = log.new(o!("component" => "datastore"));
        let config = config.clone();
        let pool_log = log.clone();
        let pool = tokio::task::spawn_blocking(move || {
            let pool = Pool::new(&pool_log, &config).map_err(|e| {
                Error::unavail(&format!(
                    "failed to open database {:?}: {}",
                    config.path, e
                ))
            })?;
            let mut conn = pool.claim().map_err(pool_error)?;
            // The journal mode is a property of the database file rather than
            // of a connection, so it only needs to be set once.
            conn.batch_execute("PRAGMA journal_mode = WAL;")
                .and_then(|()| conn.batch_execute(DBINIT))
                .map_err(|e| public_error_from_diesel(e, ErrorHandler::Server))?;
            info!(pool_log, "database ready"; "path" => %config.path);
            Ok::<_, Error>(pool)
        })
        .await
        .map_err(join_error)??;

        Ok(DataStore { log, pool })
    }

    /// Runs `f` in a write transaction (`BEGIN IMMEDIATE`) on a pooled
    /// connection.
    ///
    /// Taking the write lock up front means two concurrent callers can never
    /// both read a row and then race to update it: the second one waits for
    /// the first to commit before it reads anything.
    async fn transaction<T, F>(&self, f: F) -> Result<T, TransactionError<Error>>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, TransactionError<Error>>
            + Send
            + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.claim().map_err(pool_error)?;
            let conn: &mut SqliteConnection = &mut conn;
            conn.immediate_transaction(f)
        })
        .await
        .map_err(join_error)?
    }

    /// Runs `f` in a read-only (deferred) transaction on a pooled connection.
    async fn read<T, F>(&self, f: F) -> Result<T, TransactionError<Error>>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, TransactionError<Error>>
            + Send
            + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.claim().map_err(pool_error)?;
            let conn: &mut SqliteConnection = &mut conn;
            conn.transaction(f)
        })
        .await
        .map_err(join_error)?
    }
}

fn pool_error(error: diesel::r2d2::PoolError) -> Error {
    Error::unavail(&format!("failed to access connection pool: {}", error))
}

fn join_error(error: tokio::task::JoinError) -> Error {
    Error::internal_error(&format!("database task failed: {}", error))
}
