// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Database connection pooling

use crate::config::Config as DbConfig;
use diesel::connection::SimpleConnection;
use diesel::r2d2::ConnectionManager;
use diesel::r2d2::CustomizeConnection;
use diesel::r2d2::PooledConnection;
use diesel::SqliteConnection;
use slog::debug;
use slog::o;
use std::time::Duration;

pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Applied to every connection as it is handed out by the pool
///
/// SQLite settings such as foreign-key enforcement are per connection, so
/// they cannot be set once at open time.
#[derive(Debug)]
struct ConnectionCustomizer {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error>
    for ConnectionCustomizer
{
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<(), diesel::r2d2::Error> {
        // The busy timeout comes first so that the remaining statements wait
        // out a concurrent writer instead of failing.
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; \
             PRAGMA foreign_keys = ON; \
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout.as_millis()
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Wrapper around a database connection pool.
///
/// Expected to be used as the primary interface to the database.
pub struct Pool {
    pool: diesel::r2d2::Pool<ConnectionManager<SqliteConnection>>,
}

impl Pool {
    /// Opens (creating if necessary) the database file named by `db_config`.
    ///
    /// This blocks while the initial connections are established.
    pub fn new(
        log: &slog::Logger,
        db_config: &DbConfig,
    ) -> Result<Self, diesel::r2d2::PoolError> {
        let log = log.new(o!("component" => "DbPool"));
        debug!(log, "creating database pool";
            "path" => %db_config.path,
            "pool_size" => db_config.pool_size,
        );
        let manager =
            ConnectionManager::<SqliteConnection>::new(db_config.path.as_str());
        let pool = diesel::r2d2::Pool::builder()
            .max_size(db_config.pool_size.max(1))
            .connection_customizer(Box::new(ConnectionCustomizer {
                busy_timeout: db_config.busy_timeout(),
            }))
            .build(manager)?;
        Ok(Pool { pool })
    }

    /// Returns a connection from the pool, waiting for one to free up if
    /// necessary.
    pub fn claim(&self) -> Result<DbConnection, diesel::r2d2::PoolError> {
        self.pool.get()
    }
}

impl Clone for Pool {
    fn clone(&self) -> Self {
        Pool { pool: self.pool.clone() }
    }
}
