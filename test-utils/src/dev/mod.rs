// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for development tools and the test suite.  These should
//! not be used in production code.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use provisioner_common::logging::log_drain_for_file;
use slog::o;
use slog::Drain;
use slog::Logger;
use std::fs::OpenOptions;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

static LOG_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Logger for one test, backed by a bunyan-formatted file
///
/// The file is left behind if the test fails (or never calls
/// [`LogContext::cleanup_successful`]) so that it can be inspected.
pub struct LogContext {
    pub log: Logger,
    log_path: Utf8PathBuf,
}

impl LogContext {
    fn new(test_name: &'static str) -> LogContext {
        let dir = Utf8PathBuf::try_from(std::env::temp_dir())
            .expect("temporary directory is not valid UTF-8");
        let log_path = dir.join(format!(
            "{}.{}.{}.log",
            test_name,
            std::process::id(),
            LOG_COUNTER.fetch_add(1, Ordering::SeqCst),
        ));

        let mut open_options = OpenOptions::new();
        open_options.write(true).create_new(true);
        let drain = log_drain_for_file(&open_options, &log_path, test_name)
            .expect("failed to create test log file");
        let drain = slog::LevelFilter(drain, slog::Level::Trace).fuse();
        let drain = std::sync::Mutex::new(drain).fuse();
        let log = Logger::root(drain, o!("test" => test_name));

        LogContext { log, log_path }
    }

    pub fn log_path(&self) -> &Utf8Path {
        &self.log_path
    }

    /// Removes the log file.  Call this at the end of a test that passed.
    pub fn cleanup_successful(self) {
        // Nothing useful to do if this fails; the file is merely left behind.
        let _ = std::fs::remove_file(&self.log_path);
    }
}

/// Set up a [`LogContext`] appropriate for a test named `test_name`
pub fn test_setup_log(test_name: &'static str) -> LogContext {
    LogContext::new(test_name)
}
