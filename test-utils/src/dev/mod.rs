// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for the test suite.  These should not be used in
//! production code.

pub mod jmx;

use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::Drain;
use slog::Logger;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

static LOG_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A logger for one test, writing to its own file in the system temporary
/// directory.
///
/// The file is removed by [`LogContext::cleanup_successful`], so only the logs
/// of failed tests are left behind.
pub struct LogContext {
    pub log: Logger,
    log_path: Utf8PathBuf,
}

impl LogContext {
    pub fn new(test_name: &str) -> LogContext {
        let dir = Utf8PathBuf::try_from(std::env::temp_dir())
            .expect("temporary directory is not valid UTF-8");
        let log_path = dir.join(format!(
            "{}.{}.{}.log",
            test_name,
            std::process::id(),
            LOG_FILE_COUNTER.fetch_add(1, Ordering::SeqCst),
        ));
        let file = std::fs::File::create(&log_path).unwrap_or_else(|err| {
            panic!("failed to create test log file {log_path}: {err}")
        });
        eprintln!("log file: {log_path}");

        let decorator = slog_term::PlainSyncDecorator::new(file);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let log =
            Logger::root(drain, slog::o!("test_name" => test_name.to_owned()));
        LogContext { log, log_path }
    }

    pub fn log_path(&self) -> &Utf8Path {
        &self.log_path
    }

    /// Removes the log file.  Call this at the very end of a test that passed.
    pub fn cleanup_successful(self) {
        let LogContext { log, log_path } = self;
        drop(log);
        if let Err(err) = std::fs::remove_file(&log_path) {
            eprintln!("failed to remove test log file {log_path}: {err}");
        }
    }
}

/// Set up a [`LogContext`] appropriate for a test named `test_name`.
pub fn test_setup_log(test_name: &str) -> LogContext {
    LogContext::new(test_name)
}
