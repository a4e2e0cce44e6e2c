// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Versioned, never-overwritten run artifacts.
//!
//! Each run gets its own directory under the results root:
//!
//! ```text
//! <root>/
//!     20240501-142233/
//!         results.csv
//!         metadata.json
//!         run.log
//!     20240501-142233-1/
//!     latest -> 20240501-142233-1
//! ```
//!
//! Creating the directory is what claims a run id, so two recorders started
//! in the same second (even in different processes) never share one.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use chrono::DateTime;
use chrono::Local;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use slog::o;
use slog::Drain;
use slog::Logger;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use thiserror::Error;

pub const RESULTS_FILE: &str = "results.csv";
pub const METADATA_FILE: &str = "metadata.json";
pub const LOG_FILE: &str = "run.log";
pub const LATEST_LINK: &str = "latest";

/// Suffixes tried after the bare timestamp before giving up.
const MAX_RUN_ID_SUFFIX: u32 = 1000;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("writing {path}")]
    Csv {
        path: Utf8PathBuf,
        #[source]
        err: csv::Error,
    },
    #[error("writing {path}")]
    Json {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },
    #[error("row has {got} fields but the header has {expected}")]
    RowWidth { expected: usize, got: usize },
    #[error("no free run id for {0} under {1}")]
    NoFreeRunId(String, Utf8PathBuf),
}

/// What a run was asked to do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub experiment: String,
    /// The fixed CSV header for this experiment.
    pub columns: Vec<String>,
    /// Topology and experiment knobs.
    pub values: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Interrupted,
}

/// How a run ended, and whatever aggregate fields it produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// The contents of `metadata.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub parameters: RunParameters,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub rows: usize,
    pub summary: RunSummary,
}

/// A run in progress.  Rows are kept in memory until [`RunRecorder::finalize`].
pub struct RunHandle {
    run_id: String,
    dir: Utf8PathBuf,
    parameters: RunParameters,
    started: DateTime<Local>,
    rows: Vec<Vec<String>>,
    log_file: std::fs::File,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// A logger that writes everything logged through `parent` and also
    /// copies it into this run's `run.log`.
    pub fn logger(&self, parent: &Logger) -> Result<Logger, RecorderError> {
        let file = self.log_file.try_clone()?;
        let decorator = slog_term::PlainSyncDecorator::new(file);
        let transcript = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog::Duplicate::new(parent.clone(), transcript).fuse();
        Ok(Logger::root(drain, o!("run_id" => self.run_id.clone())))
    }
}

pub struct RunRecorder {
    log: Logger,
    root: Utf8PathBuf,
}

impl RunRecorder {
    pub fn new(log: &Logger, root: &Utf8Path) -> RunRecorder {
        RunRecorder {
            log: log.new(o!("component" => "RunRecorder")),
            root: root.to_owned(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn begin_run(
        &self,
        parameters: RunParameters,
    ) -> Result<RunHandle, RecorderError> {
        self.begin_run_at(parameters, Local::now())
    }

    pub(crate) fn begin_run_at(
        &self,
        parameters: RunParameters,
        started: DateTime<Local>,
    ) -> Result<RunHandle, RecorderError> {
        fs_err::create_dir_all(&self.root)?;
        let base = started.format("%Y%m%d-%H%M%S").to_string();
        let (run_id, dir) = self.claim_run_dir(&base)?;
        let log_file = fs_err::File::create(dir.join(LOG_FILE))?.into_parts().0;
        info!(
            self.log,
            "run started";
            "run_id" => &run_id,
            "experiment" => &parameters.experiment,
            "dir" => %dir,
        );
        Ok(RunHandle { run_id, dir, parameters, started, rows: Vec::new(), log_file })
    }

    fn claim_run_dir(
        &self,
        base: &str,
    ) -> Result<(String, Utf8PathBuf), RecorderError> {
        for suffix in 0..=MAX_RUN_ID_SUFFIX {
            let run_id = if suffix == 0 {
                base.to_owned()
            } else {
                format!("{base}-{suffix}")
            };
            let dir = self.root.join(&run_id);
            match fs_err::create_dir(&dir) {
                Ok(()) => return Ok((run_id, dir)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(RecorderError::NoFreeRunId(base.to_owned(), self.root.clone()))
    }

    pub fn append_row(
        &self,
        handle: &mut RunHandle,
        row: Vec<String>,
    ) -> Result<(), RecorderError> {
        let expected = handle.parameters.columns.len();
        if row.len() != expected {
            return Err(RecorderError::RowWidth { expected, got: row.len() });
        }
        handle.rows.push(row);
        Ok(())
    }

    /// Writes the run's artifacts and points `latest` at it.
    pub fn finalize(
        &self,
        handle: RunHandle,
        summary: RunSummary,
    ) -> Result<RunMetadata, RecorderError> {
        let RunHandle { run_id, dir, parameters, started, rows, log_file } =
            handle;
        drop(log_file);

        let results_path = dir.join(RESULTS_FILE);
        let csv_err =
            |err| RecorderError::Csv { path: results_path.clone(), err };
        let mut writer = csv::Writer::from_path(&results_path).map_err(csv_err)?;
        writer.write_record(&parameters.columns).map_err(csv_err)?;
        for row in &rows {
            writer.write_record(row).map_err(csv_err)?;
        }
        writer.flush()?;

        let metadata = RunMetadata {
            run_id: run_id.clone(),
            parameters,
            started,
            finished: Local::now(),
            rows: rows.len(),
            summary,
        };
        let metadata_path = dir.join(METADATA_FILE);
        let file = fs_err::File::create(&metadata_path)?;
        serde_json::to_writer_pretty(file, &metadata).map_err(|err| {
            RecorderError::Json { path: metadata_path.clone(), err }
        })?;

        self.point_latest_at(&run_id)?;
        info!(
            self.log,
            "run finalized";
            "run_id" => &run_id,
            "status" => ?metadata.summary.status,
            "rows" => metadata.rows,
        );
        Ok(metadata)
    }

    /// Replaces the `latest` link in one step: a fresh link is made under a
    /// temporary name and renamed over the old one.
    fn point_latest_at(&self, run_id: &str) -> Result<(), RecorderError> {
        let tmp = self.root.join(format!(".{LATEST_LINK}.{run_id}.tmp"));
        match fs_err::remove_file(&tmp) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs_err::os::unix::fs::symlink(run_id, &tmp)?;
        fs_err::rename(&tmp, self.root.join(LATEST_LINK))?;
        Ok(())
    }

    /// Every finalized run under the root, oldest first.
    pub fn list_runs(&self) -> Result<Vec<RunMetadata>, RecorderError> {
        let mut runs = Vec::new();
        let entries = match fs_err::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(runs),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_name() == LATEST_LINK || !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(dir) = Utf8PathBuf::try_from(entry.path()) else {
                continue;
            };
            let metadata_path = dir.join(METADATA_FILE);
            let contents = match fs_err::read_to_string(&metadata_path) {
                Ok(contents) => contents,
                // Still running, or abandoned before finalizing.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let metadata: RunMetadata = serde_json::from_str(&contents)
                .map_err(|err| RecorderError::Json { path: metadata_path, err })?;
            runs.push(metadata);
        }
        runs.sort_by(|a, b| {
            a.started.cmp(&b.started).then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }
}
