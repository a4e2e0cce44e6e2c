// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A long-lived telemetry sampler, run as its own process.
//!
//! `monitor start` spawns `dfs-harness monitor run` in a new process group
//! and records its pid in a file under the results root.  `monitor stop`
//! signals that pid and removes the file.  The sampler itself appends one
//! CSV row per sample until it is told to shut down.

use crate::shutdown::ShutdownSignal;
use crate::telemetry::Metric;
use crate::telemetry::SampleSource;
use crate::telemetry::TelemetrySample;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::info;
use slog::warn;
use slog::Logger;
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("a monitor is already running (pid {0})")]
    AlreadyRunning(i32),
    #[error("no monitor is running")]
    NotRunning,
    #[error("pid file {path} does not contain a pid: {contents:?}")]
    BadPidFile { path: Utf8PathBuf, contents: String },
    #[error("failed to start monitor")]
    Spawn(#[source] std::io::Error),
    #[error("monitor (pid {0}) did not exit")]
    StillRunning(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("writing samples")]
    Csv(#[from] csv::Error),
}

/// Returns whether the given process is currently running.
pub fn process_running(pid: libc::pid_t) -> bool {
    // Signal 0 only checks that the process exists and may be signalled.
    let rv = unsafe { libc::kill(pid, 0) };
    rv == 0
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn signal(pid: i32, signal: libc::c_int) -> Result<(), std::io::Error> {
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn read_pid_file(path: &Utf8Path) -> Result<Option<i32>, MonitorError> {
    let contents = match fs_err::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    contents.trim().parse().map(Some).map_err(|_| MonitorError::BadPidFile {
        path: path.to_owned(),
        contents,
    })
}

fn remove_pid_file(path: &Utf8Path) -> Result<(), MonitorError> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Starts `program args...` as a detached monitor process and records its
/// pid in `pid_file`.
pub fn start(
    log: &Logger,
    pid_file: &Utf8Path,
    program: &Utf8Path,
    args: &[String],
) -> Result<i32, MonitorError> {
    if let Some(pid) = read_pid_file(pid_file)? {
        if process_running(pid) {
            return Err(MonitorError::AlreadyRunning(pid));
        }
        warn!(log, "removing stale monitor pid file"; "pid" => pid);
        remove_pid_file(pid_file)?;
    }
    if let Some(parent) = pid_file.parent() {
        fs_err::create_dir_all(parent)?;
    }

    let child = std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        // Keep the monitor out of the operator's terminal process group, so
        // ^C in that terminal doesn't reach it.
        .process_group(0)
        .spawn()
        .map_err(MonitorError::Spawn)?;
    let pid = i32::try_from(child.id()).map_err(|_| {
        MonitorError::Spawn(std::io::Error::other("pid out of range"))
    })?;
    fs_err::write(pid_file, format!("{pid}\n"))?;
    info!(log, "monitor started"; "pid" => pid, "pid_file" => %pid_file);
    Ok(pid)
}

/// How [`stop`] ended the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// It exited after SIGTERM.
    Terminated(i32),
    /// It ignored SIGTERM for `wait` and was killed.
    Killed(i32),
    /// The pid file named a process that was already gone.
    Stale(i32),
}

/// Stops the monitor named by `pid_file`, waiting up to `wait` for it to
/// exit after SIGTERM before sending SIGKILL.
pub async fn stop(
    log: &Logger,
    pid_file: &Utf8Path,
    wait: Duration,
) -> Result<StopOutcome, MonitorError> {
    let pid = read_pid_file(pid_file)?.ok_or(MonitorError::NotRunning)?;
    if !process_running(pid) {
        warn!(log, "monitor already exited; removing stale pid file"; "pid" => pid);
        remove_pid_file(pid_file)?;
        return Ok(StopOutcome::Stale(pid));
    }

    info!(log, "stopping monitor"; "pid" => pid);
    signal(pid, libc::SIGTERM)?;
    let deadline = Instant::now() + wait;
    let outcome = loop {
        if !process_running(pid) {
            break StopOutcome::Terminated(pid);
        }
        if Instant::now() >= deadline {
            warn!(log, "monitor ignored SIGTERM; killing it"; "pid" => pid);
            signal(pid, libc::SIGKILL)?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            if process_running(pid) {
                return Err(MonitorError::StillRunning(pid));
            }
            break StopOutcome::Killed(pid);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    remove_pid_file(pid_file)?;
    Ok(outcome)
}

/// Stops a monitor left running, if there is one.  Used during experiment
/// cleanup, where a missing monitor is the normal case.
pub async fn stop_if_running(
    log: &Logger,
    pid_file: &Utf8Path,
    wait: Duration,
) -> Result<Option<StopOutcome>, MonitorError> {
    match stop(log, pid_file, wait).await {
        Ok(outcome) => Ok(Some(outcome)),
        Err(MonitorError::NotRunning) => Ok(None),
        Err(err) => Err(err),
    }
}

/// The CSV header the monitor writes.
pub fn sample_header() -> Vec<String> {
    let mut header = vec![String::from("timestamp")];
    header.extend(Metric::ALL.iter().map(|metric| metric.to_string()));
    header.push(String::from("unavailable"));
    header
}

/// One CSV record for `sample`, in [`sample_header`] order.  Unavailable
/// metrics are written as zero and also listed in the last column.
pub fn sample_record(sample: &TelemetrySample) -> Vec<String> {
    let mut record = vec![sample.timestamp.to_rfc3339()];
    record.extend(
        Metric::ALL.iter().map(|metric| sample.get(*metric).to_string()),
    );
    record.push(
        sample
            .unavailable_metrics()
            .iter()
            .map(|metric| metric.as_str())
            .collect::<Vec<_>>()
            .join(";"),
    );
    record
}

/// Samples `source` every `interval`, appending to `csv_path`, until
/// shutdown is requested.  Returns how many rows were written.
pub async fn run(
    log: &Logger,
    source: &dyn SampleSource,
    csv_path: &Utf8Path,
    interval: Duration,
    shutdown: &ShutdownSignal,
) -> Result<u64, MonitorError> {
    let is_new = !csv_path.exists();
    let file = fs_err::OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;
    let mut writer =
        csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if is_new {
        writer.write_record(sample_header())?;
        writer.flush()?;
    }

    info!(
        log,
        "monitor sampling";
        "source" => source.describe(),
        "csv" => %csv_path,
        "interval" => ?interval,
    );
    let mut rows = 0;
    while !shutdown.is_requested() {
        match source.sample().await {
            Ok(sample) => {
                writer.write_record(sample_record(&sample))?;
                writer.flush()?;
                rows += 1;
            }
            Err(err) => {
                warn!(log, "monitor sample failed"; "error" => %err);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.requested() => {}
        }
    }
    info!(log, "monitor stopping"; "rows" => rows);
    Ok(rows)
}
