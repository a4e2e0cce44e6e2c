// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around the cluster's administrative command line.

use crate::executor::BoxedExecutor;
use crate::executor::Host;
use crate::executor::RemoteCommandResult;
use crate::topology::quote;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::info;
use slog::warn;
use slog::Logger;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{operation} on {host} failed: {reason}")]
    Command {
        operation: &'static str,
        host: Host,
        exit_code: i32,
        reason: String,
    },
    #[error("could not find {0:?} in the cluster report")]
    Report(&'static str),
}

/// What `dfsadmin -report` says about the cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterReport {
    pub live_datanodes: u32,
    pub dead_datanodes: u32,
}

impl ClusterReport {
    /// Parses the `Live datanodes (N):` and `Dead datanodes (N):` lines of a
    /// report.  A report without a dead-node section has none.
    pub fn parse(report: &str) -> Result<ClusterReport, AdminError> {
        let live = count_after(report, "Live datanodes")
            .ok_or(AdminError::Report("Live datanodes"))?;
        let dead = count_after(report, "Dead datanodes").unwrap_or(0);
        Ok(ClusterReport { live_datanodes: live, dead_datanodes: dead })
    }
}

fn count_after(report: &str, heading: &str) -> Option<u32> {
    report.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(heading)?;
        let inner = rest.trim().strip_prefix('(')?;
        let (count, _) = inner.split_once(')')?;
        count.trim().parse().ok()
    })
}

/// Runs administrative commands on the control plane.
#[derive(Clone)]
pub struct AdminCli {
    log: Logger,
    executor: BoxedExecutor,
    home: Utf8PathBuf,
    control_plane: Host,
    timeout: Duration,
}

impl AdminCli {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        home: &Utf8Path,
        control_plane: Host,
        timeout: Duration,
    ) -> AdminCli {
        AdminCli {
            log: log.new(slog::o!("component" => "AdminCli")),
            executor,
            home: home.to_owned(),
            control_plane,
            timeout,
        }
    }

    pub fn control_plane(&self) -> &Host {
        &self.control_plane
    }

    fn hdfs(&self, args: &str) -> String {
        format!("{} {args}", quote(&self.home.join("bin").join("hdfs")))
    }

    fn sbin(&self, script: &str) -> String {
        quote(&self.home.join("sbin").join(script))
    }

    async fn run(
        &self,
        operation: &'static str,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteCommandResult, AdminError> {
        let result =
            self.executor.execute(&self.control_plane, command, timeout).await;
        if result.success() {
            Ok(result)
        } else {
            Err(AdminError::Command {
                operation,
                host: self.control_plane.clone(),
                exit_code: result.exit_code,
                reason: result.failure_reason(),
            })
        }
    }

    pub async fn report(&self) -> Result<ClusterReport, AdminError> {
        let result = self
            .run("report", &self.hdfs("dfsadmin -report"), self.timeout)
            .await?;
        ClusterReport::parse(&result.stdout)
    }

    /// Persists the namespace: enter safe mode, save, leave safe mode.  Safe
    /// mode is left even when the save fails.
    pub async fn checkpoint(&self) -> Result<(), AdminError> {
        info!(self.log, "checkpointing namespace");
        self.run(
            "safemode enter",
            &self.hdfs("dfsadmin -safemode enter"),
            self.timeout,
        )
        .await?;
        let saved = self
            .run(
                "saveNamespace",
                &self.hdfs("dfsadmin -saveNamespace"),
                self.timeout,
            )
            .await;
        let left = self
            .run(
                "safemode leave",
                &self.hdfs("dfsadmin -safemode leave"),
                self.timeout,
            )
            .await;
        saved?;
        left?;
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), AdminError> {
        let command = format!(
            "{} -mkdir -p {}",
            self.hdfs("dfs"),
            shell_words::quote(path)
        );
        self.run("mkdir", &command, self.timeout).await.map(|_| ())
    }

    pub async fn remove(&self, path: &str) -> Result<(), AdminError> {
        let command = format!(
            "{} -rm -r -f {}",
            self.hdfs("dfs"),
            shell_words::quote(path)
        );
        self.run("remove", &command, self.timeout).await.map(|_| ())
    }

    /// Asks a worker to reload its storage volumes from configuration.
    pub async fn reconfigure_datanode(
        &self,
        worker: &Host,
        ipc_port: u16,
    ) -> Result<(), AdminError> {
        let command = self.hdfs(&format!(
            "dfsadmin -reconfig datanode {}:{ipc_port} start",
            worker.address()
        ));
        self.run("reconfig datanode", &command, self.timeout).await.map(|_| ())
    }

    /// Reinitializes the metadata store, destroying the namespace.
    pub async fn format_namenode(&self) -> Result<(), AdminError> {
        warn!(self.log, "formatting namenode"; "host" => %self.control_plane);
        self.run(
            "format",
            &self.hdfs("namenode -format -force -nonInteractive"),
            self.timeout,
        )
        .await
        .map(|_| ())
    }

    pub async fn start_dfs(&self) -> Result<(), AdminError> {
        self.run("start-dfs", &self.sbin("start-dfs.sh"), self.timeout)
            .await
            .map(|_| ())
    }

    pub async fn stop_dfs(&self) -> Result<(), AdminError> {
        self.run("stop-dfs", &self.sbin("stop-dfs.sh"), self.timeout)
            .await
            .map(|_| ())
    }

    /// Runs a workload command to completion.  The result is returned as-is;
    /// a failed workload is data, not an error.
    pub async fn run_workload(
        &self,
        command: &str,
        timeout: Duration,
    ) -> RemoteCommandResult {
        info!(self.log, "submitting workload"; "command" => command);
        self.executor.execute(&self.control_plane, command, timeout).await
    }
}
