// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Restarting the cluster from scratch on a new topology.
//!
//! A restart is one transactional phase:
//!
//! ```text
//! Stopped -> Cleaning -> Formatting -> Starting -> Verifying -> Running
//! ```
//!
//! and `Running -> Stopped` through [`ClusterController::stop`].  Any error
//! along the way leaves the controller [`LifecycleState::Failed`], from which
//! nothing further is attempted.  This is the only component that destroys
//! persisted cluster state.

use crate::admin::AdminCli;
use crate::executor::BoxedExecutor;
use crate::fanout::fan_out;
use crate::fanout::FanOutLimits;
use crate::shutdown::ShutdownSignal;
use crate::topology::quote;
use crate::topology::ApplyOutcome;
use crate::topology::ClusterLayout;
use crate::topology::Topology;
use serde::Serialize;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Cleaning,
    Formatting,
    Starting,
    Verifying,
    Running,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Cleaning => "cleaning",
            LifecycleState::Formatting => "formatting",
            LifecycleState::Starting => "starting",
            LifecycleState::Verifying => "verifying",
            LifecycleState::Running => "running",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Whether a restart may proceed on configuration that reached only some
/// nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartialPolicy {
    Refuse,
    /// The operator confirmed (`--accept-partial`).
    Accept,
}

/// How long to wait for workers to register after starting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cluster controller has failed; no further operations allowed")]
    Failed,
    #[error("cannot {operation} while {state}")]
    InvalidTransition { operation: &'static str, state: LifecycleState },
    #[error(
        "configuration did not reach every node ({}); refusing to restart",
        .failed.join(", ")
    )]
    ConfigurationIncomplete { failed: Vec<String> },
    #[error("{phase} failed on {}", .hosts.join(", "))]
    PhaseFailed { phase: &'static str, hosts: Vec<String> },
    #[error("{phase} failed")]
    Admin {
        phase: &'static str,
        #[source]
        err: crate::admin::AdminError,
    },
    #[error(
        "expected {expected} live workers, last observed {}",
        .observed.map_or_else(|| String::from("none"), |n| n.to_string())
    )]
    VerificationFailed { expected: u32, observed: Option<u32> },
    #[error("interrupted by shutdown request")]
    Interrupted,
}

pub struct ClusterController {
    log: Logger,
    executor: BoxedExecutor,
    admin: AdminCli,
    layout: ClusterLayout,
    limits: FanOutLimits,
    verify: VerifyPolicy,
    shutdown: ShutdownSignal,
    state: LifecycleState,
}

impl ClusterController {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        admin: AdminCli,
        layout: ClusterLayout,
        limits: FanOutLimits,
        verify: VerifyPolicy,
        shutdown: ShutdownSignal,
    ) -> ClusterController {
        ClusterController {
            log: log.new(o!("component" => "ClusterController")),
            executor,
            admin,
            layout,
            limits,
            verify,
            shutdown,
            state: LifecycleState::Stopped,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn admin(&self) -> &AdminCli {
        &self.admin
    }

    fn transition(&mut self, next: LifecycleState) {
        info!(
            self.log,
            "lifecycle transition";
            "from" => %self.state,
            "to" => %next,
        );
        self.state = next;
    }

    fn fail(&mut self, err: LifecycleError) -> LifecycleError {
        error!(
            self.log,
            "lifecycle failed";
            "state" => %self.state,
            "error" => %err,
        );
        self.state = LifecycleState::Failed;
        err
    }

    fn check_shutdown(&mut self) -> Result<(), LifecycleError> {
        if self.shutdown.is_requested() {
            Err(self.fail(LifecycleError::Interrupted))
        } else {
            Ok(())
        }
    }

    /// A shutdown request seen while nothing has been destroyed yet leaves
    /// the controller usable.
    fn interrupted_before_cleaning(&self) -> Result<(), LifecycleError> {
        if self.shutdown.is_requested() {
            warn!(
                self.log,
                "restart interrupted before cleaning";
                "state" => %self.state,
            );
            Err(LifecycleError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Daemons may be left over from an earlier invocation that this
    /// controller never saw, so they are stopped before any state is
    /// removed.  The stop script succeeds when nothing is running; a failure
    /// here is logged and the restart carries on.
    async fn stop_leftover_daemons(&mut self) {
        info!(self.log, "stopping any running daemons before cleaning");
        if let Err(err) = self.admin.stop_dfs().await {
            warn!(
                self.log,
                "stopping leftover daemons failed";
                "error" => %err,
            );
        }
    }

    /// Wipes the cluster and brings it up on `topology`.  Daemons are always
    /// stopped first, whether or not this controller started them.
    ///
    /// `configured` is what the preceding configuration push reported.  A
    /// push that reached no node is always refused; one that reached only
    /// some nodes is refused unless `policy` is [`PartialPolicy::Accept`].
    pub async fn restart(
        &mut self,
        topology: &Topology,
        configured: &ApplyOutcome,
        policy: PartialPolicy,
    ) -> Result<(), LifecycleError> {
        match self.state {
            LifecycleState::Failed => return Err(LifecycleError::Failed),
            LifecycleState::Stopped | LifecycleState::Running => {}
            state => {
                return Err(LifecycleError::InvalidTransition {
                    operation: "restart",
                    state,
                })
            }
        }

        match (configured, policy) {
            (ApplyOutcome::Success, _) => {}
            (ApplyOutcome::Partial { .. }, PartialPolicy::Accept) => {
                warn!(
                    self.log,
                    "restarting on partially distributed configuration";
                    "failed" => ?configured.failed_hosts(),
                );
            }
            (ApplyOutcome::Partial { .. } | ApplyOutcome::Failure { .. }, _) => {
                let failed = configured
                    .failed_hosts()
                    .iter()
                    .map(|host| host.to_string())
                    .collect::<Vec<_>>();
                // Nothing has been touched, so the controller stays usable.
                warn!(
                    self.log,
                    "refusing to restart on incomplete configuration";
                    "failed" => ?failed,
                );
                return Err(LifecycleError::ConfigurationIncomplete { failed });
            }
        }

        self.interrupted_before_cleaning()?;
        if self.state == LifecycleState::Running {
            self.stop().await?;
        } else {
            self.stop_leftover_daemons().await;
        }

        self.interrupted_before_cleaning()?;
        self.transition(LifecycleState::Cleaning);
        self.clean(topology).await?;

        self.check_shutdown()?;
        self.transition(LifecycleState::Formatting);
        if let Err(err) = self.admin.format_namenode().await {
            return Err(self.fail(LifecycleError::Admin { phase: "format", err }));
        }

        self.check_shutdown()?;
        self.transition(LifecycleState::Starting);
        if let Err(err) = self.admin.start_dfs().await {
            return Err(self.fail(LifecycleError::Admin { phase: "start", err }));
        }

        self.transition(LifecycleState::Verifying);
        let expected = u32::try_from(topology.workers().len()).unwrap_or(u32::MAX);
        self.verify(expected).await?;

        self.transition(LifecycleState::Running);
        Ok(())
    }

    /// Stops a running cluster.
    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            LifecycleState::Running => {}
            LifecycleState::Failed => return Err(LifecycleError::Failed),
            state => {
                return Err(LifecycleError::InvalidTransition {
                    operation: "stop",
                    state,
                })
            }
        }
        if let Err(err) = self.admin.stop_dfs().await {
            return Err(self.fail(LifecycleError::Admin { phase: "stop", err }));
        }
        self.transition(LifecycleState::Stopped);
        Ok(())
    }

    /// Removes every node's persisted state and recreates empty storage
    /// unit directories.
    async fn clean(&mut self, topology: &Topology) -> Result<(), LifecycleError> {
        let units = self.layout.unit_dirs(topology.storage_units_per_node());
        let recreate = units.iter().map(|dir| quote(dir)).collect::<Vec<_>>();
        let command = format!(
            "rm -rf {name} {data} && mkdir -p {units}",
            name = quote(&self.layout.name_dir),
            data = quote(&self.layout.data_root),
            units = recreate.join(" "),
        );
        let outcomes = fan_out(
            &self.executor,
            &topology.hosts(),
            self.limits,
            |_| command.clone(),
        )
        .await;
        if outcomes.all_succeeded() {
            return Ok(());
        }
        outcomes.log_failures(&self.log, "clean");
        let hosts = outcomes
            .failed_hosts()
            .iter()
            .map(|host| host.to_string())
            .collect();
        Err(self.fail(LifecycleError::PhaseFailed { phase: "clean", hosts }))
    }

    /// Polls the control plane until `expected` workers are live.
    async fn verify(&mut self, expected: u32) -> Result<(), LifecycleError> {
        let mut observed = None;
        for attempt in 1..=self.verify.attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = tokio::time::sleep(self.verify.interval) => {}
                    _ = self.shutdown.requested() => {}
                }
            }
            self.check_shutdown()?;
            match self.admin.report().await {
                Ok(report) => {
                    observed = Some(report.live_datanodes);
                    if report.live_datanodes == expected {
                        info!(
                            self.log,
                            "cluster verified";
                            "live_workers" => report.live_datanodes,
                            "attempt" => attempt,
                        );
                        return Ok(());
                    }
                    info!(
                        self.log,
                        "waiting for workers to register";
                        "live_workers" => report.live_datanodes,
                        "expected" => expected,
                        "attempt" => attempt,
                    );
                }
                Err(err) => {
                    info!(
                        self.log,
                        "cluster report unavailable";
                        "attempt" => attempt,
                        "error" => %err,
                    );
                }
            }
        }
        Err(self.fail(LifecycleError::VerificationFailed { expected, observed }))
    }
}
