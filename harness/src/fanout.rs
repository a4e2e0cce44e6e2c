// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running one command per node, in parallel, and joining all of them.
//!
//! Every worker is awaited before [`fan_out`] returns, whether it succeeded
//! or not, so a phase never advances while a straggler is still running.  A
//! straggler is bounded by the executor's own timeout.

use crate::executor::BoxedExecutor;
use crate::executor::Host;
use crate::executor::RemoteCommandResult;
use futures::stream;
use futures::StreamExt;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;

/// The default number of per-node commands allowed to run at once.
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

/// How many commands may be in flight at once, and for how long each one may
/// run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FanOutLimits {
    pub max_parallelism: usize,
    pub timeout: Duration,
}

impl FanOutLimits {
    pub fn new(max_parallelism: usize, timeout: Duration) -> FanOutLimits {
        FanOutLimits { max_parallelism: max_parallelism.max(1), timeout }
    }
}

/// The joined results of one fan-out batch, in the order hosts were given.
#[derive(Clone, Debug)]
pub struct NodeOutcomes {
    results: Vec<RemoteCommandResult>,
}

impl NodeOutcomes {
    pub fn results(&self) -> &[RemoteCommandResult] {
        &self.results
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(RemoteCommandResult::success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RemoteCommandResult> {
        self.results.iter().filter(|result| !result.success())
    }

    pub fn failed_hosts(&self) -> Vec<Host> {
        self.failures().map(|result| result.host.clone()).collect()
    }

    /// Logs every node that failed in this batch under a single phase name.
    pub fn log_failures(&self, log: &Logger, phase: &'static str) {
        for failure in self.failures() {
            warn!(
                log,
                "node failed during {}", phase;
                "phase" => phase,
                "host" => %failure.host,
                "reason" => failure.failure_reason(),
            );
        }
    }
}

/// Runs `command_for(host)` on every host in `hosts`, at most
/// `limits.max_parallelism` at a time, and waits for all of them.
pub async fn fan_out<F>(
    executor: &BoxedExecutor,
    hosts: &[Host],
    limits: FanOutLimits,
    command_for: F,
) -> NodeOutcomes
where
    F: Fn(&Host) -> String,
{
    let jobs: Vec<(Host, String)> = hosts
        .iter()
        .map(|host| (host.clone(), command_for(host)))
        .collect();

    let results = stream::iter(jobs)
        .map(|(host, command)| {
            let executor = Arc::clone(executor);
            async move {
                executor.execute(&host, &command, limits.timeout).await
            }
        })
        // Results come back in input order.
        .buffered(limits.max_parallelism.max(1))
        .collect::<Vec<_>>()
        .await;

    NodeOutcomes { results }
}
