// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequencing the components over a parameter sweep.
//!
//! Each sweep point runs the phases
//!
//! ```text
//! configure -> restart -> load -> measure
//!     [-> fail -> wait-for-convergence -> recover] -> report
//! ```
//!
//! A phase that fails stops the sweep, but the run is still finalized with
//! the rows collected so far.  Injected failures still held when the sweep
//! stops, for whatever reason, are recovered before returning.

use crate::admin::AdminCli;
use crate::config::Config;
use crate::executor::BoxedExecutor;
use crate::executor::Host;
use crate::failure::FailureError;
use crate::failure::FailureInjector;
use crate::failure::FailureMode;
use crate::failure::ReloadOnRecover;
use crate::lifecycle::ClusterController;
use crate::lifecycle::LifecycleError;
use crate::lifecycle::PartialPolicy;
use crate::monitor;
use crate::poll::wait_until;
use crate::poll::ConvergenceResult;
use crate::poll::Target;
use crate::recorder::RecorderError;
use crate::recorder::RunParameters;
use crate::recorder::RunRecorder;
use crate::recorder::RunStatus;
use crate::recorder::RunSummary;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::Metric;
use crate::telemetry::SampleSource;
use crate::telemetry::TelemetryClient;
use crate::telemetry::TelemetrySample;
use crate::topology::Topology;
use crate::topology::TopologyConfigurator;
use crate::topology::TopologyError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::json;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on the control-plane reachability check.
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long cleanup waits for a leftover monitor to exit.
const MONITOR_STOP_WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentKind {
    /// Double the block size at fixed storage units per node.
    BlockSize,
    /// Double the storage units per node at a fixed block size.
    StorageUnits,
    /// Double the number of workers and watch control-plane memory.
    Nodes,
    /// Fail storage units on one worker and time the recovery.
    FailureRecovery,
}

impl ExperimentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentKind::BlockSize => "block-size",
            ExperimentKind::StorageUnits => "storage-units",
            ExperimentKind::Nodes => "nodes",
            ExperimentKind::FailureRecovery => "failure-recovery",
        }
    }

    /// The fixed `results.csv` header for this kind.  The last column names
    /// the telemetry cells left empty because the endpoint did not report
    /// them, separated by `;`.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            ExperimentKind::BlockSize | ExperimentKind::StorageUnits => &[
                "block_size",
                "units_per_node",
                "nodes",
                "runtime_secs",
                "workload_ok",
                "heap_used",
                "block_count",
                "file_count",
                "unavailable",
            ],
            ExperimentKind::Nodes => &[
                "nodes",
                "heap_used",
                "heap_max",
                "block_count",
                "live_node_count",
                "unavailable",
            ],
            ExperimentKind::FailureRecovery => &[
                "mode",
                "failed_units",
                "units_per_node",
                "converged",
                "recovery_secs",
                "last_under_replicated",
                "storage_count_before",
                "storage_count_after",
                "unavailable",
            ],
        }
    }
}

impl fmt::Display for ExperimentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error(
    "unknown experiment {0:?} (expected block-size, storage-units, nodes or \
     failure-recovery)"
)]
pub struct UnknownExperiment(String);

impl FromStr for ExperimentKind {
    type Err = UnknownExperiment;

    fn from_str(s: &str) -> Result<ExperimentKind, UnknownExperiment> {
        [
            ExperimentKind::BlockSize,
            ExperimentKind::StorageUnits,
            ExperimentKind::Nodes,
            ExperimentKind::FailureRecovery,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == s)
        .ok_or_else(|| UnknownExperiment(s.to_owned()))
    }
}

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("invalid sweep point")]
    Topology(#[from] TopologyError),
    #[error("sweep from {start} to {max} is empty")]
    EmptySweep { start: u64, max: u64 },
    #[error("experiment needs {needed} workers but only {available} are configured")]
    NotEnoughWorkers { needed: usize, available: usize },
    #[error("control plane {host} is unreachable: {reason}")]
    ControlPlaneUnreachable { host: Host, reason: String },
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Failure(#[from] FailureError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error("interrupted by shutdown request")]
    Interrupted,
}

/// Per-invocation choices layered over the configuration file.
#[derive(Clone, Debug)]
pub struct ExperimentOptions {
    pub kind: ExperimentKind,
    pub partial_policy: PartialPolicy,
    pub failure_mode: FailureMode,
    pub failure_count: u32,
    /// Seeds unit selection, for repeatable failure runs.
    pub seed: Option<u64>,
}

impl ExperimentOptions {
    /// Options for `kind` taken entirely from `config`.
    pub fn from_config(kind: ExperimentKind, config: &Config) -> ExperimentOptions {
        ExperimentOptions {
            kind,
            partial_policy: config.partial_policy(),
            failure_mode: config.experiment.failure_mode,
            failure_count: config.experiment.failure_count,
            seed: None,
        }
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub rows: usize,
}

/// `start, 2*start, 4*start, ...` up to and including `max`.
pub fn doublings(start: u64, max: u64) -> Result<Vec<u64>, ExperimentError> {
    let mut values = Vec::new();
    let mut value = start;
    while value != 0 && value <= max {
        values.push(value);
        value = match value.checked_mul(2) {
            Some(next) => next,
            None => break,
        };
    }
    if values.is_empty() {
        return Err(ExperimentError::EmptySweep { start, max });
    }
    Ok(values)
}

/// Builds and validates every topology of the sweep before anything runs.
pub fn sweep(
    kind: ExperimentKind,
    config: &Config,
) -> Result<Vec<Topology>, ExperimentError> {
    let nodes = &config.cluster.nodes;
    let experiment = &config.experiment;
    let min = config.cluster.min_block_size;
    let topology = |nodes: Vec<String>, units: u32, block_size: u64| {
        Topology::new(nodes, units, block_size, min)
    };

    let points = match kind {
        ExperimentKind::BlockSize => {
            doublings(experiment.block_size_start, experiment.block_size_max)?
                .into_iter()
                .map(|block_size| {
                    topology(nodes.clone(), experiment.default_units, block_size)
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        ExperimentKind::StorageUnits => doublings(
            u64::from(experiment.units_start),
            u64::from(experiment.units_max),
        )?
        .into_iter()
        .map(|units| {
            let units = u32::try_from(units).unwrap_or(u32::MAX);
            topology(nodes.clone(), units, experiment.default_block_size)
        })
        .collect::<Result<Vec<_>, _>>()?,
        ExperimentKind::Nodes => {
            let available = nodes.len().saturating_sub(1);
            if available < 2 {
                return Err(ExperimentError::NotEnoughWorkers {
                    needed: 2,
                    available,
                });
            }
            let max = u64::try_from(available).unwrap_or(u64::MAX);
            doublings(2, max)?
                .into_iter()
                .map(|workers| {
                    let workers = usize::try_from(workers).unwrap_or(usize::MAX);
                    topology(
                        nodes[..=workers].to_vec(),
                        experiment.default_units,
                        experiment.default_block_size,
                    )
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        ExperimentKind::FailureRecovery => vec![topology(
            nodes.clone(),
            experiment.default_units,
            experiment.default_block_size,
        )?],
    };
    Ok(points)
}

fn number(value: f64) -> String {
    value.to_string()
}

fn seconds(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}

/// Builds one `results.csv` row.  A telemetry cell with no value stays
/// empty and its column is named in the trailing `unavailable` cell.
#[derive(Default)]
struct RowBuilder {
    cells: Vec<String>,
    unavailable: Vec<&'static str>,
}

impl RowBuilder {
    fn cell(&mut self, value: impl ToString) -> &mut RowBuilder {
        self.cells.push(value.to_string());
        self
    }

    fn telemetry(
        &mut self,
        column: &'static str,
        value: Option<f64>,
    ) -> &mut RowBuilder {
        match value {
            Some(value) => self.cells.push(number(value)),
            None => {
                self.cells.push(String::new());
                self.unavailable.push(column);
            }
        }
        self
    }

    fn is_degraded(&self) -> bool {
        !self.unavailable.is_empty()
    }

    fn finish(mut self) -> Vec<String> {
        self.cells.push(self.unavailable.join(";"));
        self.cells
    }
}

/// What the load phase observed.
struct LoadResult {
    runtime: Duration,
    ok: bool,
}

/// What the fail/wait/recover phases observed.
struct RecoveryResult {
    failed_units: usize,
    converged: ConvergenceResult,
    storage_before: Option<f64>,
    storage_after: Option<f64>,
}

/// A sweep point's CSV row and what its phases observed.
struct PointResult {
    row: Vec<String>,
    load: Option<LoadResult>,
    recovery: Option<RecoveryResult>,
    telemetry_degraded: bool,
    software_version: Option<String>,
}

/// Components wired up for one run, all logging into the run's transcript.
struct RunContext<'a> {
    configurator: TopologyConfigurator,
    controller: ClusterController,
    admin: AdminCli,
    injector: &'a FailureInjector,
}

pub struct ExperimentDriver {
    log: Logger,
    config: Config,
    executor: BoxedExecutor,
    telemetry: TelemetryClient,
    shutdown: ShutdownSignal,
}

impl ExperimentDriver {
    pub fn new(
        log: &Logger,
        config: Config,
        executor: BoxedExecutor,
        shutdown: ShutdownSignal,
    ) -> ExperimentDriver {
        ExperimentDriver {
            log: log.new(o!("component" => "ExperimentDriver")),
            telemetry: TelemetryClient::new(log),
            config,
            executor,
            shutdown,
        }
    }

    fn admin(&self, log: &Logger) -> AdminCli {
        let control_plane = Host::from_name(&self.config.cluster.nodes[0]);
        AdminCli::new(
            log,
            self.executor.clone(),
            &self.config.hadoop.home,
            control_plane,
            self.config.fan_out_limits().timeout,
        )
    }

    fn check_shutdown(&self) -> Result<(), ExperimentError> {
        if self.shutdown.is_requested() {
            Err(ExperimentError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Runs one experiment end to end.
    ///
    /// Errors returned directly mean nothing was recorded: the sweep was
    /// invalid or the control plane was unreachable.  Once a run directory
    /// exists, failures are reported through [`RunOutcome::status`].
    pub async fn run(
        &self,
        options: &ExperimentOptions,
    ) -> Result<RunOutcome, ExperimentError> {
        let points = sweep(options.kind, &self.config)?;
        self.preflight().await?;

        let recorder = RunRecorder::new(&self.log, &self.config.results.root);
        let mut handle = recorder.begin_run(self.parameters(options, &points))?;
        let run_log = match handle.logger(&self.log) {
            Ok(log) => log,
            Err(err) => {
                warn!(
                    self.log,
                    "run transcript unavailable; logging to console only";
                    "run_id" => handle.run_id(),
                    "error" => %err,
                );
                self.log.new(o!("run_id" => handle.run_id().to_owned()))
            }
        };
        info!(
            run_log,
            "experiment starting";
            "experiment" => %options.kind,
            "points" => points.len(),
        );

        let injector = FailureInjector::new(
            &run_log,
            self.executor.clone(),
            self.config.layout(),
            self.config.fan_out_limits().timeout,
            self.config.experiment.reconfigure_on_recover.then(|| {
                ReloadOnRecover {
                    admin: self.admin(&run_log),
                    ipc_port: self.config.hadoop.datanode_ipc_port,
                }
            }),
        );
        let admin = self.admin(&run_log);
        let mut context = RunContext {
            configurator: TopologyConfigurator::new(
                &run_log,
                self.executor.clone(),
                self.config.layout(),
                self.config.fan_out_limits(),
            ),
            controller: ClusterController::new(
                &run_log,
                self.executor.clone(),
                admin.clone(),
                self.config.layout(),
                self.config.fan_out_limits(),
                self.config.verify_policy(),
                self.shutdown.clone(),
            ),
            admin,
            injector: &injector,
        };
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut outcome: Result<(), ExperimentError> = Ok(());
        let mut runtime_total = Duration::ZERO;
        let mut recoveries = Vec::new();
        let mut degraded_rows = 0usize;
        let mut software_version = None;
        for (index, topology) in points.iter().enumerate() {
            let point_log = run_log.new(o!(
                "point" => index,
                "nodes" => topology.nodes().len(),
                "units_per_node" => topology.storage_units_per_node(),
                "block_size" => topology.block_size(),
            ));
            let result = self
                .run_point(&mut context, &point_log, options, topology, &mut rng)
                .await;
            match result {
                Ok(point) => {
                    if let Some(load) = point.load {
                        runtime_total += load.runtime;
                    }
                    if let Some(recovery) = point.recovery {
                        recoveries.push(recovery);
                    }
                    if point.telemetry_degraded {
                        degraded_rows += 1;
                    }
                    if point.software_version.is_some() {
                        software_version = point.software_version;
                    }
                    if let Err(err) = recorder.append_row(&mut handle, point.row) {
                        error!(point_log, "could not record row"; "error" => %err);
                        outcome = Err(err.into());
                        break;
                    }
                }
                Err(err) => {
                    error!(point_log, "sweep stopped"; "error" => %err);
                    outcome = Err(err);
                    break;
                }
            }
        }

        // Put back anything still failed.  A monitor is left alone unless the
        // run ended early.
        let unrecovered = injector.recover_all().await;
        if !unrecovered.is_empty() {
            error!(
                run_log,
                "injected failures could not be recovered";
                "plans" => ?unrecovered,
            );
        }
        if outcome.is_err() {
            if let Err(err) = monitor::stop_if_running(
                &run_log,
                &self.config.results.monitor_pid_file(),
                MONITOR_STOP_WAIT,
            )
            .await
            {
                warn!(run_log, "failed to stop monitor"; "error" => %err);
            }
        }

        let mut fields = BTreeMap::new();
        fields.insert(String::from("points"), json!(handle.rows().len()));
        fields.insert(
            String::from("telemetry_unavailable"),
            json!(degraded_rows),
        );
        if let Some(version) = software_version {
            fields.insert(String::from("software_version"), json!(version));
        }
        if self.config.workload.is_some() && !handle.rows().is_empty() {
            fields.insert(
                String::from("runtime_secs"),
                json!(runtime_total.as_secs_f64()),
            );
        }
        if let Some(recovery) = recoveries.last() {
            fields.insert(
                String::from("recovery_secs"),
                json!(recovery.converged.elapsed.as_secs_f64()),
            );
            fields.insert(
                String::from("converged"),
                json!(recovery.converged.converged),
            );
        }
        let (status, error) = match &outcome {
            Ok(()) => (RunStatus::Completed, None),
            Err(ExperimentError::Interrupted) => {
                (RunStatus::Interrupted, Some(String::from("interrupted")))
            }
            Err(err) => (RunStatus::Failed, Some(err.to_string())),
        };
        let rows = handle.rows().len();
        let run_id = handle.run_id().to_owned();
        drop(context);
        drop(run_log);
        recorder.finalize(handle, RunSummary { status, error, fields })?;

        info!(
            self.log,
            "experiment finished";
            "run_id" => &run_id,
            "status" => ?status,
            "rows" => rows,
        );
        Ok(RunOutcome { run_id, status, rows })
    }

    /// The control plane must answer before anything is recorded.
    async fn preflight(&self) -> Result<(), ExperimentError> {
        let host = Host::from_name(&self.config.cluster.nodes[0]);
        let result = self.executor.execute(&host, "true", PREFLIGHT_TIMEOUT).await;
        if result.success() {
            Ok(())
        } else {
            Err(ExperimentError::ControlPlaneUnreachable {
                host,
                reason: result.failure_reason(),
            })
        }
    }

    fn parameters(
        &self,
        options: &ExperimentOptions,
        points: &[Topology],
    ) -> RunParameters {
        let mut values = BTreeMap::new();
        values.insert(String::from("nodes"), json!(self.config.cluster.nodes));
        values.insert(String::from("sweep"), json!(points));
        values.insert(
            String::from("workload"),
            json!(self.config.workload.as_ref().map(|w| w.render())),
        );
        if options.kind == ExperimentKind::FailureRecovery {
            values.insert(
                String::from("failure_mode"),
                json!(options.failure_mode.to_string()),
            );
            values.insert(
                String::from("failure_count"),
                json!(options.failure_count),
            );
            values.insert(String::from("seed"), json!(options.seed));
        }
        RunParameters {
            experiment: options.kind.to_string(),
            columns: options
                .kind
                .columns()
                .iter()
                .map(|column| column.to_string())
                .collect(),
            values,
        }
    }

    async fn run_point(
        &self,
        context: &mut RunContext<'_>,
        log: &Logger,
        options: &ExperimentOptions,
        topology: &Topology,
        rng: &mut StdRng,
    ) -> Result<PointResult, ExperimentError> {
        self.check_shutdown()?;
        info!(log, "phase"; "phase" => "configure");
        let configured = context.configurator.apply(topology).await;

        self.check_shutdown()?;
        info!(log, "phase"; "phase" => "restart");
        context
            .controller
            .restart(topology, &configured, options.partial_policy)
            .await?;

        self.check_shutdown()?;
        let load = match &self.config.workload {
            Some(workload) => {
                info!(log, "phase"; "phase" => "load");
                if let Some(input) = &workload.input {
                    // Formatting emptied the namespace.
                    if let Err(err) = context.admin.mkdir(input).await {
                        warn!(log, "could not create workload input"; "error" => %err);
                    }
                }
                if let Some(output) = &workload.output {
                    // A previous run's output makes most jobs refuse to start.
                    if let Err(err) = context.admin.remove(output).await {
                        warn!(log, "could not clear workload output"; "error" => %err);
                    }
                }
                let result = context
                    .admin
                    .run_workload(&workload.render(), workload.timeout())
                    .await;
                if !result.success() {
                    warn!(
                        log,
                        "workload failed";
                        "reason" => result.failure_reason(),
                    );
                }
                Some(LoadResult { runtime: result.duration, ok: result.success() })
            }
            None => None,
        };

        self.check_shutdown()?;
        info!(log, "phase"; "phase" => "measure");
        if load.is_some() {
            // Metadata counts are read from a saved namespace image.
            if let Err(err) = context.admin.checkpoint().await {
                warn!(log, "checkpoint failed"; "error" => %err);
            }
        }
        let namenode = self.telemetry.source(
            self.config.telemetry.namenode_url.clone(),
            self.config.telemetry_timeout(),
        );
        let sample = self.measure(log, &namenode).await;
        let value =
            |metric: Metric| sample.as_ref().and_then(|sample| sample.value(metric));

        let mut row = RowBuilder::default();
        let recovery = match options.kind {
            ExperimentKind::BlockSize | ExperimentKind::StorageUnits => {
                row.cell(topology.block_size())
                    .cell(topology.storage_units_per_node())
                    .cell(topology.workers().len())
                    .cell(
                        load.as_ref()
                            .map(|load| seconds(load.runtime))
                            .unwrap_or_default(),
                    )
                    .cell(
                        load.as_ref()
                            .map(|load| load.ok.to_string())
                            .unwrap_or_default(),
                    )
                    .telemetry("heap_used", value(Metric::HeapUsed))
                    .telemetry("block_count", value(Metric::BlockCount))
                    .telemetry("file_count", value(Metric::FileCount));
                None
            }
            ExperimentKind::Nodes => {
                row.cell(topology.workers().len())
                    .telemetry("heap_used", value(Metric::HeapUsed))
                    .telemetry("heap_max", value(Metric::HeapMax))
                    .telemetry("block_count", value(Metric::BlockCount))
                    .telemetry("live_node_count", value(Metric::LiveNodeCount));
                None
            }
            ExperimentKind::FailureRecovery => {
                let recovery = self
                    .fail_and_recover(context, log, options, topology, &namenode, rng)
                    .await?;
                row.cell(options.failure_mode)
                    .cell(recovery.failed_units)
                    .cell(topology.storage_units_per_node())
                    .cell(recovery.converged.converged)
                    .cell(seconds(recovery.converged.elapsed))
                    .telemetry("last_under_replicated", recovery.converged.last_value)
                    .telemetry("storage_count_before", recovery.storage_before)
                    .telemetry("storage_count_after", recovery.storage_after);
                Some(recovery)
            }
        };
        if row.is_degraded() {
            warn!(log, "row has unavailable telemetry"; "columns" => ?row.unavailable);
        }
        info!(log, "phase"; "phase" => "report");
        Ok(PointResult {
            telemetry_degraded: row.is_degraded(),
            row: row.finish(),
            load,
            recovery,
            software_version: sample
                .as_ref()
                .and_then(|sample| sample.software_version())
                .map(str::to_owned),
        })
    }

    /// Takes the configured number of samples and keeps the last one that
    /// could be fetched.
    async fn measure(
        &self,
        log: &Logger,
        source: &dyn SampleSource,
    ) -> Option<TelemetrySample> {
        let interval =
            Duration::from_secs(self.config.experiment.measure_interval_secs);
        let mut last = None;
        for index in 0..self.config.experiment.measure_samples.max(1) {
            if index > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.shutdown.requested() => break,
                }
            }
            match source.sample().await {
                Ok(sample) => last = Some(sample),
                Err(err) => {
                    warn!(log, "telemetry unavailable"; "error" => %err);
                }
            }
        }
        last
    }

    async fn fail_and_recover(
        &self,
        context: &RunContext<'_>,
        log: &Logger,
        options: &ExperimentOptions,
        topology: &Topology,
        namenode: &dyn SampleSource,
        rng: &mut StdRng,
    ) -> Result<RecoveryResult, ExperimentError> {
        let target = &topology.workers()[0];
        let worker = self.telemetry.source(
            self.config.telemetry.datanode_url_for(target),
            self.config.telemetry_timeout(),
        );
        let storage_before = worker
            .sample()
            .await
            .ok()
            .and_then(|sample| sample.value(Metric::StorageCount));

        self.check_shutdown()?;
        info!(log, "phase"; "phase" => "fail");
        let plan = context.injector.plan(
            Host::from_name(target),
            topology.storage_units_per_node(),
            options.failure_count,
            options.failure_mode,
            rng,
        )?;
        context.injector.inject(&plan).await?;

        info!(log, "phase"; "phase" => "wait-for-convergence");
        let converged = wait_until(
            log,
            namenode,
            Metric::UnderReplicatedCount,
            Target::Equals(0.0),
            self.config.poll_interval(),
            self.config.poll_max_wait(),
            &self.shutdown,
        )
        .await;

        // Recovery runs even when the wait was cut short.
        info!(log, "phase"; "phase" => "recover");
        context.injector.recover(&plan).await?;
        self.check_shutdown()?;
        let storage_after = match storage_before {
            Some(before) => {
                wait_until(
                    log,
                    &worker,
                    Metric::StorageCount,
                    Target::AtLeast(before),
                    self.config.poll_interval(),
                    self.config.poll_max_wait(),
                    &self.shutdown,
                )
                .await
                .last_value
            }
            None => worker
                .sample()
                .await
                .ok()
                .and_then(|sample| sample.value(Metric::StorageCount)),
        };
        self.check_shutdown()?;

        Ok(RecoveryResult {
            failed_units: plan.target_unit_ids.len(),
            converged,
            storage_before,
            storage_after,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::FakeExecutor;
    use crate::executor::FakeResponse;
    use crate::recorder::RunMetadata;
    use crate::recorder::METADATA_FILE;
    use crate::recorder::RESULTS_FILE;
    use camino::Utf8Path;
    use camino_tempfile::Utf8TempDir;
    use dfs_harness_test_utils::dev::jmx::BeansBuilder;
    use dfs_harness_test_utils::dev::jmx::NamesystemState;
    use dfs_harness_test_utils::dev::test_setup_log;
    use httpmock::MockServer;
    use std::sync::Arc;

    fn config(root: &Utf8Path, server: &MockServer, extra: &str) -> Config {
        let contents = format!(
            r#"
            [cluster]
            nodes = ["nn", "dn1", "dn2", "dn3", "dn4"]
            min_block_size = 65536

            [hadoop]
            home = "/opt/hadoop"
            data_root = "/data/dfs"
            name_dir = "/data/name"

            [telemetry]
            namenode_url = "{nn}"
            datanode_url = "{dn}"

            [lifecycle]
            verify_attempts = 2
            verify_interval_secs = 0

            [poll]
            interval_ms = 10
            max_wait_secs = 2

            [results]
            root = "{root}"

            {extra}
            "#,
            nn = server.url("/nn/jmx"),
            dn = server.url("/dn/{host}/jmx"),
        );
        let config: Config = toml::from_str(&contents).unwrap();
        config.validate().unwrap();
        config
    }

    /// A cluster whose workers always register and whose control plane
    /// reports `live` workers.
    fn healthy(fake: &FakeExecutor, live: u32) {
        fake.set_handler(move |_, command| {
            if command.contains("-report") {
                FakeResponse::stdout(format!("Live datanodes ({live}):\n"))
            } else if command.contains("wordcount") {
                FakeResponse::stdout("job done")
            } else {
                FakeResponse::success()
            }
        });
    }

    fn mock_namenode(server: &MockServer) {
        let body = BeansBuilder::new()
            .memory(256 << 20, 1 << 30)
            .namesystem_state(&NamesystemState {
                blocks: 12,
                files: 7,
                live_datanodes: 4,
                ..Default::default()
            })
            .live_nodes(&[("dn1", 2), ("dn2", 2), ("dn3", 2), ("dn4", 2)])
            .to_body();
        server.mock(|when, then| {
            when.path("/nn/jmx");
            then.status(200).body(body);
        });
    }

    /// The pid of a process that has already exited and been reaped.
    fn exited_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        child.id()
    }

    fn read_metadata(dir: &Utf8Path) -> RunMetadata {
        let contents = std::fs::read_to_string(dir.join(METADATA_FILE)).unwrap();
        serde_json::from_str(&contents).unwrap()
    }

    #[test]
    fn test_doublings() {
        assert_eq!(doublings(1, 8).unwrap(), [1, 2, 4, 8]);
        assert_eq!(doublings(3, 20).unwrap(), [3, 6, 12]);
        assert_eq!(doublings(5, 5).unwrap(), [5]);
        assert!(matches!(
            doublings(8, 4),
            Err(ExperimentError::EmptySweep { start: 8, max: 4 })
        ));
        assert!(doublings(0, 4).is_err());
        assert_eq!(doublings(u64::MAX / 2 + 1, u64::MAX).unwrap().len(), 1);
    }

    #[test]
    fn test_kinds() {
        for kind in [
            ExperimentKind::BlockSize,
            ExperimentKind::StorageUnits,
            ExperimentKind::Nodes,
            ExperimentKind::FailureRecovery,
        ] {
            assert_eq!(kind.as_str().parse::<ExperimentKind>().unwrap(), kind);
        }
        assert!("throughput".parse::<ExperimentKind>().is_err());
    }

    #[test]
    fn test_node_sweep_uses_leading_workers() {
        let server = MockServer::start();
        let dir = Utf8TempDir::new().unwrap();
        let config = config(dir.path(), &server, "");
        let points = sweep(ExperimentKind::Nodes, &config).unwrap();
        let workers: Vec<&[String]> =
            points.iter().map(|topology| topology.workers()).collect();
        assert_eq!(workers, [&["dn1", "dn2"][..], &["dn1", "dn2", "dn3", "dn4"][..]]);
        assert!(points.iter().all(|topology| topology.control_plane() == "nn"));
    }

    #[tokio::test]
    async fn test_block_size_sweep_records_every_point() {
        let logctx = test_setup_log("test_block_size_sweep_records_every_point");
        let server = MockServer::start();
        mock_namenode(&server);
        let dir = Utf8TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &server,
            r#"
            [workload]
            command = "hadoop jar wc.jar wordcount {input} {output}"
            input = "/in"
            output = "/out"

            [experiment]
            block_size_start = 65536
            block_size_max = 262144
            default_units = 2
            measure_samples = 1
            "#,
        );
        let fake = FakeExecutor::new(&logctx.log);
        healthy(&fake, 4);
        let driver = ExperimentDriver::new(
            &logctx.log,
            config.clone(),
            fake.clone().as_executor(),
            ShutdownSignal::new(),
        );
        // A completed run leaves a monitor's pid file alone.
        let pid_file = config.results.monitor_pid_file();
        std::fs::write(&pid_file, exited_pid().to_string()).unwrap();

        let outcome = driver
            .run(&ExperimentOptions::from_config(ExperimentKind::BlockSize, &config))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.rows, 3);
        assert!(pid_file.exists());
        assert_eq!(fake.commands_matching("namenode -format").len(), 3);
        assert_eq!(fake.commands_matching("-mkdir -p /in").len(), 3);
        assert_eq!(fake.commands_matching("wordcount /in /out").len(), 3);
        assert_eq!(fake.commands_matching("-saveNamespace").len(), 3);
        assert_eq!(fake.commands_matching("-safemode leave").len(), 3);

        let run_dir = dir.path().join(&outcome.run_id);
        let csv = std::fs::read_to_string(run_dir.join(RESULTS_FILE)).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], ExperimentKind::BlockSize.columns().join(","));
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("65536,2,4,"), "{}", lines[1]);
        assert!(lines[3].starts_with("262144,2,4,"), "{}", lines[3]);
        assert!(lines[1].ends_with(",true,268435456,12,7,"), "{}", lines[1]);

        let metadata = read_metadata(&run_dir);
        assert_eq!(metadata.summary.status, RunStatus::Completed);
        assert!(metadata.summary.fields.contains_key("runtime_secs"));
        assert_eq!(metadata.summary.fields["telemetry_unavailable"], json!(0));
        assert_eq!(metadata.summary.fields["software_version"], json!("3.3.6"));
        assert!(run_dir.join("run.log").is_file());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_invalid_sweep_rejected_before_any_command() {
        let logctx =
            test_setup_log("test_invalid_sweep_rejected_before_any_command");
        let server = MockServer::start();
        let dir = Utf8TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &server,
            r#"
            [experiment]
            block_size_start = 100000
            block_size_max = 400000
            "#,
        );
        let fake = FakeExecutor::new(&logctx.log);
        let driver = ExperimentDriver::new(
            &logctx.log,
            config.clone(),
            fake.clone().as_executor(),
            ShutdownSignal::new(),
        );

        let err = driver
            .run(&ExperimentOptions::from_config(ExperimentKind::BlockSize, &config))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::Topology(TopologyError::BlockSizeNotPowerOfTwo(100000))
        ));
        assert!(fake.history().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unreachable_control_plane_records_nothing() {
        let logctx =
            test_setup_log("test_unreachable_control_plane_records_nothing");
        let server = MockServer::start();
        let dir = Utf8TempDir::new().unwrap();
        let config = config(dir.path(), &server, "");
        let fake = FakeExecutor::new(&logctx.log);
        fake.set_handler(|_, _| FakeResponse::failure(255, "No route to host"));
        let driver = ExperimentDriver::new(
            &logctx.log,
            config.clone(),
            fake.clone().as_executor(),
            ShutdownSignal::new(),
        );

        let err = driver
            .run(&ExperimentOptions::from_config(
                ExperimentKind::StorageUnits,
                &config,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::ControlPlaneUnreachable { .. }));
        assert_eq!(fake.history().len(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failed_restart_still_finalizes_run() {
        let logctx = test_setup_log("test_failed_restart_still_finalizes_run");
        let server = MockServer::start();
        mock_namenode(&server);
        let dir = Utf8TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &server,
            r#"
            [experiment]
            units_start = 1
            units_max = 4
            measure_samples = 1
            "#,
        );
        let fake = FakeExecutor::new(&logctx.log);
        // Only three of four workers ever register.
        healthy(&fake, 3);
        let driver = ExperimentDriver::new(
            &logctx.log,
            config.clone(),
            fake.clone().as_executor(),
            ShutdownSignal::new(),
        );
        // A run that ends early cleans up a leftover monitor.
        let pid_file = config.results.monitor_pid_file();
        std::fs::write(&pid_file, exited_pid().to_string()).unwrap();

        let outcome = driver
            .run(&ExperimentOptions::from_config(
                ExperimentKind::StorageUnits,
                &config,
            ))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.rows, 0);
        // The sweep stopped at the first point.
        assert_eq!(fake.commands_matching("namenode -format").len(), 1);

        let metadata = read_metadata(&dir.path().join(&outcome.run_id));
        assert_eq!(metadata.summary.status, RunStatus::Failed);
        let error = metadata.summary.error.unwrap();
        assert!(error.contains("expected 4 live workers"), "{error}");
        assert!(!pid_file.exists());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failure_recovery_run() {
        let logctx = test_setup_log("test_failure_recovery_run");
        let server = MockServer::start();
        mock_namenode(&server);
        let volumes = ["/data/dfs/unit0", "/data/dfs/unit1", "/data/dfs/unit2", "/data/dfs/unit3"];
        let dn_body = BeansBuilder::new().datanode_volumes(&volumes).to_body();
        server.mock(|when, then| {
            when.path("/dn/dn1/jmx");
            then.status(200).body(dn_body);
        });
        let dir = Utf8TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &server,
            r#"
            [experiment]
            default_units = 4
            measure_samples = 1
            failure_mode = "soft"
            failure_count = 2
            "#,
        );
        let fake = FakeExecutor::new(&logctx.log);
        healthy(&fake, 4);
        let driver = ExperimentDriver::new(
            &logctx.log,
            config.clone(),
            fake.clone().as_executor(),
            ShutdownSignal::new(),
        );
        let mut options =
            ExperimentOptions::from_config(ExperimentKind::FailureRecovery, &config);
        options.seed = Some(11);

        let outcome = driver.run(&options).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);

        let injected = fake.commands_matching("chmod 000");
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].0, Host::from_name("dn1"));
        assert_eq!(injected[0].1.matches("chmod 000").count(), 2);
        let recovered = fake.commands_matching("chmod 755");
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].1.matches("chmod 755").count(), 2);

        let run_dir = dir.path().join(&outcome.run_id);
        let csv = std::fs::read_to_string(run_dir.join(RESULTS_FILE)).unwrap();
        let row = csv.lines().nth(1).unwrap();
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields[..4], ["soft", "2", "4", "true"]);
        assert_eq!(fields[5..], ["0", "4", "4", ""]);

        let metadata = read_metadata(&run_dir);
        assert_eq!(metadata.summary.fields["converged"], json!(true));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_interrupted_run_is_recorded() {
        let logctx = test_setup_log("test_interrupted_run_is_recorded");
        let server = MockServer::start();
        let dir = Utf8TempDir::new().unwrap();
        let config = config(dir.path(), &server, "");
        let fake = FakeExecutor::new(&logctx.log);
        healthy(&fake, 4);
        let shutdown = ShutdownSignal::new();
        shutdown.request();
        let driver = ExperimentDriver::new(
            &logctx.log,
            config.clone(),
            Arc::clone(&fake).as_executor(),
            shutdown,
        );

        let outcome = driver
            .run(&ExperimentOptions::from_config(ExperimentKind::Nodes, &config))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Interrupted);
        assert_eq!(outcome.rows, 0);
        // Only the reachability check ran.
        assert_eq!(fake.history().len(), 1);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unavailable_telemetry_leaves_cells_empty() {
        let logctx =
            test_setup_log("test_unavailable_telemetry_leaves_cells_empty");
        // Nothing answers on the NameNode endpoint.
        let server = MockServer::start();
        let dir = Utf8TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &server,
            r#"
            [experiment]
            block_size_start = 65536
            block_size_max = 65536
            default_units = 2
            measure_samples = 1
            "#,
        );
        let fake = FakeExecutor::new(&logctx.log);
        healthy(&fake, 4);
        let driver = ExperimentDriver::new(
            &logctx.log,
            config.clone(),
            fake.clone().as_executor(),
            ShutdownSignal::new(),
        );

        let outcome = driver
            .run(&ExperimentOptions::from_config(ExperimentKind::BlockSize, &config))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.rows, 1);
        // No workload, so no checkpoint either.
        assert!(fake.commands_matching("-saveNamespace").is_empty());

        let run_dir = dir.path().join(&outcome.run_id);
        let csv = std::fs::read_to_string(run_dir.join(RESULTS_FILE)).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], ExperimentKind::BlockSize.columns().join(","));
        assert_eq!(lines[1], "65536,2,4,,,,,,heap_used;block_count;file_count");

        let metadata = read_metadata(&run_dir);
        assert_eq!(metadata.summary.fields["telemetry_unavailable"], json!(1));
        assert!(!metadata.summary.fields.contains_key("software_version"));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_shutdown_during_convergence_wait_recovers() {
        let logctx =
            test_setup_log("test_shutdown_during_convergence_wait_recovers");
        let server = MockServer::start();
        // Under-replication never clears.
        let nn_body = BeansBuilder::new()
            .namesystem_state(&NamesystemState {
                under_replicated: 5,
                live_datanodes: 4,
                ..Default::default()
            })
            .to_body();
        server.mock(|when, then| {
            when.path("/nn/jmx");
            then.status(200).body(nn_body);
        });
        let dir = Utf8TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &server,
            r#"
            [experiment]
            default_units = 4
            measure_samples = 1
            failure_mode = "soft"
            failure_count = 1
            "#,
        );
        let shutdown = ShutdownSignal::new();
        let fake = FakeExecutor::new(&logctx.log);
        let on_inject = shutdown.clone();
        fake.set_handler(move |_, command| {
            if command.contains("-report") {
                FakeResponse::stdout("Live datanodes (4):\n")
            } else {
                if command.contains("chmod 000") {
                    on_inject.request();
                }
                FakeResponse::success()
            }
        });
        let driver = ExperimentDriver::new(
            &logctx.log,
            config.clone(),
            fake.clone().as_executor(),
            shutdown,
        );
        let mut options =
            ExperimentOptions::from_config(ExperimentKind::FailureRecovery, &config);
        options.seed = Some(3);

        let started = std::time::Instant::now();
        let outcome = driver.run(&options).await.unwrap();
        assert!(started.elapsed() < config.poll_max_wait());
        assert_eq!(outcome.status, RunStatus::Interrupted);
        assert_eq!(outcome.rows, 0);
        assert_eq!(fake.commands_matching("chmod 000").len(), 1);
        assert_eq!(fake.commands_matching("chmod 755").len(), 1);

        let metadata = read_metadata(&dir.path().join(&outcome.run_id));
        assert_eq!(metadata.summary.status, RunStatus::Interrupted);

        logctx.cleanup_successful();
    }
}
