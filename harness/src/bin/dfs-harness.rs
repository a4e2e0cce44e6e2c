// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line entry point for running storage-layout experiments.

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use dfs_harness::admin::AdminCli;
use dfs_harness::config::Config;
use dfs_harness::executor::BoxedExecutor;
use dfs_harness::executor::Host;
use dfs_harness::executor::HostExecutor;
use dfs_harness::experiment::ExperimentDriver;
use dfs_harness::experiment::ExperimentKind;
use dfs_harness::experiment::ExperimentOptions;
use dfs_harness::failure::FailureMode;
use dfs_harness::lifecycle::PartialPolicy;
use dfs_harness::monitor;
use dfs_harness::recorder::RunRecorder;
use dfs_harness::recorder::RunStatus;
use dfs_harness::shutdown::ShutdownSignal;
use dfs_harness::summary;
use dfs_harness::telemetry::Metric;
use dfs_harness::telemetry::SampleSource;
use dfs_harness::telemetry::TelemetryClient;
use dfs_harness::topology::ApplyOutcome;
use dfs_harness::topology::Topology;
use dfs_harness::topology::TopologyConfigurator;
use slog::info;
use slog::o;
use slog::Drain;
use slog::Logger;
use slog_term::FullFormat;
use slog_term::TermDecorator;
use std::process::ExitCode;
use std::time::Duration;
use tabled::Tabled;

/// How long `monitor stop` waits for the monitor to exit after SIGTERM.
const MONITOR_STOP_WAIT: Duration = Duration::from_secs(10);

/// Run storage-layout experiments against a distributed filesystem cluster
#[derive(Debug, Parser)]
#[clap(version)]
struct HarnessApp {
    /// Path to the harness configuration file
    #[clap(long, short, env = "DFS_HARNESS_CONFIG", action)]
    config: Utf8PathBuf,

    /// Minimum severity of log messages written to the terminal
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Write run artifacts here instead of the configured results root
    #[clap(long, action)]
    results_root: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    command: HarnessCmd,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> slog::Level {
        match level {
            LogLevel::Error => slog::Level::Error,
            LogLevel::Warn => slog::Level::Warning,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Trace => slog::Level::Trace,
        }
    }
}

#[derive(Debug, Subcommand)]
enum HarnessCmd {
    /// Run an experiment and record its results
    Run(RunArgs),
    /// Push a configuration to every node without restarting anything
    Apply(ApplyArgs),
    /// Show each node's configuration and the cluster's health
    Status,
    /// Manage the background telemetry monitor
    #[clap(subcommand)]
    Monitor(MonitorCmd),
    /// Summarize previously recorded runs
    Summarize,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Experiment to run: block-size, storage-units, nodes or
    /// failure-recovery
    kind: ExperimentKind,

    /// Restart even if the configuration only reached some nodes
    #[clap(long, action)]
    accept_partial: bool,

    /// How storage units are failed: soft, hard or rename
    #[clap(long)]
    failure_mode: Option<FailureMode>,

    /// Number of storage units to fail
    #[clap(long)]
    fail_count: Option<u32>,

    /// Seed for choosing which units fail
    #[clap(long)]
    seed: Option<u64>,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    /// Block size to configure, in bytes
    #[clap(long)]
    block_size: Option<u64>,

    /// Storage units per node
    #[clap(long)]
    units: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum MonitorCmd {
    /// Start sampling telemetry in a detached process
    Start,
    /// Stop the detached monitor
    Stop,
    /// Sample telemetry in the foreground until interrupted
    Run {
        /// Seconds between samples (defaults to the poll interval)
        #[clap(long)]
        interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = HarnessApp::parse();

    let decorator = TermDecorator::new().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, args.log_level.into()).fuse();
    let log = Logger::root(drain, o!());

    match args.exec(&log).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("dfs-harness: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

impl HarnessApp {
    async fn exec(&self, log: &Logger) -> anyhow::Result<ExitCode> {
        let mut config = Config::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config))?;
        if let Some(root) = &self.results_root {
            config.results.root = root.clone();
        }

        match &self.command {
            HarnessCmd::Run(args) => args.exec(log, config).await,
            HarnessCmd::Apply(args) => args.exec(log, &config).await,
            HarnessCmd::Status => cmd_status(log, &config).await,
            HarnessCmd::Monitor(cmd) => cmd.exec(log, &config, self).await,
            HarnessCmd::Summarize => cmd_summarize(log, &config),
        }
    }
}

fn executor(log: &Logger, config: &Config) -> BoxedExecutor {
    HostExecutor::new(log, config.ssh_options()).as_executor()
}

impl RunArgs {
    async fn exec(&self, log: &Logger, config: Config) -> anyhow::Result<ExitCode> {
        let mut options = ExperimentOptions::from_config(self.kind, &config);
        if self.accept_partial {
            options.partial_policy = PartialPolicy::Accept;
        }
        if let Some(mode) = self.failure_mode {
            options.failure_mode = mode;
        }
        if let Some(count) = self.fail_count {
            options.failure_count = count;
        }
        options.seed = self.seed;

        let shutdown = ShutdownSignal::new();
        let signals = shutdown
            .listen_for_signals(log)
            .context("installing signal handlers")?;
        let driver = ExperimentDriver::new(
            log,
            config.clone(),
            executor(log, &config),
            shutdown,
        );
        let result = driver.run(&options).await;
        signals.close();

        let outcome = result
            .with_context(|| format!("running {} experiment", self.kind))?;
        let run_dir = config.results.root.join(&outcome.run_id);
        println!(
            "run {}: {:?}, {} rows in {}",
            outcome.run_id, outcome.status, outcome.rows, run_dir
        );
        Ok(match outcome.status {
            RunStatus::Completed => ExitCode::SUCCESS,
            RunStatus::Failed | RunStatus::Interrupted => ExitCode::FAILURE,
        })
    }
}

impl ApplyArgs {
    async fn exec(&self, log: &Logger, config: &Config) -> anyhow::Result<ExitCode> {
        let topology = Topology::new(
            config.cluster.nodes.clone(),
            self.units.unwrap_or(config.experiment.default_units),
            self.block_size.unwrap_or(config.experiment.default_block_size),
            config.cluster.min_block_size,
        )
        .context("invalid topology")?;
        let configurator = TopologyConfigurator::new(
            log,
            executor(log, config),
            config.layout(),
            config.fan_out_limits(),
        );

        let outcome = configurator.apply(&topology).await;
        match &outcome {
            ApplyOutcome::Success => {
                println!(
                    "configured {} nodes: block size {}, {} storage units each",
                    topology.nodes().len(),
                    topology.block_size(),
                    topology.storage_units_per_node(),
                );
                Ok(ExitCode::SUCCESS)
            }
            ApplyOutcome::Partial { failed } | ApplyOutcome::Failure { failed } => {
                for failure in failed {
                    eprintln!("{}: {}", failure.host, failure.reason);
                }
                bail!(
                    "configuration did not reach {} of {} nodes",
                    failed.len(),
                    topology.nodes().len()
                )
            }
        }
    }
}

async fn cmd_status(log: &Logger, config: &Config) -> anyhow::Result<ExitCode> {
    #[derive(Tabled)]
    #[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
    struct NodeRow {
        node: String,
        block_size: String,
        storage_units: String,
        replication: String,
    }

    let executor = executor(log, config);
    let configurator = TopologyConfigurator::new(
        log,
        executor.clone(),
        config.layout(),
        config.fan_out_limits(),
    );
    let mut rows = Vec::new();
    for node in &config.cluster.nodes {
        let row = match configurator.probe(&Host::from_name(node)).await {
            Ok(probed) => NodeRow {
                node: node.clone(),
                block_size: probed
                    .block_size
                    .map_or_else(|| String::from("-"), |size| size.to_string()),
                storage_units: probed.storage_units.to_string(),
                replication: probed
                    .properties
                    .get("dfs.replication")
                    .cloned()
                    .unwrap_or_else(|| String::from("-")),
            },
            Err(err) => NodeRow {
                node: node.clone(),
                block_size: format!("error: {}", err),
                storage_units: String::from("-"),
                replication: String::from("-"),
            },
        };
        rows.push(row);
    }
    println!("{}", summary::table(rows));
    println!();

    let admin = AdminCli::new(
        log,
        executor,
        &config.hadoop.home,
        Host::from_name(&config.cluster.nodes[0]),
        config.fan_out_limits().timeout,
    );
    match admin.report().await {
        Ok(report) => println!(
            "workers: {} live, {} dead",
            report.live_datanodes, report.dead_datanodes
        ),
        Err(err) => println!("workers: unknown ({})", err),
    }

    let source = TelemetryClient::new(log).source(
        config.telemetry.namenode_url.clone(),
        config.telemetry_timeout(),
    );
    match source.sample().await {
        Ok(sample) => {
            for metric in Metric::ALL {
                let value = sample
                    .value(metric)
                    .map_or_else(|| String::from("unavailable"), |v| v.to_string());
                println!("{:<24} {}", metric, value);
            }
        }
        Err(err) => println!("telemetry: unavailable ({})", err),
    }
    Ok(ExitCode::SUCCESS)
}

impl MonitorCmd {
    async fn exec(
        &self,
        log: &Logger,
        config: &Config,
        app: &HarnessApp,
    ) -> anyhow::Result<ExitCode> {
        let pid_file = config.results.monitor_pid_file();
        match self {
            MonitorCmd::Start => {
                let program = std::env::current_exe()
                    .context("locating the harness executable")?;
                let program = Utf8PathBuf::try_from(program)
                    .map_err(|err| anyhow!("executable path: {}", err))?;
                let args = vec![
                    String::from("--config"),
                    app.config.to_string(),
                    String::from("--results-root"),
                    config.results.root.to_string(),
                    String::from("monitor"),
                    String::from("run"),
                ];
                let pid = monitor::start(log, &pid_file, &program, &args)?;
                println!(
                    "monitor started (pid {}), writing {}",
                    pid,
                    config.results.monitor_csv()
                );
            }
            MonitorCmd::Stop => {
                let outcome =
                    monitor::stop(log, &pid_file, MONITOR_STOP_WAIT).await?;
                println!("monitor stopped: {:?}", outcome);
            }
            MonitorCmd::Run { interval_secs } => {
                let interval = interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| config.poll_interval());
                fs_err::create_dir_all(&config.results.root)?;
                let shutdown = ShutdownSignal::new();
                let signals = shutdown
                    .listen_for_signals(log)
                    .context("installing signal handlers")?;
                let source = TelemetryClient::new(log).source(
                    config.telemetry.namenode_url.clone(),
                    config.telemetry_timeout(),
                );
                let rows = monitor::run(
                    log,
                    &source,
                    &config.results.monitor_csv(),
                    interval,
                    &shutdown,
                )
                .await?;
                signals.close();
                info!(log, "monitor exiting"; "rows" => rows);
            }
        }
        Ok(ExitCode::SUCCESS)
    }
}

fn cmd_summarize(log: &Logger, config: &Config) -> anyhow::Result<ExitCode> {
    let recorder = RunRecorder::new(log, &config.results.root);
    let summary = summary::summarize(log, &recorder)
        .with_context(|| format!("reading runs under {}", config.results.root))?;
    print!("{}", summary.render());
    Ok(ExitCode::SUCCESS)
}
