// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Aggregates over previously recorded runs.

use crate::recorder::RecorderError;
use crate::recorder::RunMetadata;
use crate::recorder::RunRecorder;
use slog::warn;
use slog::Logger;
use tabled::Tabled;

/// Summary field holding a run's total workload runtime.
pub const RUNTIME_FIELD: &str = "runtime_secs";

#[derive(Clone, Debug, PartialEq)]
pub struct RunsSummary {
    pub runs: Vec<RunMetadata>,
    /// Runs that contributed a runtime.
    pub measured: usize,
    pub mean_runtime: Option<f64>,
    /// Sample standard deviation; needs at least two measured runs.
    pub std_dev_runtime: Option<f64>,
}

impl RunsSummary {
    pub fn from_runs(log: &Logger, runs: Vec<RunMetadata>) -> RunsSummary {
        let runtimes: Vec<f64> = runs
            .iter()
            .filter_map(|run| {
                let runtime = runtime(run);
                if runtime.is_none() {
                    warn!(
                        log,
                        "run has no runtime; skipping";
                        "run_id" => &run.run_id,
                    );
                }
                runtime
            })
            .collect();

        let measured = runtimes.len();
        let mean_runtime = (measured > 0)
            .then(|| runtimes.iter().sum::<f64>() / measured as f64);
        let std_dev_runtime = match mean_runtime {
            Some(mean) if measured >= 2 => {
                let variance = runtimes
                    .iter()
                    .map(|runtime| (runtime - mean).powi(2))
                    .sum::<f64>()
                    / (measured - 1) as f64;
                Some(variance.sqrt())
            }
            _ => None,
        };
        RunsSummary { runs, measured, mean_runtime, std_dev_runtime }
    }

    /// A table of runs followed by the aggregate lines.
    pub fn render(&self) -> String {
        #[derive(Tabled)]
        #[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
        struct RunRow {
            run_id: String,
            experiment: String,
            status: String,
            rows: usize,
            runtime_secs: String,
        }

        let rows = self.runs.iter().map(|run| RunRow {
            run_id: run.run_id.clone(),
            experiment: run.parameters.experiment.clone(),
            status: format!("{:?}", run.summary.status).to_lowercase(),
            rows: run.rows,
            runtime_secs: runtime(run)
                .map_or_else(|| String::from("-"), |runtime| format!("{runtime:.3}")),
        });
        let table = table(rows);

        let optional = |value: Option<f64>| {
            value.map_or_else(|| String::from("-"), |value| format!("{value:.3}"))
        };
        format!(
            "{table}\n\ntotal runs:       {}\nmeasured runs:    {}\n\
             mean runtime:     {}\nstd dev runtime:  {}\n",
            self.runs.len(),
            self.measured,
            optional(self.mean_runtime),
            optional(self.std_dev_runtime),
        )
    }
}

/// Renders rows as a borderless table with a space after each column.
pub fn table<T: Tabled>(rows: impl IntoIterator<Item = T>) -> String {
    tabled::Table::new(rows)
        .with(tabled::settings::Style::empty())
        .with(tabled::settings::Padding::new(0, 1, 0, 0))
        .to_string()
}

fn runtime(run: &RunMetadata) -> Option<f64> {
    run.summary.fields.get(RUNTIME_FIELD)?.as_f64()
}

/// Loads every finished run under the recorder's root.
pub fn summarize(
    log: &Logger,
    recorder: &RunRecorder,
) -> Result<RunsSummary, RecorderError> {
    Ok(RunsSummary::from_runs(log, recorder.list_runs()?))
}
