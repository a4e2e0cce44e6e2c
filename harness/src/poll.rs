// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for a telemetry metric to reach a target value.
//!
//! This is where recovery times are measured.  The poller knows only which
//! metric it is watching and what value it is waiting for; it has no idea
//! whether the perturbation was an injected failure or a configuration
//! change.

use crate::shutdown::ShutdownSignal;
use crate::telemetry::Metric;
use crate::telemetry::SampleSource;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// The condition a metric must satisfy to count as converged.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Target {
    Equals(f64),
    AtMost(f64),
    AtLeast(f64),
}

impl Target {
    pub fn matches(&self, value: f64) -> bool {
        match *self {
            Target::Equals(target) => value == target,
            Target::AtMost(target) => value <= target,
            Target::AtLeast(target) => value >= target,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Equals(target) => write!(f, "== {target}"),
            Target::AtMost(target) => write!(f, "<= {target}"),
            Target::AtLeast(target) => write!(f, ">= {target}"),
        }
    }
}

/// How a [`wait_until`] call ended.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConvergenceResult {
    pub converged: bool,
    pub elapsed: Duration,
    /// The last value observed, if any sample reported the metric.
    pub last_value: Option<f64>,
    /// How many samples were taken, including unavailable ones.
    pub samples: u32,
    /// The wait was cut short by a shutdown request.
    pub interrupted: bool,
}

/// Samples `metric` from `source` every `interval` until it satisfies
/// `target` or `max_wait` has elapsed.
///
/// The first sample is taken immediately.  A sample in which the metric is
/// unavailable (or the endpoint is unreachable) counts as "not yet".  The
/// final sample is taken no later than `max_wait`, so at most
/// `ceil(max_wait / interval) + 1` samples are taken.  Not converging is a
/// valid outcome and is reported with `converged: false`, never as an error.
/// A shutdown request ends the wait early with `interrupted: true`.
pub async fn wait_until(
    log: &Logger,
    source: &dyn SampleSource,
    metric: Metric,
    target: Target,
    interval: Duration,
    max_wait: Duration,
    shutdown: &ShutdownSignal,
) -> ConvergenceResult {
    let interval = interval.max(Duration::from_millis(1));
    let start = Instant::now();
    let mut samples = 0;
    let mut last_value = None;

    info!(
        log,
        "waiting for convergence";
        "metric" => %metric,
        "target" => %target,
        "source" => source.describe(),
        "interval" => ?interval,
        "max_wait" => ?max_wait,
    );

    loop {
        samples += 1;
        match source.sample().await {
            Ok(sample) => match sample.value(metric) {
                Some(value) => {
                    last_value = Some(value);
                    if target.matches(value) {
                        let elapsed = start.elapsed();
                        info!(
                            log,
                            "converged";
                            "metric" => %metric,
                            "value" => value,
                            "elapsed" => ?elapsed,
                            "samples" => samples,
                        );
                        return ConvergenceResult {
                            converged: true,
                            elapsed,
                            last_value,
                            samples,
                            interrupted: false,
                        };
                    }
                    debug!(
                        log,
                        "not yet converged";
                        "metric" => %metric,
                        "value" => value,
                    );
                }
                None => {
                    debug!(log, "metric unavailable"; "metric" => %metric);
                }
            },
            Err(err) => {
                debug!(
                    log,
                    "telemetry unavailable while polling";
                    "error" => %err,
                );
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= max_wait {
            warn!(
                log,
                "did not converge before deadline";
                "metric" => %metric,
                "target" => %target,
                "last_value" => ?last_value,
                "elapsed" => ?elapsed,
                "samples" => samples,
            );
            return ConvergenceResult {
                converged: false,
                elapsed,
                last_value,
                samples,
                interrupted: false,
            };
        }
        tokio::select! {
            _ = tokio::time::sleep(interval.min(max_wait - elapsed)) => {}
            _ = shutdown.requested() => {
                let elapsed = start.elapsed();
                warn!(
                    log,
                    "stopped waiting for convergence on shutdown request";
                    "metric" => %metric,
                    "last_value" => ?last_value,
                    "elapsed" => ?elapsed,
                );
                return ConvergenceResult {
                    converged: false,
                    elapsed,
                    last_value,
                    samples,
                    interrupted: true,
                };
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::telemetry::parse_sample;
    use crate::telemetry::TelemetrySample;
    use crate::telemetry::TelemetryUnavailable;
    use async_trait::async_trait;
    use chrono::Utc;
    use dfs_harness_test_utils::dev::jmx::BeansBuilder;
    use dfs_harness_test_utils::dev::jmx::NamesystemState;
    use dfs_harness_test_utils::dev::test_setup_log;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves a fixed sequence of bodies, repeating the last one forever.
    /// `None` stands for an unreachable endpoint.
    pub(crate) struct ScriptedSource {
        script: Mutex<VecDeque<Option<String>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<Option<String>>) -> ScriptedSource {
            ScriptedSource {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        pub(crate) fn under_replicated(counts: &[u64]) -> ScriptedSource {
            ScriptedSource::new(
                counts
                    .iter()
                    .map(|count| {
                        Some(
                            BeansBuilder::new()
                                .namesystem_state(&NamesystemState {
                                    under_replicated: *count,
                                    ..Default::default()
                                })
                                .to_body(),
                        )
                    })
                    .collect(),
            )
        }

        pub(crate) fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SampleSource for ScriptedSource {
        async fn sample(&self) -> Result<TelemetrySample, TelemetryUnavailable> {
            *self.calls.lock().unwrap() += 1;
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().flatten()
                } else {
                    script.front().cloned().flatten()
                }
            };
            match next {
                Some(body) => Ok(parse_sample(&body, Utc::now())),
                None => Err(TelemetryUnavailable::Status {
                    url: String::from("scripted"),
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                }),
            }
        }

        fn describe(&self) -> String {
            String::from("scripted")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_converged_takes_one_sample() {
        let logctx = test_setup_log("test_already_converged_takes_one_sample");
        let source = ScriptedSource::under_replicated(&[0]);

        let result = wait_until(
            &logctx.log,
            &source,
            Metric::UnderReplicatedCount,
            Target::Equals(0.0),
            Duration::from_secs(1),
            Duration::from_secs(60),
            &ShutdownSignal::new(),
        )
        .await;
        assert!(result.converged);
        assert_eq!(result.elapsed, Duration::ZERO);
        assert_eq!(result.samples, 1);
        assert_eq!(source.calls(), 1);
        assert_eq!(result.last_value, Some(0.0));

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_converges_within_sample_bound() {
        let logctx = test_setup_log("test_never_converges_within_sample_bound");
        let source = ScriptedSource::under_replicated(&[5]);

        let interval = Duration::from_secs(3);
        let max_wait = Duration::from_secs(10);
        let result = wait_until(
            &logctx.log,
            &source,
            Metric::UnderReplicatedCount,
            Target::Equals(0.0),
            interval,
            max_wait,
            &ShutdownSignal::new(),
        )
        .await;
        assert!(!result.converged);
        assert!(result.elapsed >= max_wait);
        assert_eq!(result.last_value, Some(5.0));
        let bound = max_wait.as_secs().div_ceil(interval.as_secs()) + 1;
        assert!(u64::from(result.samples) <= bound);
        assert_eq!(u64::from(source.calls()), u64::from(result.samples));

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_after_recovery() {
        let logctx = test_setup_log("test_converges_after_recovery");
        let source = ScriptedSource::under_replicated(&[9, 4, 1, 0]);

        let result = wait_until(
            &logctx.log,
            &source,
            Metric::UnderReplicatedCount,
            Target::Equals(0.0),
            Duration::from_secs(2),
            Duration::from_secs(60),
            &ShutdownSignal::new(),
        )
        .await;
        assert!(result.converged);
        assert_eq!(result.samples, 4);
        assert_eq!(result.elapsed, Duration::from_secs(6));

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_samples_count_as_not_yet() {
        let logctx = test_setup_log("test_unavailable_samples_count_as_not_yet");
        let converged = BeansBuilder::new()
            .namesystem_state(&NamesystemState::default())
            .to_body();
        let source = ScriptedSource::new(vec![
            None,
            Some(String::from(r#"{"beans":[]}"#)),
            Some(converged),
        ]);

        let result = wait_until(
            &logctx.log,
            &source,
            Metric::UnderReplicatedCount,
            Target::AtMost(0.0),
            Duration::from_secs(1),
            Duration::from_secs(10),
            &ShutdownSignal::new(),
        )
        .await;
        assert!(result.converged);
        assert_eq!(result.samples, 3);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_wait_early() {
        let logctx = test_setup_log("test_shutdown_ends_wait_early");
        let source = ScriptedSource::under_replicated(&[5]);
        let shutdown = ShutdownSignal::new();
        let requester = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            requester.request();
        });

        let result = wait_until(
            &logctx.log,
            &source,
            Metric::UnderReplicatedCount,
            Target::Equals(0.0),
            Duration::from_secs(2),
            Duration::from_secs(600),
            &shutdown,
        )
        .await;
        assert!(!result.converged);
        assert!(result.interrupted);
        assert_eq!(result.elapsed, Duration::from_secs(3));
        assert_eq!(result.samples, 2);
        assert_eq!(result.last_value, Some(5.0));

        logctx.cleanup_successful();
    }

    #[test]
    fn test_targets() {
        assert!(Target::Equals(0.0).matches(0.0));
        assert!(!Target::Equals(0.0).matches(1.0));
        assert!(Target::AtMost(3.0).matches(2.0));
        assert!(!Target::AtMost(3.0).matches(4.0));
        assert!(Target::AtLeast(4.0).matches(4.0));
        assert_eq!(Target::AtLeast(4.0).to_string(), ">= 4");
    }
}
