// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated storage-unit failures and their exact reversal.
//!
//! Every injected plan is remembered until it has been recovered, so a run
//! that is interrupted part-way can put the cluster back the way it found it
//! with [`FailureInjector::recover_all`].

use crate::admin::AdminCli;
use crate::executor::BoxedExecutor;
use crate::executor::Host;
use crate::topology::quote;
use crate::topology::ClusterLayout;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// How a storage unit is made to fail.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Remove every permission bit from the unit directory.
    Soft,
    /// Delete the unit directory and everything in it.
    Hard,
    /// Move the unit directory aside.
    Rename,
}

impl FailureMode {
    fn as_str(&self) -> &'static str {
        match self {
            FailureMode::Soft => "soft",
            FailureMode::Hard => "hard",
            FailureMode::Rename => "rename",
        }
    }

    fn inject_command(&self, dir: &Utf8Path) -> String {
        let dir = quote(dir);
        match self {
            FailureMode::Soft => format!("chmod 000 {dir}"),
            FailureMode::Hard => format!("rm -rf {dir}"),
            FailureMode::Rename => format!("mv {dir} {dir}.failed"),
        }
    }

    /// Reverses `inject_command`.  Safe to run more than once.
    fn recover_command(&self, dir: &Utf8Path) -> String {
        let dir = quote(dir);
        match self {
            FailureMode::Soft => format!("chmod 755 {dir}"),
            FailureMode::Hard => format!("mkdir -p {dir} && chmod 755 {dir}"),
            FailureMode::Rename => format!(
                "if [ -e {dir}.failed ]; then rm -rf {dir} && mv {dir}.failed {dir}; \
                 else mkdir -p {dir}; fi"
            ),
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown failure mode {0:?} (expected soft, hard or rename)")]
pub struct UnknownFailureMode(String);

impl FromStr for FailureMode {
    type Err = UnknownFailureMode;

    fn from_str(s: &str) -> Result<FailureMode, UnknownFailureMode> {
        match s {
            "soft" => Ok(FailureMode::Soft),
            "hard" => Ok(FailureMode::Hard),
            "rename" => Ok(FailureMode::Rename),
            other => Err(UnknownFailureMode(other.to_owned())),
        }
    }
}

/// Which units on which worker to fail, and how.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureInjectionPlan {
    pub target_host: Host,
    pub target_unit_ids: BTreeSet<u32>,
    pub mode: FailureMode,
    /// The directory backing each target unit, in unit order.
    pub unit_dirs: Vec<Utf8PathBuf>,
}

#[derive(Debug, Error)]
pub enum FailureError {
    #[error("cannot fail zero storage units")]
    NoUnits,
    #[error("cannot fail {requested} storage units; only {available} exist")]
    TooManyUnits { requested: u32, available: u32 },
    #[error("{action} on {host} failed: {reason}")]
    Command { action: &'static str, host: Host, reason: String },
    #[error("reloading volumes on {host} failed")]
    Reconfigure {
        host: Host,
        #[source]
        err: crate::admin::AdminError,
    },
}

/// Confirmation that an injection or recovery took effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub host: Host,
    pub units: BTreeSet<u32>,
    pub duration: Duration,
}

/// Asks a worker to reload its volumes after every recovery.
#[derive(Clone)]
pub struct ReloadOnRecover {
    pub admin: AdminCli,
    pub ipc_port: u16,
}

pub struct FailureInjector {
    log: Logger,
    executor: BoxedExecutor,
    layout: ClusterLayout,
    timeout: Duration,
    reload: Option<ReloadOnRecover>,
    held: Mutex<Vec<FailureInjectionPlan>>,
}

impl FailureInjector {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        layout: ClusterLayout,
        timeout: Duration,
        reload: Option<ReloadOnRecover>,
    ) -> FailureInjector {
        FailureInjector {
            log: log.new(slog::o!("component" => "FailureInjector")),
            executor,
            layout,
            timeout,
            reload,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Chooses `count` of the `units_available` units on `host` at random.
    ///
    /// The request is validated before anything is chosen; an impossible
    /// request never reaches a node.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        host: Host,
        units_available: u32,
        count: u32,
        mode: FailureMode,
        rng: &mut R,
    ) -> Result<FailureInjectionPlan, FailureError> {
        if count == 0 {
            return Err(FailureError::NoUnits);
        }
        if count > units_available {
            return Err(FailureError::TooManyUnits {
                requested: count,
                available: units_available,
            });
        }
        let chosen: BTreeSet<u32> = rand::seq::index::sample(
            rng,
            units_available as usize,
            count as usize,
        )
        .into_iter()
        .filter_map(|index| u32::try_from(index).ok())
        .collect();
        let unit_dirs =
            chosen.iter().map(|unit| self.layout.unit_dir(*unit)).collect();
        Ok(FailureInjectionPlan {
            target_host: host,
            target_unit_ids: chosen,
            mode,
            unit_dirs,
        })
    }

    /// Plans that have been injected and not yet recovered.
    pub fn held_plans(&self) -> Vec<FailureInjectionPlan> {
        self.held.lock().unwrap().clone()
    }

    pub async fn inject(
        &self,
        plan: &FailureInjectionPlan,
    ) -> Result<Ack, FailureError> {
        info!(
            self.log,
            "injecting failure";
            "host" => %plan.target_host,
            "units" => ?plan.target_unit_ids,
            "mode" => %plan.mode,
        );
        // Registered first: a partially applied injection still needs
        // recovering.
        {
            let mut held = self.held.lock().unwrap();
            if !held.contains(plan) {
                held.push(plan.clone());
            }
        }
        let command = plan
            .unit_dirs
            .iter()
            .map(|dir| plan.mode.inject_command(dir))
            .collect::<Vec<_>>()
            .join(" && ");
        self.run("inject", plan, &command).await
    }

    pub async fn recover(
        &self,
        plan: &FailureInjectionPlan,
    ) -> Result<Ack, FailureError> {
        info!(
            self.log,
            "recovering failure";
            "host" => %plan.target_host,
            "units" => ?plan.target_unit_ids,
            "mode" => %plan.mode,
        );
        // Each unit is recovered even if an earlier one could not be.
        let mut command = String::from("rc=0;");
        for dir in &plan.unit_dirs {
            command.push_str(&format!(
                " ( {} ) || rc=1;",
                plan.mode.recover_command(dir)
            ));
        }
        command.push_str(" exit $rc");
        let ack = self.run("recover", plan, &command).await?;
        self.held.lock().unwrap().retain(|held| held != plan);

        if let Some(reload) = &self.reload {
            reload
                .admin
                .reconfigure_datanode(&plan.target_host, reload.ipc_port)
                .await
                .map_err(|err| FailureError::Reconfigure {
                    host: plan.target_host.clone(),
                    err,
                })?;
        }
        Ok(ack)
    }

    /// Recovers every held plan, logging rather than stopping at failures.
    /// Returns the plans that could not be recovered.
    pub async fn recover_all(&self) -> Vec<FailureInjectionPlan> {
        let mut unrecovered = Vec::new();
        for plan in self.held_plans() {
            if let Err(err) = self.recover(&plan).await {
                warn!(
                    self.log,
                    "failed to recover injected failure";
                    "host" => %plan.target_host,
                    "units" => ?plan.target_unit_ids,
                    "error" => %err,
                );
                unrecovered.push(plan);
            }
        }
        unrecovered
    }

    async fn run(
        &self,
        action: &'static str,
        plan: &FailureInjectionPlan,
        command: &str,
    ) -> Result<Ack, FailureError> {
        let result = self
            .executor
            .execute(&plan.target_host, command, self.timeout)
            .await;
        if !result.success() {
            return Err(FailureError::Command {
                action,
                host: plan.target_host.clone(),
                reason: result.failure_reason(),
            });
        }
        Ok(Ack {
            host: plan.target_host.clone(),
            units: plan.target_unit_ids.clone(),
            duration: result.duration,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::FakeExecutor;
    use crate::executor::HostExecutor;
    use crate::executor::SshOptions;
    use crate::telemetry::parse_sample;
    use crate::telemetry::Metric;
    use crate::topology::test::layout;
    use camino_tempfile::Utf8TempDir;
    use chrono::Utc;
    use dfs_harness_test_utils::dev::jmx::BeansBuilder;
    use dfs_harness_test_utils::dev::test_setup_log;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::os::unix::fs::PermissionsExt;

    const UNITS: u32 = 4;

    fn local_injector(log: &Logger, root: &Utf8Path) -> FailureInjector {
        let layout = layout(root);
        for dir in layout.unit_dirs(UNITS) {
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("blk_1"), b"block").unwrap();
        }
        FailureInjector::new(
            log,
            HostExecutor::new(log, SshOptions::default()).as_executor(),
            layout,
            Duration::from_secs(10),
            None,
        )
    }

    /// What a worker's `DataNodeInfo` bean would report: one volume per
    /// unit directory it can still use.
    fn storage_count(root: &Utf8Path) -> f64 {
        let layout = layout(root);
        let usable: Vec<String> = layout
            .unit_dirs(UNITS)
            .into_iter()
            .filter(|dir| {
                std::fs::metadata(dir)
                    .map(|meta| {
                        meta.is_dir() && meta.permissions().mode() & 0o777 != 0
                    })
                    .unwrap_or(false)
            })
            .map(|dir| dir.to_string())
            .collect();
        let volumes: Vec<&str> = usable.iter().map(String::as_str).collect();
        let body = BeansBuilder::new().datanode_volumes(&volumes).to_body();
        parse_sample(&body, Utc::now()).get(Metric::StorageCount)
    }

    async fn inject_then_recover(mode: FailureMode) {
        let name = format!("test_inject_then_recover_{mode}");
        let logctx = test_setup_log(&name);
        let dir = Utf8TempDir::new().unwrap();
        let injector = local_injector(&logctx.log, dir.path());
        let mut rng = StdRng::seed_from_u64(7);

        let before = storage_count(dir.path());
        assert_eq!(before, f64::from(UNITS));

        let plan = injector.plan(Host::Local, UNITS, 2, mode, &mut rng).unwrap();
        assert_eq!(plan.target_unit_ids.len(), 2);
        injector.inject(&plan).await.unwrap();
        assert_eq!(storage_count(dir.path()), before - 2.0);
        assert_eq!(injector.held_plans(), vec![plan.clone()]);

        injector.recover(&plan).await.unwrap();
        assert_eq!(storage_count(dir.path()), before);
        assert!(injector.held_plans().is_empty());

        // Recovery is idempotent.
        injector.recover(&plan).await.unwrap();
        assert_eq!(storage_count(dir.path()), before);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_inject_then_recover_soft() {
        inject_then_recover(FailureMode::Soft).await;
    }

    #[tokio::test]
    async fn test_inject_then_recover_hard() {
        inject_then_recover(FailureMode::Hard).await;
    }

    #[tokio::test]
    async fn test_inject_then_recover_rename() {
        inject_then_recover(FailureMode::Rename).await;
    }

    #[tokio::test]
    async fn test_rename_keeps_contents() {
        let logctx = test_setup_log("test_rename_keeps_contents");
        let dir = Utf8TempDir::new().unwrap();
        let injector = local_injector(&logctx.log, dir.path());
        let mut rng = StdRng::seed_from_u64(1);

        let plan = injector
            .plan(Host::Local, UNITS, UNITS, FailureMode::Rename, &mut rng)
            .unwrap();
        injector.inject(&plan).await.unwrap();
        for unit in &plan.unit_dirs {
            assert!(!unit.exists());
        }
        injector.recover(&plan).await.unwrap();
        for unit in &plan.unit_dirs {
            assert_eq!(std::fs::read(unit.join("blk_1")).unwrap(), b"block");
        }

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_too_many_units_rejected_before_any_command() {
        let logctx =
            test_setup_log("test_too_many_units_rejected_before_any_command");
        let fake = FakeExecutor::new(&logctx.log);
        let injector = FailureInjector::new(
            &logctx.log,
            fake.clone().as_executor(),
            layout(Utf8Path::new("/srv/dfs")),
            Duration::from_secs(5),
            None,
        );
        let mut rng = StdRng::seed_from_u64(0);

        let err = injector
            .plan(Host::from_name("dn1"), 3, 5, FailureMode::Hard, &mut rng)
            .unwrap_err();
        assert!(matches!(
            err,
            FailureError::TooManyUnits { requested: 5, available: 3 }
        ));
        assert!(matches!(
            injector.plan(Host::from_name("dn1"), 3, 0, FailureMode::Hard, &mut rng),
            Err(FailureError::NoUnits)
        ));
        assert!(fake.history().is_empty());
        assert!(injector.held_plans().is_empty());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_recover_all_reverses_held_plans() {
        let logctx = test_setup_log("test_recover_all_reverses_held_plans");
        let dir = Utf8TempDir::new().unwrap();
        let injector = local_injector(&logctx.log, dir.path());
        let mut rng = StdRng::seed_from_u64(3);

        let plan = injector
            .plan(Host::Local, UNITS, 3, FailureMode::Soft, &mut rng)
            .unwrap();
        injector.inject(&plan).await.unwrap();
        assert_eq!(storage_count(dir.path()), 1.0);

        assert!(injector.recover_all().await.is_empty());
        assert!(injector.held_plans().is_empty());
        assert_eq!(storage_count(dir.path()), f64::from(UNITS));

        logctx.cleanup_successful();
    }

    #[test]
    fn test_selection_is_without_replacement() {
        let logctx = test_setup_log("test_selection_is_without_replacement");
        let fake = FakeExecutor::new(&logctx.log);
        let injector = FailureInjector::new(
            &logctx.log,
            fake.as_executor(),
            layout(Utf8Path::new("/srv/dfs")),
            Duration::from_secs(5),
            None,
        );
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let plan = injector
                .plan(Host::Local, 8, 5, FailureMode::Soft, &mut rng)
                .unwrap();
            assert_eq!(plan.target_unit_ids.len(), 5);
            assert_eq!(plan.unit_dirs.len(), 5);
            assert!(plan.target_unit_ids.iter().all(|unit| *unit < 8));
        }
        assert_eq!("rename".parse::<FailureMode>().unwrap(), FailureMode::Rename);
        assert!("explode".parse::<FailureMode>().is_err());

        logctx.cleanup_successful();
    }
}
