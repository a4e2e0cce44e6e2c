// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running commands on cluster hosts, locally or over `ssh`.
//!
//! Execution never fails from the caller's point of view: a command that
//! exits non-zero, times out, or cannot be spawned at all still produces a
//! [`RemoteCommandResult`], and it is up to the caller to decide whether that
//! outcome matters.  This lets fan-out code treat one unreachable node as a
//! partial failure rather than aborting the whole batch.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Exit code reported when a command did not finish within its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;
/// Exit code reported when the command could not be started or awaited.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -2;
/// Exit code reported when the process was terminated by a signal.
pub const SIGNALED_EXIT_CODE: i32 = -3;

/// The machine a command runs on.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(from = "String", into = "String")]
pub enum Host {
    /// The machine the harness itself is running on; no `ssh` hop.
    Local,
    Remote(String),
}

impl Host {
    /// Interprets a node name from configuration.  `local` and `localhost`
    /// are taken to mean this machine.
    pub fn from_name(name: &str) -> Host {
        match name {
            "local" | "localhost" => Host::Local,
            other => Host::Remote(other.to_owned()),
        }
    }

    /// The name other hosts use to reach this one.
    pub fn address(&self) -> &str {
        match self {
            Host::Local => "localhost",
            Host::Remote(name) => name,
        }
    }
}

impl From<String> for Host {
    fn from(name: String) -> Host {
        Host::from_name(&name)
    }
}

impl From<Host> for String {
    fn from(host: Host) -> String {
        host.to_string()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Local => write!(f, "local"),
            Host::Remote(name) => write!(f, "{name}"),
        }
    }
}

/// The outcome of running one command on one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCommandResult {
    pub host: Host,
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl RemoteCommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    /// A one-line description of why the command failed, suitable for log
    /// lines and error messages.
    pub fn failure_reason(&self) -> String {
        let detail = self
            .stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("<no stderr>")
            .trim();
        match self.exit_code {
            TIMEOUT_EXIT_CODE => format!("timed out: {detail}"),
            SPAWN_FAILURE_EXIT_CODE => format!("could not run: {detail}"),
            SIGNALED_EXIT_CODE => format!("killed by signal: {detail}"),
            code => format!("exit code {code}: {detail}"),
        }
    }
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Describes an "executor", which can run commands on a [`Host`].
///
/// - In production, this is a [`HostExecutor`].
/// - Under test, a `FakeExecutor` with a scripted handler may be used.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `command` through a shell on `host`, waiting at most `timeout`
    /// for it to complete.
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        timeout: Duration,
    ) -> RemoteCommandResult;
}

fn log_input(log: &Logger, id: u64, host: &Host, command: &str) {
    info!(
        log,
        "running command";
        "id" => id,
        "host" => %host,
        "command" => command,
    );
}

fn log_output(log: &Logger, id: u64, result: &RemoteCommandResult) {
    if result.timed_out() {
        warn!(
            log,
            "command timed out";
            "id" => id,
            "host" => %result.host,
            "duration" => ?result.duration,
        );
    } else {
        info!(
            log,
            "finished running command";
            "id" => id,
            "host" => %result.host,
            "result" => if result.success() { "OK" } else { "ERROR" },
            "status" => result.exit_code,
            "duration" => ?result.duration,
        );
    }
    if !result.stdout.is_empty() {
        debug!(
            log,
            "finished command stdout";
            "id" => id,
            "stdout" => &result.stdout,
        );
    }
    if !result.stderr.is_empty() {
        debug!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => &result.stderr,
        );
    }
}

/// How remote hosts are reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshOptions {
    pub user: Option<String>,
    pub connect_timeout: Duration,
    pub extra_args: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> SshOptions {
        SshOptions {
            user: None,
            connect_timeout: Duration::from_secs(10),
            extra_args: Vec::new(),
        }
    }
}

/// Runs commands with `sh -c` locally and through `ssh` otherwise.
pub struct HostExecutor {
    log: Logger,
    ssh: SshOptions,
    counter: AtomicU64,
}

impl HostExecutor {
    pub fn new(log: &Logger, ssh: SshOptions) -> Arc<HostExecutor> {
        Arc::new(HostExecutor {
            log: log.new(slog::o!("component" => "HostExecutor")),
            ssh,
            counter: AtomicU64::new(0),
        })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn build_command(
        &self,
        host: &Host,
        command: &str,
    ) -> tokio::process::Command {
        match host {
            Host::Local => {
                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
            Host::Remote(name) => {
                let mut cmd = tokio::process::Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"])
                    .arg("-o")
                    .arg(format!(
                        "ConnectTimeout={}",
                        self.ssh.connect_timeout.as_secs().max(1)
                    ));
                if let Some(user) = &self.ssh.user {
                    cmd.arg("-l").arg(user);
                }
                cmd.args(&self.ssh.extra_args).arg(name).arg("--").arg(command);
                cmd
            }
        }
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        timeout: Duration,
    ) -> RemoteCommandResult {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, host, command);

        let mut cmd = self.build_command(host, command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let finish = |exit_code: i32, stdout: String, stderr: String| {
            RemoteCommandResult {
                host: host.clone(),
                command: command.to_owned(),
                exit_code,
                stdout,
                stderr,
                duration: start.elapsed(),
            }
        };

        let result = match cmd.spawn() {
            Err(err) => finish(
                SPAWN_FAILURE_EXIT_CODE,
                String::new(),
                format!("failed to spawn: {err}"),
            ),
            // Dropping the `wait_with_output` future on timeout kills the
            // child, courtesy of `kill_on_drop`.
            Ok(child) => {
                match tokio::time::timeout(timeout, child.wait_with_output())
                    .await
                {
                    Ok(Ok(output)) => finish(
                        output.status.code().unwrap_or(SIGNALED_EXIT_CODE),
                        String::from_utf8_lossy(&output.stdout).into_owned(),
                        String::from_utf8_lossy(&output.stderr).into_owned(),
                    ),
                    Ok(Err(err)) => finish(
                        SPAWN_FAILURE_EXIT_CODE,
                        String::new(),
                        format!("failed to wait for command: {err}"),
                    ),
                    Err(_) => finish(
                        TIMEOUT_EXIT_CODE,
                        String::new(),
                        format!("command timed out after {timeout:?}"),
                    ),
                }
            }
        };

        log_output(&self.log, id, &result);
        result
    }
}

#[cfg(any(test, feature = "testing"))]
pub use fake::*;

#[cfg(any(test, feature = "testing"))]
mod fake {
    use super::*;
    use std::sync::Mutex;

    /// What a [`FakeExecutor`] handler wants a command to look like.
    #[derive(Clone, Debug, Default)]
    pub struct FakeResponse {
        pub exit_code: i32,
        pub stdout: String,
        pub stderr: String,
    }

    impl FakeResponse {
        pub fn success() -> FakeResponse {
            FakeResponse::default()
        }

        pub fn stdout(stdout: impl Into<String>) -> FakeResponse {
            FakeResponse { stdout: stdout.into(), ..Default::default() }
        }

        pub fn failure(exit_code: i32, stderr: impl Into<String>) -> FakeResponse {
            FakeResponse {
                exit_code,
                stdout: String::new(),
                stderr: stderr.into(),
            }
        }

        pub fn timeout() -> FakeResponse {
            FakeResponse::failure(TIMEOUT_EXIT_CODE, "command timed out")
        }
    }

    /// Handler called for every command the fake executes.
    pub type HandlerFn = dyn FnMut(&Host, &str) -> FakeResponse + Send;
    pub type BoxedHandlerFn = Box<HandlerFn>;

    /// An executor which records every command and answers with whatever its
    /// handler returns.  By default every command succeeds with no output.
    pub struct FakeExecutor {
        log: Logger,
        counter: AtomicU64,
        handler: Mutex<BoxedHandlerFn>,
        history: Mutex<Vec<(Host, String)>>,
    }

    impl FakeExecutor {
        pub fn new(log: &Logger) -> Arc<FakeExecutor> {
            Arc::new(FakeExecutor {
                log: log.new(slog::o!("component" => "FakeExecutor")),
                counter: AtomicU64::new(0),
                handler: Mutex::new(Box::new(|_, _| FakeResponse::success())),
                history: Mutex::new(Vec::new()),
            })
        }

        /// Set the handler to an arbitrary function.
        pub fn set_handler(
            &self,
            f: impl FnMut(&Host, &str) -> FakeResponse + Send + 'static,
        ) {
            *self.handler.lock().unwrap() = Box::new(f);
        }

        /// Every command executed so far, in order.
        pub fn history(&self) -> Vec<(Host, String)> {
            self.history.lock().unwrap().clone()
        }

        /// Commands executed so far that contain `needle`.
        pub fn commands_matching(&self, needle: &str) -> Vec<(Host, String)> {
            self.history()
                .into_iter()
                .filter(|(_, command)| command.contains(needle))
                .collect()
        }

        /// Perform some type coercion to access a commonly-used trait object.
        pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
            self
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn execute(
            &self,
            host: &Host,
            command: &str,
            _timeout: Duration,
        ) -> RemoteCommandResult {
            let id = self.counter.fetch_add(1, Ordering::SeqCst);
            log_input(&self.log, id, host, command);
            self.history
                .lock()
                .unwrap()
                .push((host.clone(), command.to_owned()));

            let response = (self.handler.lock().unwrap())(host, command);
            let result = RemoteCommandResult {
                host: host.clone(),
                command: command.to_owned(),
                exit_code: response.exit_code,
                stdout: response.stdout,
                stderr: response.stderr,
                duration: Duration::ZERO,
            };
            log_output(&self.log, id, &result);
            result
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dfs_harness_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn test_local_command_captures_output() {
        let logctx = test_setup_log("test_local_command_captures_output");
        let executor =
            HostExecutor::new(&logctx.log, SshOptions::default()).as_executor();

        let result = executor
            .execute(
                &Host::Local,
                "echo hello; echo oops >&2; exit 3",
                Duration::from_secs(10),
            )
            .await;
        assert_eq!(result.host, Host::Local);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "oops\n");
        assert!(!result.success());
        assert_eq!(result.failure_reason(), "exit code 3: oops");

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_timeout_is_a_result_not_an_error() {
        let logctx = test_setup_log("test_timeout_is_a_result_not_an_error");
        let executor =
            HostExecutor::new(&logctx.log, SshOptions::default()).as_executor();

        let result = executor
            .execute(&Host::Local, "sleep 30", Duration::from_millis(100))
            .await;
        assert!(result.timed_out());
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("timed out"), "{}", result.stderr);
        assert!(result.duration < Duration::from_secs(30));

        logctx.cleanup_successful();
    }

    #[test]
    fn test_host_names() {
        assert_eq!(Host::from_name("localhost"), Host::Local);
        assert_eq!(Host::from_name("local"), Host::Local);
        assert_eq!(
            Host::from_name("dn1"),
            Host::Remote(String::from("dn1"))
        );
        assert_eq!(Host::Local.address(), "localhost");
        assert_eq!(Host::from_name("dn1").to_string(), "dn1");
    }

    #[test]
    fn test_remote_command_line() {
        let logctx = test_setup_log("test_remote_command_line");
        let executor = HostExecutor::new(
            &logctx.log,
            SshOptions {
                user: Some(String::from("hadoop")),
                connect_timeout: Duration::from_secs(5),
                extra_args: vec![String::from("-q")],
            },
        );
        let cmd = executor.build_command(&Host::from_name("dn1"), "ls /");
        let std = cmd.as_std();
        assert_eq!(std.get_program(), "ssh");
        let args: Vec<_> =
            std.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=5",
                "-l",
                "hadoop",
                "-q",
                "dn1",
                "--",
                "ls /"
            ]
        );
        logctx.cleanup_successful();
    }
}
