//! Test support utilities shared across unit and integration tests.
//!
//! The fakes here record every call they receive and replay queued
//! responses in FIFO order, so lifecycle tests can script a full run
//! without spawning processes or touching the network.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::credential::{
    CredentialError, CredentialFuture, CredentialSource, SESSION_FILE_INSTALL_PATH, SecretBlob,
};
use crate::provider::{
    InstanceSpec, InstanceState, InstanceStatus, Provider, ProviderError, ProviderFuture,
};
use crate::ssh::{CommandOutput, CommandRunner, RunOptions, RunnerError, RunnerFuture};

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes fed to stdin, if any.
    pub stdin: Option<Vec<u8>>,
    /// Timeout requested for the call.
    pub timeout: Option<Duration>,
    /// Whether output streaming was requested.
    pub stream: bool,
    /// Whether the call went through `run_interactive`.
    pub interactive: bool,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the final argument, which for `ssh` is the remote command.
    #[must_use]
    pub fn last_arg(&self) -> String {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// When the queue is empty the runner reports a spawn failure.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<StdMutex<VecDeque<Result<CommandOutput, RunnerError>>>>,
    interactive: Arc<StdMutex<VecDeque<Option<i32>>>>,
    invocations: Arc<StdMutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Number of responses still queued.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.responses).len()
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes a runner error.
    pub fn push_error(&self, error: RunnerError) {
        lock(&self.responses).push_back(Err(error));
    }

    /// Pushes a timeout for the next call.
    pub fn push_timeout(&self) {
        self.push_error(RunnerError::TimedOut {
            program: String::from("ssh"),
            timeout: Duration::from_secs(1),
        });
    }

    /// Queues the exit status of the next interactive call.
    pub fn push_interactive(&self, code: Option<i32>) {
        lock(&self.interactive).push_back(code);
    }

    fn record(&self, invocation: CommandInvocation) {
        lock(&self.invocations).push(invocation);
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        options: RunOptions,
    ) -> RunnerFuture<'a, CommandOutput> {
        Box::pin(async move {
            self.record(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
                stdin: options.stdin,
                timeout: options.timeout,
                stream: options.stream,
                interactive: false,
            });
            lock(&self.responses)
                .pop_front()
                .unwrap_or_else(|| {
                    Err(RunnerError::Spawn {
                        program: program.to_owned(),
                        message: String::from("no scripted response available"),
                    })
                })
        })
    }

    fn run_interactive<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> RunnerFuture<'a, Option<i32>> {
        Box::pin(async move {
            self.record(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
                stdin: None,
                timeout: None,
                stream: false,
                interactive: true,
            });
            let queued = lock(&self.interactive).pop_front();
            queued.ok_or_else(|| RunnerError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted interactive response available"),
            })
        })
    }
}

/// A call received by [`ScriptedProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderCall {
    /// `create` with the requested spec.
    Create(InstanceSpec),
    /// `get_status` for an instance.
    GetStatus(String),
    /// `delete` for an instance.
    Delete(String),
}

/// Provider fake with per-operation FIFO queues.
///
/// Unscripted calls fall back to defaults: `create` is rejected, `get_status`
/// reports a pending instance and `delete` succeeds.
#[derive(Clone, Debug)]
pub struct ScriptedProvider {
    id: String,
    creates: Arc<StdMutex<VecDeque<Result<String, ProviderError>>>>,
    statuses: Arc<StdMutex<VecDeque<Result<InstanceStatus, ProviderError>>>>,
    deletes: Arc<StdMutex<VecDeque<Result<(), ProviderError>>>>,
    calls: Arc<StdMutex<Vec<ProviderCall>>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new("hetzner")
    }
}

impl ScriptedProvider {
    /// Creates a provider reporting `id`.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            creates: Arc::default(),
            statuses: Arc::default(),
            deletes: Arc::default(),
            calls: Arc::default(),
        }
    }

    /// Queues the result of the next `create`.
    pub fn push_create(&self, result: Result<&str, ProviderError>) {
        lock(&self.creates).push_back(result.map(str::to_owned));
    }

    /// Queues the result of the next `get_status`.
    pub fn push_status(&self, result: Result<InstanceStatus, ProviderError>) {
        lock(&self.statuses).push_back(result);
    }

    /// Queues a running status with `address`.
    ///
    /// # Panics
    ///
    /// Panics when `address` is not an IP address.
    pub fn push_running(&self, address: &str) {
        let parsed = address
            .parse()
            .unwrap_or_else(|err| panic!("invalid test address {address}: {err}"));
        self.push_status(Ok(InstanceStatus {
            state: InstanceState::Running,
            address: Some(parsed),
        }));
    }

    /// Queues a pending status.
    pub fn push_pending(&self) {
        self.push_status(Ok(InstanceStatus {
            state: InstanceState::Pending,
            address: None,
        }));
    }

    /// Queues the result of the next `delete`.
    pub fn push_delete(&self, result: Result<(), ProviderError>) {
        lock(&self.deletes).push_back(result);
    }

    /// Returns every call received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    /// Counts `create` calls.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(|call| matches!(call, ProviderCall::Create(_)))
    }

    /// Counts `delete` calls.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(|call| matches!(call, ProviderCall::Delete(_)))
    }

    fn count(&self, predicate: impl Fn(&ProviderCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: ProviderCall) {
        lock(&self.calls).push(call);
    }
}

impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn create<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.record(ProviderCall::Create(spec.clone()));
            lock(&self.creates).pop_front().unwrap_or_else(|| {
                Err(ProviderError::Rejected(String::from(
                    "no scripted create response",
                )))
            })
        })
    }

    fn get_status<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceStatus> {
        Box::pin(async move {
            self.record(ProviderCall::GetStatus(instance_id.to_owned()));
            lock(&self.statuses).pop_front().unwrap_or(Ok(InstanceStatus {
                state: InstanceState::Pending,
                address: None,
            }))
        })
    }

    fn delete<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(ProviderCall::Delete(instance_id.to_owned()));
            lock(&self.deletes).pop_front().unwrap_or(Ok(()))
        })
    }
}

/// Credential source returning a fixed secret, or reporting that none
/// exists.
#[derive(Clone, Debug)]
pub struct StaticCredentialSource {
    secret: Option<SecretBlob>,
    calls: Arc<AtomicUsize>,
}

impl StaticCredentialSource {
    /// Creates a source that returns `secret`.
    #[must_use]
    pub fn with_secret(secret: &str) -> Self {
        Self {
            secret: Some(SecretBlob::new(secret.as_bytes().to_vec())),
            calls: Arc::default(),
        }
    }

    /// Creates a source that fails with `NotAuthenticated`.
    #[must_use]
    pub fn missing() -> Self {
        Self {
            secret: None,
            calls: Arc::default(),
        }
    }

    /// Number of `get` calls received.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialSource for StaticCredentialSource {
    fn get(&self) -> CredentialFuture<'_> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.secret.clone().ok_or_else(|| {
                CredentialError::NotAuthenticated(String::from("no scripted credential"))
            })
        })
    }

    fn install_path(&self) -> &str {
        SESSION_FILE_INSTALL_PATH
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes variables while holding the global mutex, restoring them on
    /// drop.
    pub async fn remove_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }
        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
