//! Orchestrator wired to scripted collaborators and a temporary store.

use std::time::Duration;

use camino::Utf8PathBuf;
use clwd::test_support::{ScriptedProvider, ScriptedRunner, StaticCredentialSource};
use clwd::{
    HardeningTier, InitOptions, LifecycleOrchestrator, LifecyclePolicy, Project, ProjectSpec,
    ProjectStore, SshConnector, SshSettings,
};
use rstest::fixture;
use tempfile::TempDir;

pub const LIVENESS_OUTPUT: &str = "clwd-liveness-ok\n";
pub const BOOTSTRAP_OUTPUT: &str = "packages installed\nCLWD_BOOTSTRAP_OK\n";

pub type TestOrchestrator =
    LifecycleOrchestrator<ScriptedProvider, StaticCredentialSource, ScriptedRunner>;

pub struct Harness {
    _dir: TempDir,
    pub provider: ScriptedProvider,
    pub credentials: StaticCredentialSource,
    pub runner: ScriptedRunner,
    pub orchestrator: TestOrchestrator,
}

pub fn fast_policy() -> LifecyclePolicy {
    LifecyclePolicy {
        poll_initial: Duration::from_millis(1),
        poll_factor: 2,
        poll_max: Duration::from_millis(4),
        provision_budget: Duration::from_millis(40),
        delete_attempts: 3,
        delete_interval: Duration::from_millis(1),
        command_timeout: Duration::from_secs(5),
        bootstrap_timeout: Duration::from_secs(5),
        liveness_timeout: Duration::from_secs(5),
    }
}

pub fn fast_ssh_settings() -> SshSettings {
    SshSettings {
        ssh_bin: String::from("ssh"),
        user: String::from("root"),
        port: 22,
        identity_file: None,
        connect_attempts: 2,
        connect_interval: Duration::from_millis(1),
        connect_timeout: Duration::from_secs(1),
    }
}

pub fn small_spec() -> ProjectSpec {
    ProjectSpec {
        size: String::from("small"),
        region: String::from("nbg1"),
        image: String::from("ubuntu-24.04"),
        hardening_tier: HardeningTier::None,
    }
}

impl Harness {
    pub fn new(credentials: StaticCredentialSource) -> Self {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-UTF-8 tempdir {}", path.display()));
        let store = ProjectStore::open(root).unwrap_or_else(|err| panic!("open store: {err}"));
        let provider = ScriptedProvider::default();
        let runner = ScriptedRunner::new();
        let orchestrator = LifecycleOrchestrator::new(
            store,
            provider.clone(),
            credentials.clone(),
            SshConnector::new(fast_ssh_settings(), runner.clone()),
            fast_policy(),
        );
        Self {
            _dir: dir,
            provider,
            credentials,
            runner,
            orchestrator,
        }
    }

    pub fn store(&self) -> &ProjectStore {
        self.orchestrator.store()
    }

    /// Queues a created instance that reports `address` on its first poll.
    pub fn script_instance(&self, instance_id: &str, address: &str) {
        self.provider.push_create(Ok(instance_id));
        self.provider.push_running(address);
    }

    /// Queues the SSH traffic of a clean bootstrap: probe, optional
    /// credential upload, script upload, script run and liveness probe.
    pub fn script_bootstrap(&self, with_credential: bool) {
        self.runner.push_success();
        if with_credential {
            self.runner.push_success();
        }
        self.runner.push_success();
        self.runner.push_output(Some(0), BOOTSTRAP_OUTPUT, "");
        self.runner.push_output(Some(0), LIVENESS_OUTPUT, "");
    }

    /// Drives `name` to `ready` on `instance_id` at `address`.
    pub async fn ready_project(&self, name: &str, instance_id: &str, address: &str) -> Project {
        self.script_instance(instance_id, address);
        self.script_bootstrap(true);
        self.orchestrator
            .init(name, &small_spec(), InitOptions::default())
            .await
            .unwrap_or_else(|err| panic!("init {name} failed: {err}"))
    }
}

#[fixture]
pub fn harness() -> Harness {
    Harness::new(StaticCredentialSource::with_secret("tok-123"))
}
