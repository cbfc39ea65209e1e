//! Behavioural scenarios for `init` and its resume paths.

#[path = "common/harness.rs"]
mod common;

use clwd::test_support::{ProviderCall, StaticCredentialSource};
use clwd::{InitOptions, LifecycleError, LifecycleStep, ProjectStatus, ProviderError};
use common::{BOOTSTRAP_OUTPUT, Harness, harness, small_spec};
use rstest::rstest;

#[rstest]
#[tokio::test]
async fn init_reaches_ready_after_one_pending_poll(harness: Harness) {
    harness.provider.push_create(Ok("i-1"));
    harness.provider.push_pending();
    harness.provider.push_running("203.0.113.5");
    harness.script_bootstrap(true);

    let project = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .unwrap_or_else(|err| panic!("init failed: {err}"));

    assert_eq!(project.name, "demo");
    assert_eq!(project.instance_id.as_deref(), Some("i-1"));
    assert_eq!(project.address.map(|addr| addr.to_string()).as_deref(), Some("203.0.113.5"));
    assert_eq!(project.status, ProjectStatus::Ready);
    assert!(project.last_error.is_empty());

    let stored = harness
        .store()
        .get("demo")
        .unwrap_or_else(|err| panic!("read store: {err}"));
    assert_eq!(stored, Some(project));
    assert_eq!(harness.credentials.calls(), 1);
    assert_eq!(harness.runner.pending(), 0);
}

#[rstest]
#[tokio::test]
async fn credential_is_uploaded_with_owner_only_mode(harness: Harness) {
    harness.script_instance("i-1", "203.0.113.5");
    harness.script_bootstrap(true);

    harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .unwrap_or_else(|err| panic!("init failed: {err}"));

    let invocations = harness.runner.invocations();
    let upload = invocations
        .get(1)
        .unwrap_or_else(|| panic!("expected a credential upload"));
    assert_eq!(upload.stdin.as_deref(), Some("tok-123".as_bytes()));
    assert!(upload.last_arg().contains("chmod 600"), "{}", upload.last_arg());
    assert!(upload.last_arg().contains("/root/.claude.json"), "{}", upload.last_arg());
    assert!(
        invocations
            .iter()
            .all(|call| !call.command_string().contains("tok-123")),
        "secret must only travel on stdin"
    );
}

#[rstest]
#[tokio::test]
async fn create_failure_skips_ssh_and_credentials(harness: Harness) {
    harness
        .provider
        .push_create(Err(ProviderError::Quota(String::from("limit reached"))));

    let err = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("quota error should fail init");

    assert!(matches!(err, LifecycleError::Provision(ProviderError::Quota(_))));
    assert_eq!(err.step(), LifecycleStep::Provision);
    assert!(harness.runner.invocations().is_empty());
    assert_eq!(harness.credentials.calls(), 0);

    let stored = harness
        .store()
        .get("demo")
        .unwrap_or_else(|err| panic!("read store: {err}"))
        .unwrap_or_else(|| panic!("failed project should be recorded"));
    assert_eq!(stored.status, ProjectStatus::ProvisionFailed);
    assert_eq!(stored.last_error, "limit reached");
    assert_eq!(stored.instance_id, None);
}

#[rstest]
#[tokio::test]
async fn poll_budget_exhaustion_keeps_instance(harness: Harness) {
    harness.provider.push_create(Ok("i-1"));

    let err = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("instance never becomes ready");

    assert!(matches!(err, LifecycleError::NetworkTimeout { ref instance_id, .. } if instance_id == "i-1"));
    assert_eq!(harness.provider.delete_count(), 0);
    assert!(harness.runner.invocations().is_empty());

    let stored = harness
        .store()
        .get("demo")
        .unwrap_or_else(|err| panic!("read store: {err}"))
        .unwrap_or_else(|| panic!("project should be recorded"));
    assert_eq!(stored.status, ProjectStatus::NetworkTimeout);
    assert_eq!(stored.instance_id.as_deref(), Some("i-1"));
    assert!(!stored.last_error.is_empty());
}

#[rstest]
#[tokio::test]
async fn transient_poll_errors_are_retried(harness: Harness) {
    harness.provider.push_create(Ok("i-1"));
    harness
        .provider
        .push_status(Err(ProviderError::Transient(String::from("HTTP 503"))));
    harness.provider.push_running("203.0.113.5");
    harness.script_bootstrap(true);

    let project = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .unwrap_or_else(|err| panic!("init failed: {err}"));
    assert_eq!(project.status, ProjectStatus::Ready);
}

#[rstest]
#[tokio::test]
async fn auth_error_while_polling_stops_immediately(harness: Harness) {
    harness.provider.push_create(Ok("i-1"));
    harness
        .provider
        .push_status(Err(ProviderError::Auth(String::from("token revoked"))));

    let err = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("auth error should abort polling");

    assert_eq!(err.step(), LifecycleStep::AwaitNetwork);
    let polls = harness
        .provider
        .calls()
        .into_iter()
        .filter(|call| matches!(call, ProviderCall::GetStatus(_)))
        .count();
    assert_eq!(polls, 1);
}

#[tokio::test]
async fn missing_credential_fails_bootstrap_without_script() {
    let harness = Harness::new(StaticCredentialSource::missing());
    harness.script_instance("i-1", "203.0.113.5");
    harness.runner.push_success();

    let err = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("credential is missing");

    assert!(matches!(err, LifecycleError::Credential(_)));
    assert_eq!(harness.runner.invocations().len(), 1);
    let stored = harness
        .store()
        .get("demo")
        .unwrap_or_else(|err| panic!("read store: {err}"))
        .unwrap_or_else(|| panic!("project should be recorded"));
    assert_eq!(stored.status, ProjectStatus::BootstrapFailed);
    assert_eq!(harness.provider.delete_count(), 0);
}

#[tokio::test]
async fn skip_auth_never_reads_the_credential() {
    let harness = Harness::new(StaticCredentialSource::missing());
    harness.script_instance("i-1", "203.0.113.5");
    harness.script_bootstrap(false);

    let project = harness
        .orchestrator
        .init(
            "demo",
            &small_spec(),
            InitOptions {
                skip_auth: true,
                ..InitOptions::default()
            },
        )
        .await
        .unwrap_or_else(|err| panic!("init failed: {err}"));

    assert_eq!(project.status, ProjectStatus::Ready);
    assert_eq!(harness.credentials.calls(), 0);
}

#[rstest]
#[case::script_failed(Some(1), "apt-get: unable to locate package\n", "status 1")]
#[case::sentinel_missing(Some(0), "half done\n", "completion marker")]
#[tokio::test]
async fn bootstrap_failures_are_recorded(
    harness: Harness,
    #[case] code: Option<i32>,
    #[case] stdout: &str,
    #[case] expected: &str,
) {
    harness.script_instance("i-1", "203.0.113.5");
    harness.runner.push_success();
    harness.runner.push_success();
    harness.runner.push_success();
    harness.runner.push_output(code, stdout, "");

    let err = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("bootstrap should fail");

    assert!(matches!(err, LifecycleError::BootstrapFailed { step: LifecycleStep::Bootstrap, .. }));
    let stored = harness
        .store()
        .get("demo")
        .unwrap_or_else(|err| panic!("read store: {err}"))
        .unwrap_or_else(|| panic!("project should be recorded"));
    assert_eq!(stored.status, ProjectStatus::BootstrapFailed);
    assert!(stored.last_error.contains(expected), "{}", stored.last_error);
    assert!(stored.address.is_some());
    assert_eq!(harness.provider.delete_count(), 0);
}

#[rstest]
#[tokio::test]
async fn bootstrap_output_never_leaks_the_secret(harness: Harness) {
    harness.script_instance("i-1", "203.0.113.5");
    harness.runner.push_success();
    harness.runner.push_success();
    harness.runner.push_success();
    harness
        .runner
        .push_output(Some(2), "reading token tok-123\n", "failed with tok-123");

    let err = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("bootstrap should fail");

    assert!(!err.to_string().contains("tok-123"), "{err}");
    let stored = harness
        .store()
        .get("demo")
        .unwrap_or_else(|err| panic!("read store: {err}"))
        .unwrap_or_else(|| panic!("project should be recorded"));
    assert!(!stored.last_error.contains("tok-123"), "{}", stored.last_error);
}

#[rstest]
#[tokio::test]
async fn liveness_mismatch_fails_bootstrap(harness: Harness) {
    harness.script_instance("i-1", "203.0.113.5");
    harness.runner.push_success();
    harness.runner.push_success();
    harness.runner.push_success();
    harness.runner.push_output(Some(0), BOOTSTRAP_OUTPUT, "");
    harness.runner.push_output(Some(0), "unexpected\n", "");

    let err = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("liveness should fail");

    assert_eq!(err.step(), LifecycleStep::Liveness);
}

#[rstest]
#[tokio::test]
async fn ready_project_cannot_be_initialised_again(harness: Harness) {
    harness.script_instance("i-1", "203.0.113.5");
    harness.script_bootstrap(true);
    harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .unwrap_or_else(|err| panic!("init failed: {err}"));

    let err = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("second init should be refused");
    assert!(matches!(err, LifecycleError::AlreadyExists { status: ProjectStatus::Ready, .. }));
    assert_eq!(harness.provider.create_count(), 1);
}

#[rstest]
#[tokio::test]
async fn network_timeout_resumes_polling_without_new_instance(harness: Harness) {
    harness.provider.push_create(Ok("i-1"));
    harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("first run times out");

    harness.provider.push_running("203.0.113.5");
    harness.script_bootstrap(true);
    let project = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .unwrap_or_else(|err| panic!("resume failed: {err}"));

    assert_eq!(project.status, ProjectStatus::Ready);
    assert_eq!(project.instance_id.as_deref(), Some("i-1"));
    assert_eq!(harness.provider.create_count(), 1);
}

#[rstest]
#[tokio::test]
async fn bootstrap_failure_resumes_at_connect(harness: Harness) {
    harness.script_instance("i-1", "203.0.113.5");
    harness.runner.push_success();
    harness.runner.push_success();
    harness.runner.push_success();
    harness.runner.push_output(Some(1), "boom\n", "");
    harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("first bootstrap fails");
    let calls_before = harness.provider.calls().len();

    harness.script_bootstrap(true);
    let project = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .unwrap_or_else(|err| panic!("resume failed: {err}"));

    assert_eq!(project.status, ProjectStatus::Ready);
    assert_eq!(harness.provider.calls().len(), calls_before);
}

#[rstest]
#[tokio::test]
async fn provision_failure_retries_create(harness: Harness) {
    harness
        .provider
        .push_create(Err(ProviderError::Transient(String::from("HTTP 502"))));
    harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("first create fails");

    harness.script_instance("i-2", "203.0.113.6");
    harness.script_bootstrap(true);
    let project = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .unwrap_or_else(|err| panic!("retry failed: {err}"));

    assert_eq!(project.instance_id.as_deref(), Some("i-2"));
    assert_eq!(harness.provider.create_count(), 2);
}

#[rstest]
#[tokio::test]
async fn destroying_record_requires_force(harness: Harness) {
    harness.script_instance("i-1", "203.0.113.5");
    harness.script_bootstrap(true);
    harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .unwrap_or_else(|err| panic!("init failed: {err}"));
    for _ in 0..3 {
        harness
            .provider
            .push_delete(Err(ProviderError::Transient(String::from("HTTP 503"))));
    }
    harness
        .orchestrator
        .destroy("demo")
        .await
        .expect_err("delete keeps failing");

    let err = harness
        .orchestrator
        .init("demo", &small_spec(), InitOptions::default())
        .await
        .expect_err("destroying record blocks init");
    assert!(matches!(err, LifecycleError::StateMismatch { status: ProjectStatus::Destroying, .. }));

    harness.script_instance("i-9", "203.0.113.9");
    harness.script_bootstrap(true);
    let project = harness
        .orchestrator
        .init(
            "demo",
            &small_spec(),
            InitOptions {
                force: true,
                ..InitOptions::default()
            },
        )
        .await
        .unwrap_or_else(|err| panic!("forced init failed: {err}"));
    assert_eq!(project.instance_id.as_deref(), Some("i-9"));
}

#[rstest]
#[case("")]
#[case("bad name")]
#[tokio::test]
async fn invalid_names_fail_before_any_call(harness: Harness, #[case] name: &str) {
    let err = harness
        .orchestrator
        .init(name, &small_spec(), InitOptions::default())
        .await
        .expect_err("invalid name");
    assert!(matches!(err, LifecycleError::InvalidName(_)));
    assert!(harness.provider.calls().is_empty());
}
