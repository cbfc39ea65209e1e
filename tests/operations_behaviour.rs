//! Behavioural scenarios for operations on existing projects.

#[path = "common/harness.rs"]
mod common;

use std::time::Duration;

use clwd::test_support::ProviderCall;
use clwd::{
    DestroyOutcome, InitOptions, InstanceState, LifecycleError, LifecycleStep, ProjectStatus,
    ProviderError, SshError,
};
use common::{Harness, harness, small_spec};
use rstest::rstest;

async fn failed_provision(harness: &Harness, name: &str) {
    harness
        .provider
        .push_create(Err(ProviderError::Quota(String::from("limit reached"))));
    harness
        .orchestrator
        .init(name, &small_spec(), InitOptions::default())
        .await
        .expect_err("create is refused");
}

#[rstest]
#[tokio::test]
async fn destroy_is_idempotent(harness: Harness) {
    harness.ready_project("demo", "i-1", "203.0.113.5").await;

    let first = harness
        .orchestrator
        .destroy("demo")
        .await
        .unwrap_or_else(|err| panic!("destroy failed: {err}"));
    assert_eq!(
        first,
        DestroyOutcome::Destroyed {
            instance_id: Some(String::from("i-1"))
        }
    );
    let second = harness
        .orchestrator
        .destroy("demo")
        .await
        .unwrap_or_else(|err| panic!("second destroy failed: {err}"));
    assert_eq!(second, DestroyOutcome::AlreadyDestroyed);

    assert_eq!(harness.provider.delete_count(), 1);
    assert_eq!(
        harness
            .store()
            .get("demo")
            .unwrap_or_else(|err| panic!("read store: {err}")),
        None
    );
    assert!(
        harness
            .store()
            .tombstone("demo")
            .unwrap_or_else(|err| panic!("read store: {err}"))
            .is_some()
    );
}

#[rstest]
#[tokio::test]
async fn destroyed_name_can_be_reused(harness: Harness) {
    harness.ready_project("demo", "i-1", "203.0.113.5").await;
    harness
        .orchestrator
        .destroy("demo")
        .await
        .unwrap_or_else(|err| panic!("destroy failed: {err}"));

    let project = harness.ready_project("demo", "i-2", "203.0.113.6").await;
    assert_eq!(project.instance_id.as_deref(), Some("i-2"));
    assert_eq!(project.status, ProjectStatus::Ready);
}

#[rstest]
#[tokio::test]
async fn destroy_of_unknown_project_makes_no_provider_call(harness: Harness) {
    let err = harness
        .orchestrator
        .destroy("ghost")
        .await
        .expect_err("unknown project");
    assert!(err.is_not_found());
    assert!(err.to_string().contains("not found"));
    assert!(harness.provider.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn destroy_exhausting_retries_keeps_record(harness: Harness) {
    harness.ready_project("demo", "i-1", "203.0.113.5").await;
    for _ in 0..3 {
        harness
            .provider
            .push_delete(Err(ProviderError::Transient(String::from("HTTP 503"))));
    }

    let err = harness
        .orchestrator
        .destroy("demo")
        .await
        .expect_err("every delete fails");

    assert!(matches!(err, LifecycleError::DestroyFailed { attempts: 3, .. }));
    assert_eq!(err.step(), LifecycleStep::Destroy);
    assert_eq!(harness.provider.delete_count(), 3);
    let stored = harness
        .store()
        .get("demo")
        .unwrap_or_else(|err| panic!("read store: {err}"))
        .unwrap_or_else(|| panic!("record is kept"));
    assert_eq!(stored.status, ProjectStatus::Destroying);
    assert!(stored.last_error.contains("HTTP 503"), "{}", stored.last_error);
}

#[rstest]
#[tokio::test]
async fn destroy_stops_on_non_retryable_error(harness: Harness) {
    harness.ready_project("demo", "i-1", "203.0.113.5").await;
    harness
        .provider
        .push_delete(Err(ProviderError::Auth(String::from("token revoked"))));

    let err = harness
        .orchestrator
        .destroy("demo")
        .await
        .expect_err("auth failure");
    assert!(matches!(err, LifecycleError::DestroyFailed { attempts: 1, .. }));
    assert_eq!(harness.provider.delete_count(), 1);
}

#[rstest]
#[tokio::test]
async fn destroy_without_instance_only_removes_record(harness: Harness) {
    failed_provision(&harness, "demo").await;

    let outcome = harness
        .orchestrator
        .destroy("demo")
        .await
        .unwrap_or_else(|err| panic!("destroy failed: {err}"));
    assert_eq!(outcome, DestroyOutcome::Destroyed { instance_id: None });
    assert_eq!(harness.provider.delete_count(), 0);
}

#[rstest]
#[tokio::test]
async fn exec_and_open_refuse_projects_that_are_not_ready(harness: Harness) {
    failed_provision(&harness, "demo").await;

    let exec_err = harness
        .orchestrator
        .exec("demo", "uptime", None)
        .await
        .expect_err("exec refused");
    let open_err = harness
        .orchestrator
        .open("demo", None)
        .await
        .expect_err("open refused");

    for err in [exec_err, open_err] {
        assert!(
            matches!(err, LifecycleError::StateMismatch { status: ProjectStatus::ProvisionFailed, .. }),
            "{err}"
        );
    }
    assert!(harness.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn exec_returns_remote_output(harness: Harness) {
    harness.ready_project("demo", "i-1", "203.0.113.5").await;
    let before = harness.runner.invocations().len();
    harness.runner.push_output(Some(3), "partial\n", "warning\n");

    let output = harness
        .orchestrator
        .exec("demo", "make test", Some(Duration::from_secs(42)))
        .await
        .unwrap_or_else(|err| panic!("exec failed: {err}"));

    assert_eq!(output.exit_code, 3);
    assert_eq!(output.stdout, "partial\n");
    assert_eq!(output.stderr, "warning\n");
    let invocations = harness.runner.invocations();
    let call = invocations
        .get(before)
        .unwrap_or_else(|| panic!("exec should invoke ssh"));
    assert_eq!(call.last_arg(), "make test");
    assert_eq!(call.timeout, Some(Duration::from_secs(42)));
    assert!(call.command_string().contains("root@203.0.113.5"));
}

#[rstest]
#[tokio::test]
async fn exec_timeout_is_reported(harness: Harness) {
    harness.ready_project("demo", "i-1", "203.0.113.5").await;
    harness.runner.push_timeout();

    let err = harness
        .orchestrator
        .exec("demo", "sleep 999", None)
        .await
        .expect_err("command times out");
    assert!(matches!(
        err,
        LifecycleError::Ssh {
            step: LifecycleStep::Remote,
            source: SshError::RemoteTimeout { .. }
        }
    ));
}

#[rstest]
#[tokio::test]
async fn open_runs_an_interactive_session(harness: Harness) {
    harness.ready_project("demo", "i-1", "203.0.113.5").await;
    harness.runner.push_interactive(Some(130));

    let code = harness
        .orchestrator
        .open("demo", Some("claude"))
        .await
        .unwrap_or_else(|err| panic!("open failed: {err}"));

    assert_eq!(code, 130);
    let invocations = harness.runner.invocations();
    let session = invocations
        .last()
        .unwrap_or_else(|| panic!("open should invoke ssh"));
    assert!(session.interactive);
    assert_eq!(session.last_arg(), "claude");
}

#[rstest]
#[tokio::test]
async fn status_reports_live_state_without_recording_errors(harness: Harness) {
    harness.ready_project("demo", "i-1", "203.0.113.5").await;
    harness.provider.push_running("203.0.113.5");
    harness
        .provider
        .push_status(Err(ProviderError::Transient(String::from("HTTP 500"))));

    let healthy = harness
        .orchestrator
        .status("demo")
        .await
        .unwrap_or_else(|err| panic!("status failed: {err}"));
    assert!(matches!(
        healthy.instance,
        Some(Ok(ref status)) if status.state == InstanceState::Running
    ));

    let degraded = harness
        .orchestrator
        .status("demo")
        .await
        .unwrap_or_else(|err| panic!("status failed: {err}"));
    assert!(matches!(degraded.instance, Some(Err(ProviderError::Transient(_)))));
    assert_eq!(degraded.project.status, ProjectStatus::Ready);
    assert!(degraded.project.last_error.is_empty());
    assert!(
        harness
            .provider
            .calls()
            .iter()
            .any(|call| *call == ProviderCall::GetStatus(String::from("i-1")))
    );
}

#[rstest]
#[tokio::test]
async fn logs_tail_the_remote_bootstrap_log(harness: Harness) {
    harness.ready_project("demo", "i-1", "203.0.113.5").await;
    harness.runner.push_output(Some(0), "line a\nline b\n", "");

    let report = harness
        .orchestrator
        .logs("demo", 20)
        .await
        .unwrap_or_else(|err| panic!("logs failed: {err}"));

    assert!(matches!(report.remote, Some(Ok(ref output)) if output.stdout == "line a\nline b\n"));
    let invocations = harness.runner.invocations();
    let call = invocations
        .last()
        .unwrap_or_else(|| panic!("logs should invoke ssh"));
    assert_eq!(call.last_arg(), "tail -n 20 /var/log/clwd-bootstrap.log");
}

#[rstest]
#[tokio::test]
async fn logs_without_address_report_last_error_only(harness: Harness) {
    failed_provision(&harness, "demo").await;

    let report = harness
        .orchestrator
        .logs("demo", 50)
        .await
        .unwrap_or_else(|err| panic!("logs failed: {err}"));

    assert!(report.remote.is_none());
    assert_eq!(report.project.last_error, "limit reached");
    assert!(harness.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn list_is_sorted_by_name(harness: Harness) {
    failed_provision(&harness, "zeta").await;
    failed_provision(&harness, "alpha").await;

    let names: Vec<String> = harness
        .orchestrator
        .list()
        .unwrap_or_else(|err| panic!("list failed: {err}"))
        .into_iter()
        .map(|project| project.name)
        .collect();
    assert_eq!(names, ["alpha", "zeta"]);

    let shown = harness
        .orchestrator
        .show("alpha")
        .unwrap_or_else(|err| panic!("show failed: {err}"));
    assert_eq!(shown.status, ProjectStatus::ProvisionFailed);
}
