//! Unit tests for the SSH channel driven through a scripted runner.

use super::*;
use crate::test_support::{CommandInvocation, ScriptedRunner};
use rstest::{fixture, rstest};

const ADDRESS: &str = "203.0.113.5";

fn address() -> IpAddr {
    ADDRESS.parse().unwrap_or_else(|err| panic!("ip: {err}"))
}

#[fixture]
fn settings() -> SshSettings {
    SshSettings {
        ssh_bin: String::from("ssh"),
        user: String::from("root"),
        port: 22,
        identity_file: None,
        connect_attempts: 3,
        connect_interval: Duration::from_millis(1),
        connect_timeout: Duration::from_secs(10),
    }
}

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn connector(settings: SshSettings, runner: &ScriptedRunner) -> SshConnector<ScriptedRunner> {
    SshConnector::new(settings, runner.clone())
}

#[rstest]
fn batch_args_disable_prompts_and_target_user(settings: SshSettings, runner: ScriptedRunner) {
    let mut configured = settings;
    configured.port = 2222;
    configured.identity_file = Some(Utf8PathBuf::from("/keys/id_ed25519"));
    let channel = connector(configured, &runner).attach(address());

    let args: Vec<String> = channel
        .command_args("uptime", false)
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    let joined = args.join(" ");

    assert!(joined.starts_with("-o BatchMode=yes"));
    assert!(joined.contains("-o StrictHostKeyChecking=no"));
    assert!(joined.contains("-o ConnectTimeout=10"));
    assert!(joined.contains("-p 2222"));
    assert!(joined.contains("-i /keys/id_ed25519"));
    assert_eq!(args.get(args.len() - 2).map(String::as_str), Some("root@203.0.113.5"));
    assert_eq!(args.last().map(String::as_str), Some("uptime"));
}

#[rstest]
fn interactive_args_request_tty_without_command(settings: SshSettings, runner: ScriptedRunner) {
    let channel = connector(settings, &runner).attach(address());
    let args = channel.command_args("", true);
    assert_eq!(args.first(), Some(&OsString::from("-t")));
    assert!(!args.contains(&OsString::from("BatchMode=yes")));
    assert_eq!(args.last(), Some(&OsString::from("root@203.0.113.5")));
}

#[rstest]
#[tokio::test]
async fn connect_retries_until_probe_succeeds(settings: SshSettings, runner: ScriptedRunner) {
    runner.push_output(Some(255), "", "ssh: connect to host 203.0.113.5 port 22: Connection refused");
    runner.push_timeout();
    runner.push_success();

    let channel = connector(settings, &runner)
        .connect(address())
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"));

    assert_eq!(channel.address(), address());
    let calls = runner.invocations();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|call| call.last_arg() == "true"));
    assert!(
        calls
            .iter()
            .all(|call| call.timeout == Some(Duration::from_secs(10)))
    );
}

#[rstest]
#[tokio::test]
async fn connect_gives_up_after_attempt_budget(settings: SshSettings, runner: ScriptedRunner) {
    for _ in 0..3 {
        runner.push_output(Some(255), "", "No route to host");
    }

    let err = connector(settings, &runner)
        .connect(address())
        .await
        .expect_err("host never answers");

    assert_eq!(
        err,
        SshError::ConnectTimeout {
            address: address(),
            attempts: 3,
            last_error: String::from("No route to host"),
        }
    );
    assert_eq!(runner.invocations().len(), 3);
}

#[rstest]
#[case("Permission denied (publickey).")]
#[case("Host key verification failed.")]
#[tokio::test]
async fn connect_fails_fast_on_auth_rejection(
    settings: SshSettings,
    runner: ScriptedRunner,
    #[case] stderr: &str,
) {
    runner.push_output(Some(255), "", stderr);
    runner.push_success();

    let err = connector(settings, &runner)
        .connect(address())
        .await
        .expect_err("auth rejected");

    assert!(matches!(err, SshError::AuthRejected { .. }));
    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
#[tokio::test]
async fn connect_fails_fast_when_ssh_is_missing(settings: SshSettings, runner: ScriptedRunner) {
    let err = connector(settings, &runner)
        .connect(address())
        .await
        .expect_err("no ssh binary");
    assert!(matches!(err, SshError::Spawn { .. }));
    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
#[tokio::test]
async fn run_returns_remote_exit_status(settings: SshSettings, runner: ScriptedRunner) {
    runner.push_output(Some(3), "partial\n", "boom\n");
    let channel = connector(settings, &runner).attach(address());

    let output = channel
        .run("make test", Duration::from_secs(60))
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert_eq!(output.exit_code, 3);
    assert_eq!(output.stdout, "partial\n");
    let calls = runner.invocations();
    let call = calls.first().unwrap_or_else(|| panic!("no call recorded"));
    assert_eq!(call.last_arg(), "make test");
    assert_eq!(call.timeout, Some(Duration::from_secs(60)));
    assert!(!call.stream);
}

#[rstest]
#[tokio::test]
async fn run_maps_exit_255_to_transport(settings: SshSettings, runner: ScriptedRunner) {
    runner.push_output(Some(255), "", "Connection reset by peer");
    let channel = connector(settings, &runner).attach(address());

    let err = channel
        .run("uptime", Duration::from_secs(5))
        .await
        .expect_err("transport failure");
    assert_eq!(
        err,
        SshError::Transport {
            address: address(),
            message: String::from("Connection reset by peer"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn run_maps_timeout_to_remote_timeout(settings: SshSettings, runner: ScriptedRunner) {
    runner.push_timeout();
    let channel = connector(settings, &runner).attach(address());

    let err = channel
        .run("sleep 100", Duration::from_secs(7))
        .await
        .expect_err("timeout");
    assert_eq!(
        err,
        SshError::RemoteTimeout {
            timeout: Duration::from_secs(7)
        }
    );
}

#[rstest]
#[tokio::test]
async fn run_without_exit_status_is_an_error(settings: SshSettings, runner: ScriptedRunner) {
    runner.push_missing_exit_code();
    let channel = connector(settings, &runner).attach(address());
    let err = channel
        .run("uptime", Duration::from_secs(5))
        .await
        .expect_err("signal");
    assert_eq!(err, SshError::MissingExitCode);
}

#[rstest]
#[tokio::test]
async fn run_streamed_requests_streaming(settings: SshSettings, runner: ScriptedRunner) {
    runner.push_success();
    let channel = connector(settings, &runner).attach(address());
    channel
        .run_streamed("bash setup.sh", Duration::from_secs(5))
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));
    assert!(runner.invocations().iter().all(|call| call.stream));
}

#[rstest]
#[tokio::test]
async fn put_streams_bytes_into_verified_temp_file(settings: SshSettings, runner: ScriptedRunner) {
    runner.push_success();
    let channel = connector(settings, &runner).attach(address());

    channel
        .put(b"{\"token\":1}", "/root/.claude.json", 0o600, Duration::from_secs(30))
        .await
        .unwrap_or_else(|err| panic!("put: {err}"));

    let calls = runner.invocations();
    assert_eq!(calls.len(), 1);
    let call = calls.first().unwrap_or_else(|| panic!("no call recorded"));
    assert_eq!(call.stdin.as_deref(), Some(b"{\"token\":1}".as_slice()));
    let script = call.last_arg();
    let digest = format!("{:x}", Sha256::digest(b"{\"token\":1}"));
    assert!(script.contains(&digest));
    assert!(script.contains("sha256sum -c --status"));
    assert!(script.contains("chmod 600 "));
    assert!(script.contains("mv -f /root/.claude.json.clwd-"));
    assert!(script.contains("mkdir -p /root "));
    assert!(!script.contains("token"));
}

#[rstest]
#[tokio::test]
async fn put_reports_remote_failure(settings: SshSettings, runner: ScriptedRunner) {
    runner.push_output(Some(1), "", "sha256sum: WARNING: 1 computed checksum did NOT match\n");
    let channel = connector(settings, &runner).attach(address());

    let err = channel
        .put(b"data", "/root/script.sh", 0o700, Duration::from_secs(30))
        .await
        .expect_err("digest mismatch");

    assert!(matches!(
        err,
        SshError::TransferFailed { ref path, ref message }
            if path == "/root/script.sh" && message.contains("did NOT match")
    ));
    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
#[tokio::test]
async fn put_cleans_up_temp_file_after_timeout(settings: SshSettings, runner: ScriptedRunner) {
    runner.push_timeout();
    runner.push_success();
    let channel = connector(settings, &runner).attach(address());

    let err = channel
        .put(b"data", "/root/script.sh", 0o700, Duration::from_secs(30))
        .await
        .expect_err("timeout");

    assert!(matches!(err, SshError::RemoteTimeout { .. }));
    let calls = runner.invocations();
    assert_eq!(calls.len(), 2);
    let cleanup = calls.get(1).map(CommandInvocation::last_arg).unwrap_or_default();
    assert!(cleanup.starts_with("rm -f /root/script.sh.clwd-"));
}

#[rstest]
#[tokio::test]
async fn interactive_returns_exit_status(settings: SshSettings, runner: ScriptedRunner) {
    runner.push_interactive(Some(130));
    let channel = connector(settings, &runner).attach(address());

    let code = channel
        .interactive(Some("tmux attach"))
        .await
        .unwrap_or_else(|err| panic!("interactive: {err}"));

    assert_eq!(code, 130);
    let calls = runner.invocations();
    assert!(calls.iter().all(|call| call.interactive));
    assert_eq!(calls.first().map(CommandInvocation::last_arg).as_deref(), Some("tmux attach"));
}

#[test]
fn install_script_quotes_paths_with_spaces() {
    let script = install_script(b"x", "/root/my dir/file", "/root/my dir/file.tmp", 0o644);
    assert!(script.contains("mkdir -p '/root/my dir'"));
    assert!(script.contains("mv -f '/root/my dir/file.tmp' '/root/my dir/file'"));
}
