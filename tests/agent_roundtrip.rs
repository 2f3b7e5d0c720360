//! Agent round-trip tests
//!
//! A real `remlaunch-agent` on a loopback port, driven through `AgentClient`
//! and through a launcher with the agent backend.

use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

use remlaunch::host::AgentClient;
use remlaunch::launcher::AgentBackend;
use remlaunch::mount::{DirectMount, Mount};
use remlaunch::runner::ShellRunner;
use remlaunch::{
    Backend, ExecutionContext, LaunchConfig, LaunchOptions, Launcher, Payload, Plan, Runner,
    RunnerKind, Submission,
};
use remlaunch_agent::AgentState;
use remlaunch_protocol::ExecReply;
use tempfile::TempDir;

/// Serve an agent rooted at `root` on a free loopback port; returns its URL.
fn start_agent(root: &Path) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let state = AgentState::new(root.canonicalize().unwrap());

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            remlaunch_agent::serve_listener(listener, state).await.unwrap();
        });
    });
    format!("http://{}", addr)
}

fn stdout(reply: ExecReply) -> String {
    match reply {
        ExecReply::Finished(result) => {
            assert!(result.success(), "command failed: {}", result.stderr);
            result.stdout
        }
        ExecReply::TimedOut(t) => panic!("timed out after {}s", t.timeout),
    }
}

#[test]
fn test_uploaded_file_is_visible_to_commands() {
    let root = TempDir::new().unwrap();
    let client = AgentClient::new(start_agent(root.path())).unwrap();

    let ack = client.put_bytes("a.txt", b"hello".to_vec()).unwrap();
    assert_eq!(ack.bytes, 5);
    assert_eq!(stdout(client.execute("ls . | grep a.txt", None).unwrap()), "a.txt\n");
}

#[test]
fn test_update_file_appends() {
    let root = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let part = local.path().join("part.log");
    fs::write(&part, "two\n").unwrap();

    let client = AgentClient::new(start_agent(root.path())).unwrap();
    client.put_bytes("logs/run.log", b"one\n".to_vec()).unwrap();
    client.update_file(&part, "logs/run.log", false).unwrap();
    assert_eq!(stdout(client.execute("cat logs/run.log", None).unwrap()), "one\ntwo\n");
}

#[test]
fn test_short_timeout_yields_sentinel() {
    let root = TempDir::new().unwrap();
    let client = AgentClient::new(start_agent(root.path())).unwrap();

    let reply = client.execute("sleep 5", Some(0.3)).unwrap();
    assert!(matches!(reply, ExecReply::TimedOut(t) if t.timeout == 0.3));
}

#[test]
fn test_map_runs_commands_in_order() {
    let root = TempDir::new().unwrap();
    let client = AgentClient::new(start_agent(root.path())).unwrap();

    let replies = client
        .map(&["sleep 0.2; echo slow".to_string(), "echo fast".to_string()], None)
        .unwrap();
    let outputs: Vec<String> = replies.into_iter().map(stdout).collect();
    assert_eq!(outputs, ["slow\n", "fast\n"]);
}

struct AgentLaunch {
    root: TempDir,
    _code: TempDir,
    _staging: TempDir,
    launcher: Launcher,
    mount: Arc<dyn Mount>,
}

fn agent_launch() -> AgentLaunch {
    let root = TempDir::new().unwrap();
    let code = TempDir::new().unwrap();
    fs::write(code.path().join("train.py"), "print('hi')\n").unwrap();
    let staging = TempDir::new().unwrap();

    let remote = root.path().canonicalize().unwrap();
    let mount: Arc<dyn Mount> = Arc::new(
        DirectMount::new(code.path())
            .unwrap()
            .with_name("code")
            .with_staging_dir(staging.path().to_path_buf())
            .with_remote_tar(remote.join("archives/code.tar").display().to_string())
            .unwrap()
            .with_host_path(remote.join("code").display().to_string())
            .unwrap(),
    );

    let options = LaunchOptions {
        launch_dir: remote.join("launch").display().to_string(),
        ..LaunchOptions::default()
    };
    let config = LaunchConfig::new(Backend::Agent(AgentBackend::new(start_agent(root.path())))).with_options(options);
    let launcher = Launcher::new(config).unwrap();

    AgentLaunch {
        root,
        _code: code,
        _staging: staging,
        launcher,
        mount,
    }
}

fn entry_runner(mount: &Arc<dyn Mount>, payload: &Payload) -> Runner {
    let context = ExecutionContext::new()
        .with_work_dir(mount.host_path())
        .with_entry_command(env!("CARGO_BIN_EXE_remlaunch-entry"));
    let mut runner = Runner::new(RunnerKind::Shell(ShellRunner::default()))
        .unwrap()
        .with_context(context)
        .with_mount(mount.clone());
    runner.build(payload);
    runner
}

#[test]
fn test_launch_through_agent_runs_payload() {
    let AgentLaunch {
        root,
        _code,
        _staging,
        mut launcher,
        mount,
    } = agent_launch();

    launcher.add_runner(entry_runner(&mount, &Payload::new("add").with_arg(3).with_arg(5)));
    let submissions = launcher.execute().unwrap();

    match submissions.as_slice() {
        [Submission::Agent(reply)] => {
            let out = stdout(reply.clone());
            assert!(out.lines().any(|line| line == "8"), "stdout was:\n{}", out);
        }
        other => panic!("unexpected submissions {:?}", other),
    }
    assert!(root.path().join("code/train.py").exists());
    assert!(root.path().join("archives/code.tar").exists());
    assert!(root.path().join(".remlaunch/launch.sh").exists());
    let log = fs::read_to_string(root.path().join("launch/launch.log")).unwrap();
    assert!(log.lines().any(|line| line == "8"));
}

#[test]
fn test_setup_host_unpacks_once_through_agent() {
    let AgentLaunch {
        root,
        _code,
        _staging,
        mut launcher,
        mount,
    } = agent_launch();

    launcher.add_runner(entry_runner(&mount, &Payload::new("echo").with_arg("ready")));
    assert!(launcher.setup_host().unwrap());
    assert!(root.path().join("code/train.py").exists());
    assert!(!launcher.setup_host().unwrap());

    launcher.plan_instance().unwrap();
    match &launcher.plans()[0] {
        Plan::Script { script, .. } => assert!(!script.contains("# [unpack]")),
        other => panic!("unexpected plan {:?}", other),
    }
    let submissions = launcher.execute().unwrap();
    assert!(matches!(
        submissions.as_slice(),
        [Submission::Agent(ExecReply::Finished(result))] if result.stdout.contains("\"ready\"")
    ));
    assert_eq!(launcher.uploads().len(), 1);
}
