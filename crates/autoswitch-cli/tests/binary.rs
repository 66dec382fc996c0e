//! Process-level tests against the `autoswitch` binary.
//!
//! The supervisor and its workers are real OS processes sharing a
//! `SO_REUSEPORT` socket. Core guarantees exercised here:
//! - Writing a new version to the version file moves traffic to a worker
//!   running that version.
//! - Once the tree answers, every request during a switch succeeds on its
//!   first attempt and carries the old or the new version.
//! - A failing workload brings the whole tree down with exit code 1.
//! - An unreadable version file at startup exits 1.
//! - Host-delegated mode writes `recycle` to the control endpoint.
#![cfg(unix)]

use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};

const PATIENCE: Duration = Duration::from_secs(20);

struct Fixture {
    _dir: tempfile::TempDir,
    version_file: PathBuf,
}

impl Fixture {
    fn new(version: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let version_file = dir.path().join("version.txt");
        std::fs::write(&version_file, version).unwrap();
        Self {
            _dir: dir,
            version_file,
        }
    }

    fn set_version(&self, version: &str) {
        std::fs::write(&self.version_file, version).unwrap();
    }
}

fn autoswitch(version_file: &Path, args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_autoswitch"))
        .arg("--version-file")
        .arg(version_file)
        .arg("--grace-ms")
        .arg("1000")
        .args(args)
        .env_remove("AUTO_VERSION_SWITCH")
        .env_remove("AUTO_VERSION_SWITCH_SUPERVISOR")
        .env_remove("AUTO_VERSION_SWITCH_WORKER_ID")
        .env_remove("AUTO_VERSION_SWITCH_TOKEN")
        .env_remove("AUTO_VERSION_SWITCH_IISNODE_MODE")
        .env_remove("IISNODE_CONTROL_PIPE")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap()
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn try_request(port: u16) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let mut answer = String::new();
    stream.read_to_string(&mut answer).await?;
    let answer = answer.trim();
    if answer.is_empty() {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(answer.to_string())
}

/// One request; refused or reset connections are retried until `PATIENCE`.
async fn request(port: u16) -> String {
    let deadline = Instant::now() + PATIENCE;
    loop {
        match try_request(port).await {
            Ok(answer) => return answer,
            Err(_) if Instant::now() < deadline => sleep(Duration::from_millis(20)).await,
            Err(err) => panic!("no answer on port {port}: {err}"),
        }
    }
}

async fn wait_for_answer(port: u16, expected: &str) {
    let deadline = Instant::now() + PATIENCE;
    while request(port).await != expected {
        assert!(Instant::now() < deadline, "never answered {expected}");
        sleep(Duration::from_millis(50)).await;
    }
}

fn terminate(child: &Child) {
    let pid = child.id().unwrap();
    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());
}

async fn exit_code(child: &mut Child) -> Option<i32> {
    timeout(PATIENCE, child.wait())
        .await
        .expect("process exits in time")
        .unwrap()
        .code()
}

/// Round trip through real processes: 1.0 is served, the file moves to
/// 2.1, and traffic ends up on a 2.1 worker. SIGTERM then exits 0.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn round_trip_through_binary() {
    let fixture = Fixture::new("1.0");
    let port = free_port().await;
    let mut child = autoswitch(&fixture.version_file, &["serve", "--port", &port.to_string()]);

    assert_eq!(request(port).await, "1.0");

    fixture.set_version("2.1\n");
    wait_for_answer(port, "2.1").await;
    for _ in 0..5 {
        assert_eq!(request(port).await, "2.1");
    }

    terminate(&child);
    assert_eq!(exit_code(&mut child).await, Some(0));
}

/// Load across a switch with two slots: after the first answer, each
/// request is sent once and must be answered with the old or new version.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_through_binary_sees_only_old_or_new() {
    let fixture = Fixture::new("1.0");
    let port = free_port().await;
    let mut child = autoswitch(
        &fixture.version_file,
        &["--slots", "2", "serve", "--port", &port.to_string()],
    );
    assert_eq!(request(port).await, "1.0");

    const REQUESTS: usize = 100;
    let mut tasks = Vec::with_capacity(REQUESTS);
    for i in 0..REQUESTS {
        if i == REQUESTS / 4 {
            fixture.set_version("2.2");
        }
        tasks.push(tokio::spawn(try_request(port)));
        sleep(Duration::from_millis(10)).await;
    }

    let mut seen = HashSet::new();
    let mut failures = Vec::new();
    for (i, task) in tasks.into_iter().enumerate() {
        match task.await.unwrap() {
            Ok(answer) => {
                seen.insert(answer);
            }
            Err(err) => failures.push(format!("request {i}: {err}")),
        }
    }
    assert!(failures.is_empty(), "requests failed: {failures:?}");
    assert!(
        seen.is_subset(&HashSet::from(["1.0".to_string(), "2.2".to_string()])),
        "unexpected versions: {seen:?}"
    );

    wait_for_answer(port, "2.2").await;

    terminate(&child);
    assert_eq!(exit_code(&mut child).await, Some(0));
}

/// A workload that fails at once takes the supervisor down with exit 1.
#[tokio::test]
async fn workload_throw_exits_one() {
    let fixture = Fixture::new("1.0");
    let mut child = autoswitch(&fixture.version_file, &["throw"]);
    assert_eq!(exit_code(&mut child).await, Some(1));
}

/// Same for a workload that fails some time after starting.
#[tokio::test]
async fn delayed_throw_exits_one() {
    let fixture = Fixture::new("1.0");
    let mut child = autoswitch(&fixture.version_file, &["throw", "--after-ms", "300"]);
    assert_eq!(exit_code(&mut child).await, Some(1));
}

/// No version can be read at startup, so nothing is spawned.
#[tokio::test]
async fn unreadable_version_file_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.txt");
    let mut child = autoswitch(&missing, &["stall"]);
    assert_eq!(exit_code(&mut child).await, Some(1));
}

/// In host-delegated mode the process is the worker itself; drift is
/// reported by writing `recycle` to the host manager's endpoint.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_delegated_writes_recycle() {
    let fixture = Fixture::new("1.0");
    let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = control.local_addr().unwrap().to_string();
    let port = free_port().await;

    let mut child = autoswitch(
        &fixture.version_file,
        &[
            "--host-delegated",
            "--control-endpoint",
            &endpoint,
            "serve",
            "--port",
            &port.to_string(),
        ],
    );
    assert_eq!(request(port).await, "1.0");

    fixture.set_version("2.0");
    assert_eq!(request(port).await, "1.0");

    let (mut stream, _) = timeout(PATIENCE, control.accept()).await.unwrap().unwrap();
    let mut command = String::new();
    timeout(PATIENCE, stream.read_to_string(&mut command))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(command, "recycle");

    child.start_kill().unwrap();
    let _ = child.wait().await;
}
