//! Supervision tests against real processes and a settings file on disk.
//!
//! `/bin/sh` stands in for the frp binaries: it is launched as
//! `sh -c <config>`, so a config "path" of `exec sleep 30` yields a
//! long-running process, and a config file that is an executable script
//! runs that script.

#![cfg(target_os = "linux")]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use frpdeck::settings::{SettingsSource, SettingsStore, SERVER_ID};
use frpdeck::supervisor::{ServiceStatus, Supervisor};
use tempfile::TempDir;

const SH: &str = "/bin/sh";
const POLL: Duration = Duration::from_millis(100);
const LONG_RUNNING: &str = "exec sleep 30";

/// Scratch directory under the target dir, where scripts may be executed
fn scratch_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("frpdeck-")
        .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
        .unwrap()
}

fn store(dir: &Path) -> Arc<SettingsStore> {
    let store = Arc::new(SettingsStore::new(dir.join("settings.json")));
    store.set_binary_paths(SH, SH).unwrap();
    store
}

fn supervisor(store: &Arc<SettingsStore>) -> Arc<Supervisor> {
    Supervisor::new(Arc::clone(store) as Arc<dyn SettingsSource>, POLL)
}

/// Executable config file that runs `sleep 30` when launched through `sh -c`
fn script_config(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    write_script(&path, "exec sleep 30\n");
    path
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Script that appends `tag` to `log` on every launch, then stays up
fn tagging_script(log: &Path, tag: &str) -> String {
    format!("echo {tag} >> '{}'\nexec sleep 30\n", log.display())
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Running (not zombie) process with `pid` exists
fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z'),
        Err(_) => false,
    }
}

async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

fn status(supervisor: &Supervisor, id: &str) -> ServiceStatus {
    supervisor.status(id).unwrap()
}

#[tokio::test]
async fn test_killed_process_is_respawned() {
    let dir = scratch_dir();
    let store = store(dir.path());
    store.add_instance(Some("office"), Some(Path::new(LONG_RUNNING))).unwrap();
    let supervisor = supervisor(&store);

    supervisor.start("office").unwrap();
    let first = status(&supervisor, "office");
    assert!(first.running, "status: {:?}", first);
    let first_pid = first.pid.unwrap();

    unsafe {
        libc::kill(first_pid as libc::pid_t, libc::SIGKILL);
    }

    let healed = wait_for(Duration::from_secs(5), || {
        let s = status(&supervisor, "office");
        s.running && s.pid.is_some_and(|pid| pid != first_pid)
    })
    .await;
    assert!(healed, "status: {:?}", status(&supervisor, "office"));
    assert!(status(&supervisor, "office").last_error.is_empty());

    supervisor.shutdown(true);
}

#[tokio::test]
async fn test_stopped_instance_stays_down() {
    let dir = scratch_dir();
    let store = store(dir.path());
    store.add_instance(Some("office"), Some(Path::new(LONG_RUNNING))).unwrap();
    let supervisor = supervisor(&store);

    supervisor.start("office").unwrap();
    let pid = status(&supervisor, "office").pid.unwrap();

    supervisor.stop("office");
    assert!(wait_for(Duration::from_secs(5), || !process_alive(pid)).await);

    // Several poll intervals later nothing has been respawned
    tokio::time::sleep(POLL * 5).await;
    let s = status(&supervisor, "office");
    assert!(!s.desired);
    assert!(!s.running);
    assert!(s.pid.is_none());
    assert!(supervisor.monitor_generation("office").is_some());
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let dir = scratch_dir();
    let store = store(dir.path());
    store.add_instance(Some("office"), Some(Path::new(LONG_RUNNING))).unwrap();
    let supervisor = supervisor(&store);

    supervisor.start("office").unwrap();
    let old_pid = status(&supervisor, "office").pid.unwrap();
    let generation = supervisor.monitor_generation("office");

    supervisor.restart("office").unwrap();
    let s = status(&supervisor, "office");
    assert!(s.running);
    assert_ne!(s.pid, Some(old_pid));
    assert_eq!(supervisor.monitor_generation("office"), generation);
    assert!(wait_for(Duration::from_secs(5), || !process_alive(old_pid)).await);

    supervisor.shutdown(true);
}

#[tokio::test]
async fn test_saved_config_restarts_bound_instances() {
    let dir = scratch_dir();
    let store = store(dir.path());
    let config = script_config(dir.path(), "shared.toml");
    store.add_instance(Some("a"), Some(&config)).unwrap();
    store.add_instance(Some("b"), Some(&config)).unwrap();
    store.add_instance(Some("idle"), Some(&config)).unwrap();
    store.add_instance(Some("other"), Some(Path::new(LONG_RUNNING))).unwrap();
    let supervisor = supervisor(&store);

    supervisor.start("a").unwrap();
    supervisor.start("b").unwrap();
    supervisor.start("other").unwrap();
    let a_pid = status(&supervisor, "a").pid.unwrap();
    let b_pid = status(&supervisor, "b").pid.unwrap();
    let other_pid = status(&supervisor, "other").pid.unwrap();

    let mut restarted = supervisor.notify_config_file_saved(&config).unwrap();
    restarted.sort();
    assert_eq!(restarted, vec!["a", "b"]);

    assert_ne!(status(&supervisor, "a").pid, Some(a_pid));
    assert_ne!(status(&supervisor, "b").pid, Some(b_pid));
    assert_eq!(status(&supervisor, "other").pid, Some(other_pid));
    assert!(status(&supervisor, "idle").pid.is_none());

    supervisor.shutdown(true);
}

#[tokio::test]
async fn test_concurrent_starts_spawn_once() {
    let dir = scratch_dir();
    let store = store(dir.path());
    store.add_instance(Some("office"), Some(Path::new(LONG_RUNNING))).unwrap();
    let supervisor = supervisor(&store);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let supervisor = Arc::clone(&supervisor);
        handles.push(tokio::spawn(async move { supervisor.start("office") }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let s = status(&supervisor, "office");
    assert!(s.running);
    let pid = s.pid.unwrap();

    tokio::time::sleep(POLL * 3).await;
    assert_eq!(status(&supervisor, "office").pid, Some(pid));

    supervisor.shutdown(true);
}

#[tokio::test]
async fn test_instances_are_isolated() {
    let dir = scratch_dir();
    let store = store(dir.path());
    store.add_instance(Some("a"), Some(Path::new(LONG_RUNNING))).unwrap();
    store.add_instance(Some("b"), Some(Path::new(LONG_RUNNING))).unwrap();
    let supervisor = supervisor(&store);

    supervisor.start("a").unwrap();
    supervisor.start("b").unwrap();
    let b_pid = status(&supervisor, "b").pid.unwrap();

    supervisor.stop("a");
    supervisor.remove_instance("a").unwrap();
    tokio::time::sleep(POLL * 3).await;

    let b = status(&supervisor, "b");
    assert!(b.running);
    assert!(b.desired);
    assert_eq!(b.pid, Some(b_pid));

    let ids: Vec<String> = supervisor.status_all().unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![SERVER_ID, "b"]);

    supervisor.shutdown(true);
}

#[tokio::test]
async fn test_binary_path_is_read_on_each_attempt() {
    let dir = scratch_dir();
    let store = store(dir.path());
    store.set_binary_paths("", SH).unwrap();
    store.add_instance(Some("office"), Some(Path::new(LONG_RUNNING))).unwrap();
    let supervisor = supervisor(&store);

    supervisor.start("office").unwrap();
    assert_eq!(status(&supervisor, "office").last_error, "binary path is not set");

    store.set_binary_paths(SH, SH).unwrap();
    let recovered = wait_for(Duration::from_secs(5), || {
        let s = status(&supervisor, "office");
        s.running && s.last_error.is_empty()
    })
    .await;
    assert!(recovered, "status: {:?}", status(&supervisor, "office"));

    supervisor.shutdown(true);
}

#[tokio::test]
async fn test_server_runs_its_bound_config() {
    let dir = scratch_dir();
    let store = store(dir.path());
    let config = script_config(dir.path(), "frps.toml");
    store.set_server_config(&config).unwrap();
    let supervisor = supervisor(&store);

    supervisor.start(SERVER_ID).unwrap();
    let s = status(&supervisor, SERVER_ID);
    assert!(s.running, "status: {:?}", s);
    assert_eq!(s.config, config.display().to_string());

    let pid = s.pid.unwrap();
    assert!(supervisor.notify_config_changed(SERVER_ID));
    assert_ne!(status(&supervisor, SERVER_ID).pid, Some(pid));

    supervisor.shutdown(true);
}

#[tokio::test]
async fn test_shutdown_can_leave_processes_running() {
    let dir = scratch_dir();
    let store = store(dir.path());
    store.add_instance(Some("office"), Some(Path::new(LONG_RUNNING))).unwrap();
    let supervisor = supervisor(&store);

    supervisor.start("office").unwrap();
    let pid = status(&supervisor, "office").pid.unwrap();

    supervisor.shutdown(false);
    tokio::time::sleep(POLL * 2).await;
    assert!(process_alive(pid));
    assert!(supervisor.monitor_generation("office").is_none());

    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[tokio::test]
async fn test_saved_config_respawns_once_with_new_content() {
    let dir = scratch_dir();
    let store = store(dir.path());
    let launches = dir.path().join("launches.log");
    let config = dir.path().join("office.toml");
    write_script(&config, &tagging_script(&launches, "v1"));
    store.add_instance(Some("office"), Some(&config)).unwrap();
    let supervisor = supervisor(&store);

    supervisor.start("office").unwrap();
    assert!(wait_for(Duration::from_secs(5), || read_lines(&launches) == ["v1"]).await);
    let first_pid = status(&supervisor, "office").pid.unwrap();

    write_script(&config, &tagging_script(&launches, "v2"));
    assert_eq!(supervisor.notify_config_file_saved(&config).unwrap(), vec!["office"]);

    let relaunched = wait_for(Duration::from_secs(5), || {
        read_lines(&launches) == ["v1", "v2"]
    })
    .await;
    assert!(relaunched, "launches: {:?}", read_lines(&launches));
    let second_pid = status(&supervisor, "office").pid.unwrap();
    assert_ne!(second_pid, first_pid);

    // No further spawns once the new process is up
    tokio::time::sleep(POLL * 5).await;
    assert_eq!(read_lines(&launches), vec!["v1", "v2"]);
    assert_eq!(status(&supervisor, "office").pid, Some(second_pid));

    supervisor.shutdown(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_and_stop_of_different_instances() {
    let dir = scratch_dir();
    let store = store(dir.path());
    store.add_instance(Some("a"), Some(Path::new(LONG_RUNNING))).unwrap();
    store.add_instance(Some("b"), Some(Path::new(LONG_RUNNING))).unwrap();
    let supervisor = supervisor(&store);

    let mut a_pid = None;
    for _ in 0..20 {
        supervisor.start("b").unwrap();
        let b_pid = status(&supervisor, "b").pid.unwrap();

        let starter = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.start("a") })
        };
        let stopper = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.stop("b") })
        };
        starter.await.unwrap().unwrap();
        stopper.await.unwrap();

        let a = status(&supervisor, "a");
        assert!(a.desired && a.running, "a: {:?}", a);
        // The first start spawns, later ones find the process alive
        match a_pid {
            None => a_pid = a.pid,
            Some(pid) => assert_eq!(a.pid, Some(pid)),
        }

        let b = status(&supervisor, "b");
        assert!(!b.desired, "b: {:?}", b);
        assert!(!b.running);
        assert!(b.pid.is_none());
        assert!(wait_for(Duration::from_secs(5), || !process_alive(b_pid)).await);
    }

    tokio::time::sleep(POLL * 3).await;
    assert_eq!(status(&supervisor, "a").pid, a_pid);
    assert!(status(&supervisor, "b").pid.is_none());

    supervisor.shutdown(true);
}
