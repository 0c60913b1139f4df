#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use upkeep_core::lock;

fn upkeep(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("upkeep").unwrap();
    cmd.current_dir(root).env("UPKEEP_ROOT", root);
    cmd
}

fn write_config(root: &Path, yaml: &str) {
    std::fs::create_dir_all(root.join(".upkeep")).unwrap();
    std::fs::write(root.join(".upkeep/config.yaml"), yaml).unwrap();
}

// ---------------------------------------------------------------------------
// upkeep init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_config_and_ignores_state_dir() {
    let dir = TempDir::new().unwrap();
    upkeep(dir.path())
        .args([
            "init",
            "--service",
            "telemetry.service",
            "--assets-url",
            "https://cdn.example.com/web/{version}.zip",
            "--live-dir",
            "web/build",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .upkeep/config.yaml"));

    let config = std::fs::read_to_string(dir.path().join(".upkeep/config.yaml")).unwrap();
    assert!(config.contains("telemetry.service"));
    assert!(config.contains("{version}.zip"));
    let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
    assert!(gitignore.lines().any(|l| l == ".upkeep/"));
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(".gitignore"), "target/").unwrap();
    upkeep(dir.path()).arg("init").assert().success();
    upkeep(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .upkeep/config.yaml"));

    let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
    assert_eq!(gitignore, "target/\n.upkeep/\n");
}

#[test]
fn init_rejects_assets_url_without_live_dir() {
    let dir = TempDir::new().unwrap();
    upkeep(dir.path())
        .args(["init", "--assets-url", "https://cdn/{version}.zip"])
        .assert()
        .failure();
    assert!(!dir.path().join(".upkeep/config.yaml").exists());
}

// ---------------------------------------------------------------------------
// config / history / collections
// ---------------------------------------------------------------------------

#[test]
fn commands_require_init() {
    let dir = TempDir::new().unwrap();
    upkeep(dir.path())
        .arg("check")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not initialized"));
    upkeep(dir.path())
        .arg("run")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn config_validate_accepts_fresh_config() {
    let dir = TempDir::new().unwrap();
    upkeep(dir.path()).args(["init", "--service", "app"]).assert().success();
    upkeep(dir.path())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains(".upkeep/config.yaml is valid."));
}

#[test]
fn config_validate_reports_errors() {
    let dir = TempDir::new().unwrap();
    write_config(
        dir.path(),
        "service:\n  supervisor:\n    type: systemd\n    unit: app\n  stop_timeout_secs: 0\n\
         assets:\n  url_template: https://cdn/web.zip\n  live_dir: .upkeep/web\n",
    );
    upkeep(dir.path())
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("stop_timeout_secs"))
        .stdout(predicate::str::contains("warning: assets.url_template"))
        .stdout(predicate::str::contains("must not be inside .upkeep/"))
        .stdout(predicate::str::contains("3 finding(s), 2 blocking."))
        .stderr(predicate::str::contains("updates will not run"));
}

#[test]
fn config_show_fills_defaults() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "service:\n  supervisor:\n    type: systemd\n    unit: app\n");
    upkeep(dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("interval_minutes: 10"))
        .stdout(predicate::str::contains("remote: origin"));
}

#[test]
fn history_is_empty_before_any_cycle() {
    let dir = TempDir::new().unwrap();
    upkeep(dir.path()).arg("init").assert().success();
    upkeep(dir.path())
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("No update cycles recorded."));
    upkeep(dir.path())
        .args(["history", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn collections_list_reads_application_database() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("storage.db");
    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute_batch(
        "CREATE TABLE collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            start_s REAL,
            end_s REAL,
            description TEXT,
            uploaded INTEGER NOT NULL DEFAULT 0
        );
        INSERT INTO collections (name, start_s) VALUES ('morning-session', 100.0);
        INSERT INTO collections (name, start_s, end_s, uploaded) VALUES ('evening-session', 900.0, 1200.0, 1);",
    )
    .unwrap();
    drop(conn);

    let out = upkeep(dir.path())
        .args(["collections", "list", "--db", "storage.db"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(out).unwrap();
    let evening = text.find("evening-session").unwrap();
    let morning = text.find("morning-session").unwrap();
    assert!(evening < morning, "newest collection first:\n{text}");

    upkeep(dir.path())
        .args(["collections", "list", "--db", "storage.db", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"uploaded\": true"));
}

#[test]
fn collections_list_without_database() {
    let dir = TempDir::new().unwrap();
    upkeep(dir.path()).arg("init").assert().success();
    upkeep(dir.path())
        .args(["collections", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No collections."));
}

// ---------------------------------------------------------------------------
// upkeep run (end to end against a local git remote)
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "upkeep")
        .env("GIT_AUTHOR_EMAIL", "upkeep@example.com")
        .env("GIT_COMMITTER_NAME", "upkeep")
        .env("GIT_COMMITTER_EMAIL", "upkeep@example.com")
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

#[cfg(unix)]
fn write_bundle(path: &Path, index: &str) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    zip.start_file("index.html", zip::write::SimpleFileOptions::default())
        .unwrap();
    zip.write_all(index.as_bytes()).unwrap();
    zip.finish().unwrap();
}

/// An app clone one commit behind its upstream, where the new commit bumps
/// the declared asset version and changes code. The supervised "service" is
/// a flag file that exists while it runs.
#[cfg(unix)]
struct PendingUpdate {
    _dir: TempDir,
    app: PathBuf,
    flag: PathBuf,
}

#[cfg(unix)]
fn pending_update(extra_yaml: &str) -> Option<PendingUpdate> {
    if which_git().is_none() {
        eprintln!("git not available; skipping");
        return None;
    }
    let dir = TempDir::new().unwrap();
    let upstream = dir.path().join("upstream");
    let app = dir.path().join("app");
    let bundles = dir.path().join("bundles");
    std::fs::create_dir_all(&upstream).unwrap();
    std::fs::create_dir_all(&bundles).unwrap();

    git(&upstream, &["init", "--quiet"]);
    std::fs::write(upstream.join("assets.version"), "v1\n").unwrap();
    git(&upstream, &["add", "."]);
    git(&upstream, &["commit", "--quiet", "-m", "initial"]);
    git(dir.path(), &["clone", "--quiet", "upstream", "app"]);

    std::fs::write(upstream.join("assets.version"), "v2\n").unwrap();
    std::fs::write(upstream.join("server.py"), "print('v2')\n").unwrap();
    git(&upstream, &["add", "."]);
    git(&upstream, &["commit", "--quiet", "-m", "new assets"]);
    write_bundle(&bundles.join("v2.zip"), "<h1>v2</h1>");

    let flag = dir.path().join("running.flag");
    std::fs::write(&flag, "").unwrap();
    let f = flag.display();
    write_config(
        &app,
        &format!(
            "service:\n  supervisor:\n    type: command\n\
             \x20   start: [touch, {f}]\n\
             \x20   stop: [rm, -f, {f}]\n\
             \x20   status: [test, -f, {f}]\n\
             \x20 stop_timeout_secs: 5\n  start_timeout_secs: 5\n  poll_interval_ms: 20\n\
             assets:\n  url_template: file://{}/{{version}}.zip\n  live_dir: web/build\n{extra_yaml}",
            bundles.display()
        ),
    );
    Some(PendingUpdate {
        _dir: dir,
        app,
        flag,
    })
}

#[cfg(unix)]
#[test]
fn run_updates_code_assets_and_restarts() {
    let Some(PendingUpdate { _dir, app, flag }) = pending_update("") else {
        return;
    };

    upkeep(&app)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("Update pending"));

    upkeep(&app)
        .arg("run")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("assets:  v2 (installed)"))
        .stdout(predicate::str::contains("Update complete."));

    assert_eq!(
        std::fs::read_to_string(app.join("server.py")).unwrap(),
        "print('v2')\n"
    );
    assert_eq!(
        std::fs::read_to_string(app.join("web/build/index.html")).unwrap(),
        "<h1>v2</h1>"
    );
    assert_eq!(
        std::fs::read_to_string(app.join(".upkeep/installed-assets")).unwrap(),
        "v2\n"
    );
    assert!(flag.exists(), "service restarted");
    assert_eq!(lock::holder(&app.join(".upkeep/upkeep.lock")), None);

    upkeep(&app)
        .arg("run")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Up to date."));

    upkeep(&app)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("assets v2"));
}

#[cfg(unix)]
#[test]
fn sigterm_after_stop_still_restarts_the_service() {
    let hooks = "hooks:\n  post_pull:\n    - name: settle\n      argv: [sleep, \"2\"]\n";
    let Some(PendingUpdate { _dir, app, flag }) = pending_update(hooks) else {
        return;
    };

    let child = std::process::Command::new(assert_cmd::cargo::cargo_bin("upkeep"))
        .arg("run")
        .current_dir(&app)
        .env("UPKEEP_ROOT", &app)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    while flag.exists() {
        assert!(Instant::now() < deadline, "service was never stopped");
        std::thread::sleep(Duration::from_millis(20));
    }
    let status = std::process::Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let output = child.wait_with_output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0), "stdout:\n{stdout}");
    assert!(stdout.contains("Update complete."), "stdout:\n{stdout}");
    assert!(flag.exists(), "service left stopped after SIGTERM");
    assert_eq!(
        std::fs::read_to_string(app.join("server.py")).unwrap(),
        "print('v2')\n"
    );
}

#[cfg(unix)]
#[test]
fn run_drops_trigger_while_another_process_holds_the_lock() {
    let dir = TempDir::new().unwrap();
    upkeep(dir.path()).arg("init").assert().success();
    let _held = lock::InstanceLock::acquire(&dir.path().join(".upkeep/upkeep.lock")).unwrap();

    upkeep(dir.path())
        .arg("run")
        .assert()
        .code(0)
        .stderr(predicate::str::contains("trigger dropped"));
    upkeep(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("running (pid {})", std::process::id())));
}

#[cfg(unix)]
#[test]
fn leftover_lock_file_does_not_drop_triggers() {
    let dir = TempDir::new().unwrap();
    upkeep(dir.path()).arg("init").assert().success();
    // pid 1 is alive, but nothing holds the lock.
    std::fs::write(dir.path().join(".upkeep/upkeep.lock"), "1\n").unwrap();

    upkeep(dir.path())
        .arg("run")
        .assert()
        .stderr(predicate::str::contains("trigger dropped").not());
    upkeep(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("running (pid").not());
}

#[cfg(unix)]
fn which_git() -> Option<()> {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|_| ())
}
