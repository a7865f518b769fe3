//! CLI integration tests
//!
//! Command parsing, output of the describe-only commands, exit codes of the local
//! entrypoint runner and the extra-argument policy.

use serial_test::serial;
use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn pybox_bin() -> PathBuf {
    let mut path = env::current_exe()
        .expect("Failed to get current executable path")
        .parent()
        .expect("No parent")
        .to_path_buf();
    if path.ends_with("deps") {
        path = path.parent().expect("No parent").to_path_buf();
    }
    path.join("pybox")
}

fn pybox(args: &[&str], cache: &Path) -> Output {
    Command::new(pybox_bin())
        .args(args)
        .env("PYBOX_CACHE_DIR", cache)
        .env_remove("PYBOX_RECIPE")
        .env_remove("PYBOX_PLATFORM")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute pybox")
}

/// Project with a manifest, a two-file package and, optionally, a recipe.
fn create_project(dir: &Path, recipe: Option<&str>) {
    fs::write(dir.join("requirements.txt"), "requests==2.31.0\n").unwrap();
    fs::create_dir_all(dir.join("app")).unwrap();
    fs::write(dir.join("app/__init__.py"), "").unwrap();
    fs::write(dir.join("app/main.py"), "print('hello')\n").unwrap();
    if let Some(recipe) = recipe {
        fs::write(dir.join("pybox.yaml"), recipe).unwrap();
    }
}

fn fake_interpreter(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fakepy");
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn test_cli_help() {
    let cache = TempDir::new().unwrap();
    let output = pybox(&["--help"], cache.path());

    assert!(output.status.success());
    let out = stdout(&output);
    for command in ["plan", "build", "llb", "dockerfile", "run", "exec", "health"] {
        assert!(out.contains(command), "help is missing {}", command);
    }
}

#[test]
fn test_cli_version() {
    let cache = TempDir::new().unwrap();
    let output = pybox(&["--version"], cache.path());
    assert!(output.status.success());
    assert!(stdout(&output).contains("pybox"));
}

#[test]
fn test_dockerfile_defaults() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), None);

    let output = pybox(
        &["dockerfile", dir.path().to_str().unwrap()],
        cache.path(),
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let out = stdout(&output);
    assert!(out.contains("FROM docker.io/library/python:3.12-slim AS base"));
    assert!(out.contains("COPY [\"requirements.txt\",\"/app/requirements.txt\"]"));
    assert!(out.contains("ENTRYPOINT [\"python\",\"-m\",\"app.main\"]"));
    assert!(out.contains("ENV PYTHONDONTWRITEBYTECODE=\"1\" PYTHONUNBUFFERED=\"1\""));
}

#[test]
fn test_plan_json() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), Some("name: svc\n"));

    let output = pybox(
        &["plan", dir.path().to_str().unwrap(), "--format", "json"],
        cache.path(),
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["project"], "svc");
    assert_eq!(json["workdir"], "/app");
    assert_eq!(
        json["entrypoint"],
        serde_json::json!(["python", "-m", "app.main"])
    );
    assert_eq!(json["source_files"], 2);
}

#[test]
fn test_plan_source_edit_keeps_install_key() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), Some("name: svc\n"));
    let context = dir.path().to_str().unwrap();

    let plan = |cache: &Path| -> serde_json::Value {
        let output = pybox(&["plan", context, "-f", "json"], cache);
        assert!(output.status.success(), "stderr: {}", stderr(&output));
        serde_json::from_str(&stdout(&output)).unwrap()
    };

    let before = plan(cache.path());
    fs::write(dir.path().join("app/main.py"), "print('edited')\n").unwrap();
    let after = plan(cache.path());

    assert_eq!(before["stages"]["base"], after["stages"]["base"]);
    assert_eq!(before["stages"]["dependencies"], after["stages"]["dependencies"]);
    assert_ne!(before["stages"]["runtime"], after["stages"]["runtime"]);
}

#[test]
fn test_plan_rejects_unpinned_base() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), Some("base:\n  image: python:latest\n"));

    let output = pybox(&["plan", dir.path().to_str().unwrap()], cache.path());
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("configuration error"));
}

#[test]
fn test_plan_missing_manifest() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), None);
    fs::remove_file(dir.path().join("requirements.txt")).unwrap();

    let output = pybox(&["plan", dir.path().to_str().unwrap()], cache.path());
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("input error"));
}

#[test]
fn test_llb_describe() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), None);

    let output = pybox(
        &["llb", dir.path().to_str().unwrap(), "--describe"],
        cache.path(),
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("FROM docker.io/library/python:3.12-slim"));
    assert!(out.contains("pip install --no-cache-dir -r"));
}

#[test]
fn test_llb_writes_image_config() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), Some("env:\n  GREETING: hi\n"));
    let config_path = dir.path().join("image-config.json");

    let output = pybox(
        &[
            "llb",
            dir.path().to_str().unwrap(),
            "--image-config",
            config_path.to_str().unwrap(),
        ],
        cache.path(),
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(!output.stdout.is_empty());

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
    let config = &json["Config"];
    assert_eq!(
        config["Entrypoint"],
        serde_json::json!(["python", "-m", "app.main"])
    );
    assert_eq!(config["WorkingDir"], "/app");
    assert_eq!(
        config["Env"],
        serde_json::json!([
            "GREETING=hi",
            "PYTHONDONTWRITEBYTECODE=1",
            "PYTHONUNBUFFERED=1"
        ])
    );
    assert_eq!(json["os"], "linux");
}

#[test]
fn test_llb_describe_lists_image_config() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), None);

    let output = pybox(
        &["llb", dir.path().to_str().unwrap(), "--describe"],
        cache.path(),
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    let config = out
        .lines()
        .find_map(|line| line.strip_prefix("CONFIG "))
        .expect("describe output has no CONFIG line");
    assert!(config.contains("\"Entrypoint\":[\"python\",\"-m\",\"app.main\"]"));
    assert!(config.contains("PYTHONUNBUFFERED=1"));
}

#[test]
fn test_llb_binary_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), None);
    let context = dir.path().to_str().unwrap();

    let first = pybox(&["llb", context], cache.path());
    let second = pybox(&["llb", context], cache.path());
    assert!(first.status.success(), "stderr: {}", stderr(&first));
    assert!(!first.stdout.is_empty());
    assert_eq!(first.stdout, second.stdout);
}

#[test]
#[serial]
fn test_exec_propagates_exit_code() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let interpreter = fake_interpreter(dir.path(), "exit 7");
    create_project(
        dir.path(),
        Some(&format!(
            "name: svc\nentrypoint:\n  interpreter: {}\n",
            interpreter.display()
        )),
    );

    let output = pybox(&["exec", dir.path().to_str().unwrap()], cache.path());
    assert_eq!(output.status.code(), Some(7));
}

#[test]
#[serial]
fn test_exec_applies_environment_and_workdir() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let interpreter = fake_interpreter(
        dir.path(),
        "echo \"$*|$PYTHONUNBUFFERED|$GREETING|$(pwd)\"",
    );
    create_project(
        dir.path(),
        Some(&format!(
            "entrypoint:\n  interpreter: {}\n  module: svc.server\nenv:\n  GREETING: hi\n",
            interpreter.display()
        )),
    );

    let output = pybox(&["exec", dir.path().to_str().unwrap()], cache.path());
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let cwd = dir.path().canonicalize().unwrap();
    assert_eq!(
        stdout(&output).trim(),
        format!("-m svc.server|1|hi|{}", cwd.display())
    );
}

#[test]
#[serial]
fn test_exec_runs_from_image_workdir_layout() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let interpreter = fake_interpreter(dir.path(), "pwd");
    create_project(
        dir.path(),
        Some(&format!(
            "entrypoint:\n  interpreter: {}\nsource:\n  path: src\n  dest: .\n",
            interpreter.display()
        )),
    );
    fs::create_dir_all(dir.path().join("src/app")).unwrap();

    let output = pybox(&["exec", dir.path().to_str().unwrap()], cache.path());
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let expected = dir.path().canonicalize().unwrap().join("src");
    assert_eq!(stdout(&output).trim(), expected.display().to_string());

    let explicit = pybox(
        &[
            "exec",
            dir.path().to_str().unwrap(),
            "--workdir",
            dir.path().to_str().unwrap(),
        ],
        cache.path(),
    );
    assert!(explicit.status.success(), "stderr: {}", stderr(&explicit));
    assert_eq!(
        stdout(&explicit).trim(),
        dir.path().canonicalize().unwrap().display().to_string()
    );
}

#[test]
#[serial]
fn test_exec_signal_maps_to_128_plus() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let interpreter = fake_interpreter(dir.path(), "kill -TERM $$");
    create_project(
        dir.path(),
        Some(&format!(
            "entrypoint:\n  interpreter: {}\n",
            interpreter.display()
        )),
    );

    let output = pybox(&["exec", dir.path().to_str().unwrap()], cache.path());
    assert_eq!(output.status.code(), Some(143));
}

#[test]
fn test_exec_rejects_extra_args() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let marker = dir.path().join("started");
    let interpreter = fake_interpreter(dir.path(), &format!("touch {}", marker.display()));
    create_project(
        dir.path(),
        Some(&format!(
            "entrypoint:\n  interpreter: {}\n",
            interpreter.display()
        )),
    );

    let output = pybox(
        &["exec", dir.path().to_str().unwrap(), "--", "--port", "8080"],
        cache.path(),
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("extra arguments are not accepted"));
    assert!(!marker.exists());
}

#[test]
fn test_run_rejects_extra_args() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), None);

    let output = pybox(
        &["run", dir.path().to_str().unwrap(), "--", "--debug"],
        cache.path(),
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("python -m app.main"));
}

#[test]
fn test_stray_argument_is_usage_error() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), None);

    let output = pybox(
        &["exec", dir.path().to_str().unwrap(), "serve"],
        cache.path(),
    );
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_health_command() {
    let cache = TempDir::new().unwrap();
    let output = pybox(&["health"], cache.path());

    // Passes with or without a Docker daemon
    let out = stdout(&output);
    assert!(out.contains("config"));
    assert!(out.contains("cache"));
    assert!(out.contains("docker"));
}

#[test]
#[ignore = "requires a Docker daemon and registry access"]
fn test_build_source_edit_reuses_dependency_stage() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    create_project(dir.path(), Some("name: pybox-e2e\n"));
    let context = dir.path().to_str().unwrap();

    let first = pybox(&["build", context, "-f", "json"], cache.path());
    assert!(first.status.success(), "stderr: {}", stderr(&first));

    fs::write(dir.path().join("app/main.py"), "print('edited')\n").unwrap();
    let second = pybox(&["build", context, "-f", "json"], cache.path());
    assert!(second.status.success(), "stderr: {}", stderr(&second));

    let report: serde_json::Value = serde_json::from_str(&stdout(&second)).unwrap();
    let statuses: Vec<&str> = report["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["cached", "cached", "built"]);
}
