use predicates::prelude::PredicateBooleanExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Stand-in for ssh: ignores the host and runs the remote command locally.
fn fake_rsh(dir: &Path) -> PathBuf {
    let path = dir.join("fake-rsh");
    std::fs::write(&path, "#!/bin/sh\neval \"last=\\${$#}\"\nexec sh -c \"$last\"\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn create_sample(root: &Path) {
    std::fs::create_dir_all(root.join("docs/old")).unwrap();
    std::fs::write(root.join("docs/readme.txt"), "read me").unwrap();
    std::fs::write(root.join("docs/old/notes.txt"), "notes").unwrap();
    std::fs::write(root.join("data.bin"), vec![7u8; 100_000]).unwrap();
    std::fs::hard_link(root.join("data.bin"), root.join("data-copy.bin")).unwrap();
    std::os::unix::fs::symlink("docs/readme.txt", root.join("readme")).unwrap();
}

fn assert_sample(root: &Path) {
    assert_eq!(
        std::fs::read_to_string(root.join("docs/readme.txt")).unwrap(),
        "read me"
    );
    assert_eq!(
        std::fs::read_to_string(root.join("docs/old/notes.txt")).unwrap(),
        "notes"
    );
    assert_eq!(std::fs::read(root.join("data.bin")).unwrap(), vec![7u8; 100_000]);
    assert_eq!(
        std::fs::metadata(root.join("data.bin")).unwrap().ino(),
        std::fs::metadata(root.join("data-copy.bin")).unwrap().ino()
    );
    assert_eq!(
        std::fs::read_link(root.join("readme")).unwrap(),
        Path::new("docs/readme.txt")
    );
}

fn remote(path: &Path) -> String {
    format!("localhost:{}", path.display())
}

fn dsync() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("dsync").unwrap()
}

#[test]
fn check_dsync_help() {
    dsync()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("--progress-bytes"));
}

#[test]
fn protocol_version_is_json() {
    let output = dsync().arg("--protocol-version").output().unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(json.get("wire").is_some());
    assert!(json.get("semantic").is_some());
}

#[test]
fn configuration_errors_exit_with_6() {
    let src = tempfile::tempdir().unwrap();
    let src_path = src.path().to_str().unwrap();
    let dst = remote(&src.path().join("dst"));
    for args in [
        vec!["--progress-bytes", "1000", src_path, dst.as_str()],
        vec!["--progress-time", "0.01", src_path, dst.as_str()],
        vec!["--exclude", "/etc", src_path, dst.as_str()],
        vec![src_path],
        vec![src_path, "/local/destination"],
    ] {
        dsync()
            .args(&args)
            .assert()
            .code(6)
            .stderr(predicates::str::is_empty().not());
    }
}

#[test]
fn missing_source_is_a_configuration_error() {
    let tmp = tempfile::tempdir().unwrap();
    let rsh = fake_rsh(tmp.path());
    dsync()
        .args(["--rsh", rsh.to_str().unwrap()])
        .arg(tmp.path().join("nope"))
        .arg(remote(&tmp.path().join("dst")))
        .assert()
        .code(6);
    assert!(!tmp.path().join("dst").exists());
}

#[test]
fn local_to_remote_sync() {
    let tmp = tempfile::tempdir().unwrap();
    let rsh = fake_rsh(tmp.path());
    let src = tmp.path().join("src");
    let dst = tmp.path().join("dst");
    create_sample(&src);
    dsync()
        .args(["--rsh", rsh.to_str().unwrap(), "-z"])
        .arg(&src)
        .arg(remote(&dst))
        .assert()
        .success();
    assert_sample(&dst);
    let pidfile = format!("/tmp/dsync.{}.ppid", dst.display().to_string().replace('/', "_"));
    assert!(!Path::new(&pidfile).exists());
}

#[test]
fn delete_and_exclude_from_the_command_line() {
    let tmp = tempfile::tempdir().unwrap();
    let rsh = fake_rsh(tmp.path());
    let src = tmp.path().join("src");
    let dst = tmp.path().join("dst");
    create_sample(&src);
    std::fs::create_dir_all(dst.join("docs/old")).unwrap();
    std::fs::write(dst.join("docs/old/notes.txt"), "kept").unwrap();
    std::fs::write(dst.join("stale"), "gone soon").unwrap();
    dsync()
        .args(["--rsh", rsh.to_str().unwrap(), "--delete", "-x", "docs/old"])
        .arg(&src)
        .arg(remote(&dst))
        .assert()
        .success();
    assert!(!dst.join("stale").exists());
    assert_eq!(
        std::fs::read_to_string(dst.join("docs/old/notes.txt")).unwrap(),
        "kept"
    );
    assert_eq!(
        std::fs::read_to_string(dst.join("docs/readme.txt")).unwrap(),
        "read me"
    );
}

#[test]
fn dry_run_prints_the_plan() {
    let tmp = tempfile::tempdir().unwrap();
    let rsh = fake_rsh(tmp.path());
    let src = tmp.path().join("src");
    let dst = tmp.path().join("dst");
    create_sample(&src);
    dsync()
        .args(["--rsh", rsh.to_str().unwrap(), "--dry-run"])
        .arg(&src)
        .arg(remote(&dst))
        .assert()
        .success()
        .stdout(
            predicates::str::contains("would transfer ./docs/readme.txt (7 bytes)")
                .and(predicates::str::contains("would transfer ./data-copy.bin").not()),
        );
    assert!(!dst.exists());
}

#[test]
fn installed_remote_binary() {
    let tmp = tempfile::tempdir().unwrap();
    let rsh = fake_rsh(tmp.path());
    let src = tmp.path().join("src");
    let dst = tmp.path().join("dst");
    create_sample(&src);
    let binary = assert_cmd::cargo::cargo_bin("dsync");
    dsync()
        .args(["--rsh", rsh.to_str().unwrap(), "--remote-binary"])
        .arg(&binary)
        .arg(&src)
        .arg(remote(&dst))
        .assert()
        .success();
    assert_sample(&dst);
}

#[test]
fn relay_between_two_remote_hosts() {
    let tmp = tempfile::tempdir().unwrap();
    let rsh = fake_rsh(tmp.path());
    let src = tmp.path().join("src");
    let dst = tmp.path().join("dst");
    create_sample(&src);
    dsync()
        .args([
            "--rsh",
            rsh.to_str().unwrap(),
            "--progress-time",
            "1",
            "--omit-progress-timestamp",
        ])
        .arg(remote(&src))
        .arg(remote(&dst))
        .assert()
        .success()
        .stdout(predicates::str::contains("files,").and(predicates::str::contains("transferred")));
    assert_sample(&dst);
    let pidfile = format!(
        "/tmp/dsync.localhost.{}.ppid",
        dst.display().to_string().replace('/', "_")
    );
    assert!(!Path::new(&pidfile).exists());
}

#[test]
fn relay_propagates_the_remote_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    let rsh = fake_rsh(tmp.path());
    dsync()
        .args(["--rsh", rsh.to_str().unwrap()])
        .arg(remote(&tmp.path().join("missing")))
        .arg(remote(&tmp.path().join("dst")))
        .assert()
        .code(6);
    assert!(!tmp.path().join("dst").exists());
}

#[tokio::test]
async fn relayed_agent_reports_configuration_errors() {
    let tmp = tempfile::tempdir().unwrap();
    let output = dsync()
        .args(["--proxy", "--exclude", "/etc"])
        .arg(tmp.path())
        .arg(remote(&tmp.path().join("dst")))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(6));
    let mut relay = dsync_tools_dsync::relay::ProxyRelay::new();
    let code = relay
        .process_stream(
            &output.stdout[..],
            &common::supervisor::CancellationFlag::default(),
        )
        .await
        .unwrap();
    assert_eq!(code, 6);
}

#[test]
fn relay_with_a_relative_source_containing_a_colon() {
    let tmp = tempfile::tempdir().unwrap();
    let rsh = fake_rsh(tmp.path());
    let dst = tmp.path().join("dst");
    create_sample(&tmp.path().join("data:2024"));
    dsync()
        .current_dir(tmp.path())
        .args(["--rsh", rsh.to_str().unwrap()])
        .arg("localhost:data:2024")
        .arg(remote(&dst))
        .assert()
        .success();
    assert_sample(&dst);
}

#[test]
fn relay_with_a_missing_relative_source_exits_with_6() {
    let tmp = tempfile::tempdir().unwrap();
    let rsh = fake_rsh(tmp.path());
    dsync()
        .current_dir(tmp.path())
        .args(["--rsh", rsh.to_str().unwrap()])
        .arg("localhost:rel:dir")
        .arg(remote(&tmp.path().join("dst")))
        .assert()
        .code(6)
        .stderr(predicates::str::contains("ended without reporting").not());
}
