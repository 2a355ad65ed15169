//! Binary-level integration tests: drive the real `shk` executable against a
//! real filesystem, the way a user invoking it from a shell would.

use predicates::prelude::*;
use std::fs;
use std::io::Write;
use std::process::Command;

fn shk() -> Command {
    Command::new(env!("CARGO_BIN_EXE_shk"))
}

fn write_manifest(dir: &std::path::Path, json: &str) {
    let mut file = fs::File::create(dir.join("build.ninja")).unwrap();
    file.write_all(json.as_bytes()).unwrap();
}

#[test]
fn builds_a_single_step_and_is_clean_on_rerun() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("in.txt"), b"hello").unwrap();
    write_manifest(
        dir.path(),
        r#"{
            "steps": [
                {
                    "command": "cp in.txt out.txt",
                    "outputs": ["out.txt"],
                    "inputs": ["in.txt"]
                }
            ],
            "defaults": [0],
            "pools": [],
            "build_dir": ".shk"
        }"#,
    );

    let status = shk().arg("-C").arg(dir.path()).status().unwrap();
    assert!(status.success());
    assert_eq!(fs::read(dir.path().join("out.txt")).unwrap(), b"hello");

    // Second build should find nothing to do; no invocation log write should
    // fail and the output must be untouched.
    let status = shk().arg("-C").arg(dir.path()).status().unwrap();
    assert!(status.success());
}

#[test]
fn dry_run_does_not_create_the_output() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("in.txt"), b"hello").unwrap();
    write_manifest(
        dir.path(),
        r#"{
            "steps": [
                {
                    "command": "cp in.txt out.txt",
                    "outputs": ["out.txt"],
                    "inputs": ["in.txt"]
                }
            ],
            "defaults": [0],
            "pools": [],
            "build_dir": ".shk"
        }"#,
    );

    let status = shk().arg("-C").arg(dir.path()).arg("-n").status().unwrap();
    assert!(status.success());
    assert!(!dir.path().join("out.txt").exists());
}

#[test]
fn dry_run_does_not_write_rspfile_or_invocation_log() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("in.txt"), b"hello").unwrap();
    // An unrelated file already on disk; a dry run touching this manifest
    // has no business going near it.
    fs::write(dir.path().join("untouched.txt"), b"leftover").unwrap();
    write_manifest(
        dir.path(),
        r#"{
            "steps": [
                {
                    "command": "cp in.txt out.txt",
                    "outputs": ["out.txt"],
                    "inputs": ["in.txt"],
                    "rspfile": "out.rsp",
                    "rspfile_content": "in.txt out.txt"
                }
            ],
            "defaults": [0],
            "pools": [],
            "build_dir": ".shk"
        }"#,
    );

    let status = shk().arg("-C").arg(dir.path()).arg("-n").status().unwrap();
    assert!(status.success());
    assert!(!dir.path().join("out.txt").exists());
    assert!(!dir.path().join("out.rsp").exists());
    assert!(!dir.path().join(".shk").join(".shk_log").exists());
    assert_eq!(fs::read(dir.path().join("untouched.txt")).unwrap(), b"leftover");
}

#[test]
fn targets_tool_lists_declared_outputs() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("in.txt"), b"hello").unwrap();
    write_manifest(
        dir.path(),
        r#"{
            "steps": [
                {"command": "cp in.txt out.txt", "outputs": ["out.txt"], "inputs": ["in.txt"]}
            ],
            "defaults": [0],
            "pools": [],
            "build_dir": ".shk"
        }"#,
    );

    let output = shk().arg("-C").arg(dir.path()).arg("-t").arg("targets").output().unwrap();
    assert!(output.status.success());
    assert!(predicate::str::contains("out.txt").eval(&String::from_utf8_lossy(&output.stdout)));
}

#[test]
fn unknown_tool_name_suggests_the_closest_match() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        r#"{"steps": [], "defaults": [], "pools": [], "build_dir": ".shk"}"#,
    );

    let output = shk().arg("-C").arg(dir.path()).arg("-t").arg("targts").output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(predicate::str::contains("targets").eval(&stderr));
}

#[test]
fn missing_manifest_is_a_clean_failure_not_a_panic() {
    let dir = tempfile::tempdir().unwrap();
    let status = shk().arg("-C").arg(dir.path()).status().unwrap();
    assert!(!status.success());
}
