//! `renderward policy` resolves and validates sandbox policies

use renderward_core::SandboxPolicy;
use std::io::Write;
use std::process::Command;

fn policy(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_renderward"))
        .arg("policy")
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn file_policy_is_printed_back() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"max_memory_mb": 128, "network_policy": "Blocked"}}"#).unwrap();

    let output = policy(&["--file", file.path().to_str().unwrap()]);
    assert!(output.status.success());
    let printed: SandboxPolicy = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(printed.max_memory_mb, 128);
    assert_eq!(printed.max_cpu_percent, SandboxPolicy::default().max_cpu_percent);
}

#[test]
fn invalid_file_policy_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"max_cpu_percent": 0}}"#).unwrap();

    let output = policy(&["--file", file.path().to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn permissive_flag_disables_job() {
    let output = policy(&["--permissive"]);
    assert!(output.status.success());
    let printed: SandboxPolicy = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(printed, SandboxPolicy::permissive());
}
