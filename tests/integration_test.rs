use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};

fn passh(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_passh"))
        .args(args)
        .stdin(Stdio::null())
        .output()
        .expect("Failed to execute passh")
}

fn read(path: &Path) -> Vec<u8> {
    fs::read(path).expect("Failed to read transcript")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_password_is_typed_and_masked_in_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let sent = dir.path().join("sent.log");

    let output = passh(&[
        "-p",
        "hunter2",
        "-l",
        sent.to_str().unwrap(),
        "/bin/sh",
        "-c",
        r#"printf 'Password: '; read pw; echo "got:$pw""#,
    ]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("got:hunter2"));
    assert_eq!(read(&sent), b"********\r");
}

#[test]
fn test_received_transcript_matches_output() {
    let dir = tempfile::tempdir().unwrap();
    let received = dir.path().join("received.log");

    let output = passh(&[
        "-L",
        received.to_str().unwrap(),
        "/bin/sh",
        "-c",
        "echo one; echo two",
    ]);

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(read(&received), output.stdout);
    assert!(stdout(&output).contains("one\r\ntwo\r\n"));
}

#[test]
fn test_yes_no_answered_once_before_password() {
    let dir = tempfile::tempdir().unwrap();
    let sent = dir.path().join("sent.log");

    let output = passh(&[
        "-y",
        "-l",
        sent.to_str().unwrap(),
        "/bin/sh",
        "-c",
        r#"printf 'continue connecting (yes/no)? '; read a; printf 'Password: '; read b; echo "a=$a b=$b""#,
    ]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(read(&sent), b"yes\r********\r");
    assert!(stdout(&output).contains("a=yes b=password"));
}

#[test]
fn test_yes_no_ignored_without_flag() {
    let dir = tempfile::tempdir().unwrap();
    let sent = dir.path().join("sent.log");

    let output = passh(&[
        "-l",
        sent.to_str().unwrap(),
        "/bin/sh",
        "-c",
        "printf '(yes/no)? '; sleep 1",
    ]);

    assert_eq!(output.status.code(), Some(0));
    assert!(read(&sent).is_empty());
}

#[test]
fn test_two_tries_then_relay_only() {
    let dir = tempfile::tempdir().unwrap();
    let sent = dir.path().join("sent.log");

    let output = passh(&[
        "-c",
        "2",
        "-l",
        sent.to_str().unwrap(),
        "/bin/sh",
        "-c",
        "printf 'Password: '; read a; printf 'Password: '; read b; printf 'Password: '; sleep 1; echo done",
    ]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(read(&sent), b"********\r********\r");
    assert!(stdout(&output).contains("done"));
}

#[test]
fn test_fatal_max_tries_exit_code() {
    let output = passh(&[
        "-c",
        "1",
        "-C",
        "/bin/sh",
        "-c",
        "printf 'Password: '; read a; printf 'Password: '; read b; sleep 5",
    ]);

    assert_eq!(output.status.code(), Some(205));
    assert!(stderr(&output).contains("!! still prompted for passwords after 1 tries"));
}

#[test]
fn test_fatal_timeout_exit_code() {
    let output = passh(&["-t", "1", "-T", "/bin/sh", "-c", "sleep 10"]);

    assert_eq!(output.status.code(), Some(203));
    assert!(stderr(&output).contains("!! timeout waiting for password prompt"));
}

#[test]
fn test_late_prompt_after_timeout_is_not_answered() {
    let dir = tempfile::tempdir().unwrap();
    let sent = dir.path().join("sent.log");

    let output = passh(&[
        "-t",
        "1",
        "-l",
        sent.to_str().unwrap(),
        "/bin/sh",
        "-c",
        "sleep 2; printf 'Password: '; sleep 1",
    ]);

    assert_eq!(output.status.code(), Some(0));
    assert!(read(&sent).is_empty());
}

#[test]
fn test_child_exit_code_is_passed_through() {
    let output = passh(&["/bin/sh", "-c", "exit 3"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn test_killed_child_reports_128_plus_signal() {
    let output = passh(&["/bin/sh", "-c", "kill -9 $$"]);
    assert_eq!(output.status.code(), Some(137));
}

#[test]
fn test_password_from_environment() {
    let output = Command::new(env!("CARGO_BIN_EXE_passh"))
        .args(["-p", "env:PASSH_IT_PASSWORD", "/bin/sh", "-c"])
        .arg(r#"printf 'password: '; read pw; echo "got:$pw""#)
        .env("PASSH_IT_PASSWORD", "from-env")
        .stdin(Stdio::null())
        .output()
        .expect("Failed to execute passh");

    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("got:from-env"));
}

#[test]
fn test_missing_env_password_is_general_error() {
    let output = passh(&["-p", "env:PASSH_IT_SURELY_UNSET", "true"]);
    assert_eq!(output.status.code(), Some(201));
    assert!(stderr(&output).contains("env var not found: PASSH_IT_SURELY_UNSET"));
}

#[test]
fn test_missing_command_is_usage_error() {
    let output = passh(&["-p", "secret"]);
    assert_eq!(output.status.code(), Some(202));
    assert!(stderr(&output).contains("no command specified"));
}

#[test]
fn test_unknown_option_is_usage_error() {
    let output = passh(&["-Z", "true"]);
    assert_eq!(output.status.code(), Some(202));
}

#[test]
fn test_invalid_prompt_is_usage_error() {
    let output = passh(&["-P", r"a\{2,1\}", "true"]);
    assert_eq!(output.status.code(), Some(202));
    assert!(stderr(&output).contains("invalid RE for password prompt"));
}

#[test]
fn test_empty_prompt_is_usage_error() {
    let output = passh(&["-P", "", "true"]);
    assert_eq!(output.status.code(), Some(202));
    assert!(stderr(&output).contains("empty prompt"));
}

#[test]
fn test_unknown_program_is_system_error() {
    let output = passh(&["/nonexistent/passh-test-program"]);
    assert_eq!(output.status.code(), Some(204));
    assert!(stderr(&output).contains("can't execute"));
}

#[test]
fn test_version_and_help_exit_zero() {
    assert_eq!(passh(&["--version"]).status.code(), Some(0));
    let help = passh(&["--help"]);
    assert_eq!(help.status.code(), Some(0));
    assert!(stdout(&help).contains("COMMAND"));
}

#[test]
fn test_command_options_are_not_parsed_as_passh_options() {
    let output = passh(&["/bin/sh", "-c", "exit 7"]);
    assert_eq!(output.status.code(), Some(7));
}
