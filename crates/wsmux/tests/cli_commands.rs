#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/wsmux-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wsmux() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_wsmux"));
    command.arg("--log-level").arg("error");
    command
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        assert!(start.elapsed() < timeout, "socket never appeared");
        thread::sleep(Duration::from_millis(25));
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<i32> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("try_wait should work") {
            return status.code();
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return None;
        }
        thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn check_against_serve_echoes_on_every_channel() {
    let dir = unique_temp_dir("check");
    let sock_path = dir.join("mux.sock");

    let mut server = wsmux()
        .arg("serve")
        .arg(&sock_path)
        .arg("--slots")
        .arg("3")
        .arg("--once")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve should start");
    wait_for_socket(&sock_path, Duration::from_secs(5));

    let output = wsmux()
        .arg("--format")
        .arg("json")
        .arg("check")
        .arg(&sock_path)
        .arg("--channels")
        .arg("3")
        .arg("--message")
        .arg("hello mux")
        .output()
        .expect("check should run");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "check failed: {stdout}");
    let report: serde_json::Value = serde_json::from_str(stdout.trim()).expect("check prints json");
    assert_eq!(report["slots_granted"], 3);
    assert_eq!(report["default_channel_quota"], 8192);
    let channels = report["channels"].as_array().expect("channels array");
    assert_eq!(channels.len(), 3);
    for (index, channel) in channels.iter().enumerate() {
        assert_eq!(channel["channel_id"], 2 + index);
        assert_eq!(channel["status"], "ok");
        assert_eq!(channel["http_status"], 101);
        assert_eq!(channel["echoed"], "hello mux");
    }

    assert_eq!(wait_for_exit(&mut server, Duration::from_secs(10)), Some(0));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn check_reports_channels_without_slots() {
    let dir = unique_temp_dir("noslot");
    let sock_path = dir.join("mux.sock");

    let mut server = wsmux()
        .arg("serve")
        .arg(&sock_path)
        .arg("--slots")
        .arg("1")
        .arg("--once")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve should start");
    wait_for_socket(&sock_path, Duration::from_secs(5));

    let output = wsmux()
        .arg("--format")
        .arg("json")
        .arg("check")
        .arg(&sock_path)
        .arg("-n")
        .arg("2")
        .output()
        .expect("check should run");

    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("check prints json");
    assert_eq!(report["channels"][0]["status"], "ok");
    assert_eq!(report["channels"][1]["status"], "no-slot");

    assert_eq!(wait_for_exit(&mut server, Duration::from_secs(10)), Some(0));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn check_without_server_fails() {
    let missing = unique_temp_dir("missing").join("absent.sock");
    let output = wsmux()
        .arg("check")
        .arg(&missing)
        .arg("--timeout")
        .arg("200ms")
        .output()
        .expect("check should run");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("connect failed"), "stderr: {stderr}");
}

#[test]
fn decode_prints_control_blocks() {
    // FlowControl(1, 8192) followed by NewChannelSlot(64, 8192).
    let output = wsmux()
        .arg("--format")
        .arg("json")
        .arg("decode")
        .arg("00 40 01 7e 2000 80 40 7e 2000")
        .output()
        .expect("decode should run");

    assert!(output.status.success());
    let decoded: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("decode prints json");
    assert_eq!(decoded["channel_id"], 0);
    assert_eq!(decoded["items"][0]["kind"], "FlowControl");
    assert_eq!(decoded["items"][0]["channel_id"], 1);
    assert_eq!(decoded["items"][1]["kind"], "NewChannelSlot");
}

#[test]
fn decode_reports_protocol_errors_with_exit_60() {
    let output = wsmux()
        .arg("--format")
        .arg("json")
        .arg("decode")
        .arg("00 e0")
        .output()
        .expect("decode should run");

    assert_eq!(output.status.code(), Some(60));
    let decoded: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("decode prints json");
    assert_eq!(decoded["error"]["drop_code"], 2004);
}

#[test]
fn decode_rejects_bad_hex_as_usage_error() {
    let output = wsmux()
        .arg("decode")
        .arg("xyz")
        .output()
        .expect("decode should run");
    assert_eq!(output.status.code(), Some(64));
}
