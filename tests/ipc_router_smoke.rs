use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_attendanced");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn attendanced");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn health_reports_version_and_workspace() {
    let workspace = temp_dir("attendanced-smoke");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let before = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(before.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert!(before
        .get("result")
        .and_then(|r| r.get("workspacePath"))
        .map(|v| v.is_null())
        .unwrap_or(false));

    let selected = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected.get("ok").and_then(|v| v.as_bool()), Some(true));

    let after = request(&mut stdin, &mut reader, "3", "health", json!({}));
    assert!(after
        .get("result")
        .and_then(|r| r.get("workspacePath"))
        .and_then(|v| v.as_str())
        .is_some());
}

#[test]
fn malformed_request_lines_get_a_parseable_error_reply() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    // Not JSON at all, and JSON of the wrong shape; both replies must still
    // be valid single-line JSON carrying the bad_json code.
    for raw in ["{\"id\": \"1\", \"method\"", "\"just a string\""] {
        writeln!(stdin, "{}", raw).expect("write raw line");
        stdin.flush().expect("flush raw line");

        let mut line = String::new();
        reader.read_line(&mut line).expect("read response line");
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("reply must parse as json");
        assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
        assert_eq!(error_code(&value), "bad_json");
    }
}

#[test]
fn data_methods_require_a_workspace_and_unknown_methods_are_flagged() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let no_ws = request(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.forCourse",
        json!({ "courseId": "c1" }),
    );
    assert_eq!(error_code(&no_ws), "no_workspace");

    // Directory reads are data methods too; no silent empty listings.
    let no_ws_courses = request(&mut stdin, &mut reader, "2", "directory.courses", json!({}));
    assert_eq!(error_code(&no_ws_courses), "no_workspace");

    let unknown = request(&mut stdin, &mut reader, "3", "attendance.purge", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");
}
