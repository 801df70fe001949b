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
    let exe = env!("CARGO_BIN_EXE_escolard");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn escolard");
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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("escolard-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));

    let early = request(&mut stdin, &mut reader, "2", "cycles.list", json!({}));
    assert_eq!(error_code(&early), Some("no_workspace"));

    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let calls: Vec<(&str, serde_json::Value)> = vec![
        ("policy.get", json!({})),
        ("policy.update", json!({})),
        ("policy.clearOverride", json!({})),
        ("cycles.list", json!({})),
        ("cycles.create", json!({ "year": 2025, "inProgress": true })),
        ("cycles.update", json!({ "cycleId": "missing" })),
        ("cycles.delete", json!({ "cycleId": "missing" })),
        ("periods.list", json!({ "cycleId": "missing" })),
        ("periods.isClosed", json!({ "cycleId": "missing", "instance": "CIERRE", "semester": 2 })),
        ("periods.setClosed", json!({})),
        ("orientations.list", json!({})),
        ("orientations.create", json!({ "name": "Naturales" })),
        ("orientations.update", json!({ "orientationId": "missing", "name": "x" })),
        ("orientations.delete", json!({ "orientationId": "missing" })),
        ("courses.list", json!({})),
        ("courses.create", json!({})),
        ("courses.update", json!({ "courseId": "missing", "patch": {} })),
        ("courses.delete", json!({ "courseId": "missing" })),
        ("subjects.list", json!({})),
        ("subjects.create", json!({ "name": "Math" })),
        ("subjects.delete", json!({ "subjectId": "missing" })),
        ("students.list", json!({})),
        ("students.create", json!({})),
        ("students.update", json!({ "studentId": "missing", "patch": {} })),
        ("students.profile", json!({ "studentId": "missing" })),
        ("students.trajectory", json!({ "enrollments": [] })),
        ("enrollments.create", json!({})),
        ("enrollments.bulkCreate", json!({})),
        ("enrollments.list", json!({})),
        ("grades.submit", json!({})),
        ("grades.matrix", json!({ "courseId": "missing", "subjectId": "missing" })),
        ("grades.summary", json!({ "studentId": "missing" })),
        ("grades.byStudent", json!({ "studentId": "missing" })),
        ("attendance.bulkUpsert", json!({ "records": [] })),
        ("attendance.list", json!({})),
        ("attendance.byStudent", json!({ "studentId": "missing" })),
        ("reports.bulletin", json!({ "studentId": "missing" })),
        ("reports.risk", json!({})),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let id = format!("call-{}", i);
        let _ = request(&mut stdin, &mut reader, &id, method, params);
    }

    let again = request(&mut stdin, &mut reader, "zz", "health", json!({}));
    assert_eq!(
        again.pointer("/result/workspacePath").and_then(|v| v.as_str()),
        Some(&*workspace.to_string_lossy())
    );

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("bad_json is json");
    assert_eq!(error_code(&value), Some("bad_json"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn unknown_method_reports_not_implemented() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let payload = json!({ "id": "x", "method": "nope.nothing", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&value), Some("not_implemented"));
    drop(stdin);
    let _ = child.wait();
}
