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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_at(v: &serde_json::Value, pointer: &str) -> String {
    v.pointer(pointer)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", pointer, v))
        .to_string()
}

#[test]
fn orientation_courses_and_book_folios_over_ipc() {
    let workspace = temp_dir("escolard-catalog");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let orientation = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "orientations.create",
        json!({ "name": "Economia" }),
    );
    let orientation_id = str_at(&orientation, "/id");
    let dup = request(
        &mut stdin,
        &mut reader,
        "3",
        "orientations.create",
        json!({ "name": "Economia" }),
    );
    assert_eq!(dup["error"]["code"], "conflict");

    let cycle_id = str_at(
        &request_ok(&mut stdin, &mut reader, "4", "cycles.create", json!({ "year": 2026 })),
        "/id",
    );
    let course_id = str_at(
        &request_ok(
            &mut stdin,
            &mut reader,
            "5",
            "courses.create",
            json!({ "cycleId": cycle_id, "gradeLevel": "4to", "division": "A", "orientationId": orientation_id }),
        ),
        "/courseId",
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "courses.create",
        json!({ "cycleId": cycle_id, "gradeLevel": "4to", "division": "B" }),
    );

    let clash = request(
        &mut stdin,
        &mut reader,
        "7",
        "courses.update",
        json!({ "courseId": course_id, "patch": { "division": "B" } }),
    );
    assert_eq!(clash["error"]["code"], "conflict");
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "courses.update",
        json!({ "courseId": course_id, "patch": { "division": "C" } }),
    );
    assert_eq!(updated["division"], "C");
    assert_eq!(updated["orientationName"], "Economia");

    let listed = request_ok(&mut stdin, &mut reader, "9", "orientations.list", json!({}));
    assert_eq!(listed["orientations"][0]["courseCount"], 1);
    let in_use = request(
        &mut stdin,
        &mut reader,
        "10",
        "orientations.delete",
        json!({ "orientationId": orientation_id }),
    );
    assert_eq!(in_use["error"]["code"], "conflict");

    let student_id = str_at(
        &request_ok(
            &mut stdin,
            &mut reader,
            "11",
            "students.create",
            json!({
                "actorUserId": "admin-1",
                "documentId": "45123456",
                "lastName": "Ibarra",
                "firstName": "Lucia",
                "bookFolios": [{ "book": "12", "folio": "88" }],
            }),
        ),
        "/id",
    );
    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "students.profile",
        json!({ "studentId": student_id }),
    );
    assert_eq!(str_at(&profile, "/student/bookFolios/0/folio"), "88");

    let wildcard = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "students.list",
        json!({ "search": "%" }),
    );
    assert_eq!(wildcard["students"].as_array().map(|a| a.len()), Some(0));
}
