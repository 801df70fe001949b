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
fn closed_period_rejects_grades_until_reopened() {
    let workspace = temp_dir("escolard-period-gate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let cycle = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "cycles.create",
        json!({ "year": 2025, "inProgress": true }),
    );
    let cycle_id = str_at(&cycle, "/id");
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({ "cycleId": cycle_id, "gradeLevel": "3ro", "division": "B", "shift": "TARDE" }),
    );
    let course_id = str_at(&course, "/courseId");
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({ "name": "Quimica" }),
    );
    let subject_id = str_at(&subject, "/subjectId");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({
            "actorUserId": "admin-1",
            "documentId": "43000111",
            "lastName": "Rios",
            "firstName": "Tomas",
        }),
    );
    let student_id = str_at(&student, "/id");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "enrollments.create",
        json!({ "studentId": student_id, "courseId": course_id }),
    );

    let submit = |score: f64| {
        json!({
            "actorUserId": "docente-7",
            "studentId": student_id,
            "courseId": course_id,
            "subjectId": subject_id,
            "semester": 2,
            "instance": "cierre",
            "score": score,
        })
    };

    let first = request_ok(&mut stdin, &mut reader, "7", "grades.submit", submit(5.0));
    let grade_id = str_at(&first, "/grade/id");
    assert_eq!(str_at(&first, "/grade/recordedBy"), "docente-7");

    let closed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "periods.setClosed",
        json!({
            "actorUserId": "director-1",
            "cycleId": cycle_id,
            "instance": "CIERRE",
            "semester": 2,
            "closed": true,
        }),
    );
    assert_eq!(closed.pointer("/period/closed"), Some(&json!(true)));
    assert_eq!(str_at(&closed, "/period/closedBy"), "director-1");

    let is_closed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "periods.isClosed",
        json!({ "cycleId": cycle_id, "instance": "CIERRE", "semester": 2 }),
    );
    assert_eq!(is_closed["closed"], true);
    let other_semester = request_ok(
        &mut stdin,
        &mut reader,
        "9b",
        "periods.isClosed",
        json!({ "cycleId": cycle_id, "instance": "CIERRE", "semester": 1 }),
    );
    assert_eq!(other_semester["closed"], false);

    let rejected = request(&mut stdin, &mut reader, "10", "grades.submit", submit(9.0));
    assert_eq!(rejected["ok"], false);
    assert_eq!(rejected["error"]["code"], "period_closed");
    assert_eq!(rejected["error"]["details"]["instance"], "CIERRE");

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.byStudent",
        json!({ "studentId": student_id }),
    );
    assert_eq!(stored["grades"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(stored["grades"][0]["score"], 5.0);

    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "periods.setClosed",
        json!({
            "actorUserId": "director-1",
            "cycleId": cycle_id,
            "instance": "CIERRE",
            "semester": 2,
            "closed": false,
        }),
    );
    assert!(reopened["period"]["closedAt"].is_null());

    let second = request_ok(&mut stdin, &mut reader, "13", "grades.submit", submit(9.0));
    assert_eq!(str_at(&second, "/grade/id"), grade_id);
    assert_eq!(second["grade"]["score"], 9.0);

    let periods = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "periods.list",
        json!({ "cycleId": cycle_id }),
    );
    assert_eq!(periods["periods"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(periods["periods"][0]["closed"], false);
}

#[test]
fn grade_validation_errors_are_reported() {
    let workspace = temp_dir("escolard-grade-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let out_of_range = request(
        &mut stdin,
        &mut reader,
        "2",
        "grades.submit",
        json!({
            "actorUserId": "t",
            "studentId": "s",
            "courseId": "c",
            "subjectId": "m",
            "semester": 1,
            "instance": "INFORME_1",
            "score": 11,
        }),
    );
    assert_eq!(out_of_range["error"]["code"], "invalid_input");

    let unknown_instance = request(
        &mut stdin,
        &mut reader,
        "3",
        "grades.submit",
        json!({
            "actorUserId": "t",
            "studentId": "s",
            "courseId": "c",
            "subjectId": "m",
            "semester": 1,
            "instance": "RECUPERATORIO",
            "score": 7,
        }),
    );
    assert_eq!(unknown_instance["error"]["code"], "bad_params");

    let not_enrolled = request(
        &mut stdin,
        &mut reader,
        "4",
        "grades.submit",
        json!({
            "actorUserId": "t",
            "studentId": "s",
            "courseId": "c",
            "subjectId": "m",
            "semester": 1,
            "instance": "INFORME_1",
            "score": 7,
        }),
    );
    assert_eq!(not_enrolled["error"]["code"], "not_found");
}
