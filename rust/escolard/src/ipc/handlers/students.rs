use super::policy::load_policy;
use crate::history::load_student_history;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, get_optional_str, get_required_str, like_contains, map_write_err, parse_optional_day,
    require_exists, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::trajectory::{self, Enrollment, PromotionPolicy};
use chrono::Datelike;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const STUDENT_COLUMNS: &str =
    "s.id, s.document_id, s.last_name, s.first_name, s.birth_date, s.admission_date, s.status";

fn student_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "documentId": r.get::<_, String>(1)?,
        "lastName": r.get::<_, String>(2)?,
        "firstName": r.get::<_, String>(3)?,
        "birthDate": r.get::<_, Option<String>>(4)?,
        "admissionDate": r.get::<_, Option<String>>(5)?,
        "status": r.get::<_, String>(6)?,
    }))
}

/// Book and folio pairs from the enrolment register.
fn parse_book_folios(raw: Option<&serde_json::Value>) -> Result<Vec<(String, String)>, HandlerErr> {
    let items = match raw {
        None | Some(serde_json::Value::Null) => return Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items,
        Some(_) => return Err(HandlerErr::bad_params("bookFolios must be an array")),
    };
    items
        .iter()
        .map(|item| Ok((get_required_str(item, "book")?, get_required_str(item, "folio")?)))
        .collect()
}

fn replace_book_folios(
    conn: &Connection,
    student_id: &str,
    folios: &[(String, String)],
) -> Result<(), HandlerErr> {
    conn.execute("DELETE FROM student_book_folios WHERE student_id = ?", [student_id])
        .map_err(HandlerErr::db("db_delete_failed"))?;
    for (book, folio) in folios {
        conn.execute(
            "INSERT INTO student_book_folios(id, student_id, book, folio) VALUES(?, ?, ?, ?)",
            (Uuid::new_v4().to_string(), student_id, book, folio),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;
    }
    Ok(())
}

/// Book folios per student, in insertion order. Only ids in `student_ids`
/// are loaded.
fn book_folios_by_student(
    conn: &Connection,
    student_ids: &[String],
) -> Result<HashMap<String, Vec<serde_json::Value>>, HandlerErr> {
    let mut out: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
    if student_ids.is_empty() {
        return Ok(out);
    }
    let marks = vec!["?"; student_ids.len()].join(", ");
    let mut stmt = conn
        .prepare(&format!(
            "SELECT student_id, book, folio FROM student_book_folios
             WHERE student_id IN ({})
             ORDER BY rowid",
            marks
        ))
        .map_err(HandlerErr::db("db_query_failed"))?;
    let rows = stmt
        .query_map(params_from_iter(student_ids), |r| {
            Ok((
                r.get::<_, String>(0)?,
                json!({ "book": r.get::<_, String>(1)?, "folio": r.get::<_, String>(2)? }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    for (student_id, folio) in rows {
        out.entry(student_id).or_default().push(folio);
    }
    Ok(out)
}

fn attach_book_folios(conn: &Connection, students: &mut [serde_json::Value]) -> Result<(), HandlerErr> {
    let ids: Vec<String> = students
        .iter()
        .filter_map(|s| s["id"].as_str().map(str::to_string))
        .collect();
    let mut folios = book_folios_by_student(conn, &ids)?;
    for (student, id) in students.iter_mut().zip(ids) {
        student["bookFolios"] = json!(folios.remove(&id).unwrap_or_default());
    }
    Ok(())
}

pub fn load_student(conn: &Connection, student_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let mut student = conn
        .query_row(
            &format!("SELECT {} FROM students s WHERE s.id = ?", STUDENT_COLUMNS),
            [student_id],
            student_row_json,
        )
        .optional()
        .map_err(HandlerErr::db("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    let mut folios = book_folios_by_student(conn, &[student_id.to_string()])?;
    student["bookFolios"] = json!(folios.remove(student_id).unwrap_or_default());
    Ok(student)
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let search = get_optional_str(params, "search")?;
    let status = get_optional_str(params, "status")?;
    let grade_level = get_optional_str(params, "gradeLevel")?;
    let division = get_optional_str(params, "division")?;
    let shift = get_optional_str(params, "shift")?;
    let cycle_year = params.get("cycleYear").and_then(|v| v.as_i64());
    let without_course = params
        .get("withoutCourse")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(q) = search {
        // A search overrides every other filter. Wildcards in it are literal.
        let like = like_contains(&q.to_lowercase());
        clauses.push(
            "(lower(s.document_id) LIKE ? ESCAPE '\\'
              OR lower(s.first_name) LIKE ? ESCAPE '\\'
              OR lower(s.last_name) LIKE ? ESCAPE '\\')"
                .to_string(),
        );
        for _ in 0..3 {
            binds.push(Value::Text(like.clone()));
        }
    } else {
        if let Some(st) = status {
            clauses.push("s.status = ?".to_string());
            binds.push(Value::Text(st));
        }
        if without_course {
            let year = cycle_year.unwrap_or_else(|| i64::from(chrono::Local::now().year()));
            clauses.push(
                "NOT EXISTS (SELECT 1 FROM enrollments e
                             JOIN courses co ON co.id = e.course_id
                             JOIN cycles cy ON cy.id = co.cycle_id
                             WHERE e.student_id = s.id AND cy.year = ?)"
                    .to_string(),
            );
            binds.push(Value::Integer(year));
        } else if cycle_year.is_some() || grade_level.is_some() || division.is_some() || shift.is_some() {
            let mut inner = vec!["e.student_id = s.id".to_string()];
            if let Some(y) = cycle_year {
                inner.push("cy.year = ?".to_string());
                binds.push(Value::Integer(y));
            }
            if let Some(g) = grade_level {
                inner.push("co.grade_level = ?".to_string());
                binds.push(Value::Text(g));
            }
            if let Some(d) = division {
                inner.push("co.division = ?".to_string());
                binds.push(Value::Text(d));
            }
            if let Some(t) = shift {
                inner.push("co.shift = ?".to_string());
                binds.push(Value::Text(t));
            }
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM enrollments e
                         JOIN courses co ON co.id = e.course_id
                         JOIN cycles cy ON cy.id = co.cycle_id
                         WHERE {})",
                inner.join(" AND ")
            ));
        }
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM students s {} ORDER BY s.last_name, s.first_name",
        STUDENT_COLUMNS, where_sql
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db("db_query_failed"))?;
    let mut students = stmt
        .query_map(params_from_iter(binds), student_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    attach_book_folios(conn, &mut students)?;
    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor_user_id = actor(params)?;
    let document_id = get_required_str(params, "documentId")?;
    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    let birth_date = parse_optional_day(params, "birthDate")?;
    let admission_date = parse_optional_day(params, "admissionDate")?;
    let status = get_optional_str(params, "status")?.unwrap_or_else(|| "REGULAR".to_string());
    let book_folios = parse_book_folios(params.get("bookFolios"))?;

    let student_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO students(id, document_id, last_name, first_name, birth_date, admission_date, status, created_by)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &document_id,
            &last_name,
            &first_name,
            &birth_date,
            &admission_date,
            &status,
            &actor_user_id,
        ),
    )
    .map_err(map_write_err("db_insert_failed", "a student with that document id already exists"))?;
    replace_book_folios(&tx, &student_id, &book_folios)?;
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;
    tracing::info!(student_id = %student_id, actor = %actor_user_id, "student created");
    load_student(conn, &student_id)
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor_user_id = actor(params)?;
    let student_id = get_required_str(params, "studentId")?;
    require_exists(conn, "students", &student_id)?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    if patch.is_empty() {
        return Err(HandlerErr::bad_params("patch must not be empty"));
    }

    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    let mut book_folios = None;
    for (k, v) in patch {
        if k == "bookFolios" {
            book_folios = Some(parse_book_folios(Some(v))?);
            continue;
        }
        let wrapped = json!({ "v": v });
        let (col, value) = match k.as_str() {
            "documentId" => ("document_id", Value::Text(get_required_str(&wrapped, "v")?)),
            "lastName" => ("last_name", Value::Text(get_required_str(&wrapped, "v")?)),
            "firstName" => ("first_name", Value::Text(get_required_str(&wrapped, "v")?)),
            "status" => ("status", Value::Text(get_required_str(&wrapped, "v")?)),
            "birthDate" | "admissionDate" => {
                let col = if k == "birthDate" { "birth_date" } else { "admission_date" };
                let day = parse_optional_day(&wrapped, "v")?;
                (col, day.map(Value::Text).unwrap_or(Value::Null))
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown student field: {}", other)));
            }
        };
        sets.push(format!("{} = ?", col));
        binds.push(value);
    }
    sets.push("updated_by = ?".to_string());
    binds.push(Value::Text(actor_user_id));
    sets.push("updated_at = ?".to_string());
    binds.push(Value::Text(chrono::Utc::now().to_rfc3339()));
    binds.push(Value::Text(student_id.clone()));

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    tx.execute(
        &format!("UPDATE students SET {} WHERE id = ?", sets.join(", ")),
        params_from_iter(binds),
    )
    .map_err(map_write_err("db_update_failed", "a student with that document id already exists"))?;
    if let Some(folios) = &book_folios {
        replace_book_folios(&tx, &student_id, folios)?;
    }
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;
    load_student(conn, &student_id)
}

pub fn subject_names(conn: &Connection) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM subjects")
        .map_err(HandlerErr::db("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(rows.into_iter().collect())
}

fn students_profile(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = load_student(conn, &student_id)?;
    let policy = load_policy(conn)?;
    let history = load_student_history(conn, &student_id)?;
    let names = subject_names(conn)?;

    let inputs: Vec<Enrollment> = history.iter().map(|h| h.enrollment.clone()).collect();
    let annotated = trajectory::resolve_trajectory(&inputs, &policy)
        .map_err(|e| HandlerErr::new("invalid_input", e.to_string()))?;
    let contexts: HashMap<&str, &crate::history::EnrollmentContext> = history
        .iter()
        .map(|h| (h.context.enrollment_id.as_str(), &h.context))
        .collect();

    let mut enrollments: Vec<serde_json::Value> = Vec::with_capacity(annotated.len());
    for a in &annotated {
        let mut v = serde_json::to_value(a)
            .map_err(|e| HandlerErr::new("serialize_failed", e.to_string()))?;
        if let Some(ctx) = contexts.get(a.enrollment.id.as_str()) {
            v["course"] = json!({
                "id": ctx.course_id,
                "gradeLevel": ctx.grade_level,
                "division": ctx.division,
                "shift": ctx.shift,
                "cycleId": ctx.cycle_id,
                "cycleYear": ctx.cycle_year,
                "cycleInProgress": ctx.cycle_in_progress,
            });
            v["condition"] = json!(ctx.condition);
            v["absences"] = json!(ctx.absences);
        }
        let final_named: Vec<serde_json::Value> = a
            .final_grades
            .iter()
            .map(|(sid, score)| {
                json!({
                    "subjectId": sid,
                    "subjectName": names.get(sid),
                    "score": score,
                    "owed": policy.is_owed(*score),
                })
            })
            .collect();
        v["finalGradeRows"] = json!(final_named);
        enrollments.push(v);
    }

    tracing::debug!(student_id = %student_id, enrollments = enrollments.len(), "profile resolved");
    Ok(json!({
        "student": student,
        "policy": policy,
        "enrollments": enrollments,
    }))
}

/// Resolves a caller-supplied history without touching the workspace. The
/// workspace policy applies when one is open.
fn handle_students_trajectory(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("enrollments") else {
        return err(&req.id, "bad_params", "missing enrollments", None);
    };
    let enrollments: Vec<Enrollment> = match serde_json::from_value(raw.clone()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "invalid_input", e.to_string(), None),
    };
    let policy = match state.db.as_ref() {
        Some(conn) => match load_policy(conn) {
            Ok(p) => p,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        None => PromotionPolicy::default(),
    };
    match trajectory::resolve_trajectory(&enrollments, &policy) {
        Ok(annotated) => ok(&req.id, json!({ "enrollments": annotated })),
        Err(e) => err(&req.id, "invalid_input", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.profile" => Some(with_conn(state, req, students_profile)),
        "students.trajectory" => Some(handle_students_trajectory(state, req)),
        _ => None,
    }
}
