use crate::ipc::helpers::{
    get_optional_str, get_required_str, get_str_array, require_exists, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ENROLLMENTS_BULK_MAX: usize = 2000;

#[derive(Debug, PartialEq)]
enum EnrollOutcome {
    Created(String),
    Transferred(String),
    AlreadyEnrolled(String),
}

impl EnrollOutcome {
    fn json(&self, student_id: &str) -> serde_json::Value {
        let (action, enrollment_id) = match self {
            EnrollOutcome::Created(id) => ("created", id),
            EnrollOutcome::Transferred(id) => ("transferred", id),
            EnrollOutcome::AlreadyEnrolled(id) => ("unchanged", id),
        };
        json!({
            "studentId": student_id,
            "enrollmentId": enrollment_id,
            "action": action,
        })
    }
}

fn course_cycle(conn: &Connection, course_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT cycle_id FROM courses WHERE id = ?",
        [course_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("course not found").with_details(json!({ "courseId": course_id })))
}

/// One enrollment per student per cycle: a second course in the same cycle
/// moves the existing enrollment instead of adding another.
fn enroll_one(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
    cycle_id: &str,
) -> Result<EnrollOutcome, HandlerErr> {
    require_exists(conn, "students", student_id)?;
    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT e.id, e.course_id
             FROM enrollments e
             JOIN courses co ON co.id = e.course_id
             WHERE e.student_id = ? AND co.cycle_id = ?",
            (student_id, cycle_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db("db_query_failed"))?;

    match existing {
        Some((enrollment_id, current_course)) if current_course == course_id => {
            Ok(EnrollOutcome::AlreadyEnrolled(enrollment_id))
        }
        Some((enrollment_id, _)) => {
            conn.execute(
                "UPDATE enrollments SET course_id = ? WHERE id = ?",
                (course_id, &enrollment_id),
            )
            .map_err(|e| {
                HandlerErr::new("db_update_failed", e.to_string())
                    .with_details(json!({ "table": "enrollments" }))
            })?;
            Ok(EnrollOutcome::Transferred(enrollment_id))
        }
        None => {
            let enrollment_id = Uuid::new_v4().to_string();
            let today = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
            conn.execute(
                "INSERT INTO enrollments(id, student_id, course_id, condition, enrolled_on)
                 VALUES(?, ?, ?, 'REGULAR', ?)",
                (&enrollment_id, student_id, course_id, &today),
            )
            .map_err(|e| {
                HandlerErr::new("db_insert_failed", e.to_string())
                    .with_details(json!({ "table": "enrollments" }))
            })?;
            Ok(EnrollOutcome::Created(enrollment_id))
        }
    }
}

fn enrollments_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_required_str(params, "courseId")?;
    let cycle_id = course_cycle(conn, &course_id)?;
    let outcome = enroll_one(conn, &student_id, &course_id, &cycle_id)?;
    if let EnrollOutcome::AlreadyEnrolled(enrollment_id) = &outcome {
        return Err(HandlerErr::new("conflict", "student is already enrolled in this course")
            .with_details(json!({ "enrollmentId": enrollment_id })));
    }
    tracing::info!(student_id = %student_id, course_id = %course_id, outcome = ?outcome, "enrollment saved");
    Ok(outcome.json(&student_id))
}

fn enrollments_bulk_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let student_ids = get_str_array(params, "studentIds")?;
    if student_ids.len() > ENROLLMENTS_BULK_MAX {
        return Err(HandlerErr::bad_params("too many students in one batch")
            .with_details(json!({ "max": ENROLLMENTS_BULK_MAX, "count": student_ids.len() })));
    }
    let cycle_id = course_cycle(conn, &course_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let mut results = Vec::with_capacity(student_ids.len());
    for student_id in &student_ids {
        // Any failure drops `tx`, rolling back the whole batch.
        let outcome = enroll_one(&tx, student_id, &course_id, &cycle_id)?;
        results.push(outcome.json(student_id));
    }
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    tracing::info!(course_id = %course_id, count = results.len(), "bulk enrollment applied");
    Ok(json!({ "results": results }))
}

fn enrollments_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_optional_str(params, "courseId")?;
    let student_id = get_optional_str(params, "studentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.student_id, s.last_name, s.first_name, e.course_id,
                    co.grade_level, co.division, cy.year, e.condition, e.enrolled_on
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             JOIN courses co ON co.id = e.course_id
             JOIN cycles cy ON cy.id = co.cycle_id
             WHERE (?1 IS NULL OR e.course_id = ?1)
               AND (?2 IS NULL OR e.student_id = ?2)
             ORDER BY cy.year DESC, s.last_name, s.first_name",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let rows = stmt
        .query_map((&course_id, &student_id), |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "displayName": format!("{}, {}", last, first),
                "courseId": r.get::<_, String>(4)?,
                "gradeLevel": r.get::<_, String>(5)?,
                "division": r.get::<_, String>(6)?,
                "cycleYear": r.get::<_, i64>(7)?,
                "condition": r.get::<_, String>(8)?,
                "enrolledOn": r.get::<_, Option<String>>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(json!({ "enrollments": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.create" => Some(with_conn(state, req, enrollments_create)),
        "enrollments.bulkCreate" => Some(with_conn(state, req, enrollments_bulk_create)),
        "enrollments.list" => Some(with_conn(state, req, enrollments_list)),
        _ => None,
    }
}
