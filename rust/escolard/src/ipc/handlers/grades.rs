use super::policy::load_policy;
use crate::grading::{self, GradeError, GradeSubmission};
use crate::history::load_student_history;
use crate::ipc::helpers::{
    actor, get_required_f64, get_required_i64, get_required_str, require_exists, with_conn,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::periods::{PeriodRegistry, SqlitePeriods};
use crate::trajectory::{self, Instance};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map};

fn parse_instance(params: &serde_json::Value) -> Result<Instance, HandlerErr> {
    let raw = get_required_str(params, "instance")?;
    Instance::parse(&raw).ok_or_else(|| {
        HandlerErr::bad_params("unknown instance").with_details(json!({
            "instance": raw,
            "allowed": Instance::ALL.iter().map(|i| i.as_str()).collect::<Vec<_>>(),
        }))
    })
}

fn grades_submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor_user_id = actor(params)?;
    let submission = GradeSubmission {
        student_id: get_required_str(params, "studentId")?,
        course_id: get_required_str(params, "courseId")?,
        subject_id: get_required_str(params, "subjectId")?,
        semester: get_required_i64(params, "semester")?,
        instance: parse_instance(params)?,
        score: get_required_f64(params, "score")?,
    };
    let periods = SqlitePeriods::new(conn);
    let stored = grading::submit_grade(conn, &periods, &submission, &actor_user_id)
        .map_err(|e| {
            let details = match &e {
                GradeError::PeriodClosed { instance, semester } => {
                    Some(json!({ "instance": instance, "semester": semester }))
                }
                GradeError::EnrollmentNotFound { student_id, course_id } => {
                    Some(json!({ "studentId": student_id, "courseId": course_id }))
                }
                GradeError::SubjectNotFound(subject_id) => Some(json!({ "subjectId": subject_id })),
                _ => None,
            };
            let out = HandlerErr::new(e.code(), e.to_string());
            match details {
                Some(d) => out.with_details(d),
                None => out,
            }
        })?;
    tracing::info!(
        grade_id = %stored.id,
        instance = %submission.instance,
        semester = submission.semester,
        "grade submitted"
    );
    Ok(json!({ "grade": stored }))
}

/// Per-student grid for one course and subject, keyed `"<semester>-<INSTANCE>"`.
fn grades_matrix(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let cycle_id: String = conn
        .query_row("SELECT cycle_id FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("course not found"))?;
    require_exists(conn, "subjects", &subject_id)?;

    let periods = SqlitePeriods::new(conn).list(&cycle_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT e.id, s.id, s.last_name, s.first_name, s.document_id
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.course_id = ?
             ORDER BY s.last_name, s.first_name",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let enrolled = stmt
        .query_map([&course_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;

    let mut grade_stmt = conn
        .prepare(
            "SELECT semester, instance, score FROM grades
             WHERE enrollment_id = ? AND subject_id = ?",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let mut students = Vec::with_capacity(enrolled.len());
    for (enrollment_id, student_id, last, first, document_id) in enrolled {
        let cells = grade_stmt
            .query_map((&enrollment_id, &subject_id), |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db("db_query_failed"))?;
        let mut grades = Map::new();
        for (semester, instance, score) in cells {
            grades.insert(format!("{}-{}", semester, instance), json!(score));
        }
        students.push(json!({
            "student": {
                "id": student_id,
                "lastName": last,
                "firstName": first,
                "documentId": document_id,
            },
            "enrollmentId": enrollment_id,
            "grades": grades,
        }));
    }

    Ok(json!({ "students": students, "periods": periods }))
}

fn grades_by_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_exists(conn, "students", &student_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.enrollment_id, g.subject_id, sub.name, g.semester, g.instance,
                    g.score, g.recorded_at, g.recorded_by, cy.year, co.grade_level
             FROM grades g
             JOIN enrollments e ON e.id = g.enrollment_id
             JOIN courses co ON co.id = e.course_id
             JOIN cycles cy ON cy.id = co.cycle_id
             JOIN subjects sub ON sub.id = g.subject_id
             WHERE e.student_id = ?
             ORDER BY cy.year DESC, sub.name, g.semester",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let grades = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "enrollmentId": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "subjectName": r.get::<_, String>(3)?,
                "semester": r.get::<_, i64>(4)?,
                "instance": r.get::<_, String>(5)?,
                "score": r.get::<_, f64>(6)?,
                "recordedAt": r.get::<_, String>(7)?,
                "recordedBy": r.get::<_, String>(8)?,
                "cycleYear": r.get::<_, i64>(9)?,
                "gradeLevel": r.get::<_, String>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(json!({ "grades": grades }))
}

/// Closing-instance failures across every enrollment of the student.
fn grades_summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_exists(conn, "students", &student_id)?;
    let policy = load_policy(conn)?;
    let history = load_student_history(conn, &student_id)?;
    let failing = trajectory::count_failing_closing(
        history.iter().flat_map(|h| h.enrollment.grades.iter()),
        &policy,
    );
    let risk = trajectory::classify_risk(failing);
    Ok(json!({
        "studentId": student_id,
        "failingClosingCount": failing,
        "risk": risk.code(),
        "riskLabel": risk.label(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.submit" => Some(with_conn(state, req, grades_submit)),
        "grades.matrix" => Some(with_conn(state, req, grades_matrix)),
        "grades.byStudent" => Some(with_conn(state, req, grades_by_student)),
        "grades.summary" => Some(with_conn(state, req, grades_summary)),
        _ => None,
    }
}
