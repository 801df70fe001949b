use super::policy::load_policy;
use super::students::{load_student, subject_names};
use crate::history::{active_enrollment, load_student_history};
use crate::ipc::helpers::{get_required_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::trajectory::{self, Instance};
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Default)]
struct BulletinRow {
    informe_1: Option<f64>,
    informe_2: Option<f64>,
    pfa: Option<f64>,
    cierre: Option<f64>,
}

/// Bulletin data for the student's enrollment in the in-progress cycle.
///
/// Each instance column holds the most recently stored score for that
/// instance, whichever semester it belongs to.
fn reports_bulletin(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = load_student(conn, &student_id)?;
    let history = load_student_history(conn, &student_id)?;
    let Some(active) = active_enrollment(&history) else {
        return Err(HandlerErr::not_found("student has no active enrollment")
            .with_details(json!({ "studentId": student_id })));
    };
    let names = subject_names(conn)?;
    let grades = &active.enrollment.grades;

    let mut rows: BTreeMap<&str, BulletinRow> = BTreeMap::new();
    for g in grades {
        let row = rows.entry(g.subject_id.as_str()).or_default();
        let slot = match g.instance {
            Instance::Informe1 => &mut row.informe_1,
            Instance::Informe2 => &mut row.informe_2,
            Instance::Pfa => &mut row.pfa,
            Instance::Cierre => &mut row.cierre,
            _ => continue,
        };
        *slot = Some(g.score);
    }
    let finals = trajectory::resolve_final_grades(grades);
    for subject_id in finals.keys() {
        rows.entry(subject_id.as_str()).or_default();
    }

    let mut subjects: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(subject_id, row)| {
            json!({
                "subjectId": subject_id,
                "subjectName": names.get(subject_id),
                "informe1": row.informe_1,
                "informe2": row.informe_2,
                "pfa": row.pfa,
                "cierre": row.cierre,
                "finalGrade": finals.get(subject_id).map(|g| g.score),
            })
        })
        .collect();
    subjects.sort_by(|a, b| {
        a["subjectName"]
            .as_str()
            .unwrap_or_default()
            .cmp(b["subjectName"].as_str().unwrap_or_default())
    });

    let ctx = &active.context;
    Ok(json!({
        "student": student,
        "course": {
            "id": ctx.course_id,
            "gradeLevel": ctx.grade_level,
            "division": ctx.division,
            "shift": ctx.shift,
            "cycleYear": ctx.cycle_year,
        },
        "subjects": subjects,
        "absences": ctx.absences,
    }))
}

/// Closing-instance failure count and risk band for every student enrolled
/// in the in-progress cycle, ordered by last and first name.
fn reports_risk(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let policy = load_policy(conn)?;
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT s.id, s.last_name, s.first_name, s.document_id
             FROM students s
             JOIN enrollments e ON e.student_id = s.id
             JOIN courses co ON co.id = e.course_id
             JOIN cycles cy ON cy.id = co.cycle_id
             WHERE cy.in_progress = 1
             ORDER BY s.last_name, s.first_name",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let students = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;

    let mut out = Vec::with_capacity(students.len());
    for (student_id, last, first, document_id) in students {
        let history = load_student_history(conn, &student_id)?;
        let Some(active) = active_enrollment(&history) else {
            continue;
        };
        let failing = trajectory::count_failing_closing(active.enrollment.grades.iter(), &policy);
        let level = trajectory::classify_risk(failing);
        out.push(json!({
            "studentId": student_id,
            "displayName": format!("{}, {}", last, first),
            "documentId": document_id,
            "gradeLevel": active.context.grade_level,
            "division": active.context.division,
            "failingClosingCount": failing,
            "risk": level.code(),
            "riskLabel": level.label(),
        }));
    }

    tracing::debug!(students = out.len(), "risk report built");
    Ok(json!({ "students": out }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.bulletin" => Some(with_conn(state, req, reports_bulletin)),
        "reports.risk" => Some(with_conn(state, req, reports_risk)),
        _ => None,
    }
}
