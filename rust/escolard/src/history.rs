use crate::trajectory::{Enrollment, GradeRecord, Instance};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

/// Course/cycle context of one stored enrollment, kept next to the engine
/// input so views can be joined back by enrollment id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentContext {
    pub enrollment_id: String,
    pub course_id: String,
    pub cycle_id: String,
    pub cycle_year: i64,
    pub cycle_in_progress: bool,
    pub grade_level: String,
    pub division: String,
    pub shift: String,
    pub condition: String,
    pub absences: i64,
}

#[derive(Debug, Clone)]
pub struct StoredEnrollment {
    pub context: EnrollmentContext,
    pub enrollment: Enrollment,
}

/// Loads every enrollment of a student with its grades, in storage order.
pub fn load_student_history(conn: &Connection, student_id: &str) -> anyhow::Result<Vec<StoredEnrollment>> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.course_id, co.cycle_id, cy.year, cy.in_progress,
                co.grade_level, co.division, co.shift, e.condition,
                (SELECT COUNT(*) FROM attendance a
                 WHERE a.enrollment_id = e.id AND a.present = 0) AS absences
         FROM enrollments e
         JOIN courses co ON co.id = e.course_id
         JOIN cycles cy ON cy.id = co.cycle_id
         WHERE e.student_id = ?
         ORDER BY e.rowid",
    )?;
    let contexts = stmt
        .query_map([student_id], |r| {
            Ok(EnrollmentContext {
                enrollment_id: r.get(0)?,
                course_id: r.get(1)?,
                cycle_id: r.get(2)?,
                cycle_year: r.get(3)?,
                cycle_in_progress: r.get::<_, i64>(4)? != 0,
                grade_level: r.get(5)?,
                division: r.get(6)?,
                shift: r.get(7)?,
                condition: r.get(8)?,
                absences: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grades_by_enrollment = load_grades_for_student(conn, student_id)?;
    Ok(contexts
        .into_iter()
        .map(|context| {
            let grades = grades_by_enrollment
                .remove(&context.enrollment_id)
                .unwrap_or_default();
            let enrollment = Enrollment {
                id: context.enrollment_id.clone(),
                grade_level: context.grade_level.clone(),
                cycle_year: context.cycle_year,
                grades,
            };
            StoredEnrollment {
                context,
                enrollment,
            }
        })
        .collect())
}

fn load_grades_for_student(
    conn: &Connection,
    student_id: &str,
) -> anyhow::Result<HashMap<String, Vec<GradeRecord>>> {
    let mut stmt = conn.prepare(
        "SELECT g.enrollment_id, g.subject_id, g.instance, g.semester, g.score, g.recorded_at
         FROM grades g
         JOIN enrollments e ON e.id = g.enrollment_id
         WHERE e.student_id = ?
         ORDER BY g.rowid",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out: HashMap<String, Vec<GradeRecord>> = HashMap::new();
    for (enrollment_id, subject_id, instance_raw, semester, score, recorded_at) in rows {
        let Some(instance) = Instance::parse(&instance_raw) else {
            anyhow::bail!("unknown evaluation instance stored: {}", instance_raw);
        };
        out.entry(enrollment_id).or_default().push(GradeRecord {
            subject_id,
            instance,
            semester,
            score,
            recorded_at,
        });
    }
    Ok(out)
}

/// The student's enrollment in the in-progress cycle, if any.
pub fn active_enrollment(history: &[StoredEnrollment]) -> Option<&StoredEnrollment> {
    history.iter().find(|s| s.context.cycle_in_progress)
}
