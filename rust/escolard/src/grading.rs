use crate::periods::PeriodRegistry;
use crate::trajectory::Instance;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 10.0;

#[derive(Debug, Error)]
pub enum GradeError {
    #[error("student {student_id} is not enrolled in course {course_id}")]
    EnrollmentNotFound {
        student_id: String,
        course_id: String,
    },

    #[error("subject not found: {0}")]
    SubjectNotFound(String),

    #[error("{instance} (semester {semester}) is closed")]
    PeriodClosed { instance: Instance, semester: i64 },

    #[error("invalid grade: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

impl GradeError {
    /// IPC error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            GradeError::EnrollmentNotFound { .. } | GradeError::SubjectNotFound(_) => "not_found",
            GradeError::PeriodClosed { .. } => "period_closed",
            GradeError::InvalidInput(_) => "invalid_input",
            GradeError::Db(_) | GradeError::Registry(_) => "db_query_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradeSubmission {
    pub student_id: String,
    pub course_id: String,
    pub subject_id: String,
    pub semester: i64,
    pub instance: Instance,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredGrade {
    pub id: String,
    pub enrollment_id: String,
    pub subject_id: String,
    pub semester: i64,
    pub instance: Instance,
    pub score: f64,
    pub recorded_at: String,
    pub recorded_by: String,
}

fn validate(sub: &GradeSubmission) -> Result<(), GradeError> {
    if !(1..=2).contains(&sub.semester) {
        return Err(GradeError::InvalidInput(format!(
            "semester must be 1 or 2, got {}",
            sub.semester
        )));
    }
    if !sub.score.is_finite() || sub.score < MIN_SCORE || sub.score > MAX_SCORE {
        return Err(GradeError::InvalidInput(format!(
            "score must be between {} and {}",
            MIN_SCORE, MAX_SCORE
        )));
    }
    Ok(())
}

/// Records a grade unless its evaluation period is closed.
///
/// Upserts by (enrollment, subject, semester, instance); a resubmission
/// overwrites the score in place and keeps the row id. A rejected write
/// leaves any stored grade untouched.
pub fn submit_grade(
    conn: &Connection,
    periods: &dyn PeriodRegistry,
    sub: &GradeSubmission,
    actor_user_id: &str,
) -> Result<StoredGrade, GradeError> {
    validate(sub)?;

    let enrollment: Option<(String, String)> = conn
        .query_row(
            "SELECT e.id, co.cycle_id
             FROM enrollments e
             JOIN courses co ON co.id = e.course_id
             WHERE e.student_id = ? AND e.course_id = ?",
            (&sub.student_id, &sub.course_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((enrollment_id, cycle_id)) = enrollment else {
        return Err(GradeError::EnrollmentNotFound {
            student_id: sub.student_id.clone(),
            course_id: sub.course_id.clone(),
        });
    };

    let subject_exists = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&sub.subject_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    if !subject_exists {
        return Err(GradeError::SubjectNotFound(sub.subject_id.clone()));
    }

    if periods.is_closed(&cycle_id, sub.instance, sub.semester)? {
        tracing::warn!(
            cycle_id = %cycle_id,
            instance = sub.instance.as_str(),
            semester = sub.semester,
            "grade write rejected: period closed"
        );
        return Err(GradeError::PeriodClosed {
            instance: sub.instance,
            semester: sub.semester,
        });
    }

    let recorded_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO grades(id, enrollment_id, subject_id, semester, instance, score, recorded_at, recorded_by)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(enrollment_id, subject_id, semester, instance) DO UPDATE SET
           score = excluded.score,
           recorded_at = excluded.recorded_at,
           recorded_by = excluded.recorded_by",
        (
            Uuid::new_v4().to_string(),
            &enrollment_id,
            &sub.subject_id,
            sub.semester,
            sub.instance.as_str(),
            sub.score,
            &recorded_at,
            actor_user_id,
        ),
    )?;
    let id: String = conn.query_row(
        "SELECT id FROM grades
         WHERE enrollment_id = ? AND subject_id = ? AND semester = ? AND instance = ?",
        (
            &enrollment_id,
            &sub.subject_id,
            sub.semester,
            sub.instance.as_str(),
        ),
        |r| r.get(0),
    )?;

    tracing::debug!(
        enrollment_id = %enrollment_id,
        subject_id = %sub.subject_id,
        instance = sub.instance.as_str(),
        "grade recorded"
    );
    Ok(StoredGrade {
        id,
        enrollment_id,
        subject_id: sub.subject_id.clone(),
        semester: sub.semester,
        instance: sub.instance,
        score: sub.score,
        recorded_at,
        recorded_by: actor_user_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::periods::{PeriodParam, SqlitePeriods};
    use std::cell::Cell;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO cycles(id, year, in_progress) VALUES('c25', 2025, 1);
             INSERT INTO courses(id, cycle_id, grade_level, division, shift) VALUES('k1', 'c25', '1st', 'A', 'M');
             INSERT INTO subjects(id, name) VALUES('math', 'Math');
             INSERT INTO students(id, document_id, last_name, first_name, created_by)
               VALUES('s1', '100', 'Perez', 'Ana', 'u');
             INSERT INTO enrollments(id, student_id, course_id) VALUES('e1', 's1', 'k1');",
        )
        .expect("seed");
        conn
    }

    fn submission(score: f64) -> GradeSubmission {
        GradeSubmission {
            student_id: "s1".to_string(),
            course_id: "k1".to_string(),
            subject_id: "math".to_string(),
            semester: 1,
            instance: Instance::Cierre,
            score,
        }
    }

    fn stored_scores(conn: &Connection) -> Vec<f64> {
        let mut stmt = conn
            .prepare("SELECT score FROM grades ORDER BY rowid")
            .expect("prepare");
        stmt.query_map([], |r| r.get(0))
            .expect("query")
            .collect::<Result<Vec<f64>, _>>()
            .expect("collect")
    }

    /// Registry stub that counts lookups.
    struct FixedRegistry {
        closed: bool,
        lookups: Cell<usize>,
    }

    impl PeriodRegistry for FixedRegistry {
        fn is_closed(&self, _: &str, _: Instance, _: i64) -> anyhow::Result<bool> {
            self.lookups.set(self.lookups.get() + 1);
            Ok(self.closed)
        }

        fn set_closed(&self, _: &str, _: Instance, _: i64, _: bool, _: &str) -> anyhow::Result<PeriodParam> {
            anyhow::bail!("read-only registry")
        }

        fn list(&self, _: &str) -> anyhow::Result<Vec<PeriodParam>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn resubmission_overwrites_in_place() {
        let conn = setup();
        let periods = SqlitePeriods::new(&conn);
        let first = submit_grade(&conn, &periods, &submission(4.0), "u-1").expect("first");
        let second = submit_grade(&conn, &periods, &submission(7.5), "u-2").expect("second");
        assert_eq!(first.id, second.id);
        assert_eq!(second.recorded_by, "u-2");
        assert_eq!(stored_scores(&conn), vec![7.5]);
    }

    #[test]
    fn closed_period_rejects_and_keeps_stored_grade() {
        let conn = setup();
        let periods = SqlitePeriods::new(&conn);
        submit_grade(&conn, &periods, &submission(4.0), "u-1").expect("open write");
        periods
            .set_closed("c25", Instance::Cierre, 1, true, "admin")
            .expect("close");

        let err = submit_grade(&conn, &periods, &submission(9.0), "u-1").unwrap_err();
        assert!(matches!(err, GradeError::PeriodClosed { semester: 1, .. }));
        assert_eq!(err.code(), "period_closed");
        assert_eq!(stored_scores(&conn), vec![4.0]);

        // The other semester stays writable.
        let mut other = submission(8.0);
        other.semester = 2;
        submit_grade(&conn, &periods, &other, "u-1").expect("semester 2 open");

        periods
            .set_closed("c25", Instance::Cierre, 1, false, "admin")
            .expect("reopen");
        submit_grade(&conn, &periods, &submission(9.0), "u-1").expect("reopened write");
        assert_eq!(stored_scores(&conn), vec![9.0, 8.0]);
    }

    #[test]
    fn registry_is_consulted_after_referential_checks() {
        let conn = setup();
        let registry = FixedRegistry {
            closed: true,
            lookups: Cell::new(0),
        };
        let mut missing = submission(5.0);
        missing.subject_id = "nope".to_string();
        let err = submit_grade(&conn, &registry, &missing, "u").unwrap_err();
        assert!(matches!(err, GradeError::SubjectNotFound(ref s) if s == "nope"));
        assert_eq!(registry.lookups.get(), 0);

        let err = submit_grade(&conn, &registry, &submission(5.0), "u").unwrap_err();
        assert!(matches!(err, GradeError::PeriodClosed { .. }));
        assert_eq!(registry.lookups.get(), 1);
    }

    #[test]
    fn unknown_enrollment_is_not_found() {
        let conn = setup();
        let periods = SqlitePeriods::new(&conn);
        let mut sub = submission(5.0);
        sub.course_id = "other".to_string();
        let err = submit_grade(&conn, &periods, &sub, "u").unwrap_err();
        assert!(matches!(err, GradeError::EnrollmentNotFound { .. }));
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn out_of_range_values_are_invalid() {
        let conn = setup();
        let periods = SqlitePeriods::new(&conn);
        for bad in [-0.5, 10.5, f64::INFINITY] {
            let err = submit_grade(&conn, &periods, &submission(bad), "u").unwrap_err();
            assert!(matches!(err, GradeError::InvalidInput(_)));
        }
        let mut sub = submission(5.0);
        sub.semester = 3;
        assert!(matches!(
            submit_grade(&conn, &periods, &sub, "u").unwrap_err(),
            GradeError::InvalidInput(_)
        ));
        assert!(stored_scores(&conn).is_empty());
    }
}
