use crate::ipc::helpers::{
    get_optional_str, get_required_str, parse_day_str, parse_optional_day, require_exists,
    with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ATTENDANCE_BULK_MAX: usize = 5000;

struct AttendanceRecord {
    enrollment_id: String,
    day: String,
    present: bool,
}

fn parse_records(params: &serde_json::Value) -> Result<Vec<AttendanceRecord>, HandlerErr> {
    let Some(raw) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing records"));
    };
    if raw.len() > ATTENDANCE_BULK_MAX {
        return Err(HandlerErr::bad_params("too many records in one batch")
            .with_details(json!({ "max": ATTENDANCE_BULK_MAX, "count": raw.len() })));
    }
    raw.iter()
        .enumerate()
        .map(|(index, item)| {
            let enrollment_id = get_required_str(item, "enrollmentId")
                .map_err(|e| e.with_details(json!({ "index": index })))?;
            let date_raw = get_required_str(item, "date")
                .map_err(|e| e.with_details(json!({ "index": index })))?;
            let day = parse_day_str(&date_raw).ok_or_else(|| {
                HandlerErr::bad_params("date must be YYYY-MM-DD or an RFC 3339 timestamp")
                    .with_details(json!({ "index": index, "value": date_raw }))
            })?;
            let present = item.get("present").and_then(|v| v.as_bool()).ok_or_else(|| {
                HandlerErr::bad_params("present must be a boolean")
                    .with_details(json!({ "index": index }))
            })?;
            Ok(AttendanceRecord {
                enrollment_id,
                day: day.format("%Y-%m-%d").to_string(),
                present,
            })
        })
        .collect()
}

/// Writes every record or none. A second mark for the same enrollment on the
/// same calendar day replaces the first.
fn attendance_bulk_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let records = parse_records(params)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let mut created = 0usize;
    let mut updated = 0usize;
    for (index, rec) in records.iter().enumerate() {
        require_exists(&tx, "enrollments", &rec.enrollment_id)
            .map_err(|e| e.with_details(json!({ "index": index, "enrollmentId": rec.enrollment_id })))?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM attendance WHERE enrollment_id = ? AND date = ?",
                (&rec.enrollment_id, &rec.day),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db("db_query_failed"))?;
        match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE attendance SET present = ? WHERE id = ?",
                    (rec.present as i64, &id),
                )
                .map_err(HandlerErr::db("db_update_failed"))?;
                updated += 1;
            }
            None => {
                tx.execute(
                    "INSERT INTO attendance(id, enrollment_id, date, present) VALUES(?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &rec.enrollment_id,
                        &rec.day,
                        rec.present as i64,
                    ),
                )
                .map_err(HandlerErr::db("db_insert_failed"))?;
                created += 1;
            }
        }
    }
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    tracing::info!(created, updated, "attendance batch applied");
    Ok(json!({ "created": created, "updated": updated }))
}

fn attendance_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_optional_str(params, "courseId")?;
    let day = parse_optional_day(params, "date")?;
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.enrollment_id, e.student_id, s.last_name, s.first_name, a.date, a.present
             FROM attendance a
             JOIN enrollments e ON e.id = a.enrollment_id
             JOIN students s ON s.id = e.student_id
             WHERE (?1 IS NULL OR e.course_id = ?1)
               AND (?2 IS NULL OR a.date = ?2)
             ORDER BY a.date, s.last_name, s.first_name",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let rows = stmt
        .query_map((&course_id, &day), |r| {
            let last: String = r.get(3)?;
            let first: String = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "enrollmentId": r.get::<_, String>(1)?,
                "studentId": r.get::<_, String>(2)?,
                "displayName": format!("{}, {}", last, first),
                "date": r.get::<_, String>(5)?,
                "present": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(json!({ "attendance": rows }))
}

fn attendance_by_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_exists(conn, "students", &student_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.enrollment_id, cy.year, a.date, a.present
             FROM attendance a
             JOIN enrollments e ON e.id = a.enrollment_id
             JOIN courses co ON co.id = e.course_id
             JOIN cycles cy ON cy.id = co.cycle_id
             WHERE e.student_id = ?
             ORDER BY a.date DESC",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;

    let absences = rows.iter().filter(|(_, _, _, _, present)| !present).count();
    let attendance: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, enrollment_id, year, date, present)| {
            json!({
                "id": id,
                "enrollmentId": enrollment_id,
                "cycleYear": year,
                "date": date,
                "present": present,
            })
        })
        .collect();
    Ok(json!({
        "studentId": student_id,
        "absences": absences,
        "attendance": attendance,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.bulkUpsert" => Some(with_conn(state, req, attendance_bulk_upsert)),
        "attendance.list" => Some(with_conn(state, req, attendance_list)),
        "attendance.byStudent" => Some(with_conn(state, req, attendance_by_student)),
        _ => None,
    }
}
