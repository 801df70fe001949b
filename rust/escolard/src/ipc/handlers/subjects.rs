use crate::ipc::helpers::{get_optional_str, get_required_str, require_exists, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

/// Subjects without an orientation are common to every orientation.
const COMMON_ORIENTATION: &str = "E.S.O";

fn subjects_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let orientation = get_optional_str(params, "orientation")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, grade_level, orientation
             FROM subjects
             WHERE ?1 IS NULL
                OR orientation IS NULL
                OR orientation = ?1
                OR orientation = ?2
             ORDER BY grade_level, name",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let subjects = stmt
        .query_map((&orientation, COMMON_ORIENTATION), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "gradeLevel": r.get::<_, Option<String>>(2)?,
                "orientation": r.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let grade_level = get_optional_str(params, "gradeLevel")?;
    let orientation = get_optional_str(params, "orientation")?;
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, grade_level, orientation) VALUES(?, ?, ?, ?)",
        (&subject_id, &name, &grade_level, &orientation),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "subjects" }))
    })?;
    Ok(json!({
        "subjectId": subject_id,
        "name": name,
        "gradeLevel": grade_level,
        "orientation": orientation,
    }))
}

fn subjects_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    require_exists(conn, "subjects", &subject_id)?;
    let grade_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM grades WHERE subject_id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    if grade_count > 0 {
        return Err(HandlerErr::new("conflict", "subject has recorded grades and cannot be deleted")
            .with_details(json!({ "gradeCount": grade_count })));
    }
    conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])
        .map_err(HandlerErr::db("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(with_conn(state, req, subjects_list)),
        "subjects.create" => Some(with_conn(state, req, subjects_create)),
        "subjects.delete" => Some(with_conn(state, req, subjects_delete)),
        _ => None,
    }
}
