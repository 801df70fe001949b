use crate::ipc::helpers::{get_required_str, map_write_err, require_exists, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

const DUPLICATE_NAME: &str = "an orientation with that name already exists";

fn course_count(conn: &Connection, orientation_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM courses WHERE orientation_id = ?",
        [orientation_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db("db_query_failed"))
}

fn orientations_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT o.id, o.name,
                    (SELECT COUNT(*) FROM courses co WHERE co.orientation_id = o.id) AS course_count
             FROM orientations o
             ORDER BY o.name",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let orientations = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "courseCount": r.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(json!({ "orientations": orientations }))
}

fn orientations_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let orientation_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO orientations(id, name) VALUES(?, ?)",
        (&orientation_id, &name),
    )
    .map_err(map_write_err("db_insert_failed", DUPLICATE_NAME))?;
    tracing::info!(orientation_id = %orientation_id, name = %name, "orientation created");
    Ok(json!({ "id": orientation_id, "name": name }))
}

fn orientations_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let orientation_id = get_required_str(params, "orientationId")?;
    let name = get_required_str(params, "name")?;
    require_exists(conn, "orientations", &orientation_id)?;
    conn.execute(
        "UPDATE orientations SET name = ? WHERE id = ?",
        (&name, &orientation_id),
    )
    .map_err(map_write_err("db_update_failed", DUPLICATE_NAME))?;
    Ok(json!({
        "id": orientation_id,
        "name": name,
        "courseCount": course_count(conn, &orientation_id)?,
    }))
}

fn orientations_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let orientation_id = get_required_str(params, "orientationId")?;
    require_exists(conn, "orientations", &orientation_id)?;
    let courses = course_count(conn, &orientation_id)?;
    if courses > 0 {
        return Err(
            HandlerErr::new("conflict", "orientation is used by courses and cannot be deleted")
                .with_details(json!({ "courseCount": courses })),
        );
    }
    conn.execute("DELETE FROM orientations WHERE id = ?", [&orientation_id])
        .map_err(HandlerErr::db("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "orientations.list" => Some(with_conn(state, req, orientations_list)),
        "orientations.create" => Some(with_conn(state, req, orientations_create)),
        "orientations.update" => Some(with_conn(state, req, orientations_update)),
        "orientations.delete" => Some(with_conn(state, req, orientations_delete)),
        _ => None,
    }
}
