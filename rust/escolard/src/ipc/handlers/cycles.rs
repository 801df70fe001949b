use crate::ipc::helpers::{
    actor, get_required_bool, get_required_i64, get_required_str, map_write_err,
    parse_optional_day, require_exists, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::periods::{PeriodRegistry, SqlitePeriods};
use crate::trajectory::Instance;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn cycle_json(conn: &Connection, cycle_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, year, start_date, end_date, in_progress FROM cycles WHERE id = ?",
        [cycle_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "year": r.get::<_, i64>(1)?,
                "startDate": r.get::<_, Option<String>>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?,
                "inProgress": r.get::<_, i64>(4)? != 0,
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::db("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("cycle not found"))
}

fn cycles_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, year, start_date, end_date, in_progress,
                    (SELECT COUNT(*) FROM courses co WHERE co.cycle_id = c.id) AS course_count
             FROM cycles c
             ORDER BY year DESC",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let cycles = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "year": r.get::<_, i64>(1)?,
                "startDate": r.get::<_, Option<String>>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?,
                "inProgress": r.get::<_, i64>(4)? != 0,
                "courseCount": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(json!({ "cycles": cycles }))
}

fn cycles_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year = get_required_i64(params, "year")?;
    if !(1900..=2200).contains(&year) {
        return Err(HandlerErr::bad_params("year out of range").with_details(json!({ "year": year })));
    }
    let start_date = parse_optional_day(params, "startDate")?;
    let end_date = parse_optional_day(params, "endDate")?;
    let in_progress = params
        .get("inProgress")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let cycle_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    if in_progress {
        tx.execute("UPDATE cycles SET in_progress = 0 WHERE in_progress = 1", [])
            .map_err(HandlerErr::db("db_update_failed"))?;
    }
    tx.execute(
        "INSERT INTO cycles(id, year, start_date, end_date, in_progress) VALUES(?, ?, ?, ?, ?)",
        (&cycle_id, year, &start_date, &end_date, in_progress as i64),
    )
    .map_err(map_write_err("db_insert_failed", "a cycle for that year already exists"))?;
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    tracing::info!(cycle_id = %cycle_id, year, in_progress, "cycle created");
    cycle_json(conn, &cycle_id)
}

fn cycles_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let cycle_id = get_required_str(params, "cycleId")?;
    require_exists(conn, "cycles", &cycle_id)?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    for (k, v) in patch {
        match k.as_str() {
            "year" => {
                let Some(year) = v.as_i64() else {
                    return Err(HandlerErr::bad_params("year must be an integer"));
                };
                tx.execute("UPDATE cycles SET year = ? WHERE id = ?", (year, &cycle_id))
                    .map_err(map_write_err("db_update_failed", "a cycle for that year already exists"))?;
            }
            "startDate" | "endDate" => {
                let day = parse_optional_day(&json!({ "d": v }), "d")?;
                let col = if k == "startDate" { "start_date" } else { "end_date" };
                tx.execute(
                    &format!("UPDATE cycles SET {} = ? WHERE id = ?", col),
                    (&day, &cycle_id),
                )
                .map_err(HandlerErr::db("db_update_failed"))?;
            }
            "inProgress" => {
                let Some(flag) = v.as_bool() else {
                    return Err(HandlerErr::bad_params("inProgress must be a boolean"));
                };
                if flag {
                    tx.execute(
                        "UPDATE cycles SET in_progress = 0 WHERE id <> ? AND in_progress = 1",
                        [&cycle_id],
                    )
                    .map_err(HandlerErr::db("db_update_failed"))?;
                }
                tx.execute(
                    "UPDATE cycles SET in_progress = ? WHERE id = ?",
                    (flag as i64, &cycle_id),
                )
                .map_err(HandlerErr::db("db_update_failed"))?;
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown cycle field: {}", other)));
            }
        }
    }
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;
    cycle_json(conn, &cycle_id)
}

fn cycles_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let cycle_id = get_required_str(params, "cycleId")?;
    require_exists(conn, "cycles", &cycle_id)?;
    let course_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM courses WHERE cycle_id = ?",
            [&cycle_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    if course_count > 0 {
        return Err(HandlerErr::new("conflict", "cycle has courses and cannot be deleted")
            .with_details(json!({ "courseCount": course_count })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    tx.execute("DELETE FROM period_params WHERE cycle_id = ?", [&cycle_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "period_params" }))
        })?;
    tx.execute("DELETE FROM cycles WHERE id = ?", [&cycle_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "cycles" }))
        })?;
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn parse_period_key(params: &serde_json::Value) -> Result<(String, Instance, i64), HandlerErr> {
    let cycle_id = get_required_str(params, "cycleId")?;
    let instance_raw = get_required_str(params, "instance")?;
    let Some(instance) = Instance::parse(&instance_raw) else {
        return Err(HandlerErr::bad_params("unknown instance")
            .with_details(json!({ "instance": instance_raw })));
    };
    let semester = get_required_i64(params, "semester")?;
    if !(1..=2).contains(&semester) {
        return Err(HandlerErr::bad_params("semester must be 1 or 2"));
    }
    Ok((cycle_id, instance, semester))
}

fn periods_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let cycle_id = get_required_str(params, "cycleId")?;
    require_exists(conn, "cycles", &cycle_id)?;
    let periods = SqlitePeriods::new(conn).list(&cycle_id)?;
    Ok(json!({ "periods": periods }))
}

fn periods_is_closed(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (cycle_id, instance, semester) = parse_period_key(params)?;
    let closed = SqlitePeriods::new(conn).is_closed(&cycle_id, instance, semester)?;
    Ok(json!({ "closed": closed }))
}

fn periods_set_closed(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (cycle_id, instance, semester) = parse_period_key(params)?;
    let closed = get_required_bool(params, "closed")?;
    let actor_user_id = actor(params)?;
    require_exists(conn, "cycles", &cycle_id)?;
    let period = SqlitePeriods::new(conn)
        .set_closed(&cycle_id, instance, semester, closed, &actor_user_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "period": period }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "cycles.list" => Some(with_conn(state, req, cycles_list)),
        "cycles.create" => Some(with_conn(state, req, cycles_create)),
        "cycles.update" => Some(with_conn(state, req, cycles_update)),
        "cycles.delete" => Some(with_conn(state, req, cycles_delete)),
        "periods.list" => Some(with_conn(state, req, periods_list)),
        "periods.isClosed" => Some(with_conn(state, req, periods_is_closed)),
        "periods.setClosed" => Some(with_conn(state, req, periods_set_closed)),
        _ => None,
    }
}
