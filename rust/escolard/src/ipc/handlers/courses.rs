use crate::ipc::helpers::{
    get_optional_str, get_required_str, map_write_err, require_exists, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const DUPLICATE_COURSE: &str =
    "a course with that cycle, grade level, division and shift already exists";

const COURSE_SELECT: &str =
    "SELECT co.id, co.cycle_id, cy.year, co.grade_level, co.division, co.shift,
            co.orientation_id, o.name,
            (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = co.id) AS enrollment_count
     FROM courses co
     JOIN cycles cy ON cy.id = co.cycle_id
     LEFT JOIN orientations o ON o.id = co.orientation_id";

fn course_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "cycleId": r.get::<_, String>(1)?,
        "cycleYear": r.get::<_, i64>(2)?,
        "gradeLevel": r.get::<_, String>(3)?,
        "division": r.get::<_, String>(4)?,
        "shift": r.get::<_, String>(5)?,
        "orientationId": r.get::<_, Option<String>>(6)?,
        "orientationName": r.get::<_, Option<String>>(7)?,
        "enrollmentCount": r.get::<_, i64>(8)?,
    }))
}

fn load_course(conn: &Connection, course_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE co.id = ?", COURSE_SELECT),
        [course_id],
        course_row_json,
    )
    .optional()
    .map_err(HandlerErr::db("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("course not found"))
}

fn courses_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let cycle_id = get_optional_str(params, "cycleId")?;
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE (?1 IS NULL OR co.cycle_id = ?1)
             ORDER BY cy.year DESC, co.grade_level, co.division",
            COURSE_SELECT
        ))
        .map_err(HandlerErr::db("db_query_failed"))?;
    let courses = stmt
        .query_map([&cycle_id], course_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(json!({ "courses": courses }))
}

fn courses_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let cycle_id = get_required_str(params, "cycleId")?;
    let grade_level = get_required_str(params, "gradeLevel")?;
    let division = get_required_str(params, "division")?;
    let shift = get_optional_str(params, "shift")?.unwrap_or_default();
    let orientation_id = get_optional_str(params, "orientationId")?;
    require_exists(conn, "cycles", &cycle_id)?;
    if let Some(id) = &orientation_id {
        require_exists(conn, "orientations", id)?;
    }

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, cycle_id, grade_level, division, shift, orientation_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&course_id, &cycle_id, &grade_level, &division, &shift, &orientation_id),
    )
    .map_err(map_write_err("db_insert_failed", DUPLICATE_COURSE))?;

    Ok(json!({
        "courseId": course_id,
        "cycleId": cycle_id,
        "gradeLevel": grade_level,
        "division": division,
        "shift": shift,
        "orientationId": orientation_id,
    }))
}

/// Patches grade level, division, shift or orientation. The cycle is fixed
/// once a course exists.
fn courses_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    require_exists(conn, "courses", &course_id)?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (k, v) in patch {
        let wrapped = json!({ "v": v });
        let (col, value) = match k.as_str() {
            "gradeLevel" => ("grade_level", Value::Text(get_required_str(&wrapped, "v")?)),
            "division" => ("division", Value::Text(get_required_str(&wrapped, "v")?)),
            "shift" => (
                "shift",
                Value::Text(get_optional_str(&wrapped, "v")?.unwrap_or_default()),
            ),
            "orientationId" => match get_optional_str(&wrapped, "v")? {
                Some(id) => {
                    require_exists(conn, "orientations", &id)?;
                    ("orientation_id", Value::Text(id))
                }
                None => ("orientation_id", Value::Null),
            },
            other => {
                return Err(HandlerErr::bad_params(format!("unknown course field: {}", other)));
            }
        };
        sets.push(format!("{} = ?", col));
        binds.push(value);
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("patch must not be empty"));
    }
    binds.push(Value::Text(course_id.clone()));

    conn.execute(
        &format!("UPDATE courses SET {} WHERE id = ?", sets.join(", ")),
        params_from_iter(binds),
    )
    .map_err(map_write_err("db_update_failed", DUPLICATE_COURSE))?;
    load_course(conn, &course_id)
}

fn courses_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    require_exists(conn, "courses", &course_id)?;
    let enrollment_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM enrollments WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    if enrollment_count > 0 {
        return Err(HandlerErr::new("conflict", "course has enrollments and cannot be deleted")
            .with_details(json!({ "enrollmentCount": enrollment_count })));
    }
    conn.execute("DELETE FROM courses WHERE id = ?", [&course_id])
        .map_err(HandlerErr::db("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(with_conn(state, req, courses_list)),
        "courses.create" => Some(with_conn(state, req, courses_create)),
        "courses.update" => Some(with_conn(state, req, courses_update)),
        "courses.delete" => Some(with_conn(state, req, courses_delete)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO cycles(id, year) VALUES('c25', 2025);
             INSERT INTO orientations(id, name) VALUES('o-nat', 'Naturales');
             INSERT INTO courses(id, cycle_id, grade_level, division, shift) VALUES
               ('k1', 'c25', '4to', 'A', 'M'), ('k2', 'c25', '4to', 'B', 'M');",
        )
        .expect("seed");
        conn
    }

    #[test]
    fn update_to_an_existing_key_is_a_conflict() {
        let conn = setup();
        let dup = courses_update(&conn, &json!({ "courseId": "k2", "patch": { "division": "A" } }))
            .err()
            .expect("duplicate key");
        assert_eq!(dup.code, "conflict");

        let moved = courses_update(&conn, &json!({ "courseId": "k2", "patch": { "shift": "T", "division": "A" } }))
            .ok()
            .expect("different shift");
        assert_eq!(moved["division"], "A");
        assert_eq!(moved["shift"], "T");
    }

    #[test]
    fn update_sets_and_clears_orientation() {
        let conn = setup();
        let set = courses_update(&conn, &json!({ "courseId": "k1", "patch": { "orientationId": "o-nat" } }))
            .ok()
            .expect("set orientation");
        assert_eq!(set["orientationName"], "Naturales");

        let cleared = courses_update(&conn, &json!({ "courseId": "k1", "patch": { "orientationId": null } }))
            .ok()
            .expect("clear orientation");
        assert!(cleared["orientationId"].is_null());

        let unknown = courses_update(&conn, &json!({ "courseId": "k1", "patch": { "orientationId": "o-x" } }))
            .err()
            .expect("unknown orientation");
        assert_eq!(unknown.code, "not_found");
    }

    #[test]
    fn update_rejects_cycle_moves_and_missing_courses() {
        let conn = setup();
        let moved = courses_update(&conn, &json!({ "courseId": "k1", "patch": { "cycleId": "c25" } }))
            .err()
            .expect("cycle is fixed");
        assert_eq!(moved.code, "bad_params");

        let empty = courses_update(&conn, &json!({ "courseId": "k1", "patch": {} }))
            .err()
            .expect("empty patch");
        assert_eq!(empty.code, "bad_params");

        let missing = courses_update(&conn, &json!({ "courseId": "nope", "patch": { "division": "C" } }))
            .err()
            .expect("missing course");
        assert_eq!(missing.code, "not_found");
    }
}
