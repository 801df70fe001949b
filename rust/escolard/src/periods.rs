use crate::trajectory::Instance;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodParam {
    pub cycle_id: String,
    pub instance: Instance,
    pub semester: i64,
    pub closed: bool,
    pub closed_at: Option<String>,
    pub closed_by: Option<String>,
}

/// Open/closed state of each (cycle, instance, semester) evaluation period.
/// A period with no stored row is open.
pub trait PeriodRegistry {
    fn is_closed(&self, cycle_id: &str, instance: Instance, semester: i64) -> anyhow::Result<bool>;

    /// Idempotent upsert. Closing stamps who and when; reopening clears both.
    fn set_closed(
        &self,
        cycle_id: &str,
        instance: Instance,
        semester: i64,
        closed: bool,
        actor_user_id: &str,
    ) -> anyhow::Result<PeriodParam>;

    fn list(&self, cycle_id: &str) -> anyhow::Result<Vec<PeriodParam>>;
}

pub struct SqlitePeriods<'a> {
    conn: &'a Connection,
}

impl<'a> SqlitePeriods<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

fn row_to_param(r: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64, bool, Option<String>, Option<String>)> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get::<_, i64>(3)? != 0,
        r.get(4)?,
        r.get(5)?,
    ))
}

impl PeriodRegistry for SqlitePeriods<'_> {
    fn is_closed(&self, cycle_id: &str, instance: Instance, semester: i64) -> anyhow::Result<bool> {
        let closed: Option<i64> = self
            .conn
            .query_row(
                "SELECT closed FROM period_params
                 WHERE cycle_id = ? AND instance = ? AND semester = ?",
                (cycle_id, instance.as_str(), semester),
                |r| r.get(0),
            )
            .optional()?;
        Ok(closed.unwrap_or(0) != 0)
    }

    fn set_closed(
        &self,
        cycle_id: &str,
        instance: Instance,
        semester: i64,
        closed: bool,
        actor_user_id: &str,
    ) -> anyhow::Result<PeriodParam> {
        let (closed_at, closed_by) = if closed {
            (
                Some(chrono::Utc::now().to_rfc3339()),
                Some(actor_user_id.to_string()),
            )
        } else {
            (None, None)
        };
        self.conn.execute(
            "INSERT INTO period_params(cycle_id, instance, semester, closed, closed_at, closed_by)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(cycle_id, instance, semester) DO UPDATE SET
               closed = excluded.closed,
               closed_at = excluded.closed_at,
               closed_by = excluded.closed_by",
            (
                cycle_id,
                instance.as_str(),
                semester,
                closed as i64,
                &closed_at,
                &closed_by,
            ),
        )?;
        tracing::info!(
            cycle_id,
            instance = instance.as_str(),
            semester,
            closed,
            actor = actor_user_id,
            "evaluation period updated"
        );
        Ok(PeriodParam {
            cycle_id: cycle_id.to_string(),
            instance,
            semester,
            closed,
            closed_at,
            closed_by,
        })
    }

    fn list(&self, cycle_id: &str) -> anyhow::Result<Vec<PeriodParam>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle_id, instance, semester, closed, closed_at, closed_by
             FROM period_params
             WHERE cycle_id = ?
             ORDER BY semester, instance",
        )?;
        let rows = stmt
            .query_map([cycle_id], row_to_param)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (cycle_id, instance_raw, semester, closed, closed_at, closed_by) in rows {
            let Some(instance) = Instance::parse(&instance_raw) else {
                tracing::warn!(instance = %instance_raw, "skipping period row with unknown instance");
                continue;
            };
            out.push(PeriodParam {
                cycle_id,
                instance,
                semester,
                closed,
                closed_at,
                closed_by,
            });
        }
        out.sort_by(|a, b| {
            a.semester
                .cmp(&b.semester)
                .then(a.instance.rank().cmp(&b.instance.rank()))
        });
        Ok(out)
    }
}
