use crate::db;
use crate::ipc::helpers::{with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::trajectory::PromotionPolicy;
use rusqlite::Connection;
use serde_json::json;

const POLICY_KEY: &str = "policy.promotion";

/// Effective promotion policy for the workspace. A stored override that no
/// longer parses falls back to the defaults.
pub fn load_policy(conn: &Connection) -> anyhow::Result<PromotionPolicy> {
    let Some(saved) = db::settings_get_json(conn, POLICY_KEY)? else {
        return Ok(PromotionPolicy::default());
    };
    match serde_json::from_value::<PromotionPolicy>(saved) {
        Ok(p) => Ok(p),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed promotion policy override");
            Ok(PromotionPolicy::default())
        }
    }
}

fn policy_json(policy: &PromotionPolicy, is_override: bool) -> serde_json::Value {
    json!({
        "failingThreshold": policy.failing_threshold,
        "repeatOwedCount": policy.repeat_owed_count,
        "isOverride": is_override,
    })
}

fn policy_get(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let is_override = db::settings_get_json(conn, POLICY_KEY)?.is_some();
    Ok(policy_json(&load_policy(conn)?, is_override))
}

fn policy_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut policy = load_policy(conn)?;
    let mut touched = false;

    if let Some(v) = params.get("failingThreshold") {
        let Some(t) = v.as_f64() else {
            return Err(HandlerErr::bad_params("failingThreshold must be a number"));
        };
        if !(0.0..=10.0).contains(&t) {
            return Err(HandlerErr::bad_params("failingThreshold must be between 0 and 10")
                .with_details(json!({ "failingThreshold": t })));
        }
        policy.failing_threshold = t;
        touched = true;
    }
    if let Some(v) = params.get("repeatOwedCount") {
        let Some(n) = v.as_u64() else {
            return Err(HandlerErr::bad_params("repeatOwedCount must be a positive integer"));
        };
        if n == 0 || n > 100 {
            return Err(HandlerErr::bad_params("repeatOwedCount must be between 1 and 100")
                .with_details(json!({ "repeatOwedCount": n })));
        }
        policy.repeat_owed_count = n as usize;
        touched = true;
    }
    if !touched {
        return Err(HandlerErr::bad_params(
            "expected failingThreshold and/or repeatOwedCount",
        ));
    }

    let value = serde_json::to_value(policy).map_err(|e| HandlerErr::new("bad_params", e.to_string()))?;
    db::settings_set_json(conn, POLICY_KEY, &value)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!(
        failing_threshold = policy.failing_threshold,
        repeat_owed_count = policy.repeat_owed_count,
        "promotion policy override saved"
    );
    Ok(policy_json(&policy, true))
}

fn policy_clear_override(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    db::settings_delete(conn, POLICY_KEY)
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    Ok(policy_json(&PromotionPolicy::default(), false))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "policy.get" => Some(with_conn(state, req, policy_get)),
        "policy.update" => Some(with_conn(state, req, policy_update)),
        "policy.clearOverride" => Some(with_conn(state, req, policy_clear_override)),
        _ => None,
    }
}
