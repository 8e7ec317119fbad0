use crate::db;
use crate::eligibility::SchedulingPolicy;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

const POLICY_KEY: &str = "policy.scheduling";

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_policy_patch(current: &mut Map<String, Value>, patch: &Map<String, Value>) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "instructorCancelAllowed"
            | "instructorRescheduleAllowed"
            | "learnerCancelAllowed"
            | "learnerRescheduleAllowed"
            | "refundCreditsOnCancel" => {
                current.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
            }
            "instructorCancelMinHours"
            | "instructorRescheduleMinHours"
            | "learnerCancelMinHours"
            | "learnerRescheduleMinHours" => {
                current.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 720)?));
            }
            "earlyStartToleranceMinutes" | "joinDelayToleranceMinutes" => {
                current.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 240)?));
            }
            "maxRescheduleHorizonDays" => {
                current.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 365)?));
            }
            _ => return Err(format!("unknown policy field: {}", k)),
        }
    }
    Ok(())
}

fn policy_value(conn: &rusqlite::Connection) -> anyhow::Result<Value> {
    let mut current = serde_json::to_value(SchedulingPolicy::default())?;
    let Some(obj) = current.as_object_mut() else {
        anyhow::bail!("policy defaults must serialize to an object");
    };
    if let Some(saved) = db::settings_get_json(conn, POLICY_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block reads.
            let _ = merge_policy_patch(obj, saved_obj);
        }
    }
    Ok(current)
}

/// Defaults-merged tenant policy, read fresh per request.
pub(crate) fn load_policy(conn: &rusqlite::Connection) -> anyhow::Result<SchedulingPolicy> {
    Ok(serde_json::from_value(policy_value(conn)?)?)
}

fn handle_policy_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match policy_value(conn) {
        Ok(policy) => ok(&req.id, json!({ "policy": policy })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_policy_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match policy_value(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(obj) = current.as_object_mut() else {
        return err(&req.id, "db_query_failed", "policy must be an object", None);
    };
    if let Err(msg) = merge_policy_patch(obj, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, POLICY_KEY, &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "policy": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "policy.get" => Some(handle_policy_get(state, req)),
        "policy.update" => Some(handle_policy_update(state, req)),
        _ => None,
    }
}
