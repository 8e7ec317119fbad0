use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

/// Outbox drain for the notification and credit-ledger consumers. Emission
/// happens inside lifecycle transactions; delivery is someone else's job.
fn events_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let after_id = params.get("afterId").and_then(|v| v.as_i64()).unwrap_or(0);
    let session_filter = get_optional_str(params, "sessionId");

    let mut stmt = conn
        .prepare(
            "SELECT id, event_type, session_id, payload, created_at
             FROM events
             WHERE id > ?1 AND (?2 IS NULL OR session_id = ?2)
             ORDER BY id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let events = stmt
        .query_map((after_id, &session_filter), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .into_iter()
        .map(|(id, event_type, session_id, payload_raw, created_at)| {
            let payload = serde_json::from_str(&payload_raw)
                .unwrap_or(serde_json::Value::String(payload_raw));
            json!({
                "id": id,
                "eventType": event_type,
                "sessionId": session_id,
                "payload": payload,
                "createdAt": created_at
            })
        })
        .collect::<Vec<_>>();
    Ok(json!({ "events": events }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "events.list" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match events_list(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(error) => error.response(&req.id),
            })
        }
        _ => None,
    }
}
