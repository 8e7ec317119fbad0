use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_bool, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReasonKind {
    Cancel,
    Reschedule,
}

impl ReasonKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "cancel" => Some(Self::Cancel),
            "reschedule" => Some(Self::Reschedule),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Reschedule => "reschedule",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Cancel => "cancellation",
            Self::Reschedule => "reschedule",
        }
    }
}

/// The lifecycle actions only need existence + enabled; management of the
/// registry itself stays in this handler.
pub(crate) fn require_enabled_reason(
    conn: &Connection,
    kind: ReasonKind,
    reason_id: &str,
) -> Result<(), HandlerErr> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT kind, enabled FROM reasons WHERE id = ?",
            [reason_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((stored_kind, enabled)) = row else {
        return Err(HandlerErr::bad_params(format!(
            "unknown {} reason",
            kind.label()
        )));
    };
    if stored_kind != kind.as_str() {
        return Err(HandlerErr::bad_params(format!(
            "reason is not a {} reason",
            kind.label()
        )));
    }
    if enabled == 0 {
        return Err(HandlerErr::bad_params(format!(
            "{} reason is disabled",
            kind.label()
        )));
    }
    Ok(())
}

fn parse_kind(params: &serde_json::Value) -> Result<ReasonKind, HandlerErr> {
    let raw = get_required_str(params, "kind")?;
    ReasonKind::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params("kind must be one of: cancel, reschedule"))
}

fn reasons_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let kind = parse_kind(params)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, enabled FROM reasons
             WHERE kind = ?
             ORDER BY name, id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let reasons = stmt
        .query_map([kind.as_str()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "enabled": r.get::<_, i64>(2)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "reasons": reasons }))
}

fn reasons_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let kind = parse_kind(params)?;
    let name = get_required_str(params, "name")?;
    let name = name.trim();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let reason_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO reasons(id, kind, name, enabled) VALUES(?, ?, ?, 1)",
        (&reason_id, kind.as_str(), name),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "reasons" })))?;
    Ok(json!({ "reasonId": reason_id }))
}

fn reasons_set_enabled(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let reason_id = get_required_str(params, "reasonId")?;
    let enabled = get_required_bool(params, "enabled")?;
    let changed = conn
        .execute(
            "UPDATE reasons SET enabled = ? WHERE id = ?",
            (enabled as i64, &reason_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("reason not found"));
    }
    Ok(json!({ "ok": true }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reasons.list" => Some(with_conn(state, req, reasons_list)),
        "reasons.create" => Some(with_conn(state, req, reasons_create)),
        "reasons.setEnabled" => Some(with_conn(state, req, reasons_set_enabled)),
        _ => None,
    }
}
