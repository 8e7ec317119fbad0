use crate::eligibility::{format_utc, parse_utc};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::policy::load_policy;
use crate::ipc::handlers::sessions::{direct_member_role, load_session, SessionRow};
use crate::ipc::handlers::users::{get_user, require_user};
use crate::ipc::helpers::{get_required_str, get_required_time, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::roster::{build_roster, RawAttendance, SessionRole};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

fn opt_stored_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    match raw {
        None => Ok(None),
        Some(s) => parse_utc(&s).map(Some).ok_or_else(|| {
            HandlerErr::db("db_query_failed", format!("malformed stored timestamp: {}", s))
        }),
    }
}

/// Session membership in roster order: primary, secondary, then enrolled
/// participants. Drives both the derived roster and save-time validation.
fn member_roles(
    conn: &Connection,
    row: &SessionRow,
) -> Result<Vec<(String, SessionRole)>, HandlerErr> {
    let mut members = vec![(
        row.primary_instructor_id.clone(),
        SessionRole::PrimaryInstructor,
    )];
    if let Some(sid) = &row.secondary_instructor_id {
        members.push((sid.clone(), SessionRole::SecondaryInstructor));
    }
    for pid in super::sessions::participant_ids(conn, &row.id)? {
        members.push((pid, SessionRole::Student));
    }
    Ok(members)
}

struct StoredRecord {
    present: bool,
    join_time: Option<DateTime<Utc>>,
    leave_time: Option<DateTime<Utc>>,
}

fn stored_records(
    conn: &Connection,
    session_id: &str,
) -> Result<HashMap<String, StoredRecord>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT user_id, present, join_time, leave_time
             FROM attendance_records
             WHERE session_id = ?",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([session_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let mut by_user = HashMap::new();
    for (user_id, present, join_raw, leave_raw) in rows {
        by_user.insert(
            user_id,
            StoredRecord {
                present: present != 0,
                join_time: opt_stored_time(join_raw)?,
                leave_time: opt_stored_time(leave_raw)?,
            },
        );
    }
    Ok(by_user)
}

fn roster_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let row = load_session(conn, &session_id)?;
    let policy = load_policy(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let records = stored_records(conn, &row.id)?;
    let mut raw = Vec::new();
    for (user_id, role) in member_roles(conn, &row)? {
        let display_name = get_user(conn, &user_id)?
            .map(|u| u.display_name)
            .unwrap_or_else(|| user_id.clone());
        let stored = records.get(&user_id);
        raw.push(RawAttendance {
            display_name,
            role,
            present: stored.map(|s| s.present).unwrap_or(false),
            join_time: stored.and_then(|s| s.join_time),
            leave_time: stored.and_then(|s| s.leave_time),
            user_id,
        });
    }

    let entries = build_roster(
        raw,
        row.start_at,
        row.end_at,
        policy.early_start_tolerance_minutes,
    );
    Ok(json!({
        "sessionId": row.id,
        "startAt": format_utc(row.start_at),
        "endAt": format_utc(row.end_at),
        "entries": serde_json::to_value(entries)
            .map_err(|e| HandlerErr::db("db_query_failed", e))?
    }))
}

struct SaveEntry {
    user_id: String,
    role: SessionRole,
    present: bool,
    join_time: Option<DateTime<Utc>>,
    leave_time: Option<DateTime<Utc>>,
}

fn parse_entry_time(
    entry: &serde_json::Value,
    key: &str,
    user_id: &str,
) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    match entry.get(key).and_then(|v| v.as_str()) {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_utc(s).map(Some).ok_or_else(|| {
            HandlerErr::bad_params(format!("{} must be an RFC 3339 timestamp", key))
                .with_details(json!({ "userId": user_id }))
        }),
    }
}

fn roster_save(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let Some(entry_values) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    let row = load_session(conn, &session_id)?;
    let members: HashMap<String, SessionRole> =
        member_roles(conn, &row)?.into_iter().collect();

    // Validate everything before touching any row: a bad entry must leave
    // the stored roster exactly as it was.
    let mut parsed: Vec<SaveEntry> = Vec::with_capacity(entry_values.len());
    for entry in entry_values {
        let user_id = entry
            .get("userId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| HandlerErr::bad_params("entry missing userId"))?;
        let Some(role) = members.get(&user_id).copied() else {
            return Err(HandlerErr::bad_params(format!(
                "user {} is not a member of this session",
                user_id
            )));
        };
        if parsed.iter().any(|p| p.user_id == user_id) {
            return Err(HandlerErr::bad_params(format!(
                "duplicate entry for user {}",
                user_id
            )));
        }
        let present = entry
            .get("present")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| {
                HandlerErr::bad_params("entry missing present")
                    .with_details(json!({ "userId": user_id }))
            })?;
        let (join_time, leave_time) = if present {
            let join_time = parse_entry_time(entry, "joinTime", &user_id)?.ok_or_else(|| {
                HandlerErr::bad_params("joinTime is required for present entries")
                    .with_details(json!({ "userId": user_id }))
            })?;
            (Some(join_time), parse_entry_time(entry, "leaveTime", &user_id)?)
        } else {
            // Absent entries carry no times.
            (None, None)
        };
        parsed.push(SaveEntry {
            user_id,
            role,
            present,
            join_time,
            leave_time,
        });
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "DELETE FROM attendance_records WHERE session_id = ?",
        [&row.id],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    for entry in &parsed {
        tx.execute(
            "INSERT INTO attendance_records(session_id, user_id, role_in_session,
                                            present, join_time, leave_time)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &row.id,
                &entry.user_id,
                entry.role.as_str(),
                entry.present as i64,
                entry.join_time.map(format_utc),
                entry.leave_time.map(format_utc),
            ),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e)
                .with_details(json!({ "table": "attendance_records" }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "ok": true, "saved": parsed.len() }))
}

/// Upsert one present-marked record without touching other participants.
/// The first recorded join time wins; a rejoin never overwrites it.
pub(crate) fn upsert_single_mark(
    conn: &Connection,
    session_id: &str,
    user_id: &str,
    role: SessionRole,
    join_time: DateTime<Utc>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO attendance_records(session_id, user_id, role_in_session,
                                        present, join_time, leave_time)
         VALUES(?, ?, ?, 1, ?, NULL)
         ON CONFLICT(session_id, user_id) DO UPDATE SET
           present = 1,
           role_in_session = excluded.role_in_session,
           join_time = COALESCE(join_time, excluded.join_time)",
        (session_id, user_id, role.as_str(), format_utc(join_time)),
    )
    .map_err(|e| {
        HandlerErr::db("db_update_failed", e)
            .with_details(json!({ "table": "attendance_records" }))
    })?;
    Ok(())
}

fn mark_single(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let user_id = get_required_str(params, "userId")?;
    let join_time = get_required_time(params, "joinTime")?;

    let row = load_session(conn, &session_id)?;
    let user = require_user(conn, &user_id)?;
    let Some(role) = direct_member_role(conn, &row, &user)? else {
        return Err(HandlerErr::bad_params(
            "user is not a member of this session",
        ));
    };
    upsert_single_mark(conn, &row.id, &user.id, role, join_time)?;
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
        "attendance.rosterOpen" => Some(with_conn(state, req, roster_open)),
        "attendance.rosterSave" => Some(with_conn(state, req, roster_save)),
        "attendance.markSingle" => Some(with_conn(state, req, mark_single)),
        _ => None,
    }
}
