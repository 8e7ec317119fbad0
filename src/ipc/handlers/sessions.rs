use crate::db;
use crate::eligibility::{
    cancel_denial, derive_eligibility, effective_status, format_utc, horizon_denial, join_denial,
    parse_utc, reschedule_denial, Role, SessionStatus,
};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::attendance::upsert_single_mark;
use crate::ipc::handlers::policy::load_policy;
use crate::ipc::handlers::reasons::{require_enabled_reason, ReasonKind};
use crate::ipc::handlers::users::{require_user, UserRow};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, get_required_time, now_param, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::SessionRole;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub(crate) struct SessionRow {
    pub id: String,
    pub course_id: String,
    pub context: String,
    pub status: SessionStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub primary_instructor_id: String,
    pub secondary_instructor_id: Option<String>,
    pub meeting_link: Option<String>,
    pub notes: Option<String>,
    pub cancellation_reason_id: Option<String>,
    pub reschedule_reason_id: Option<String>,
    pub version: i64,
}

fn stored_time(raw: &str) -> Result<DateTime<Utc>, HandlerErr> {
    parse_utc(raw)
        .ok_or_else(|| HandlerErr::db("db_query_failed", format!("malformed stored timestamp: {}", raw)))
}

pub(crate) fn load_session(conn: &Connection, session_id: &str) -> Result<SessionRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, course_id, context, status, start_at, end_at,
                    primary_instructor_id, secondary_instructor_id,
                    meeting_link, notes, cancellation_reason_id,
                    reschedule_reason_id, version
             FROM sessions WHERE id = ?",
            [session_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, Option<String>>(7)?,
                    r.get::<_, Option<String>>(8)?,
                    r.get::<_, Option<String>>(9)?,
                    r.get::<_, Option<String>>(10)?,
                    r.get::<_, Option<String>>(11)?,
                    r.get::<_, i64>(12)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((
        id,
        course_id,
        context,
        status_raw,
        start_raw,
        end_raw,
        primary_instructor_id,
        secondary_instructor_id,
        meeting_link,
        notes,
        cancellation_reason_id,
        reschedule_reason_id,
        version,
    )) = row
    else {
        return Err(HandlerErr::not_found("session not found"));
    };
    let status = SessionStatus::parse(&status_raw).ok_or_else(|| {
        HandlerErr::db("db_query_failed", format!("malformed stored status: {}", status_raw))
    })?;
    Ok(SessionRow {
        id,
        course_id,
        context,
        status,
        start_at: stored_time(&start_raw)?,
        end_at: stored_time(&end_raw)?,
        primary_instructor_id,
        secondary_instructor_id,
        meeting_link,
        notes,
        cancellation_reason_id,
        reschedule_reason_id,
        version,
    })
}

pub(crate) fn participant_ids(
    conn: &Connection,
    session_id: &str,
) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT user_id FROM session_participants
             WHERE session_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([session_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn enrolled(conn: &Connection, session_id: &str, user_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM session_participants WHERE session_id = ? AND user_id = ?",
        (session_id, user_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

/// Participant membership for eligibility: instructors, enrolled students,
/// and a parent whose ward is enrolled.
pub(crate) fn is_participant(
    conn: &Connection,
    row: &SessionRow,
    user: &UserRow,
) -> Result<bool, HandlerErr> {
    if user.id == row.primary_instructor_id
        || row.secondary_instructor_id.as_deref() == Some(user.id.as_str())
    {
        return Ok(true);
    }
    if enrolled(conn, &row.id, &user.id)? {
        return Ok(true);
    }
    if let Some(ward_id) = &user.guardian_of {
        return enrolled(conn, &row.id, ward_id);
    }
    Ok(false)
}

/// The roster role the actor would hold on this session, if any. Guardians
/// and staff sitting in are not roster members.
pub(crate) fn direct_member_role(
    conn: &Connection,
    row: &SessionRow,
    user: &UserRow,
) -> Result<Option<SessionRole>, HandlerErr> {
    if user.id == row.primary_instructor_id {
        return Ok(Some(SessionRole::PrimaryInstructor));
    }
    if row.secondary_instructor_id.as_deref() == Some(user.id.as_str()) {
        return Ok(Some(SessionRole::SecondaryInstructor));
    }
    if enrolled(conn, &row.id, &user.id)? {
        return Ok(Some(SessionRole::Student));
    }
    Ok(None)
}

fn session_json(
    conn: &Connection,
    row: &SessionRow,
    actor: Option<&UserRow>,
    now: DateTime<Utc>,
) -> Result<serde_json::Value, HandlerErr> {
    let participants = participant_ids(conn, &row.id)?;
    let mut stmt = conn
        .prepare(
            "SELECT title, url FROM recordings
             WHERE session_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let recordings = stmt
        .query_map([&row.id], |r| {
            Ok(json!({
                "title": r.get::<_, String>(0)?,
                "url": r.get::<_, String>(1)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut out = json!({
        "id": row.id,
        "courseId": row.course_id,
        "context": row.context,
        "status": effective_status(row.status, row.start_at, row.end_at, now).as_str(),
        "startAt": format_utc(row.start_at),
        "endAt": format_utc(row.end_at),
        "primaryInstructorId": row.primary_instructor_id,
        "secondaryInstructorId": row.secondary_instructor_id,
        "participantIds": participants,
        "meetingLink": row.meeting_link,
        "notes": row.notes,
        "recordings": recordings,
        "cancellationReasonId": row.cancellation_reason_id,
        "rescheduleReasonId": row.reschedule_reason_id,
        "version": row.version
    });
    if let Some(actor) = actor {
        let policy = load_policy(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let member = is_participant(conn, row, actor)?;
        let eligibility = derive_eligibility(
            row.status,
            row.start_at,
            row.end_at,
            Some(&policy),
            actor.role,
            member,
            now,
        );
        out["eligibility"] = serde_json::to_value(eligibility)
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    }
    Ok(out)
}

fn sessions_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let context = get_required_str(params, "context")?;
    if context != "individual" && context != "group" {
        return Err(HandlerErr::bad_params("context must be one of: individual, group"));
    }
    let start_at = get_required_time(params, "startAt")?;
    let end_at = get_required_time(params, "endAt")?;
    if end_at <= start_at {
        return Err(HandlerErr::bad_params("endAt must be after startAt"));
    }

    let primary_id = get_required_str(params, "primaryInstructorId")?;
    let primary = require_user(conn, &primary_id)
        .map_err(|_| HandlerErr::bad_params("primaryInstructorId must reference an existing user"))?;
    if primary.role != Role::Instructor {
        return Err(HandlerErr::bad_params("primaryInstructorId must reference an instructor"));
    }
    let secondary_id = get_optional_str(params, "secondaryInstructorId");
    if let Some(sid) = &secondary_id {
        let secondary = require_user(conn, sid).map_err(|_| {
            HandlerErr::bad_params("secondaryInstructorId must reference an existing user")
        })?;
        if secondary.role != Role::Instructor {
            return Err(HandlerErr::bad_params(
                "secondaryInstructorId must reference an instructor",
            ));
        }
    }

    let Some(participant_values) = params.get("participantIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing participantIds"));
    };
    let mut participants: Vec<String> = Vec::with_capacity(participant_values.len());
    for v in participant_values {
        let Some(pid) = v.as_str() else {
            return Err(HandlerErr::bad_params("participantIds must be strings"));
        };
        if participants.iter().any(|p| p == pid) {
            return Err(HandlerErr::bad_params("duplicate participantIds"));
        }
        let user = require_user(conn, pid)
            .map_err(|_| HandlerErr::bad_params(format!("unknown participant: {}", pid)))?;
        if user.role != Role::Student {
            return Err(HandlerErr::bad_params(format!(
                "participant {} must be a student",
                pid
            )));
        }
        participants.push(pid.to_string());
    }
    if participants.is_empty() {
        return Err(HandlerErr::bad_params("participantIds must not be empty"));
    }
    if context == "individual" && participants.len() != 1 {
        return Err(HandlerErr::bad_params(
            "individual sessions have exactly one participant",
        ));
    }

    let meeting_link = get_optional_str(params, "meetingLink");
    let session_id = Uuid::new_v4().to_string();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO sessions(id, course_id, context, status, start_at, end_at,
                              primary_instructor_id, secondary_instructor_id,
                              meeting_link, version)
         VALUES(?, ?, ?, 'scheduled', ?, ?, ?, ?, ?, 1)",
        (
            &session_id,
            &course_id,
            &context,
            format_utc(start_at),
            format_utc(end_at),
            &primary_id,
            &secondary_id,
            &meeting_link,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "sessions" })))?;
    for (i, pid) in participants.iter().enumerate() {
        tx.execute(
            "INSERT INTO session_participants(session_id, user_id, sort_order) VALUES(?, ?, ?)",
            (&session_id, pid, i as i64),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e)
                .with_details(json!({ "table": "session_participants" }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "sessionId": session_id }))
}

fn sessions_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let now = now_param(params)?;
    let course_filter = get_optional_str(params, "courseId");
    let user_filter = get_optional_str(params, "userId");
    let actor = match get_optional_str(params, "actorId") {
        Some(actor_id) => Some(require_user(conn, &actor_id)?),
        None => None,
    };

    let mut stmt = conn
        .prepare(
            "SELECT s.id FROM sessions s
             WHERE (?1 IS NULL OR s.course_id = ?1)
               AND (?2 IS NULL
                    OR s.primary_instructor_id = ?2
                    OR s.secondary_instructor_id = ?2
                    OR EXISTS(SELECT 1 FROM session_participants sp
                              WHERE sp.session_id = s.id AND sp.user_id = ?2))
             ORDER BY s.start_at, s.id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let ids = stmt
        .query_map((&course_filter, &user_filter), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut sessions = Vec::with_capacity(ids.len());
    for id in ids {
        let row = load_session(conn, &id)?;
        sessions.push(session_json(conn, &row, actor.as_ref(), now)?);
    }
    Ok(json!({ "sessions": sessions }))
}

fn sessions_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let now = now_param(params)?;
    let actor = match get_optional_str(params, "actorId") {
        Some(actor_id) => Some(require_user(conn, &actor_id)?),
        None => None,
    };
    let row = load_session(conn, &session_id)?;
    let session = session_json(conn, &row, actor.as_ref(), now)?;
    Ok(json!({ "session": session }))
}

fn sessions_join(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let now = now_param(params)?;

    let row = load_session(conn, &session_id)?;
    let actor = require_user(conn, &actor_id)?;
    let policy = load_policy(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let member = is_participant(conn, &row, &actor)?;
    if let Some(denial) = join_denial(
        row.status,
        row.start_at,
        row.end_at,
        Some(&policy),
        actor.role,
        member,
        now,
    ) {
        return Err(HandlerErr::precondition(denial));
    }

    let roster_role = direct_member_role(conn, &row, &actor)?;
    if let Some(role) = roster_role {
        upsert_single_mark(conn, &row.id, &actor.id, role, now)?;
    }
    Ok(json!({
        "meetingLink": row.meeting_link,
        "status": effective_status(row.status, row.start_at, row.end_at, now).as_str(),
        "attendanceRecorded": roster_role.is_some()
    }))
}

fn expected_version(params: &serde_json::Value) -> Option<i64> {
    params.get("expectedVersion").and_then(|v| v.as_i64())
}

fn sessions_cancel(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let reason_id = get_required_str(params, "reasonId")?;
    let now = now_param(params)?;

    let actor = require_user(conn, &actor_id)?;
    let policy = load_policy(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;

    // Eligibility is re-derived inside the transaction that writes the
    // status, so a window that closed between render and submit rejects here.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let row = load_session(&tx, &session_id)?;
    if let Some(expected) = expected_version(params) {
        if row.version != expected {
            return Err(HandlerErr::conflict("session was modified concurrently"));
        }
    }
    if let Some(denial) = cancel_denial(
        row.status,
        row.start_at,
        row.end_at,
        Some(&policy),
        actor.role,
        now,
    ) {
        return Err(HandlerErr::precondition(denial));
    }
    require_enabled_reason(&tx, ReasonKind::Cancel, &reason_id)?;

    let changed = tx
        .execute(
            "UPDATE sessions
             SET status = 'cancelled', cancellation_reason_id = ?, version = version + 1
             WHERE id = ? AND version = ?",
            (&reason_id, &row.id, row.version),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::conflict("session was modified concurrently"));
    }

    db::event_emit(
        &tx,
        "session.cancelled",
        &row.id,
        &json!({ "actorId": actor.id, "reasonId": reason_id }),
        &format_utc(now),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    if policy.refund_credits_on_cancel {
        // The ledger computes amounts; this core only reports who to refund.
        for pid in participant_ids(&tx, &row.id)? {
            db::event_emit(
                &tx,
                "credit.reverse",
                &row.id,
                &json!({ "participantId": pid }),
                &format_utc(now),
            )
            .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "status": "cancelled", "version": row.version + 1 }))
}

fn sessions_reschedule(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let reason_id = get_required_str(params, "reasonId")?;
    let new_start = get_required_time(params, "newStart")?;
    let new_end = get_required_time(params, "newEnd")?;
    let now = now_param(params)?;
    if new_end <= new_start {
        return Err(HandlerErr::bad_params("newEnd must be after newStart"));
    }

    let actor = require_user(conn, &actor_id)?;
    let policy = load_policy(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let row = load_session(&tx, &session_id)?;
    if let Some(expected) = expected_version(params) {
        if row.version != expected {
            return Err(HandlerErr::conflict("session was modified concurrently"));
        }
    }
    if let Some(denial) = reschedule_denial(
        row.status,
        row.start_at,
        row.end_at,
        Some(&policy),
        actor.role,
        now,
    ) {
        return Err(HandlerErr::precondition(denial));
    }
    if new_start < now {
        return Err(HandlerErr::precondition("cannot reschedule into the past"));
    }
    if let Some(denial) = horizon_denial(new_start, Some(&policy), now) {
        return Err(HandlerErr::precondition(denial));
    }
    require_enabled_reason(&tx, ReasonKind::Reschedule, &reason_id)?;

    let changed = tx
        .execute(
            "UPDATE sessions
             SET start_at = ?, end_at = ?, status = 'scheduled',
                 reschedule_reason_id = ?, version = version + 1
             WHERE id = ? AND version = ?",
            (
                format_utc(new_start),
                format_utc(new_end),
                &reason_id,
                &row.id,
                row.version,
            ),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::conflict("session was modified concurrently"));
    }

    db::event_emit(
        &tx,
        "session.rescheduled",
        &row.id,
        &json!({
            "actorId": actor.id,
            "reasonId": reason_id,
            "newStart": format_utc(new_start),
            "newEnd": format_utc(new_end)
        }),
        &format_utc(now),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    let member = is_participant(conn, &row, &actor)?;
    let eligibility = derive_eligibility(
        SessionStatus::Scheduled,
        new_start,
        new_end,
        Some(&policy),
        actor.role,
        member,
        now,
    );
    Ok(json!({
        "status": effective_status(SessionStatus::Scheduled, new_start, new_end, now).as_str(),
        "startAt": format_utc(new_start),
        "endAt": format_utc(new_end),
        "version": row.version + 1,
        "eligibility": serde_json::to_value(eligibility)
            .map_err(|e| HandlerErr::db("db_query_failed", e))?
    }))
}

fn sessions_set_notes(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let text = get_required_str(params, "text")?;
    let row = load_session(conn, &session_id)?;
    conn.execute(
        "UPDATE sessions SET notes = ?, version = version + 1 WHERE id = ?",
        (&text, &row.id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn sessions_attach_recording(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let title = get_required_str(params, "title")?;
    let url = get_required_str(params, "url")?;
    let row = load_session(conn, &session_id)?;

    // Appended, most-recent-last; prior recordings are history, not replaced.
    let next_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM recordings WHERE session_id = ?",
            [&row.id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let recording_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO recordings(id, session_id, title, url, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&recording_id, &row.id, &title, &url, next_order),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "recordings" }))
    })?;
    Ok(json!({ "recordingId": recording_id }))
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
        "sessions.create" => Some(with_conn(state, req, sessions_create)),
        "sessions.list" => Some(with_conn(state, req, sessions_list)),
        "sessions.get" => Some(with_conn(state, req, sessions_get)),
        "sessions.join" => Some(with_conn(state, req, sessions_join)),
        "sessions.cancel" => Some(with_conn(state, req, sessions_cancel)),
        "sessions.reschedule" => Some(with_conn(state, req, sessions_reschedule)),
        "sessions.setNotes" => Some(with_conn(state, req, sessions_set_notes)),
        "sessions.attachRecording" => Some(with_conn(state, req, sessions_attach_recording)),
        _ => None,
    }
}
