use crate::eligibility::Role;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub(crate) struct UserRow {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    pub guardian_of: Option<String>,
}

pub(crate) fn get_user(conn: &Connection, user_id: &str) -> Result<Option<UserRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, display_name, role, guardian_of FROM users WHERE id = ?",
        [user_id],
        |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .map(|(id, display_name, role_raw, guardian_of)| {
        let role = Role::parse(&role_raw).ok_or_else(|| {
            HandlerErr::db("db_query_failed", format!("malformed stored role: {}", role_raw))
        })?;
        Ok(UserRow {
            id,
            display_name,
            role,
            guardian_of,
        })
    })
    .transpose()
}

pub(crate) fn require_user(conn: &Connection, user_id: &str) -> Result<UserRow, HandlerErr> {
    get_user(conn, user_id)?.ok_or_else(|| HandlerErr::not_found("user not found"))
}

fn users_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let display_name = get_required_str(params, "displayName")?;
    if display_name.trim().is_empty() {
        return Err(HandlerErr::bad_params("displayName must not be empty"));
    }
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", role_raw)))?;

    let guardian_of = get_optional_str(params, "guardianOf");
    if let Some(ward_id) = &guardian_of {
        if role != Role::Parent {
            return Err(HandlerErr::bad_params("guardianOf is only valid for parents"));
        }
        let ward = require_user(conn, ward_id)
            .map_err(|_| HandlerErr::bad_params("guardianOf must reference an existing user"))?;
        if ward.role != Role::Student {
            return Err(HandlerErr::bad_params("guardianOf must reference a student"));
        }
    }

    let user_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, display_name, role, guardian_of) VALUES(?, ?, ?, ?)",
        (&user_id, display_name.trim(), role.as_str(), &guardian_of),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "users" })))?;

    Ok(json!({ "userId": user_id }))
}

fn users_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, display_name, role, guardian_of
             FROM users
             ORDER BY display_name, id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let users = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": r.get::<_, String>(1)?,
                "role": r.get::<_, String>(2)?,
                "guardianOf": r.get::<_, Option<String>>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "users": users }))
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match users_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "users": [] }));
    };
    match users_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        _ => None,
    }
}
