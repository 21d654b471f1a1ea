use crate::auth::Role;
use crate::dates;
use crate::ipc::helpers::{
    db_err, db_err_table, parse_params, require_role, required_str, run_authed, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProfileParams {
    full_name: Option<String>,
}

fn profile(conn: &Connection, session: &Session) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, email, full_name, role, created_at FROM teachers WHERE id = ?",
        [&session.teacher_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "email": r.get::<_, String>(1)?,
                "fullName": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        },
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("teacher not found"))
}

fn update_profile(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: UpdateProfileParams = parse_params(params)?;
    let full_name = p.full_name.unwrap_or_default().trim().to_string();
    if full_name.is_empty() {
        return Err(HandlerErr::bad_params("fullName must not be empty"));
    }
    conn.execute(
        "UPDATE teachers SET full_name = ?, updated_at = ? WHERE id = ?",
        (&full_name, dates::now_rfc3339(), &session.teacher_id),
    )
    .map_err(db_err_table("db_update_failed", "teachers"))?;
    profile(conn, session)
}

fn set_role(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(session, &[Role::Admin])?;
    let teacher_id = required_str(params, "teacherId")?;
    let role_raw = required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params("role must be teacher, coordinator or admin"))?;
    if teacher_id == session.teacher_id {
        return Err(HandlerErr::bad_params("admins cannot change their own role"));
    }
    let changed = conn
        .execute(
            "UPDATE teachers SET role = ?, updated_at = ? WHERE id = ?",
            (role.as_str(), dates::now_rfc3339(), &teacher_id),
        )
        .map_err(db_err_table("db_update_failed", "teachers"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    tracing::info!(teacher_id = %teacher_id, role = role.as_str(), "role changed");
    Ok(json!({ "teacherId": teacher_id, "role": role.as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.profile" => Some(run_authed(state, req, |conn, session, _| {
            profile(conn, session)
        })),
        "teachers.updateProfile" => Some(run_authed(state, req, |conn, session, _| {
            update_profile(conn, session, &req.params)
        })),
        "teachers.setRole" => Some(run_authed(state, req, |conn, session, _| {
            set_role(conn, session, &req.params)
        })),
        _ => None,
    }
}
