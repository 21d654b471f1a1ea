use crate::auth::{self, Role};
use crate::dates;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    current_session, db_conn, db_err, db_err_table, load_session, parse_params, run_authed,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request, Session};
use crate::roster_csv::is_valid_email;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignUpParams {
    email: Option<String>,
    password: Option<String>,
    full_name: Option<String>,
}

#[derive(Deserialize)]
struct SignInParams {
    email: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordParams {
    new_password: String,
    confirm_password: Option<String>,
}

fn session_json(s: &Session) -> serde_json::Value {
    json!({
        "token": s.token,
        "expiresAt": s.expires_at,
        "teacher": {
            "id": s.teacher_id,
            "email": s.email,
            "fullName": s.full_name,
            "role": s.role.as_str()
        }
    })
}

fn sign_up(conn: &Connection, params: &serde_json::Value, admin_email: Option<&str>) -> Result<serde_json::Value, HandlerErr> {
    let p: SignUpParams = parse_params(params)?;
    let email = p.email.unwrap_or_default().trim().to_ascii_lowercase();
    let password = p.password.unwrap_or_default();
    let full_name = p.full_name.unwrap_or_default().trim().to_string();
    if email.is_empty() || password.is_empty() || full_name.is_empty() {
        return Err(HandlerErr::bad_params(
            "email, password and fullName are required",
        ));
    }
    if !is_valid_email(&email) {
        return Err(HandlerErr::bad_params(format!("invalid email: {}", email)));
    }
    auth::check_new_password(&password, None).map_err(HandlerErr::bad_params)?;

    let taken = conn
        .query_row(
            "SELECT 1 FROM teachers WHERE email = ?",
            [&email],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?
        .is_some();
    if taken {
        return Err(HandlerErr::new("email_taken", "an account already uses this email"));
    }

    let role = if admin_email == Some(email.as_str()) {
        Role::Admin
    } else {
        Role::Teacher
    };
    let teacher_id = Uuid::new_v4().to_string();
    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, &password);
    conn.execute(
        "INSERT INTO teachers(id, email, full_name, role, password_salt, password_hash, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &teacher_id,
            &email,
            &full_name,
            role.as_str(),
            &salt,
            &hash,
            dates::now_rfc3339(),
        ),
    )
    .map_err(db_err_table("db_insert_failed", "teachers"))?;
    tracing::info!(teacher_id = %teacher_id, role = role.as_str(), "account created");
    Ok(json!({ "teacherId": teacher_id, "role": role.as_str() }))
}

fn handle_sign_up(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match sign_up(conn, &req.params, state.config.admin_email.as_deref()) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn sign_in(conn: &Connection, params: &serde_json::Value, ttl_hours: i64) -> Result<Session, HandlerErr> {
    let p: SignInParams = parse_params(params)?;
    let email = p.email.unwrap_or_default().trim().to_ascii_lowercase();
    let password = p.password.unwrap_or_default();
    if email.is_empty() || password.is_empty() {
        return Err(HandlerErr::bad_params("email and password are required"));
    }

    let row: Option<(String, String, String, String, String)> = conn
        .query_row(
            "SELECT id, full_name, role, password_salt, password_hash FROM teachers WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((teacher_id, full_name, role, salt, hash)) = row else {
        return Err(HandlerErr::new("invalid_credentials", "invalid email or password"));
    };
    if !auth::verify_password(&salt, &password, &hash) {
        return Err(HandlerErr::new("invalid_credentials", "invalid email or password"));
    }

    let now = dates::now_unix();
    let session = Session {
        token: auth::new_session_token(),
        teacher_id,
        email,
        full_name,
        role: Role::parse(&role).unwrap_or(Role::Teacher),
        expires_at: now + ttl_hours * 3600,
    };
    conn.execute(
        "INSERT INTO sessions(token, teacher_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (&session.token, &session.teacher_id, now, session.expires_at),
    )
    .map_err(db_err_table("db_insert_failed", "sessions"))?;
    // Expired tokens are swept on every sign-in.
    conn.execute("DELETE FROM sessions WHERE expires_at <= ?", [now])
        .map_err(db_err_table("db_delete_failed", "sessions"))?;
    Ok(session)
}

fn handle_sign_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match sign_in(conn, &req.params, state.config.session_ttl_hours) {
        Ok(session) => {
            tracing::info!(teacher_id = %session.teacher_id, "signed in");
            let result = session_json(&session);
            state.session = Some(session);
            ok(&req.id, result)
        }
        Err(e) => {
            if e.code == "invalid_credentials" {
                tracing::warn!("rejected sign-in");
            }
            e.response(&req.id)
        }
    }
}

fn handle_resume(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(token) = req
        .params
        .get("token")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        return err(&req.id, "bad_params", "missing token", None);
    };
    let stored = match load_session(conn, &token, &state.config) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match stored {
        Some(s) if s.expires_at > dates::now_unix() => {
            let result = session_json(&s);
            state.session = Some(s);
            ok(&req.id, result)
        }
        Some(_) => {
            if let Err(e) = conn.execute("DELETE FROM sessions WHERE token = ?", [&token]) {
                tracing::warn!(error = %e, "could not drop expired session");
            }
            state.session = None;
            tracing::info!("session expired");
            err(&req.id, "session_expired", "session expired, sign in again", None)
        }
        None => {
            state.session = None;
            err(&req.id, "session_expired", "session expired, sign in again", None)
        }
    }
}

fn handle_session(state: &mut AppState, req: &Request) -> serde_json::Value {
    match current_session(state) {
        Ok(s) => ok(&req.id, session_json(&s)),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sign_out(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let (Some(conn), Some(session)) = (state.db.as_ref(), state.session.as_ref()) {
        if let Err(e) = conn.execute("DELETE FROM sessions WHERE token = ?", [&session.token]) {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "sessions" })),
            );
        }
        tracing::info!(teacher_id = %session.teacher_id, "signed out");
    }
    state.session = None;
    ok(&req.id, json!({ "ok": true }))
}

fn change_password(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ChangePasswordParams = parse_params(params)?;
    auth::check_new_password(&p.new_password, p.confirm_password.as_deref())
        .map_err(HandlerErr::bad_params)?;
    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, &p.new_password);
    conn.execute(
        "UPDATE teachers SET password_salt = ?, password_hash = ?, updated_at = ? WHERE id = ?",
        (&salt, &hash, dates::now_rfc3339(), &session.teacher_id),
    )
    .map_err(db_err_table("db_update_failed", "teachers"))?;
    tracing::info!(teacher_id = %session.teacher_id, "password changed");
    Ok(json!({ "ok": true }))
}

fn handle_change_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_authed(state, req, |conn, session, _| {
        change_password(conn, session, &req.params)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.signUp" => Some(handle_sign_up(state, req)),
        "auth.signIn" => Some(handle_sign_in(state, req)),
        "auth.resume" => Some(handle_resume(state, req)),
        "auth.session" => Some(handle_session(state, req)),
        "auth.signOut" => Some(handle_sign_out(state, req)),
        "auth.changePassword" => Some(handle_change_password(state, req)),
        _ => None,
    }
}
