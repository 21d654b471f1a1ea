use crate::auth::Role;
use crate::config::Config;
use crate::dates;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

/// Maps a rusqlite failure to a handler error with the given code.
pub fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string())
}

pub fn db_err_table(code: &'static str, table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string()).with_details(json!({ "table": table }))
}

pub fn parse_params<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T, HandlerErr> {
    let source = if params.is_null() {
        json!({})
    } else {
        params.clone()
    };
    serde_json::from_value(source).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trims optional text and collapses blanks to `None`.
pub fn clean_opt(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// Looks up a stored session token together with the teacher's current role.
pub fn load_session(conn: &Connection, token: &str, cfg: &Config) -> rusqlite::Result<Option<Session>> {
    db::with_busy_retry(
        cfg.retry_attempts,
        Duration::from_millis(cfg.retry_delay_ms),
        || {
            conn.query_row(
                "SELECT t.id, t.email, t.full_name, t.role, s.expires_at
                 FROM sessions s
                 JOIN teachers t ON t.id = s.teacher_id
                 WHERE s.token = ?",
                [token],
                |r| {
                    let role: String = r.get(3)?;
                    Ok(Session {
                        token: token.to_string(),
                        teacher_id: r.get(0)?,
                        email: r.get(1)?,
                        full_name: r.get(2)?,
                        role: Role::parse(&role).unwrap_or(Role::Teacher),
                        expires_at: r.get(4)?,
                    })
                },
            )
            .optional()
        },
    )
}

/// Re-validates the in-memory session against the store. Expired or revoked
/// sessions are dropped from state.
pub fn current_session(state: &mut AppState) -> Result<Session, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let Some(token) = state.session.as_ref().map(|s| s.token.clone()) else {
        return Err(HandlerErr::new("not_authenticated", "sign in first"));
    };
    let stored = load_session(conn, &token, &state.config).map_err(db_err("db_query_failed"))?;
    match stored {
        Some(s) if s.expires_at > dates::now_unix() => {
            state.session = Some(s.clone());
            Ok(s)
        }
        Some(_) => {
            let _ = conn.execute("DELETE FROM sessions WHERE token = ?", [&token]);
            state.session = None;
            tracing::info!("session expired");
            Err(HandlerErr::new("session_expired", "session expired, sign in again"))
        }
        None => {
            state.session = None;
            Err(HandlerErr::new("session_expired", "session no longer valid, sign in again"))
        }
    }
}

/// Runs `f` with a validated session and the open workspace.
pub fn run_authed(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Session, &Config) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let session = match current_session(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match f(conn, &session, &state.config) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn require_role(session: &Session, allowed: &[Role]) -> Result<(), HandlerErr> {
    if allowed.contains(&session.role) {
        Ok(())
    } else {
        Err(HandlerErr::forbidden(format!(
            "role {} may not do this",
            session.role.as_str()
        )))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRow {
    pub id: String,
    pub teacher_id: String,
    pub name: String,
    pub description: Option<String>,
    pub place: String,
    pub schedule_date: String,
    pub schedule_time: Option<String>,
    pub days: Option<String>,
    pub year: Option<String>,
    pub sort_order: i64,
    pub created_at: String,
}

pub const GROUP_COLUMNS: &str =
    "id, teacher_id, name, description, place, schedule_date, schedule_time, days, year, sort_order, created_at";

pub fn group_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<GroupRow> {
    Ok(GroupRow {
        id: r.get(0)?,
        teacher_id: r.get(1)?,
        name: r.get(2)?,
        description: r.get(3)?,
        place: r.get(4)?,
        schedule_date: r.get(5)?,
        schedule_time: r.get(6)?,
        days: r.get(7)?,
        year: r.get(8)?,
        sort_order: r.get(9)?,
        created_at: r.get(10)?,
    })
}

pub fn load_group(conn: &Connection, group_id: &str) -> Result<Option<GroupRow>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM groups WHERE id = ?", GROUP_COLUMNS),
        [group_id],
        group_from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))
}

/// Owners read their groups; coordinators and admins read every group.
pub fn group_for_read(conn: &Connection, session: &Session, group_id: &str) -> Result<GroupRow, HandlerErr> {
    match load_group(conn, group_id)? {
        Some(g) if g.teacher_id == session.teacher_id || session.role.sees_all() => Ok(g),
        _ => Err(HandlerErr::not_found("group not found")),
    }
}

/// Owners and admins change a group.
pub fn group_for_write(conn: &Connection, session: &Session, group_id: &str) -> Result<GroupRow, HandlerErr> {
    match load_group(conn, group_id)? {
        Some(g) if g.teacher_id == session.teacher_id || session.role == Role::Admin => Ok(g),
        Some(_) if session.role.sees_all() => {
            Err(HandlerErr::forbidden("group belongs to another teacher"))
        }
        _ => Err(HandlerErr::not_found("group not found")),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: String,
    pub group_id: String,
    pub full_name: String,
    pub email: String,
    pub national_id: String,
    pub birth_date: Option<String>,
}

pub const STUDENT_COLUMNS: &str = "id, group_id, full_name, email, national_id, birth_date";

pub fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        group_id: r.get(1)?,
        full_name: r.get(2)?,
        email: r.get(3)?,
        national_id: r.get(4)?,
        birth_date: r.get(5)?,
    })
}

pub fn list_group_students(conn: &Connection, group_id: &str) -> Result<Vec<StudentRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM students WHERE group_id = ? ORDER BY full_name COLLATE NOCASE, rowid",
            STUDENT_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    stmt.query_map([group_id], student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))
}

/// Resolves a student and checks the session may change its group.
pub fn student_for_write(
    conn: &Connection,
    session: &Session,
    student_id: &str,
) -> Result<(StudentRow, GroupRow), HandlerErr> {
    let student = conn
        .query_row(
            &format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS),
            [student_id],
            student_from_row,
        )
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    let group = group_for_write(conn, session, &student.group_id).map_err(|e| {
        if e.code == "not_found" {
            HandlerErr::not_found("student not found")
        } else {
            e
        }
    })?;
    Ok((student, group))
}

pub fn parse_date_param(raw: &str, key: &str) -> Result<chrono::NaiveDate, HandlerErr> {
    dates::parse_iso_date(raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a YYYY-MM-DD date", key)))
}
