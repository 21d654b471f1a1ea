use crate::config::Config;
use crate::dates;
use crate::db;
use crate::ipc::helpers::{
    clean_opt, db_err, db_err_table, group_for_read, group_for_write, list_group_students,
    parse_date_param, parse_params, required_str, run_authed, student_for_write, to_json,
    HandlerErr, StudentRow,
};
use crate::ipc::types::{AppState, Request, Session};
use crate::roster_csv::{self, RosterStudent};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateStudentParams {
    group_id: String,
    full_name: Option<String>,
    email: Option<String>,
    national_id: Option<String>,
    birth_date: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportParams {
    group_id: String,
    text: Option<String>,
    in_path: Option<String>,
}

fn normalize_birth_date(raw: Option<String>) -> Result<Option<String>, HandlerErr> {
    match clean_opt(raw) {
        Some(s) => Ok(Some(
            parse_date_param(&s, "birthDate")?
                .format("%Y-%m-%d")
                .to_string(),
        )),
        None => Ok(None),
    }
}

fn students_list(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let group = group_for_read(conn, session, &group_id)?;
    let students = list_group_students(conn, &group.id)?;
    Ok(json!({
        "group": to_json(&group)?,
        "students": to_json(&students)?
    }))
}

fn students_create(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: CreateStudentParams = parse_params(params)?;
    let group = group_for_write(conn, session, p.group_id.trim())?;
    let student = StudentRow {
        id: Uuid::new_v4().to_string(),
        group_id: group.id,
        full_name: p.full_name.unwrap_or_default().trim().to_string(),
        email: p.email.unwrap_or_default().trim().to_string(),
        national_id: p.national_id.unwrap_or_default().trim().to_string(),
        birth_date: normalize_birth_date(p.birth_date)?,
    };
    roster_csv::validate_student(&student.full_name, &student.email, &student.national_id)
        .map_err(HandlerErr::bad_params)?;

    conn.execute(
        "INSERT INTO students(id, group_id, full_name, email, national_id, birth_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student.id,
            &student.group_id,
            &student.full_name,
            &student.email,
            &student.national_id,
            &student.birth_date,
            dates::now_rfc3339(),
        ),
    )
    .map_err(db_err_table("db_insert_failed", "students"))?;
    Ok(json!({ "student": to_json(&student)? }))
}

fn students_update(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let (mut student, _) = student_for_write(conn, session, &student_id)?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };

    for (k, v) in patch {
        let text = match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            _ => return Err(HandlerErr::bad_params(format!("patch.{} must be string or null", k))),
        };
        match k.as_str() {
            "fullName" => student.full_name = text.unwrap_or_default().trim().to_string(),
            "email" => student.email = text.unwrap_or_default().trim().to_string(),
            "nationalId" => student.national_id = text.unwrap_or_default().trim().to_string(),
            "birthDate" => student.birth_date = normalize_birth_date(text)?,
            _ => return Err(HandlerErr::bad_params(format!("unknown student field: {}", k))),
        }
    }
    roster_csv::validate_student(&student.full_name, &student.email, &student.national_id)
        .map_err(HandlerErr::bad_params)?;

    conn.execute(
        "UPDATE students SET full_name = ?, email = ?, national_id = ?, birth_date = ?, updated_at = ?
         WHERE id = ?",
        (
            &student.full_name,
            &student.email,
            &student.national_id,
            &student.birth_date,
            dates::now_rfc3339(),
            &student.id,
        ),
    )
    .map_err(db_err_table("db_update_failed", "students"))?;
    Ok(json!({ "student": to_json(&student)? }))
}

fn students_delete(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let (student, _) = student_for_write(conn, session, &student_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let removed_marks = tx
        .execute("DELETE FROM attendance WHERE student_id = ?", [&student.id])
        .map_err(db_err_table("db_delete_failed", "attendance"))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student.id])
        .map_err(db_err_table("db_delete_failed", "students"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    Ok(json!({ "ok": true, "attendanceRemoved": removed_marks }))
}

fn students_move(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let target_id = required_str(params, "targetGroupId")?;
    let (mut student, _) = student_for_write(conn, session, &student_id)?;
    let target = group_for_write(conn, session, &target_id)?;
    if target.id == student.group_id {
        return Ok(json!({ "student": to_json(&student)?, "moved": false }));
    }

    conn.execute(
        "UPDATE students SET group_id = ?, updated_at = ? WHERE id = ?",
        (&target.id, dates::now_rfc3339(), &student.id),
    )
    .map_err(db_err_table("db_update_failed", "students"))?;
    tracing::info!(student_id = %student.id, from = %student.group_id, to = %target.id, "student moved");
    student.group_id = target.id;
    Ok(json!({ "student": to_json(&student)?, "moved": true }))
}

fn export_csv(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let group = group_for_read(conn, session, &group_id)?;
    let students = list_group_students(conn, &group.id)?;
    if students.is_empty() {
        return Err(HandlerErr::new("nothing_to_export", "the group has no students"));
    }

    let rows: Vec<RosterStudent<'_>> = students
        .iter()
        .map(|s| RosterStudent {
            full_name: &s.full_name,
            email: &s.email,
            national_id: &s.national_id,
            birth_date: s.birth_date.as_deref().and_then(dates::parse_iso_date),
        })
        .collect();
    let csv = roster_csv::build_roster_csv(&rows);
    let file_name = roster_csv::roster_file_name(&group.name, dates::today());

    let mut result = json!({
        "csv": csv,
        "fileName": file_name,
        "rowsExported": students.len()
    });
    if let Some(out) = clean_opt(params.get("outPath").and_then(|v| v.as_str()).map(str::to_string)) {
        let out_path = PathBuf::from(out);
        std::fs::write(&out_path, &csv).map_err(|e| {
            HandlerErr::new("io_failed", e.to_string())
                .with_details(json!({ "path": out_path.to_string_lossy() }))
        })?;
        result["path"] = json!(out_path.to_string_lossy());
    }
    Ok(result)
}

fn import_csv(conn: &Connection, session: &Session, cfg: &Config, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ImportParams = parse_params(params)?;
    let group = group_for_write(conn, session, p.group_id.trim())?;
    let text = match (clean_opt(p.text), clean_opt(p.in_path)) {
        (Some(t), _) => t,
        (None, Some(path)) => std::fs::read_to_string(&path).map_err(|e| {
            HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": path }))
        })?,
        (None, None) => return Err(HandlerErr::bad_params("provide text or inPath")),
    };

    let rows = roster_csv::parse_roster(&text).map_err(|e| HandlerErr::new("bad_csv", e.to_string()))?;

    let mut known: HashSet<String> = list_group_students(conn, &group.id)?
        .into_iter()
        .map(|s| s.national_id)
        .collect();
    let delay = Duration::from_millis(cfg.retry_delay_ms);
    let now = dates::now_rfc3339();
    let mut added = 0usize;
    let mut skipped = 0usize;
    let mut errors: Vec<String> = Vec::new();

    for row in rows {
        if let Err(msg) = roster_csv::validate_student(&row.full_name, &row.email, &row.national_id) {
            skipped += 1;
            errors.push(format!("line {}: {}", row.line, msg));
            continue;
        }
        if known.contains(&row.national_id) {
            skipped += 1;
            continue;
        }
        let birth = row.birth_date.map(|d| d.format("%Y-%m-%d").to_string());
        let inserted = db::with_busy_retry(cfg.retry_attempts, delay, || {
            conn.execute(
                "INSERT INTO students(id, group_id, full_name, email, national_id, birth_date, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &group.id,
                    &row.full_name,
                    &row.email,
                    &row.national_id,
                    &birth,
                    &now,
                ),
            )
        });
        match inserted {
            Ok(_) => {
                added += 1;
                known.insert(row.national_id);
            }
            Err(e) => {
                skipped += 1;
                errors.push(format!("line {}: {}", row.line, e));
            }
        }
    }

    tracing::info!(group_id = %group.id, added, skipped, "roster imported");
    Ok(json!({ "added": added, "skipped": skipped, "errors": errors }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let p = &req.params;
    match req.method.as_str() {
        "students.list" => Some(run_authed(state, req, |c, s, _| students_list(c, s, p))),
        "students.create" => Some(run_authed(state, req, |c, s, _| students_create(c, s, p))),
        "students.update" => Some(run_authed(state, req, |c, s, _| students_update(c, s, p))),
        "students.delete" => Some(run_authed(state, req, |c, s, _| students_delete(c, s, p))),
        "students.move" => Some(run_authed(state, req, |c, s, _| students_move(c, s, p))),
        "students.exportCsv" => Some(run_authed(state, req, |c, s, _| export_csv(c, s, p))),
        "students.importCsv" => Some(run_authed(state, req, |c, s, cfg| import_csv(c, s, cfg, p))),
        _ => None,
    }
}
