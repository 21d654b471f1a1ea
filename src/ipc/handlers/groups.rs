use crate::auth::Role;
use crate::config::Config;
use crate::dates;
use crate::db;
use crate::ipc::helpers::{
    clean_opt, db_err, db_err_table, group_for_read, group_for_write, group_from_row, list_group_students,
    parse_date_param, parse_params, require_role, required_str, run_authed, to_json, GroupRow,
    HandlerErr, GROUP_COLUMNS,
};
use crate::ipc::types::{AppState, Request, Session};
use chrono::NaiveTime;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupParams {
    name: Option<String>,
    place: Option<String>,
    schedule_date: Option<String>,
    description: Option<String>,
    schedule_time: Option<String>,
    days: Option<String>,
    year: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReorderParams {
    group_ids: Vec<String>,
    revision: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveParams {
    group_id: String,
    direction: String,
    revision: Option<i64>,
}

fn non_empty(v: Option<String>, key: &str) -> Result<String, HandlerErr> {
    v.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must not be empty", key)))
}

fn normalize_time(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .map(|time| time.format("%H:%M").to_string())
        .map_err(|_| HandlerErr::bad_params("scheduleTime must be HH:MM"))
}

const PATCH_FIELDS: [&str; 7] = [
    "name",
    "place",
    "scheduleDate",
    "scheduleTime",
    "description",
    "days",
    "year",
];

/// Reads an optional patch key: absent keeps the value, null or blank clears it.
fn patch_opt(patch: &serde_json::Value, key: &str) -> Result<Option<Option<String>>, HandlerErr> {
    match patch.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(Some(None)),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be string or null", key)))?;
            Ok(Some(clean_opt(Some(s.to_string()))))
        }
    }
}

fn begin_immediate<'c>(conn: &'c Connection, cfg: &Config) -> Result<Transaction<'c>, HandlerErr> {
    db::with_busy_retry(
        cfg.retry_attempts,
        Duration::from_millis(cfg.retry_delay_ms),
        || Transaction::new_unchecked(conn, TransactionBehavior::Immediate),
    )
    .map_err(db_err("db_tx_failed"))
}

fn order_revision(conn: &Connection, teacher_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT order_revision FROM teachers WHERE id = ?",
        [teacher_id],
        |r| r.get(0),
    )
    .map_err(db_err("db_query_failed"))
}

fn check_revision(conn: &Connection, teacher_id: &str, expected: Option<i64>) -> Result<(), HandlerErr> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let current = order_revision(conn, teacher_id)?;
    if current != expected {
        return Err(HandlerErr::new(
            "conflict",
            "group order changed since it was loaded",
        )
        .with_details(json!({ "currentRevision": current })));
    }
    Ok(())
}

fn ordered_group_ids(conn: &Connection, teacher_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM groups WHERE teacher_id = ? ORDER BY sort_order, rowid")
        .map_err(db_err("db_query_failed"))?;
    stmt.query_map([teacher_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))
}

fn next_sort_order(conn: &Connection, teacher_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM groups WHERE teacher_id = ?",
        [teacher_id],
        |r| r.get(0),
    )
    .map_err(db_err("db_query_failed"))
}

fn group_json(g: &GroupRow, student_count: i64) -> Result<serde_json::Value, HandlerErr> {
    let mut v = to_json(g)?;
    v["studentCount"] = json!(student_count);
    Ok(v)
}

fn student_count(conn: &Connection, group_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM students WHERE group_id = ?",
        [group_id],
        |r| r.get(0),
    )
    .map_err(db_err("db_query_failed"))
}

fn groups_list(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let scope = params
        .get("scope")
        .and_then(|v| v.as_str())
        .unwrap_or("own")
        .to_ascii_lowercase();
    let (sql, all) = match scope.as_str() {
        "own" => (
            format!(
                "SELECT {}, (SELECT COUNT(*) FROM students s WHERE s.group_id = groups.id)
                 FROM groups WHERE teacher_id = ?1 ORDER BY sort_order, rowid",
                GROUP_COLUMNS
            ),
            false,
        ),
        "all" => {
            require_role(session, &[Role::Coordinator, Role::Admin])?;
            (
                format!(
                    "SELECT {}, (SELECT COUNT(*) FROM students s WHERE s.group_id = groups.id)
                     FROM groups ORDER BY name COLLATE NOCASE, rowid",
                    GROUP_COLUMNS
                ),
                true,
            )
        }
        _ => return Err(HandlerErr::bad_params("scope must be own or all")),
    };

    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<(GroupRow, i64)> {
        Ok((group_from_row(r)?, r.get(11)?))
    };
    let rows = if all {
        stmt.query_map([], map_row)
    } else {
        stmt.query_map([&session.teacher_id], map_row)
    }
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err("db_query_failed"))?;

    let groups = rows
        .iter()
        .map(|(g, count)| group_json(g, *count))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "groups": groups,
        "orderRevision": order_revision(conn, &session.teacher_id)?
    }))
}

fn groups_create(conn: &Connection, session: &Session, cfg: &Config, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: CreateGroupParams = parse_params(params)?;
    let name = non_empty(p.name, "name")?;
    let place = non_empty(p.place, "place")?;
    let schedule_date_raw = non_empty(p.schedule_date, "scheduleDate")?;
    let schedule_date = parse_date_param(&schedule_date_raw, "scheduleDate")?;
    let schedule_time = match clean_opt(p.schedule_time) {
        Some(t) => Some(normalize_time(&t)?),
        None => None,
    };

    let tx = begin_immediate(conn, cfg)?;
    let sort_order = next_sort_order(&tx, &session.teacher_id)?;
    let g = GroupRow {
        id: Uuid::new_v4().to_string(),
        teacher_id: session.teacher_id.clone(),
        name,
        description: clean_opt(p.description),
        place,
        schedule_date: schedule_date.format("%Y-%m-%d").to_string(),
        schedule_time,
        days: clean_opt(p.days),
        year: clean_opt(p.year),
        sort_order,
        created_at: dates::now_rfc3339(),
    };
    insert_group(&tx, &g)?;
    let revision = db::bump_order_revision(&tx, &session.teacher_id)
        .map_err(db_err_table("db_update_failed", "teachers"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(group_id = %g.id, "group created");
    Ok(json!({ "group": group_json(&g, 0)?, "orderRevision": revision }))
}

fn insert_group(conn: &Connection, g: &GroupRow) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO groups(id, teacher_id, name, description, place, schedule_date, schedule_time,
                            days, year, sort_order, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &g.id,
            &g.teacher_id,
            &g.name,
            &g.description,
            &g.place,
            &g.schedule_date,
            &g.schedule_time,
            &g.days,
            &g.year,
            g.sort_order,
            &g.created_at,
        ),
    )
    .map_err(db_err_table("db_insert_failed", "groups"))?;
    Ok(())
}

fn groups_update(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let mut g = group_for_write(conn, session, &group_id)?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    if let Some(unknown) = patch
        .as_object()
        .and_then(|o| o.keys().find(|k| !PATCH_FIELDS.contains(&k.as_str())))
    {
        return Err(HandlerErr::bad_params(format!("unknown group field: {}", unknown)));
    }

    if let Some(v) = patch_opt(patch, "name")? {
        g.name = v.ok_or_else(|| HandlerErr::bad_params("name must not be empty"))?;
    }
    if let Some(v) = patch_opt(patch, "place")? {
        g.place = v.ok_or_else(|| HandlerErr::bad_params("place must not be empty"))?;
    }
    if let Some(v) = patch_opt(patch, "scheduleDate")? {
        let raw = v.ok_or_else(|| HandlerErr::bad_params("scheduleDate must not be empty"))?;
        g.schedule_date = parse_date_param(&raw, "scheduleDate")?
            .format("%Y-%m-%d")
            .to_string();
    }
    if let Some(v) = patch_opt(patch, "scheduleTime")? {
        g.schedule_time = match v {
            Some(t) => Some(normalize_time(&t)?),
            None => None,
        };
    }
    if let Some(v) = patch_opt(patch, "description")? {
        g.description = v;
    }
    if let Some(v) = patch_opt(patch, "days")? {
        g.days = v;
    }
    if let Some(v) = patch_opt(patch, "year")? {
        g.year = v;
    }

    conn.execute(
        "UPDATE groups SET name = ?, description = ?, place = ?, schedule_date = ?,
                           schedule_time = ?, days = ?, year = ?, updated_at = ?
         WHERE id = ?",
        (
            &g.name,
            &g.description,
            &g.place,
            &g.schedule_date,
            &g.schedule_time,
            &g.days,
            &g.year,
            dates::now_rfc3339(),
            &g.id,
        ),
    )
    .map_err(db_err_table("db_update_failed", "groups"))?;
    let count = student_count(conn, &g.id)?;
    Ok(json!({ "group": group_json(&g, count)? }))
}

fn groups_delete(conn: &Connection, session: &Session, cfg: &Config, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let g = group_for_write(conn, session, &group_id)?;

    let tx = begin_immediate(conn, cfg)?;
    // Explicit dependency order (no ON DELETE CASCADE).
    tx.execute(
        "DELETE FROM attendance
         WHERE group_id = ?1
            OR student_id IN (SELECT id FROM students WHERE group_id = ?1)",
        [&g.id],
    )
    .map_err(db_err_table("db_delete_failed", "attendance"))?;
    tx.execute("DELETE FROM students WHERE group_id = ?", [&g.id])
        .map_err(db_err_table("db_delete_failed", "students"))?;
    tx.execute("DELETE FROM groups WHERE id = ?", [&g.id])
        .map_err(db_err_table("db_delete_failed", "groups"))?;
    db::compact_group_order(&tx, &g.teacher_id).map_err(db_err_table("db_update_failed", "groups"))?;
    let revision = db::bump_order_revision(&tx, &g.teacher_id)
        .map_err(db_err_table("db_update_failed", "teachers"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(group_id = %g.id, "group deleted");
    Ok(json!({ "ok": true, "orderRevision": revision }))
}

fn groups_duplicate(conn: &Connection, session: &Session, cfg: &Config, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let original = group_for_write(conn, session, &group_id)?;
    let students = list_group_students(conn, &original.id)?;

    let tx = begin_immediate(conn, cfg)?;
    let copy = GroupRow {
        id: Uuid::new_v4().to_string(),
        name: format!("{} (Copia)", original.name),
        sort_order: next_sort_order(&tx, &original.teacher_id)?,
        created_at: dates::now_rfc3339(),
        ..original.clone()
    };
    insert_group(&tx, &copy)?;
    for s in &students {
        tx.execute(
            "INSERT INTO students(id, group_id, full_name, email, national_id, birth_date, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &copy.id,
                &s.full_name,
                &s.email,
                &s.national_id,
                &s.birth_date,
                &copy.created_at,
            ),
        )
        .map_err(db_err_table("db_insert_failed", "students"))?;
    }
    let revision = db::bump_order_revision(&tx, &original.teacher_id)
        .map_err(db_err_table("db_update_failed", "teachers"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(from = %original.id, group_id = %copy.id, students = students.len(), "group duplicated");
    Ok(json!({
        "group": group_json(&copy, students.len() as i64)?,
        "studentsCopied": students.len(),
        "orderRevision": revision
    }))
}

fn groups_reorder(conn: &Connection, session: &Session, cfg: &Config, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: ReorderParams = parse_params(params)?;

    let tx = begin_immediate(conn, cfg)?;
    check_revision(&tx, &session.teacher_id, p.revision)?;
    let current = ordered_group_ids(&tx, &session.teacher_id)?;
    let current_set: HashSet<&str> = current.iter().map(|s| s.as_str()).collect();
    let requested_set: HashSet<&str> = p.group_ids.iter().map(|s| s.as_str()).collect();
    if requested_set.len() != p.group_ids.len() {
        return Err(HandlerErr::bad_params("groupIds contains duplicates"));
    }
    if requested_set != current_set {
        return Err(HandlerErr::new(
            "conflict",
            "groupIds does not match the current set of groups",
        )
        .with_details(json!({
            "currentRevision": order_revision(&tx, &session.teacher_id)?,
            "groupIds": current
        })));
    }
    for (i, gid) in p.group_ids.iter().enumerate() {
        tx.execute(
            "UPDATE groups SET sort_order = ? WHERE id = ? AND teacher_id = ?",
            (i as i64, gid, &session.teacher_id),
        )
        .map_err(db_err_table("db_update_failed", "groups"))?;
    }
    let revision = db::bump_order_revision(&tx, &session.teacher_id)
        .map_err(db_err_table("db_update_failed", "teachers"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    Ok(json!({ "groupIds": p.group_ids, "orderRevision": revision }))
}

fn groups_move(conn: &Connection, session: &Session, cfg: &Config, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: MoveParams = parse_params(params)?;
    let step: isize = match p.direction.trim().to_ascii_lowercase().as_str() {
        "up" => -1,
        "down" => 1,
        _ => return Err(HandlerErr::bad_params("direction must be up or down")),
    };

    let g = group_for_write(conn, session, p.group_id.trim())?;
    let owner = g.teacher_id.as_str();

    let tx = begin_immediate(conn, cfg)?;
    check_revision(&tx, owner, p.revision)?;
    let ids = ordered_group_ids(&tx, owner)?;
    let Some(idx) = ids.iter().position(|id| *id == g.id) else {
        return Err(HandlerErr::not_found("group not found"));
    };
    let target = idx as isize + step;
    if target < 0 || target as usize >= ids.len() {
        let revision = order_revision(&tx, owner)?;
        return Ok(json!({ "moved": false, "groupIds": ids, "orderRevision": revision }));
    }
    let target = target as usize;

    // Both rows change inside one immediate transaction.
    tx.execute(
        "UPDATE groups SET sort_order = ? WHERE id = ?",
        (target as i64, &ids[idx]),
    )
    .map_err(db_err_table("db_update_failed", "groups"))?;
    tx.execute(
        "UPDATE groups SET sort_order = ? WHERE id = ?",
        (idx as i64, &ids[target]),
    )
    .map_err(db_err_table("db_update_failed", "groups"))?;
    db::compact_group_order(&tx, owner).map_err(db_err_table("db_update_failed", "groups"))?;
    let revision =
        db::bump_order_revision(&tx, owner).map_err(db_err_table("db_update_failed", "teachers"))?;
    let ids = ordered_group_ids(&tx, owner)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    Ok(json!({ "moved": true, "groupIds": ids, "orderRevision": revision }))
}

fn groups_get(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let g = group_for_read(conn, session, &group_id)?;
    let count = student_count(conn, &g.id)?;
    Ok(json!({ "group": group_json(&g, count)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let p = &req.params;
    match req.method.as_str() {
        "groups.list" => Some(run_authed(state, req, |c, s, _| groups_list(c, s, p))),
        "groups.get" => Some(run_authed(state, req, |c, s, _| groups_get(c, s, p))),
        "groups.create" => Some(run_authed(state, req, |c, s, cfg| groups_create(c, s, cfg, p))),
        "groups.update" => Some(run_authed(state, req, |c, s, _| groups_update(c, s, p))),
        "groups.delete" => Some(run_authed(state, req, |c, s, cfg| groups_delete(c, s, cfg, p))),
        "groups.duplicate" => Some(run_authed(state, req, |c, s, cfg| groups_duplicate(c, s, cfg, p))),
        "groups.reorder" => Some(run_authed(state, req, |c, s, cfg| groups_reorder(c, s, cfg, p))),
        "groups.move" => Some(run_authed(state, req, |c, s, cfg| groups_move(c, s, cfg, p))),
        _ => None,
    }
}
