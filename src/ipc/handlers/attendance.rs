use crate::dates;
use crate::ipc::helpers::{
    clean_opt, db_err, db_err_table, group_for_read, group_for_write, list_group_students,
    parse_date_param, parse_params, required_str, run_authed, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Session};
use chrono::{Months, NaiveDate};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordIn {
    student_id: String,
    #[serde(default)]
    present: bool,
    notes: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveParams {
    group_id: String,
    date: String,
    #[serde(default)]
    records: Vec<RecordIn>,
}

fn date_or_today(params: &serde_json::Value) -> Result<NaiveDate, HandlerErr> {
    match params.get("date").and_then(|v| v.as_str()).map(str::trim) {
        Some(raw) if !raw.is_empty() => parse_date_param(raw, "date"),
        _ => Ok(dates::today()),
    }
}

/// Marks for the group's current roster on one date, keyed by student.
fn day_marks(
    conn: &Connection,
    group_id: &str,
    date: &str,
) -> Result<HashMap<String, (bool, Option<String>)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, present, notes FROM attendance
             WHERE date = ?1
               AND (group_id = ?2 OR student_id IN (SELECT id FROM students WHERE group_id = ?2))",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((date, group_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                (r.get::<_, i64>(1)? != 0, r.get::<_, Option<String>>(2)?),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows.into_iter().collect())
}

fn day_open(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let group = group_for_read(conn, session, &group_id)?;
    let date = date_or_today(params)?;
    let date_key = date.format("%Y-%m-%d").to_string();

    let students = list_group_students(conn, &group.id)?;
    let marks = day_marks(conn, &group.id, &date_key)?;

    let mut present_count = 0usize;
    let rows: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            let (present, notes) = marks.get(&s.id).cloned().unwrap_or((false, None));
            if present {
                present_count += 1;
            }
            json!({
                "studentId": s.id,
                "fullName": s.full_name,
                "email": s.email,
                "present": present,
                "notes": notes.unwrap_or_default()
            })
        })
        .collect();

    Ok(json!({
        "group": to_json(&group)?,
        "date": date_key,
        "existing": !marks.is_empty(),
        "rows": rows,
        "presentCount": present_count,
        "totalCount": students.len()
    }))
}

fn save_day(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: SaveParams = parse_params(params)?;
    let group = group_for_write(conn, session, p.group_id.trim())?;
    let date_key = parse_date_param(&p.date, "date")?
        .format("%Y-%m-%d")
        .to_string();

    let students = list_group_students(conn, &group.id)?;
    let roster: HashSet<&str> = students.iter().map(|s| s.id.as_str()).collect();
    let mut marked: HashMap<&str, (bool, Option<String>)> = HashMap::new();
    for rec in &p.records {
        if !roster.contains(rec.student_id.as_str()) {
            return Err(HandlerErr::bad_params("student does not belong to the group")
                .with_details(json!({ "studentId": rec.student_id })));
        }
        marked.insert(rec.student_id.as_str(), (rec.present, clean_opt(rec.notes.clone())));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    // Only the current roster is replaced; marks of students who left stay put.
    tx.execute(
        "DELETE FROM attendance
         WHERE date = ?1
           AND student_id IN (SELECT id FROM students WHERE group_id = ?2)",
        (&date_key, &group.id),
    )
    .map_err(db_err_table("db_delete_failed", "attendance"))?;

    let now = dates::now_rfc3339();
    let mut present_count = 0usize;
    {
        let mut insert = tx
            .prepare(
                "INSERT INTO attendance(id, student_id, group_id, date, present, notes, marked_by, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .map_err(db_err("db_query_failed"))?;
        for s in &students {
            let (present, notes) = marked.remove(s.id.as_str()).unwrap_or((false, None));
            if present {
                present_count += 1;
            }
            insert
                .execute((
                    Uuid::new_v4().to_string(),
                    &s.id,
                    &group.id,
                    &date_key,
                    present as i64,
                    notes,
                    &session.teacher_id,
                    &now,
                ))
                .map_err(db_err_table("db_insert_failed", "attendance"))?;
        }
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(group_id = %group.id, date = %date_key, present = present_count, total = students.len(), "attendance saved");
    Ok(json!({
        "date": date_key,
        "saved": students.len(),
        "presentCount": present_count,
        "totalCount": students.len()
    }))
}

fn history(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let group = group_for_read(conn, session, &group_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT date, SUM(present), COUNT(*) FROM attendance
             WHERE group_id = ?
             GROUP BY date
             ORDER BY date DESC",
        )
        .map_err(db_err("db_query_failed"))?;
    let days = stmt
        .query_map([&group.id], |r| {
            let present: i64 = r.get(1)?;
            let total: i64 = r.get(2)?;
            Ok(json!({
                "date": r.get::<_, String>(0)?,
                "present": present,
                "absent": total - present,
                "total": total
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "groupId": group.id, "days": days }))
}

fn calendar(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let raw = required_str(params, "month")?;
    let first = dates::parse_month_key(&raw)
        .ok_or_else(|| HandlerErr::bad_params("month must be YYYY-MM"))?;
    let next = first
        .checked_add_months(Months::new(1))
        .ok_or_else(|| HandlerErr::bad_params("month out of range"))?;

    let mut stmt = conn
        .prepare(
            "SELECT a.date, g.id, g.name, SUM(a.present), COUNT(*)
             FROM attendance a
             JOIN groups g ON g.id = a.group_id
             WHERE g.teacher_id = ? AND a.date >= ? AND a.date < ?
             GROUP BY a.date, g.id
             ORDER BY a.date, g.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map(
            (
                &session.teacher_id,
                first.format("%Y-%m-%d").to_string(),
                next.format("%Y-%m-%d").to_string(),
            ),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    json!({
                        "groupId": r.get::<_, String>(1)?,
                        "groupName": r.get::<_, String>(2)?,
                        "present": r.get::<_, i64>(3)?,
                        "total": r.get::<_, i64>(4)?
                    }),
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut by_day: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
    for (date, group) in rows {
        by_day.entry(date).or_default().push(group);
    }
    let days: Vec<serde_json::Value> = by_day
        .into_iter()
        .map(|(date, groups)| json!({ "date": date, "groups": groups }))
        .collect();
    Ok(json!({ "month": first.format("%Y-%m").to_string(), "days": days }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let p = &req.params;
    match req.method.as_str() {
        "attendance.dayOpen" => Some(run_authed(state, req, |c, s, _| day_open(c, s, p))),
        "attendance.save" => Some(run_authed(state, req, |c, s, _| save_day(c, s, p))),
        "attendance.history" => Some(run_authed(state, req, |c, s, _| history(c, s, p))),
        "attendance.calendar" => Some(run_authed(state, req, |c, s, _| calendar(c, s, p))),
        _ => None,
    }
}
