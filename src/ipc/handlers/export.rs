use crate::dates;
use crate::ipc::helpers::{
    clean_opt, db_err, group_for_read, list_group_students, parse_date_param, required_str,
    run_authed, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Session};
use crate::roster_csv::csv_quote;
use crate::stats::percent_round;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

fn opt_date(params: &serde_json::Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(raw) if !raw.is_empty() => parse_date_param(raw, key).map(Some),
        _ => Ok(None),
    }
}

fn attendance_sheet(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let group = group_for_read(conn, session, &group_id)?;
    let from = opt_date(params, "from")?;
    let to = opt_date(params, "to")?;
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err(HandlerErr::bad_params("from must not be after to"));
        }
    }

    let students = list_group_students(conn, &group.id)?;
    if students.is_empty() {
        return Err(HandlerErr::new("nothing_to_export", "the group has no students"));
    }

    let mut stmt = conn
        .prepare("SELECT student_id, date, present FROM attendance WHERE group_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([&group.id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut columns: BTreeSet<NaiveDate> = BTreeSet::new();
    let mut cells: HashMap<(String, NaiveDate), bool> = HashMap::new();
    for (student_id, raw_date, present) in rows {
        let Some(date) = dates::parse_iso_date(&raw_date) else {
            continue;
        };
        if from.is_some_and(|f| date < f) || to.is_some_and(|t| date > t) {
            continue;
        }
        columns.insert(date);
        cells.insert((student_id, date), present);
    }

    let mut header = vec!["Nombre Completo".to_string()];
    header.extend(columns.iter().map(|d| dates::format_day_first(*d)));
    header.extend(["Presentes", "Ausentes", "%"].map(String::from));
    let mut lines = vec![header.iter().map(|h| csv_quote(h)).collect::<Vec<_>>().join(",")];

    for s in &students {
        let mut line = vec![csv_quote(&s.full_name)];
        let (mut present, mut absent) = (0i64, 0i64);
        for d in &columns {
            let cell = match cells.get(&(s.id.clone(), *d)) {
                Some(true) => {
                    present += 1;
                    "P"
                }
                Some(false) => {
                    absent += 1;
                    "A"
                }
                None => "",
            };
            line.push(cell.to_string());
        }
        line.push(present.to_string());
        line.push(absent.to_string());
        line.push(percent_round(present, present + absent).to_string());
        lines.push(line.join(","));
    }
    let csv = lines.join("\n");

    let file_name = format!(
        "asistencia_{}_{}.csv",
        group.name.trim().replace(['/', '\\', ':'], "-"),
        dates::today().format("%Y-%m-%d")
    );
    let mut result = json!({
        "csv": csv,
        "fileName": file_name,
        "dates": columns.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect::<Vec<_>>(),
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

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "export.attendanceSheet" => Some(run_authed(state, req, |conn, session, _| {
            attendance_sheet(conn, session, &req.params)
        })),
        _ => None,
    }
}
