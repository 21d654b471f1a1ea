use crate::config::Config;
use crate::dates;
use crate::ipc::handlers::setup::birthday_window_days;
use crate::ipc::helpers::{
    db_err, group_for_read, group_from_row, list_group_students, run_authed, GroupRow, HandlerErr,
    GROUP_COLUMNS,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::Connection;
use serde_json::json;

struct Upcoming {
    days_until: i64,
    entry: serde_json::Value,
}

fn own_groups(conn: &Connection, teacher_id: &str) -> Result<Vec<GroupRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM groups WHERE teacher_id = ? ORDER BY sort_order, rowid",
            GROUP_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    stmt.query_map([teacher_id], group_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))
}

fn birthdays_list(
    conn: &Connection,
    session: &Session,
    cfg: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let days = match params.get("days") {
        None | Some(serde_json::Value::Null) => birthday_window_days(conn, cfg)?,
        Some(v) => {
            let n = v
                .as_i64()
                .ok_or_else(|| HandlerErr::bad_params("days must be integer"))?;
            if !(0..=366).contains(&n) {
                return Err(HandlerErr::bad_params("days must be in 0..=366"));
            }
            n
        }
    };
    let groups = match params.get("groupId").and_then(|v| v.as_str()).map(str::trim) {
        Some(gid) if !gid.is_empty() => vec![group_for_read(conn, session, gid)?],
        _ => own_groups(conn, &session.teacher_id)?,
    };

    let today = dates::today();
    let mut today_list = Vec::new();
    let mut upcoming: Vec<Upcoming> = Vec::new();
    for g in &groups {
        for s in list_group_students(conn, &g.id)? {
            let Some(birth) = s.birth_date.as_deref().and_then(dates::parse_iso_date) else {
                continue;
            };
            let days_until = dates::days_until_birthday(birth, today);
            if days_until > days {
                continue;
            }
            let entry = json!({
                "studentId": s.id,
                "fullName": s.full_name,
                "groupId": g.id,
                "groupName": g.name,
                "birthDate": s.birth_date,
                "daysUntil": days_until,
                "turningAge": dates::turning_age(birth, today)
            });
            if dates::is_birthday_on(birth, today) {
                today_list.push(entry);
            } else {
                upcoming.push(Upcoming { days_until, entry });
            }
        }
    }
    upcoming.sort_by_key(|u| u.days_until);

    Ok(json!({
        "today": today_list,
        "upcoming": upcoming.into_iter().map(|u| u.entry).collect::<Vec<_>>(),
        "windowDays": days
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "birthdays.list" => Some(run_authed(state, req, |conn, session, cfg| {
            birthdays_list(conn, session, cfg, &req.params)
        })),
        _ => None,
    }
}
