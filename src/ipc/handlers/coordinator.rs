use crate::auth::Role;
use crate::ipc::helpers::{
    db_err, group_from_row, require_role, run_authed, student_from_row, to_json, HandlerErr,
    GROUP_COLUMNS, STUDENT_COLUMNS,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::Connection;
use serde_json::json;

const RECENT_GROUPS: i64 = 5;

fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [], |r| r.get(0))
        .map_err(db_err("db_query_failed"))
}

fn overview(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(session, &[Role::Coordinator, Role::Admin])?;
    let search = params
        .get("search")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();

    let totals = json!({
        "teachers": count(conn, "SELECT COUNT(*) FROM teachers WHERE role IN ('teacher', 'coordinator')")?,
        "groups": count(conn, "SELECT COUNT(*) FROM groups")?,
        "students": count(conn, "SELECT COUNT(*) FROM students")?,
        "attendanceRecords": count(conn, "SELECT COUNT(*) FROM attendance")?
    });

    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.email, t.full_name, t.role,
                    (SELECT COUNT(*) FROM groups g WHERE g.teacher_id = t.id),
                    (SELECT COUNT(*) FROM students s JOIN groups g ON g.id = s.group_id
                      WHERE g.teacher_id = t.id),
                    (SELECT COUNT(*) FROM attendance a JOIN groups g ON g.id = a.group_id
                      WHERE g.teacher_id = t.id)
             FROM teachers t
             WHERE t.role IN ('teacher', 'coordinator')
             ORDER BY t.full_name COLLATE NOCASE",
        )
        .map_err(db_err("db_query_failed"))?;
    let all_teachers = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                json!({
                    "teacher": {
                        "id": r.get::<_, String>(0)?,
                        "email": r.get::<_, String>(1)?,
                        "fullName": r.get::<_, String>(2)?,
                        "role": r.get::<_, String>(3)?
                    },
                    "groupCount": r.get::<_, i64>(4)?,
                    "studentCount": r.get::<_, i64>(5)?,
                    "attendanceCount": r.get::<_, i64>(6)?
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let teachers: Vec<serde_json::Value> = all_teachers
        .into_iter()
        .filter(|(email, name, _)| {
            search.is_empty()
                || name.to_lowercase().contains(&search)
                || email.to_lowercase().contains(&search)
        })
        .map(|(_, _, v)| v)
        .collect();

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {}, (SELECT full_name FROM teachers t WHERE t.id = groups.teacher_id)
             FROM groups ORDER BY created_at DESC, rowid DESC LIMIT ?",
            GROUP_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let recent = stmt
        .query_map([RECENT_GROUPS], |r| {
            Ok((group_from_row(r)?, r.get::<_, Option<String>>(11)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut recent_groups = Vec::with_capacity(recent.len());
    for (g, teacher_name) in &recent {
        let mut v = to_json(g)?;
        v["teacherName"] = json!(teacher_name);
        recent_groups.push(v);
    }

    Ok(json!({
        "totals": totals,
        "teachers": teachers,
        "recentGroups": recent_groups
    }))
}

fn dashboard(conn: &Connection, session: &Session) -> Result<serde_json::Value, HandlerErr> {
    require_role(session, &[Role::Admin])?;

    let mut stmt = conn
        .prepare(
            "SELECT id, email, full_name, role, created_at FROM teachers
             WHERE role <> 'admin'
             ORDER BY full_name COLLATE NOCASE",
        )
        .map_err(db_err("db_query_failed"))?;
    let teachers = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "email": r.get::<_, String>(1)?,
                "fullName": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM groups ORDER BY name COLLATE NOCASE, rowid",
            GROUP_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let groups = stmt
        .query_map([], group_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM students ORDER BY full_name COLLATE NOCASE, rowid",
            STUDENT_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let students = stmt
        .query_map([], student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, group_id, date, present, notes, marked_by FROM attendance
             ORDER BY date DESC, rowid",
        )
        .map_err(db_err("db_query_failed"))?;
    let attendance = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "groupId": r.get::<_, String>(2)?,
                "date": r.get::<_, String>(3)?,
                "present": r.get::<_, i64>(4)? != 0,
                "notes": r.get::<_, Option<String>>(5)?,
                "markedBy": r.get::<_, Option<String>>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    Ok(json!({
        "teachers": teachers,
        "groups": to_json(&groups)?,
        "students": to_json(&students)?,
        "attendance": attendance
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "coordinator.overview" => Some(run_authed(state, req, |conn, session, _| {
            overview(conn, session, &req.params)
        })),
        "admin.dashboard" => Some(run_authed(state, req, |conn, session, _| {
            dashboard(conn, session)
        })),
        _ => None,
    }
}
