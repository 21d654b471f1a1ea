use crate::dates;
use crate::ipc::handlers::setup::load_thresholds;
use crate::ipc::helpers::{db_err, group_for_read, list_group_students, required_str, run_authed, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::stats::{self, Mark, StudentRef};
use serde_json::json;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method != "stats.group" {
        return None;
    }
    Some(run_authed(state, req, |conn, session, cfg| {
        let group_id = required_str(&req.params, "groupId")?;
        let group = group_for_read(conn, session, &group_id)?;
        let thresholds = load_thresholds(conn, cfg)?;

        let students: Vec<StudentRef> = list_group_students(conn, &group.id)?
            .into_iter()
            .map(|s| StudentRef {
                id: s.id,
                full_name: s.full_name,
                email: s.email,
            })
            .collect();

        let mut stmt = conn
            .prepare("SELECT student_id, date, present FROM attendance WHERE group_id = ? ORDER BY date")
            .map_err(db_err("db_query_failed"))?;
        let raw = stmt
            .query_map([&group.id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)? != 0,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err("db_query_failed"))?;
        let mut marks = Vec::with_capacity(raw.len());
        for (student_id, date, present) in raw {
            let Some(date) = dates::parse_iso_date(&date) else {
                tracing::warn!(group_id = %group.id, date = %date, "skipping attendance row with bad date");
                continue;
            };
            marks.push(Mark {
                student_id,
                date,
                present,
            });
        }

        let computed = stats::compute_group_stats(&students, &marks, thresholds);
        let students_json: Vec<serde_json::Value> = computed
            .students
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "fullName": s.full_name,
                    "email": s.email,
                    "totalClasses": s.total_classes,
                    "present": s.present,
                    "absent": s.absent,
                    "percentage": s.percentage,
                    "band": s.band
                })
            })
            .collect();
        let monthly: Vec<serde_json::Value> = computed
            .monthly
            .iter()
            .map(|m| json!({ "month": m.month, "present": m.present, "absent": m.absent }))
            .collect();
        let ranking: Vec<serde_json::Value> = computed
            .absence_ranking
            .iter()
            .map(|r| json!({ "name": r.name, "absences": r.absences, "percentage": r.percentage }))
            .collect();

        Ok::<_, HandlerErr>(json!({
            "groupId": group.id,
            "groupName": group.name,
            "students": students_json,
            "group": {
                "totalStudents": computed.total_students,
                "averagePercentage": computed.average_percentage
            },
            "totals": {
                "present": computed.total_present,
                "absent": computed.total_absent
            },
            "monthly": monthly,
            "absenceRanking": ranking,
            "thresholds": { "good": thresholds.good, "warning": thresholds.warning }
        }))
    }))
}
