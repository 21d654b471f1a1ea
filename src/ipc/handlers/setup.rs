use crate::auth::Role;
use crate::config::Config;
use crate::db;
use crate::ipc::helpers::{require_role, run_authed, HandlerErr};
use crate::ipc::types::{AppState, Request, Session};
use crate::stats::Thresholds;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Statistics,
    Birthdays,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "statistics" => Some(Self::Statistics),
            "birthdays" => Some(Self::Birthdays),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Statistics => "setup.statistics",
            Self::Birthdays => "setup.birthdays",
        }
    }
}

fn default_section(section: SetupSection, cfg: &Config) -> Value {
    match section {
        SetupSection::Statistics => {
            let t = Thresholds::default();
            json!({
                "goodThreshold": t.good,
                "warningThreshold": t.warning
            })
        }
        SetupSection::Birthdays => json!({
            "windowDays": cfg.birthday_window_days
        }),
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "setup section must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Statistics => match k.as_str() {
                "goodThreshold" | "warningThreshold" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                _ => return Err(format!("unknown statistics field: {}", k)),
            },
            SetupSection::Birthdays => match k.as_str() {
                "windowDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 366)?));
                }
                _ => return Err(format!("unknown birthdays field: {}", k)),
            },
        }
    }
    if let SetupSection::Statistics = section {
        let good = obj.get("goodThreshold").and_then(|v| v.as_i64()).unwrap_or(0);
        let warning = obj.get("warningThreshold").and_then(|v| v.as_i64()).unwrap_or(0);
        if warning > good {
            return Err("warningThreshold must not exceed goodThreshold".into());
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection, cfg: &Config) -> anyhow::Result<Value> {
    let mut current = default_section(section, cfg);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed stored values fall back to defaults.
            let mut merged = current.clone();
            if merge_section_patch(section, &mut merged, saved_obj).is_ok() {
                current = merged;
            }
        }
    }
    Ok(current)
}

fn section_err(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

/// Attendance bands used by `stats.group`.
pub fn load_thresholds(conn: &Connection, cfg: &Config) -> Result<Thresholds, HandlerErr> {
    let v = load_section(conn, SetupSection::Statistics, cfg).map_err(section_err)?;
    let d = Thresholds::default();
    Ok(Thresholds {
        good: v.get("goodThreshold").and_then(|n| n.as_i64()).unwrap_or(d.good),
        warning: v
            .get("warningThreshold")
            .and_then(|n| n.as_i64())
            .unwrap_or(d.warning),
    })
}

pub fn birthday_window_days(conn: &Connection, cfg: &Config) -> Result<i64, HandlerErr> {
    let v = load_section(conn, SetupSection::Birthdays, cfg).map_err(section_err)?;
    Ok(v.get("windowDays")
        .and_then(|n| n.as_i64())
        .unwrap_or(cfg.birthday_window_days))
}

fn setup_get(conn: &Connection, cfg: &Config) -> Result<Value, HandlerErr> {
    let statistics = load_section(conn, SetupSection::Statistics, cfg).map_err(section_err)?;
    let birthdays = load_section(conn, SetupSection::Birthdays, cfg).map_err(section_err)?;
    Ok(json!({
        "statistics": statistics,
        "birthdays": birthdays
    }))
}

fn setup_update(conn: &Connection, session: &Session, cfg: &Config, params: &Value) -> Result<Value, HandlerErr> {
    require_role(session, &[Role::Admin])?;
    let Some(section_raw) = params.get("section").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(HandlerErr::bad_params("unknown section"));
    };
    let Some(patch_obj) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = load_section(conn, section, cfg).map_err(section_err)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!(section = section_raw, "setup updated");
    Ok(json!({ "ok": true, "section": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(run_authed(state, req, |conn, _, cfg| setup_get(conn, cfg))),
        "setup.update" => Some(run_authed(state, req, |conn, session, cfg| {
            setup_update(conn, session, cfg, &req.params)
        })),
        _ => None,
    }
}
