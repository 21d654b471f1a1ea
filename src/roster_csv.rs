use crate::dates;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use regex::Regex;
use std::sync::OnceLock;

pub const ROSTER_HEADER: [&str; 4] = ["Nombre Completo", "Email", "DNI", "Fecha de Nacimiento"];

#[derive(Debug, Clone, PartialEq)]
pub struct RosterRow {
    pub line: usize,
    pub full_name: String,
    pub email: String,
    pub national_id: String,
    pub birth_date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct RosterStudent<'a> {
    pub full_name: &'a str,
    pub email: &'a str,
    pub national_id: &'a str,
    pub birth_date: Option<NaiveDate>,
}

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static email pattern"))
}

pub fn is_valid_email(email: &str) -> bool {
    email_pattern().is_match(email)
}

/// Checks the fields every student must carry. Returns the first problem found.
pub fn validate_student(full_name: &str, email: &str, national_id: &str) -> Result<(), String> {
    if full_name.trim().is_empty() {
        return Err("full name is required".to_string());
    }
    if email.trim().is_empty() {
        return Err("email is required".to_string());
    }
    if national_id.trim().is_empty() {
        return Err("national id is required".to_string());
    }
    if !is_valid_email(email.trim()) {
        return Err(format!("invalid email: {}", email.trim()));
    }
    Ok(())
}

pub fn csv_quote_always(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        csv_quote_always(s)
    } else {
        s.to_string()
    }
}

pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

/// Birth dates come either day-first ("5/3/2010") or ISO. Anything else is dropped.
fn parse_birth_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    dates::parse_day_first(t).or_else(|| dates::parse_iso_date(t))
}

/// Parses an uploaded roster. The first line is a header and is skipped.
///
/// A row with fewer than three cells fails the whole file. Empty cells still
/// count; field-level validation is left to the caller so that bad rows can be
/// skipped one by one.
pub fn parse_roster(text: &str) -> Result<Vec<RosterRow>> {
    let lines: Vec<&str> = text.trim().lines().collect();
    if lines.len() < 2 {
        return Err(anyhow!("file is empty or only contains a header"));
    }

    let mut rows = Vec::new();
    for (idx, raw_line) in lines.iter().enumerate().skip(1) {
        let line_no = idx + 1;
        let line = raw_line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let values: Vec<String> = parse_csv_record(line)
            .into_iter()
            .map(|v| v.trim().to_string())
            .collect();
        if values.len() < 3 {
            return Err(anyhow!(
                "line {}: missing data, expected name, email, national id and optional birth date",
                line_no
            ));
        }
        rows.push(RosterRow {
            line: line_no,
            full_name: values[0].clone(),
            email: values[1].clone(),
            national_id: values[2].clone(),
            birth_date: values.get(3).and_then(|v| parse_birth_date(v)),
        });
    }
    Ok(rows)
}

pub fn build_roster_csv(students: &[RosterStudent<'_>]) -> String {
    let mut lines = vec![ROSTER_HEADER.join(",")];
    for s in students {
        let birth = s
            .birth_date
            .map(dates::format_day_first)
            .unwrap_or_default();
        lines.push(
            [s.full_name, s.email, s.national_id, birth.as_str()]
                .iter()
                .map(|cell| csv_quote_always(cell))
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    lines.join("\n")
}

pub fn roster_file_name(group_name: &str, on: NaiveDate) -> String {
    let safe: String = group_name
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '-' } else { c })
        .collect();
    format!("estudiantes_{}_{}.csv", safe, on.format("%Y-%m-%d"))
}
