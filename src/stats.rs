//! Attendance statistics for one group.
//!
//! Everything here is integer arithmetic over already-loaded rows, so the
//! handler can query once and the numbers are reproducible in tests.

use crate::dates;
use chrono::{Datelike, NaiveDate};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct StudentRef {
    pub id: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct Mark {
    pub student_id: String,
    pub date: NaiveDate,
    pub present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub good: i64,
    pub warning: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            good: 80,
            warning: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentStats {
    pub id: String,
    pub full_name: String,
    pub email: String,
    pub total_classes: i64,
    pub present: i64,
    pub absent: i64,
    pub percentage: i64,
    pub band: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyStats {
    pub month: String,
    pub present: i64,
    pub absent: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsenceRank {
    pub name: String,
    pub absences: i64,
    pub percentage: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStats {
    pub students: Vec<StudentStats>,
    pub total_students: usize,
    pub average_percentage: i64,
    pub total_present: i64,
    pub total_absent: i64,
    pub monthly: Vec<MonthlyStats>,
    pub absence_ranking: Vec<AbsenceRank>,
}

pub const RANKING_SIZE: usize = 10;

/// `num / den` as a whole percentage, halves rounded up.
pub fn percent_round(num: i64, den: i64) -> i64 {
    if den <= 0 {
        return 0;
    }
    (num * 200 + den) / (den * 2)
}

fn round_div(num: i64, den: i64) -> i64 {
    if den <= 0 {
        return 0;
    }
    (num * 2 + den) / (den * 2)
}

pub fn band(percentage: i64, t: Thresholds) -> &'static str {
    if percentage >= t.good {
        "good"
    } else if percentage >= t.warning {
        "warning"
    } else {
        "critical"
    }
}

fn first_word(name: &str) -> String {
    name.split_whitespace().next().unwrap_or("").to_string()
}

pub fn compute_group_stats(students: &[StudentRef], marks: &[Mark], t: Thresholds) -> GroupStats {
    let mut per_student: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
    let mut per_month: BTreeMap<(i32, u32), (i64, i64, NaiveDate)> = BTreeMap::new();
    for m in marks {
        let slot = per_student.entry(m.student_id.as_str()).or_insert((0, 0));
        let month = per_month
            .entry((m.date.year(), m.date.month()))
            .or_insert((0, 0, m.date));
        if m.present {
            slot.0 += 1;
            month.0 += 1;
        } else {
            slot.1 += 1;
            month.1 += 1;
        }
    }

    let rows: Vec<StudentStats> = students
        .iter()
        .map(|s| {
            let (present, absent) = per_student.get(s.id.as_str()).copied().unwrap_or((0, 0));
            let total = present + absent;
            let percentage = percent_round(present, total);
            StudentStats {
                id: s.id.clone(),
                full_name: s.full_name.clone(),
                email: s.email.clone(),
                total_classes: total,
                present,
                absent,
                percentage,
                band: band(percentage, t),
            }
        })
        .collect();

    let pct_sum: i64 = rows.iter().map(|r| r.percentage).sum();
    let average_percentage = round_div(pct_sum, rows.len() as i64);
    let total_present = rows.iter().map(|r| r.present).sum();
    let total_absent = rows.iter().map(|r| r.absent).sum();

    let monthly = per_month
        .values()
        .map(|(present, absent, date)| MonthlyStats {
            month: dates::month_label(*date),
            present: *present,
            absent: *absent,
        })
        .collect();

    let mut ranked: Vec<&StudentStats> = rows.iter().filter(|r| r.total_classes > 0).collect();
    // Stable sort keeps roster order among equal absence counts.
    ranked.sort_by(|a, b| b.absent.cmp(&a.absent));
    let absence_ranking = ranked
        .into_iter()
        .take(RANKING_SIZE)
        .map(|r| AbsenceRank {
            name: first_word(&r.full_name),
            absences: r.absent,
            percentage: 100 - r.percentage,
        })
        .collect();

    GroupStats {
        total_students: rows.len(),
        students: rows,
        average_percentage,
        total_present,
        total_absent,
        monthly,
        absence_ranking,
    }
}
