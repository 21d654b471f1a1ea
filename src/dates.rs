use chrono::{Datelike, Local, NaiveDate, SecondsFormat, Utc};

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

pub fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Parses a "YYYY-MM" month key into its first day.
pub fn parse_month_key(raw: &str) -> Option<NaiveDate> {
    let (y, m) = raw.trim().split_once('-')?;
    let year = y.parse::<i32>().ok()?;
    let month = m.parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Accepts `D/M/YYYY` (day first) and returns the ISO form, or `None` when the
/// text is not a real calendar date.
pub fn parse_day_first(raw: &str) -> Option<NaiveDate> {
    let mut parts = raw.trim().split('/');
    let d = parts.next()?.trim();
    let m = parts.next()?.trim();
    let y = parts.next()?.trim();
    if parts.next().is_some() {
        return None;
    }
    if d.is_empty() || d.len() > 2 || m.is_empty() || m.len() > 2 || y.len() != 4 {
        return None;
    }
    if !(d.chars().all(|c| c.is_ascii_digit())
        && m.chars().all(|c| c.is_ascii_digit())
        && y.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }
    NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
}

/// Short day-first rendering used in exported sheets ("5/3/2024").
pub fn format_day_first(date: NaiveDate) -> String {
    format!("{}/{}/{}", date.day(), date.month(), date.year())
}

pub fn month_label(date: NaiveDate) -> String {
    format!("{:02}/{}", date.month(), date.year())
}

/// The birthday as observed in `year`; 29 February rolls to 1 March in common years.
fn birthday_in_year(birth: NaiveDate, year: i32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, birth.month(), birth.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, 3, 1))
        .unwrap_or(birth)
}

pub fn is_birthday_on(birth: NaiveDate, on: NaiveDate) -> bool {
    birthday_in_year(birth, on.year()) == on
}

/// Days from `from` to the next birthday; 0 when it falls on `from`.
pub fn days_until_birthday(birth: NaiveDate, from: NaiveDate) -> i64 {
    let this_year = birthday_in_year(birth, from.year());
    let next = if this_year < from {
        birthday_in_year(birth, from.year() + 1)
    } else {
        this_year
    };
    (next - from).num_days()
}

/// Age reached on the next birthday counted from `from`.
pub fn turning_age(birth: NaiveDate, from: NaiveDate) -> i32 {
    let this_year = birthday_in_year(birth, from.year());
    let year = if this_year < from {
        from.year() + 1
    } else {
        from.year()
    };
    year - birth.year()
}
