use crate::db;
use crate::ipc::helpers::{required_str, with_tenant, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, WeekStart};
use log::warn;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Academy,
    Attendance,
    Timetable,
    Feed,
    Reports,
}

impl SetupSection {
    const ALL: [SetupSection; 5] = [
        Self::Academy,
        Self::Attendance,
        Self::Timetable,
        Self::Feed,
        Self::Reports,
    ];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "academy" => Some(Self::Academy),
            "attendance" => Some(Self::Attendance),
            "timetable" => Some(Self::Timetable),
            "feed" => Some(Self::Feed),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Academy => "academy",
            Self::Attendance => "attendance",
            Self::Timetable => "timetable",
            Self::Feed => "feed",
            Self::Reports => "reports",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Academy => "setup.academy",
            Self::Attendance => "setup.attendance",
            Self::Timetable => "setup.timetable",
            Self::Feed => "setup.feed",
            Self::Reports => "setup.reports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Academy => json!({
            "displayName": "",
            "phone": "",
            "address": ""
        }),
        SetupSection::Attendance => json!({
            "lateThresholdMinutes": 10,
            "presentCode": "P",
            "absentCode": "A",
            "lateCode": "L",
            "excusedCode": "E",
            "countLateAsPresent": true
        }),
        SetupSection::Timetable => json!({
            "weekStartsOn": "monday",
            "dayStartTime": "14:00",
            "dayEndTime": "22:00",
            "defaultLessonMinutes": 50
        }),
        SetupSection::Feed => json!({
            "memoMaxChars": 500,
            "requireMemo": false
        }),
        SetupSection::Reports => json!({
            "includeMemos": true,
            "rateDecimals": 1
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
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

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

/// Attendance codes are a single visible character.
fn parse_code(v: &Value, key: &str) -> Result<String, String> {
    let s = parse_string_max(v, key, 1)?.to_ascii_uppercase();
    if s.is_empty() {
        return Err(format!("{} must be a single character", key));
    }
    Ok(s)
}

fn parse_clock(v: &Value, key: &str) -> Result<String, String> {
    let s = parse_string_max(v, key, 5)?;
    let minutes = schedule::parse_time(&s).map_err(|e| format!("{}: {}", key, e))?;
    Ok(schedule::format_time(minutes))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Academy => match k.as_str() {
                "displayName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "phone" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 32)?));
                }
                "address" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                _ => return Err(format!("unknown academy field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "lateThresholdMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 120)?));
                }
                "presentCode" | "absentCode" | "lateCode" | "excusedCode" => {
                    obj.insert(k.clone(), Value::String(parse_code(v, k)?));
                }
                "countLateAsPresent" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Timetable => match k.as_str() {
                "weekStartsOn" => {
                    let s = parse_string_max(v, k, 8)?.to_ascii_lowercase();
                    let Some(ws) = WeekStart::parse(&s) else {
                        return Err("weekStartsOn must be one of: monday, sunday".into());
                    };
                    obj.insert(k.clone(), Value::String(ws.as_str().to_string()));
                }
                "dayStartTime" | "dayEndTime" => {
                    obj.insert(k.clone(), Value::String(parse_clock(v, k)?));
                }
                "defaultLessonMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 10, 300)?));
                }
                _ => return Err(format!("unknown timetable field: {}", k)),
            },
            SetupSection::Feed => match k.as_str() {
                "memoMaxChars" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 2000)?));
                }
                "requireMemo" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown feed field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "includeMemos" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "rateDecimals" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 3)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    if let SetupSection::Timetable = section {
        let start = obj.get("dayStartTime").and_then(|v| v.as_str()).unwrap_or("");
        let end = obj.get("dayEndTime").and_then(|v| v.as_str()).unwrap_or("");
        if start >= end {
            return Err("dayStartTime must be before dayEndTime".into());
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, academy_id: &str, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, academy_id, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            let mut whole = current.clone();
            if merge_section_patch(section, &mut whole, saved_obj).is_ok() {
                return Ok(whole);
            }
            // Field by field so one bad stored value keeps the rest.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                let mut candidate = current.clone();
                if merge_section_patch(section, &mut candidate, &one).is_ok() {
                    current = candidate;
                }
            }
        }
    }
    Ok(current)
}

/// Section as stored, falling back to defaults when the read fails.
fn section_or_default(conn: &Connection, academy_id: &str, section: SetupSection) -> Value {
    match load_section(conn, academy_id, section) {
        Ok(v) => v,
        Err(e) => {
            warn!(
                "event=setup_load module=setup status=fallback section={} error={}",
                section.name(),
                e
            );
            default_section(section)
        }
    }
}

fn get_i64(v: &Value, key: &str, default: i64) -> i64 {
    v.get(key).and_then(|x| x.as_i64()).unwrap_or(default)
}

fn get_bool(v: &Value, key: &str, default: bool) -> bool {
    v.get(key).and_then(|x| x.as_bool()).unwrap_or(default)
}

fn get_char(v: &Value, key: &str, default: char) -> char {
    v.get(key)
        .and_then(|x| x.as_str())
        .and_then(|s| s.chars().next())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct AttendanceSettings {
    pub late_threshold_minutes: u32,
    pub present_code: char,
    pub absent_code: char,
    pub late_code: char,
    pub excused_code: char,
    pub count_late_as_present: bool,
}

#[derive(Debug, Clone)]
pub struct TimetableSettings {
    pub week_starts_on: WeekStart,
    pub default_lesson_minutes: u32,
    /// Opening hours in minutes after midnight; lessons must fit inside.
    pub day_start: u32,
    pub day_end: u32,
}

impl TimetableSettings {
    pub fn within_day(&self, start: u32, end: u32) -> bool {
        start >= self.day_start && end <= self.day_end
    }
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub memo_max_chars: usize,
    pub require_memo: bool,
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub include_memos: bool,
    pub rate_decimals: u32,
}

pub fn attendance_settings(conn: &Connection, academy_id: &str) -> AttendanceSettings {
    let v = section_or_default(conn, academy_id, SetupSection::Attendance);
    AttendanceSettings {
        late_threshold_minutes: get_i64(&v, "lateThresholdMinutes", 10).clamp(0, 120) as u32,
        present_code: get_char(&v, "presentCode", 'P'),
        absent_code: get_char(&v, "absentCode", 'A'),
        late_code: get_char(&v, "lateCode", 'L'),
        excused_code: get_char(&v, "excusedCode", 'E'),
        count_late_as_present: get_bool(&v, "countLateAsPresent", true),
    }
}

pub fn timetable_settings(conn: &Connection, academy_id: &str) -> TimetableSettings {
    let v = section_or_default(conn, academy_id, SetupSection::Timetable);
    let clock = |key: &str| {
        v.get(key)
            .and_then(|x| x.as_str())
            .and_then(|x| schedule::parse_time(x).ok())
    };
    let (day_start, day_end) = match (clock("dayStartTime"), clock("dayEndTime")) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => (14 * 60, 22 * 60),
    };
    TimetableSettings {
        week_starts_on: v
            .get("weekStartsOn")
            .and_then(|x| x.as_str())
            .and_then(WeekStart::parse)
            .unwrap_or(WeekStart::Monday),
        default_lesson_minutes: get_i64(&v, "defaultLessonMinutes", 50).clamp(10, 300) as u32,
        day_start,
        day_end,
    }
}

pub fn feed_settings(conn: &Connection, academy_id: &str) -> FeedSettings {
    let v = section_or_default(conn, academy_id, SetupSection::Feed);
    FeedSettings {
        memo_max_chars: get_i64(&v, "memoMaxChars", 500).clamp(0, 2000) as usize,
        require_memo: get_bool(&v, "requireMemo", false),
    }
}

pub fn report_settings(conn: &Connection, academy_id: &str) -> ReportSettings {
    let v = section_or_default(conn, academy_id, SetupSection::Reports);
    ReportSettings {
        include_memos: get_bool(&v, "includeMemos", true),
        rate_decimals: get_i64(&v, "rateDecimals", 1).clamp(0, 3) as u32,
    }
}

fn setup_get(
    conn: &Connection,
    academy_id: &str,
    _params: &Value,
) -> Result<Value, HandlerErr> {
    let mut out = Map::new();
    for section in SetupSection::ALL {
        let value = load_section(conn, academy_id, section)
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        out.insert(section.name().to_string(), value);
    }
    Ok(Value::Object(out))
}

fn setup_update(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let section_raw = required_str(params, "section")?;
    let Some(section) = SetupSection::parse(&section_raw) else {
        return Err(HandlerErr::bad_params("unknown section")
            .with_details(json!({ "section": section_raw })));
    };
    let Some(patch_obj) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = load_section(conn, academy_id, section)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    merge_section_patch(section, &mut current, patch_obj).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(conn, academy_id, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "section": section.name(), "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(with_tenant(state, req, setup_get)),
        "setup.update" => Some(with_tenant(state, req, setup_update)),
        _ => None,
    }
}
