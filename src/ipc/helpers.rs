use crate::admin::{AdminClient, AdminDenied};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension, Params};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

/// `map_err` adapter for rusqlite failures.
pub fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string())
}

pub fn with_db<F>(state: &mut AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, &Value) -> Result<Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => crate::ipc::error::ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

/// Runs `f` with the connection and the active academy id.
pub fn with_tenant<F>(state: &mut AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, &str, &Value) -> Result<Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(academy_id) = state.academy_id.as_deref() else {
        return err(&req.id, "no_academy", "select an academy first", None);
    };
    match f(conn, academy_id, &req.params) {
        Ok(result) => crate::ipc::error::ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

/// Gate for privileged methods: needs a configured service key and a
/// matching `serviceKey` param.
pub fn require_admin(state: &AppState, params: &Value) -> Result<(), HandlerErr> {
    let admin = AdminClient::from_config(&state.config)
        .map_err(|e| HandlerErr::new("config_missing_service_key", e.to_string()))?;
    admin
        .authorize(params.get("serviceKey").and_then(|v| v.as_str()))
        .map_err(|denied| match denied {
            AdminDenied::MissingKey => HandlerErr::new("forbidden", "missing serviceKey"),
            AdminDenied::WrongKey => HandlerErr::new("forbidden", "serviceKey rejected"),
        })
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

/// Missing, null, and blank all read as `None`.
pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(HandlerErr::bad_params(format!(
            "{} must be string or null",
            key
        ))),
    }
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn required_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = required_str(params, key)?;
    schedule::parse_date(&raw).map_err(HandlerErr::bad_params)
}

pub fn optional_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match optional_str(params, key)? {
        Some(raw) => schedule::parse_date(&raw)
            .map(Some)
            .map_err(HandlerErr::bad_params),
        None => Ok(None),
    }
}

pub fn optional_time(params: &Value, key: &str) -> Result<Option<u32>, HandlerErr> {
    match optional_str(params, key)? {
        Some(raw) => schedule::parse_time(&raw)
            .map(Some)
            .map_err(HandlerErr::bad_params),
        None => Ok(None),
    }
}

/// Every item must be a string; the first that is not is reported by index.
pub fn string_array(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(items) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    items
        .iter()
        .enumerate()
        .map(|(index, v)| {
            v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                HandlerErr::bad_params(format!("{} must contain only strings", key))
                    .with_details(json!({ "key": key, "index": index }))
            })
        })
        .collect()
}

/// A calendar month given as `YYYY-MM`.
#[derive(Debug, Clone)]
pub struct MonthKey {
    pub key: String,
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl MonthKey {
    pub fn days(&self) -> usize {
        self.last.day() as usize
    }

    pub fn from_date(d: NaiveDate) -> Self {
        // Day 1 of a valid date's month always exists.
        let first = d.with_day(1).unwrap_or(d);
        Self::from_first(first)
    }

    fn from_first(first: NaiveDate) -> Self {
        let next = if first.month() == 12 {
            NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
        };
        let last = next.and_then(|n| n.pred_opt()).unwrap_or(first);
        Self {
            key: first.format("%Y-%m").to_string(),
            first,
            last,
        }
    }
}

pub fn parse_month_key(month: &str) -> Result<MonthKey, HandlerErr> {
    let t = month.trim();
    let Some((y, m)) = t.split_once('-') else {
        return Err(HandlerErr::bad_params("month must be YYYY-MM"));
    };
    if y.len() != 4 || !y.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HandlerErr::bad_params("month must be YYYY-MM"));
    }
    let year = y
        .parse::<i32>()
        .map_err(|_| HandlerErr::bad_params("month year must be numeric"))?;
    if year < 1 {
        return Err(HandlerErr::bad_params("month year must be between 0001 and 9999"));
    }
    let month_num = m
        .parse::<u32>()
        .map_err(|_| HandlerErr::bad_params("month must be YYYY-MM"))?;
    if !(1..=12).contains(&month_num) {
        return Err(HandlerErr::bad_params("month must be between 01 and 12"));
    }
    let first = NaiveDate::from_ymd_opt(year, month_num, 1)
        .ok_or_else(|| HandlerErr::bad_params("month out of range"))?;
    Ok(MonthKey::from_first(first))
}

pub fn required_month(params: &Value, key: &str) -> Result<MonthKey, HandlerErr> {
    let raw = required_str(params, key)?;
    parse_month_key(&raw)
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn row_exists<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<bool, HandlerErr> {
    conn.query_row(sql, params, |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(db_err("db_query_failed"))
}

pub fn require_student(conn: &Connection, academy_id: &str, student_id: &str) -> Result<(), HandlerErr> {
    if row_exists(
        conn,
        "SELECT 1 FROM students WHERE academy_id = ? AND id = ?",
        (academy_id, student_id),
    )? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("student not found"))
    }
}

pub fn require_teacher(conn: &Connection, academy_id: &str, teacher_id: &str) -> Result<(), HandlerErr> {
    if row_exists(
        conn,
        "SELECT 1 FROM teachers WHERE academy_id = ? AND id = ?",
        (academy_id, teacher_id),
    )? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("teacher not found"))
    }
}

/// Applies a patch of nullable text columns; returns the number of fields set.
pub fn apply_text_patch(
    conn: &Connection,
    table: &str,
    id: &str,
    patch: &serde_json::Map<String, Value>,
    fields: &[(&str, &str, usize)],
) -> Result<usize, HandlerErr> {
    let mut applied = 0;
    for (json_key, column, max_len) in fields {
        let Some(v) = patch.get(*json_key) else {
            continue;
        };
        let value: Option<String> = match v {
            Value::Null => None,
            Value::String(s) => {
                let t = s.trim();
                if t.chars().count() > *max_len {
                    return Err(HandlerErr::bad_params(format!(
                        "{} length must be <= {}",
                        json_key, max_len
                    )));
                }
                if t.is_empty() {
                    None
                } else {
                    Some(t.to_string())
                }
            }
            _ => {
                return Err(HandlerErr::bad_params(format!(
                    "{} must be string or null",
                    json_key
                )))
            }
        };
        let sql = format!("UPDATE {} SET {} = ? WHERE id = ?", table, column);
        conn.execute(&sql, (&value, id))
            .map_err(db_err("db_update_failed"))?;
        applied += 1;
    }
    Ok(applied)
}
