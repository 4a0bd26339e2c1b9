use super::setup::{self, AttendanceSettings};
use crate::ipc::helpers::{
    db_err, now_stamp, optional_str, require_student, required_date, required_month, required_str,
    string_array, with_tenant, HandlerErr, MonthKey,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, format_date};
use crate::summary::{AttendanceStatus, AttendanceTally};
use chrono::{Datelike, NaiveDateTime, Timelike};
use log::info;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};

const NOTE_MAX: usize = 200;

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params("status must be one of: present, absent, late, excused")
            .with_details(json!({ "status": raw }))
    })
}

fn status_code(settings: &AttendanceSettings, status: AttendanceStatus) -> char {
    match status {
        AttendanceStatus::Present => settings.present_code,
        AttendanceStatus::Absent => settings.absent_code,
        AttendanceStatus::Late => settings.late_code,
        AttendanceStatus::Excused => settings.excused_code,
    }
}

/// One character per day of the month; unchecked days stay blank.
fn day_codes(
    days: usize,
    marks: &[(u32, AttendanceStatus)],
    settings: &AttendanceSettings,
) -> String {
    let mut chars: Vec<char> = std::iter::repeat(' ').take(days).collect();
    for (day, status) in marks {
        let idx = (*day as usize).saturating_sub(1);
        if idx < chars.len() {
            chars[idx] = status_code(settings, *status);
        }
    }
    chars.into_iter().collect()
}

/// Late when arriving more than the threshold after the lesson start.
fn classify_arrival(arrival: u32, lesson_start: Option<u32>, threshold: u32) -> (AttendanceStatus, u32) {
    match lesson_start {
        Some(start) if arrival > start + threshold => (AttendanceStatus::Late, arrival - start),
        _ => (AttendanceStatus::Present, 0),
    }
}

fn upsert_mark(
    conn: &Connection,
    academy_id: &str,
    student_id: &str,
    date: &str,
    status: AttendanceStatus,
    note: Option<&str>,
    checked_at: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO attendance(academy_id, student_id, date, status, note, checked_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date) DO UPDATE SET
           status = excluded.status,
           note = COALESCE(excluded.note, attendance.note),
           checked_at = excluded.checked_at",
        (academy_id, student_id, date, status.as_str(), note, checked_at),
    )
    .map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string()).with_details(json!({ "table": "attendance" }))
    })?;
    Ok(())
}

#[derive(Default)]
struct DayEntry {
    name: String,
    first_lesson: Option<String>,
    teachers: Vec<String>,
    status: Option<AttendanceStatus>,
    note: Option<String>,
    checked_at: Option<String>,
}

fn attendance_day_open(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = format_date(required_date(params, "date")?);

    let mut stmt = conn
        .prepare(
            "SELECT b.student_id, s.name, b.start_time, t.name
             FROM schedule_blocks b
             JOIN students s ON s.id = b.student_id
             JOIN teachers t ON t.id = b.teacher_id
             WHERE b.academy_id = ? AND b.date = ?
             ORDER BY b.start_time, s.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let lessons = stmt
        .query_map((academy_id, &date), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut order: Vec<String> = Vec::new();
    let mut entries: HashMap<String, DayEntry> = HashMap::new();
    for (sid, name, start, teacher) in lessons {
        let e = entries.entry(sid.clone()).or_insert_with(|| {
            order.push(sid);
            DayEntry {
                name,
                first_lesson: Some(start),
                ..DayEntry::default()
            }
        });
        if !e.teachers.contains(&teacher) {
            e.teachers.push(teacher);
        }
    }

    let mut stmt = conn
        .prepare(
            "SELECT a.student_id, s.name, a.status, a.note, a.checked_at
             FROM attendance a
             JOIN students s ON s.id = a.student_id
             WHERE a.academy_id = ? AND a.date = ?
             ORDER BY s.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let marks = stmt
        .query_map((academy_id, &date), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut tally = AttendanceTally::default();
    for (sid, name, status, note, checked_at) in marks {
        let e = entries.entry(sid.clone()).or_insert_with(|| {
            order.push(sid);
            DayEntry {
                name,
                ..DayEntry::default()
            }
        });
        e.status = AttendanceStatus::parse(&status);
        if let Some(s) = e.status {
            tally.add(s);
        }
        e.note = note;
        e.checked_at = checked_at;
    }

    let students: Vec<serde_json::Value> = order
        .iter()
        .filter_map(|sid| entries.get(sid).map(|e| (sid, e)))
        .map(|(sid, e)| {
            json!({
                "studentId": sid,
                "name": e.name,
                "scheduled": e.first_lesson.is_some(),
                "firstLessonAt": e.first_lesson,
                "teacherNames": e.teachers,
                "status": e.status.map(|s| s.as_str()),
                "note": e.note,
                "checkedAt": e.checked_at
            })
        })
        .collect();
    let unchecked = students.len().saturating_sub(tally.checked());
    Ok(json!({
        "date": date,
        "students": students,
        "tally": tally,
        "unchecked": unchecked
    }))
}

fn attendance_set(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let date = format_date(required_date(params, "date")?);
    require_student(conn, academy_id, &student_id)?;

    let status = match params.get("status") {
        None => return Err(HandlerErr::bad_params("missing status (use null to clear)")),
        Some(serde_json::Value::Null) => None,
        Some(v) => {
            let raw = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params("status must be string or null"))?;
            Some(parse_status(raw)?)
        }
    };
    let note = optional_str(params, "note")?;
    if note.as_deref().map(|n| n.chars().count() > NOTE_MAX).unwrap_or(false) {
        return Err(HandlerErr::bad_params(format!("note length must be <= {}", NOTE_MAX)));
    }

    match status {
        Some(s) => upsert_mark(conn, academy_id, &student_id, &date, s, note.as_deref(), &now_stamp())?,
        None => {
            conn.execute(
                "DELETE FROM attendance WHERE academy_id = ? AND student_id = ? AND date = ?",
                (academy_id, &student_id, &date),
            )
            .map_err(db_err("db_delete_failed"))?;
        }
    }
    Ok(json!({ "ok": true, "status": status.map(|s| s.as_str()) }))
}

fn attendance_bulk_set(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = format_date(required_date(params, "date")?);
    let status = parse_status(&required_str(params, "status")?)?;
    let student_ids = string_array(params, "studentIds")?;

    let mut stmt = conn
        .prepare("SELECT id FROM students WHERE academy_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let known: HashSet<String> = stmt
        .query_map([academy_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let now = now_stamp();
    let mut updated = 0usize;
    let mut skipped = 0usize;
    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for id in &student_ids {
        if !known.contains(id) {
            skipped += 1;
            continue;
        }
        upsert_mark(&tx, academy_id, id, &date, status, None, &now)?;
        updated += 1;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "updated": updated, "skipped": skipped }))
}

fn attendance_check_in(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let at_raw = required_str(params, "at")?;
    let at = NaiveDateTime::parse_from_str(&at_raw, "%Y-%m-%dT%H:%M")
        .ok()
        .filter(|at| at_raw.len() == 16 && schedule::in_calendar(at.date()))
        .ok_or_else(|| HandlerErr::bad_params("at must be YYYY-MM-DDTHH:MM"))?;
    require_student(conn, academy_id, &student_id)?;

    let date = format_date(at.date());
    let lesson: Option<(String, String)> = conn
        .query_row(
            "SELECT id, start_time FROM schedule_blocks
             WHERE academy_id = ? AND student_id = ? AND date = ?
             ORDER BY start_time
             LIMIT 1",
            (academy_id, &student_id, &date),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let lesson_start = match lesson.as_ref() {
        Some((_, start)) => Some(schedule::parse_time(start).map_err(|e| HandlerErr::new("db_query_failed", e))?),
        None => None,
    };

    let settings = setup::attendance_settings(conn, academy_id);
    let arrival = at.hour() * 60 + at.minute();
    let (status, minutes_late) =
        classify_arrival(arrival, lesson_start, settings.late_threshold_minutes);
    upsert_mark(conn, academy_id, &student_id, &date, status, None, &at_raw)?;
    info!(
        "event=attendance_check_in module=attendance status=ok student_id={} result={}",
        student_id,
        status.as_str()
    );
    Ok(json!({
        "status": status.as_str(),
        "date": date,
        "blockId": lesson.map(|(id, _)| id),
        "minutesLate": minutes_late
    }))
}

fn attendance_month_open(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let month: MonthKey = required_month(params, "month")?;
    let settings = setup::attendance_settings(conn, academy_id);
    let first = format_date(month.first);
    let last = format_date(month.last);

    let mut stmt = conn
        .prepare(
            "SELECT student_id, date, status FROM attendance
             WHERE academy_id = ? AND date >= ? AND date <= ?",
        )
        .map_err(db_err("db_query_failed"))?;
    let marks = stmt
        .query_map((academy_id, &first, &last), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut by_student: HashMap<String, Vec<(u32, AttendanceStatus)>> = HashMap::new();
    for (sid, date, status) in marks {
        let (Ok(d), Some(s)) = (schedule::parse_date(&date), AttendanceStatus::parse(&status)) else {
            continue;
        };
        by_student.entry(sid).or_default().push((d.day(), s));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name FROM students
             WHERE academy_id = ? AND active = 1
             ORDER BY sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let students = stmt
        .query_map([academy_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let days = month.days();
    let rows: Vec<serde_json::Value> = students
        .into_iter()
        .map(|(id, name)| {
            let marks = by_student.remove(&id).unwrap_or_default();
            let mut tally = AttendanceTally::default();
            for (_, s) in &marks {
                tally.add(*s);
            }
            json!({
                "studentId": id,
                "name": name,
                "dayCodes": day_codes(days, &marks, &settings),
                "tally": tally
            })
        })
        .collect();

    Ok(json!({
        "month": month.key,
        "daysInMonth": days,
        "codes": {
            "present": settings.present_code.to_string(),
            "absent": settings.absent_code.to_string(),
            "late": settings.late_code.to_string(),
            "excused": settings.excused_code.to_string()
        },
        "rows": rows
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.dayOpen" => Some(with_tenant(state, req, attendance_day_open)),
        "attendance.set" => Some(with_tenant(state, req, attendance_set)),
        "attendance.bulkSet" => Some(with_tenant(state, req, attendance_bulk_set)),
        "attendance.checkIn" => Some(with_tenant(state, req, attendance_check_in)),
        "attendance.monthOpen" => Some(with_tenant(state, req, attendance_month_open)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_settings() -> AttendanceSettings {
        AttendanceSettings {
            late_threshold_minutes: 10,
            present_code: 'P',
            absent_code: 'A',
            late_code: 'L',
            excused_code: 'E',
            count_late_as_present: true,
        }
    }

    #[test]
    fn day_codes_leave_unchecked_days_blank() {
        let marks = vec![
            (1, AttendanceStatus::Present),
            (3, AttendanceStatus::Late),
            (30, AttendanceStatus::Absent),
            (31, AttendanceStatus::Excused),
        ];
        let codes = day_codes(30, &marks, &default_settings());
        assert_eq!(codes.chars().count(), 30);
        assert!(codes.starts_with("P L"));
        assert!(codes.ends_with('A'));
    }

    #[test]
    fn day_codes_use_configured_letters() {
        let mut settings = default_settings();
        settings.late_code = 'T';
        let codes = day_codes(3, &[(2, AttendanceStatus::Late)], &settings);
        assert_eq!(codes, " T ");
    }

    #[test]
    fn arrival_within_threshold_is_present() {
        let start = 16 * 60;
        assert_eq!(classify_arrival(start + 10, Some(start), 10), (AttendanceStatus::Present, 0));
        assert_eq!(classify_arrival(start + 11, Some(start), 10), (AttendanceStatus::Late, 11));
        assert_eq!(classify_arrival(start - 30, Some(start), 0), (AttendanceStatus::Present, 0));
        assert_eq!(classify_arrival(23 * 60, None, 0), (AttendanceStatus::Present, 0));
    }
}
