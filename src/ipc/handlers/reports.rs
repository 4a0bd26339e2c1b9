use super::setup;
use crate::ipc::helpers::{
    db_err, new_id, now_stamp, optional_str, require_student, required_date, required_month,
    required_str, with_tenant, HandlerErr, MonthKey,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::format_date;
use crate::summary::{AttendanceStatus, AttendanceTally, CategoryScores, FeedCategory};
use log::info;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const COMMENT_MAX: usize = 2000;

/// Inputs shared by every per-student summary of one month.
struct MonthScope<'a> {
    academy_id: &'a str,
    first: String,
    last: String,
    count_late_as_present: bool,
    rate_decimals: u32,
    include_memos: bool,
}

impl<'a> MonthScope<'a> {
    fn new(conn: &Connection, academy_id: &'a str, month: &MonthKey) -> Self {
        let attendance = setup::attendance_settings(conn, academy_id);
        let reports = setup::report_settings(conn, academy_id);
        Self {
            academy_id,
            first: format_date(month.first),
            last: format_date(month.last),
            count_late_as_present: attendance.count_late_as_present,
            rate_decimals: reports.rate_decimals,
            include_memos: reports.include_memos,
        }
    }
}

fn attendance_tally(conn: &Connection, scope: &MonthScope, student_id: &str) -> Result<AttendanceTally, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT status FROM attendance
             WHERE academy_id = ? AND student_id = ? AND date >= ? AND date <= ?",
        )
        .map_err(db_err("db_query_failed"))?;
    let statuses = stmt
        .query_map((scope.academy_id, student_id, &scope.first, &scope.last), |r| {
            r.get::<_, String>(0)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut tally = AttendanceTally::default();
    for s in statuses.iter().filter_map(|s| AttendanceStatus::parse(s)) {
        tally.add(s);
    }
    Ok(tally)
}

fn category_scores(conn: &Connection, scope: &MonthScope, student_id: &str) -> Result<CategoryScores, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT os.category, o.score
             FROM feed_values fv
             JOIN feeds f ON f.id = fv.feed_id
             JOIN option_sets os ON os.id = fv.option_set_id
             JOIN options o ON o.id = fv.option_id
             WHERE f.academy_id = ? AND f.student_id = ? AND f.date >= ? AND f.date <= ?
               AND os.is_scored = 1 AND o.score IS NOT NULL",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((scope.academy_id, student_id, &scope.first, &scope.last), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut scores = CategoryScores::default();
    for (category, score) in rows {
        if let Some(c) = FeedCategory::parse(&category) {
            scores.add(c, score);
        }
    }
    Ok(scores)
}

fn memos(conn: &Connection, scope: &MonthScope, student_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT f.date, t.name, f.memo
             FROM feeds f
             JOIN teachers t ON t.id = f.teacher_id
             WHERE f.academy_id = ? AND f.student_id = ? AND f.date >= ? AND f.date <= ?
               AND f.memo IS NOT NULL
             ORDER BY f.date, t.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((scope.academy_id, student_id, &scope.first, &scope.last), |r| {
            Ok(json!({
                "date": r.get::<_, String>(0)?,
                "teacherName": r.get::<_, String>(1)?,
                "memo": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

fn student_summary(
    conn: &Connection,
    scope: &MonthScope,
    student_id: &str,
    name: &str,
) -> Result<Value, HandlerErr> {
    let tally = attendance_tally(conn, scope, student_id)?;
    let (lesson_count, scheduled_days): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COUNT(DISTINCT date) FROM schedule_blocks
             WHERE academy_id = ? AND student_id = ? AND date >= ? AND date <= ?",
            (scope.academy_id, student_id, &scope.first, &scope.last),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(db_err("db_query_failed"))?;
    let feed_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM feeds
             WHERE academy_id = ? AND student_id = ? AND date >= ? AND date <= ?",
            (scope.academy_id, student_id, &scope.first, &scope.last),
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    let scores = category_scores(conn, scope, student_id)?;

    let mut out = json!({
        "studentId": student_id,
        "name": name,
        "attendance": tally,
        "attendanceRate": tally.rate(scope.count_late_as_present, scope.rate_decimals),
        "lessonCount": lesson_count,
        "scheduledDays": scheduled_days,
        "feedCount": feed_count,
        "categoryAverages": scores.averages(scope.rate_decimals),
    });
    if scope.include_memos {
        out["memos"] = Value::Array(memos(conn, scope, student_id)?);
    }
    Ok(out)
}

fn reports_monthly(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let month = required_month(params, "month")?;
    let student_id = optional_str(params, "studentId")?;
    if let Some(sid) = student_id.as_deref() {
        require_student(conn, academy_id, sid)?;
    }
    let scope = MonthScope::new(conn, academy_id, &month);

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, r.id, r.status
             FROM students s
             LEFT JOIN monthly_reports r ON r.student_id = s.id AND r.month = ?
             WHERE s.academy_id = ?
               AND ((? IS NULL AND s.active = 1) OR s.id = ?)
             ORDER BY s.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let students = stmt
        .query_map((&month.key, academy_id, &student_id, &student_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut rows = Vec::with_capacity(students.len());
    for (id, name, report_id, report_status) in students {
        let mut summary = student_summary(conn, &scope, &id, &name)?;
        summary["reportId"] = json!(report_id);
        summary["reportStatus"] = json!(report_status);
        rows.push(summary);
    }
    Ok(json!({
        "month": month.key,
        "daysInMonth": month.days(),
        "students": rows
    }))
}

fn count(conn: &Connection, sql: &str, academy_id: &str, date: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, (academy_id, date), |r| r.get(0))
        .map_err(db_err("db_query_failed"))
}

fn reports_dashboard(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let date = required_date(params, "date")?;
    let day = format_date(date);

    let (active_students, active_teachers): (i64, i64) = conn
        .query_row(
            "SELECT
               (SELECT COUNT(*) FROM students WHERE academy_id = ?1 AND active = 1),
               (SELECT COUNT(*) FROM teachers WHERE academy_id = ?1 AND active = 1)",
            [academy_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(db_err("db_query_failed"))?;
    let lessons = count(
        conn,
        "SELECT COUNT(*) FROM schedule_blocks WHERE academy_id = ? AND date = ?",
        academy_id,
        &day,
    )?;
    let scheduled_students = count(
        conn,
        "SELECT COUNT(DISTINCT student_id) FROM schedule_blocks
         WHERE academy_id = ? AND date = ? AND student_id IS NOT NULL",
        academy_id,
        &day,
    )?;
    let unchecked = count(
        conn,
        "SELECT COUNT(DISTINCT b.student_id) FROM schedule_blocks b
         WHERE b.academy_id = ? AND b.date = ? AND b.student_id IS NOT NULL
           AND NOT EXISTS (
             SELECT 1 FROM attendance a WHERE a.student_id = b.student_id AND a.date = b.date
           )",
        academy_id,
        &day,
    )?;
    let feeds = count(
        conn,
        "SELECT COUNT(*) FROM feeds WHERE academy_id = ? AND date = ?",
        academy_id,
        &day,
    )?;
    let pending_feeds = count(
        conn,
        "SELECT COUNT(*) FROM (
           SELECT DISTINCT b.student_id, b.teacher_id FROM schedule_blocks b
           WHERE b.academy_id = ? AND b.date = ? AND b.student_id IS NOT NULL
             AND NOT EXISTS (
               SELECT 1 FROM feeds f
               WHERE f.student_id = b.student_id AND f.teacher_id = b.teacher_id AND f.date = b.date
             )
         )",
        academy_id,
        &day,
    )?;

    let mut stmt = conn
        .prepare("SELECT status FROM attendance WHERE academy_id = ? AND date = ?")
        .map_err(db_err("db_query_failed"))?;
    let statuses = stmt
        .query_map((academy_id, &day), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut today = AttendanceTally::default();
    for s in statuses.iter().filter_map(|s| AttendanceStatus::parse(s)) {
        today.add(s);
    }

    let month = MonthKey::from_date(date);
    let scope = MonthScope::new(conn, academy_id, &month);
    let mut stmt = conn
        .prepare(
            "SELECT status FROM attendance
             WHERE academy_id = ? AND date >= ? AND date <= ?",
        )
        .map_err(db_err("db_query_failed"))?;
    let month_statuses = stmt
        .query_map((academy_id, &scope.first, &scope.last), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut month_tally = AttendanceTally::default();
    for s in month_statuses.iter().filter_map(|s| AttendanceStatus::parse(s)) {
        month_tally.add(s);
    }

    Ok(json!({
        "date": day,
        "activeStudents": active_students,
        "activeTeachers": active_teachers,
        "lessonsToday": lessons,
        "scheduledStudentsToday": scheduled_students,
        "attendanceToday": today,
        "uncheckedToday": unchecked,
        "feedsToday": feeds,
        "pendingFeedsToday": pending_feeds,
        "month": month.key,
        "monthAttendanceRate": month_tally.rate(scope.count_late_as_present, scope.rate_decimals)
    }))
}

fn reports_save(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let month = required_month(params, "month")?;
    let student_id = required_str(params, "studentId")?;
    let name: String = conn
        .query_row(
            "SELECT name FROM students WHERE academy_id = ? AND id = ?",
            (academy_id, &student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    let comment = match params.get("comment") {
        None => None,
        Some(Value::Null) => Some(String::new()),
        Some(Value::String(s)) => {
            let t = s.trim();
            if t.chars().count() > COMMENT_MAX {
                return Err(HandlerErr::bad_params(format!(
                    "comment length must be <= {}",
                    COMMENT_MAX
                )));
            }
            Some(t.to_string())
        }
        Some(_) => return Err(HandlerErr::bad_params("comment must be string or null")),
    };

    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT id, status FROM monthly_reports
             WHERE academy_id = ? AND student_id = ? AND month = ?",
            (academy_id, &student_id, &month.key),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some((id, status)) = existing.as_ref() {
        if status == "final" {
            return Err(HandlerErr::new("conflict", "report is final")
                .with_details(json!({ "reportId": id })));
        }
    }

    let scope = MonthScope::new(conn, academy_id, &month);
    let summary = student_summary(conn, &scope, &student_id, &name)?;
    let summary_json = serde_json::to_string(&summary)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    let now = now_stamp();

    let report_id = match existing {
        Some((id, _)) => {
            conn.execute(
                "UPDATE monthly_reports
                 SET summary_json = ?, comment = COALESCE(?, comment), updated_at = ?
                 WHERE id = ?",
                (&summary_json, &comment, &now, &id),
            )
            .map_err(db_err("db_update_failed"))?;
            id
        }
        None => {
            let id = new_id();
            conn.execute(
                "INSERT INTO monthly_reports(
                   id, academy_id, student_id, month, summary_json, comment, status, created_at, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, 'draft', ?, ?)",
                (
                    &id,
                    academy_id,
                    &student_id,
                    &month.key,
                    &summary_json,
                    comment.as_deref().unwrap_or(""),
                    &now,
                    &now,
                ),
            )
            .map_err(|e| {
                HandlerErr::new("db_insert_failed", e.to_string())
                    .with_details(json!({ "table": "monthly_reports" }))
            })?;
            id
        }
    };
    Ok(json!({ "reportId": report_id, "status": "draft", "summary": summary }))
}

fn reports_list(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let month = required_month(params, "month")?;
    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.student_id, s.name, r.status, r.updated_at, r.finalized_at
             FROM monthly_reports r
             JOIN students s ON s.id = r.student_id
             WHERE r.academy_id = ? AND r.month = ?
             ORDER BY s.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let reports = stmt
        .query_map((academy_id, &month.key), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "updatedAt": r.get::<_, String>(4)?,
                "finalizedAt": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "month": month.key, "reports": reports }))
}

fn reports_get(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let report_id = required_str(params, "reportId")?;
    let row: Option<(String, String, String, String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT student_id, month, summary_json, comment, status, updated_at, finalized_at
             FROM monthly_reports WHERE academy_id = ? AND id = ?",
            (academy_id, &report_id),
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((student_id, month, summary_json, comment, status, updated_at, finalized_at)) = row else {
        return Err(HandlerErr::not_found("report not found"));
    };
    let summary: Value = serde_json::from_str(&summary_json).map_err(|e| {
        HandlerErr::new("db_query_failed", format!("stored report summary is invalid: {}", e))
            .with_details(json!({ "reportId": report_id }))
    })?;
    Ok(json!({
        "id": report_id,
        "studentId": student_id,
        "month": month,
        "summary": summary,
        "comment": comment,
        "status": status,
        "updatedAt": updated_at,
        "finalizedAt": finalized_at
    }))
}

fn reports_finalize(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let report_id = required_str(params, "reportId")?;
    let status: String = conn
        .query_row(
            "SELECT status FROM monthly_reports WHERE academy_id = ? AND id = ?",
            (academy_id, &report_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("report not found"))?;
    if status == "final" {
        return Err(HandlerErr::new("conflict", "report is already final"));
    }
    let now = now_stamp();
    conn.execute(
        "UPDATE monthly_reports SET status = 'final', finalized_at = ?, updated_at = ? WHERE id = ?",
        (&now, &now, &report_id),
    )
    .map_err(db_err("db_update_failed"))?;
    info!("event=report_finalize module=reports status=ok report_id={}", report_id);
    Ok(json!({ "ok": true, "status": "final", "finalizedAt": now }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.monthly" => Some(with_tenant(state, req, reports_monthly)),
        "reports.dashboard" => Some(with_tenant(state, req, reports_dashboard)),
        "reports.save" => Some(with_tenant(state, req, reports_save)),
        "reports.list" => Some(with_tenant(state, req, reports_list)),
        "reports.get" => Some(with_tenant(state, req, reports_get)),
        "reports.finalize" => Some(with_tenant(state, req, reports_finalize)),
        _ => None,
    }
}
