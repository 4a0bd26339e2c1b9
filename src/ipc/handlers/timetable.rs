use super::setup;
use crate::ipc::helpers::{
    db_err, new_id, now_stamp, optional_bool, optional_date, optional_str, optional_time,
    require_student, require_teacher, required_date, required_str, with_tenant, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{
    self, format_date, format_time, BlockSlot, MoveRequest, MoveScope, MAX_REPEAT_WEEKS,
};
use log::info;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

const BLOCK_SELECT_SQL: &str = "SELECT
    id,
    group_id,
    teacher_id,
    student_id,
    date,
    start_time,
    end_time,
    detached
FROM schedule_blocks";

struct BlockRow {
    id: String,
    group_id: Option<String>,
    teacher_id: String,
    student_id: Option<String>,
    date: String,
    start_time: String,
    end_time: String,
    detached: i64,
}

impl BlockRow {
    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            group_id: r.get(1)?,
            teacher_id: r.get(2)?,
            student_id: r.get(3)?,
            date: r.get(4)?,
            start_time: r.get(5)?,
            end_time: r.get(6)?,
            detached: r.get(7)?,
        })
    }

    fn into_slot(self) -> Result<BlockSlot, HandlerErr> {
        let invalid = |m: String| {
            HandlerErr::new("db_query_failed", format!("invalid stored block {}: {}", self.id, m))
        };
        let date = schedule::parse_date(&self.date).map_err(invalid)?;
        let start = schedule::parse_time(&self.start_time).map_err(invalid)?;
        let end = schedule::parse_time(&self.end_time).map_err(invalid)?;
        Ok(BlockSlot {
            id: self.id,
            group_id: self.group_id,
            teacher_id: self.teacher_id,
            student_id: self.student_id,
            date,
            start,
            end,
            detached: self.detached != 0,
        })
    }
}

fn query_slots<P: rusqlite::Params>(
    conn: &Connection,
    where_sql: &str,
    params: P,
) -> Result<Vec<BlockSlot>, HandlerErr> {
    let sql = format!("{} {} ORDER BY date, start_time", BLOCK_SELECT_SQL, where_sql);
    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map(params, BlockRow::from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    rows.into_iter().map(BlockRow::into_slot).collect()
}

fn load_block(conn: &Connection, academy_id: &str, block_id: &str) -> Result<BlockSlot, HandlerErr> {
    let sql = format!("{} WHERE academy_id = ? AND id = ?", BLOCK_SELECT_SQL);
    conn.query_row(&sql, (academy_id, block_id), BlockRow::from_row)
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("schedule block not found"))?
        .into_slot()
}

fn load_series(conn: &Connection, academy_id: &str, anchor: &BlockSlot) -> Result<Vec<BlockSlot>, HandlerErr> {
    match anchor.group_id.as_deref() {
        Some(gid) => query_slots(conn, "WHERE academy_id = ? AND group_id = ?", (academy_id, gid)),
        None => Ok(vec![anchor.clone()]),
    }
}

/// Blocks already booked for the students of `slots` on the same dates.
fn booked_for_students(
    conn: &Connection,
    academy_id: &str,
    slots: &[BlockSlot],
) -> Result<Vec<BlockSlot>, HandlerErr> {
    let mut out: Vec<BlockSlot> = Vec::new();
    let mut seen: HashMap<(String, String), ()> = HashMap::new();
    for s in slots {
        let Some(student) = s.student_id.as_ref() else {
            continue;
        };
        let date = format_date(s.date);
        if seen.insert((student.clone(), date.clone()), ()).is_some() {
            continue;
        }
        out.extend(query_slots(
            conn,
            "WHERE academy_id = ? AND student_id = ? AND date = ?",
            (academy_id, student, &date),
        )?);
    }
    Ok(out)
}

fn check_student_conflicts(
    conn: &Connection,
    academy_id: &str,
    planned: &[BlockSlot],
    force: bool,
) -> Result<(), HandlerErr> {
    if force {
        return Ok(());
    }
    let booked = booked_for_students(conn, academy_id, planned)?;
    let conflicts = schedule::student_conflicts(planned, &booked);
    if conflicts.is_empty() {
        return Ok(());
    }
    let details: Vec<serde_json::Value> = conflicts
        .iter()
        .map(|(block, other)| json!({ "blockId": block, "conflictsWith": other }))
        .collect();
    Err(HandlerErr::new("conflict", "student is already booked at that time")
        .with_details(json!({ "conflicts": details })))
}

fn block_json(slot: &BlockSlot, names: &NameLookup, room: Option<&str>) -> serde_json::Value {
    json!({
        "id": slot.id,
        "groupId": slot.group_id,
        "teacherId": slot.teacher_id,
        "teacherName": names.teachers.get(&slot.teacher_id),
        "studentId": slot.student_id,
        "studentName": slot.student_id.as_ref().and_then(|s| names.students.get(s)),
        "date": format_date(slot.date),
        "weekday": slot.date.format("%a").to_string(),
        "startTime": format_time(slot.start),
        "endTime": format_time(slot.end),
        "room": room,
        "detached": slot.detached,
    })
}

struct NameLookup {
    teachers: HashMap<String, String>,
    students: HashMap<String, String>,
}

impl NameLookup {
    fn load(conn: &Connection, academy_id: &str) -> Result<Self, HandlerErr> {
        let load = |sql: &str| -> Result<HashMap<String, String>, HandlerErr> {
            let mut stmt = conn.prepare(sql).map_err(db_err("db_query_failed"))?;
            let map = stmt
                .query_map([academy_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
                .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
                .map_err(db_err("db_query_failed"))?;
            Ok(map)
        };
        Ok(Self {
            teachers: load("SELECT id, name FROM teachers WHERE academy_id = ?")?,
            students: load("SELECT id, name FROM students WHERE academy_id = ?")?,
        })
    }
}

fn rooms_for(conn: &Connection, academy_id: &str, from: &str, to: &str) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, room FROM schedule_blocks
             WHERE academy_id = ? AND date >= ? AND date <= ? AND room IS NOT NULL",
        )
        .map_err(db_err("db_query_failed"))?;
    let map = stmt
        .query_map((academy_id, from, to), |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(map)
}

fn check_day_window(settings: &setup::TimetableSettings, start: u32, end: u32) -> Result<(), HandlerErr> {
    if settings.within_day(start, end) {
        return Ok(());
    }
    Err(HandlerErr::bad_params(format!(
        "lesson must fall within the academy day ({}-{})",
        format_time(settings.day_start),
        format_time(settings.day_end)
    ))
    .with_details(json!({ "startTime": format_time(start), "endTime": format_time(end) })))
}

fn parse_scope(params: &serde_json::Value) -> Result<MoveScope, HandlerErr> {
    let raw = required_str(params, "scope")?;
    MoveScope::parse(&raw).ok_or_else(|| {
        HandlerErr::bad_params("scope must be one of: day, group").with_details(json!({ "scope": raw }))
    })
}

fn timetable_create(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    require_teacher(conn, academy_id, &teacher_id)?;
    let student_id = optional_str(params, "studentId")?;
    if let Some(sid) = student_id.as_deref() {
        require_student(conn, academy_id, sid)?;
    }
    let date = required_date(params, "date")?;
    let start = optional_time(params, "startTime")?
        .ok_or_else(|| HandlerErr::bad_params("missing startTime"))?;
    let settings = setup::timetable_settings(conn, academy_id);
    let end = match optional_time(params, "endTime")? {
        Some(end) => end,
        None => start + settings.default_lesson_minutes,
    };
    if start >= end || end > 24 * 60 {
        return Err(HandlerErr::bad_params("startTime must be before endTime"));
    }
    check_day_window(&settings, start, end)?;
    let room = optional_str(params, "room")?;
    let repeat_weeks = match params.get("repeatWeeks") {
        None | Some(serde_json::Value::Null) => 1,
        Some(v) => v
            .as_u64()
            .filter(|n| (1..=MAX_REPEAT_WEEKS as u64).contains(n))
            .ok_or_else(|| {
                HandlerErr::bad_params(format!("repeatWeeks must be in 1..={}", MAX_REPEAT_WEEKS))
            })? as u32,
    };
    let force = optional_bool(params, "force")?.unwrap_or(false);

    let group_id = if repeat_weeks > 1 { Some(new_id()) } else { None };
    let planned: Vec<BlockSlot> = schedule::weekly_dates(date, repeat_weeks)
        .map_err(HandlerErr::bad_params)?
        .into_iter()
        .map(|d| BlockSlot {
            id: new_id(),
            group_id: group_id.clone(),
            teacher_id: teacher_id.clone(),
            student_id: student_id.clone(),
            date: d,
            start,
            end,
            detached: false,
        })
        .collect();
    check_student_conflicts(conn, academy_id, &planned, force)?;

    let now = now_stamp();
    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for b in &planned {
        tx.execute(
            "INSERT INTO schedule_blocks(
               id, academy_id, teacher_id, student_id, group_id, date, start_time, end_time,
               room, detached, created_at, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
            (
                &b.id,
                academy_id,
                &b.teacher_id,
                &b.student_id,
                &b.group_id,
                format_date(b.date),
                format_time(b.start),
                format_time(b.end),
                &room,
                &now,
                &now,
            ),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "schedule_blocks" }))
        })?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;

    let ids: Vec<&str> = planned.iter().map(|b| b.id.as_str()).collect();
    Ok(json!({ "blockIds": ids, "groupId": group_id }))
}

fn timetable_list(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let from = required_date(params, "from")?;
    let to = required_date(params, "to")?;
    if to < from {
        return Err(HandlerErr::bad_params("to must not be before from"));
    }
    if (to - from).num_days() > 366 {
        return Err(HandlerErr::bad_params("range must not exceed 366 days"));
    }
    let teacher_id = optional_str(params, "teacherId")?;
    let student_id = optional_str(params, "studentId")?;

    let from_s = format_date(from);
    let to_s = format_date(to);
    let slots = query_slots(
        conn,
        "WHERE academy_id = ? AND date >= ? AND date <= ?
           AND (? IS NULL OR teacher_id = ?)
           AND (? IS NULL OR student_id = ?)",
        (
            academy_id,
            &from_s,
            &to_s,
            &teacher_id,
            &teacher_id,
            &student_id,
            &student_id,
        ),
    )?;
    let names = NameLookup::load(conn, academy_id)?;
    let rooms = rooms_for(conn, academy_id, &from_s, &to_s)?;
    let blocks: Vec<serde_json::Value> = slots
        .iter()
        .map(|s| block_json(s, &names, rooms.get(&s.id).map(|r| r.as_str())))
        .collect();
    Ok(json!({ "from": from_s, "to": to_s, "blocks": blocks }))
}

fn timetable_week(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = required_date(params, "date")?;
    let settings = setup::timetable_settings(conn, academy_id);
    let start = schedule::week_start(date, settings.week_starts_on).map_err(HandlerErr::bad_params)?;
    let end = schedule::shift_days(start, 6).map_err(HandlerErr::bad_params)?;
    let start_s = format_date(start);
    let end_s = format_date(end);

    let slots = query_slots(
        conn,
        "WHERE academy_id = ? AND date >= ? AND date <= ?",
        (academy_id, &start_s, &end_s),
    )?;
    let names = NameLookup::load(conn, academy_id)?;
    let rooms = rooms_for(conn, academy_id, &start_s, &end_s)?;

    let days: Vec<serde_json::Value> = start
        .iter_days()
        .take(7)
        .map(|day| {
            let blocks: Vec<serde_json::Value> = slots
                .iter()
                .filter(|s| s.date == day)
                .map(|s| block_json(s, &names, rooms.get(&s.id).map(|r| r.as_str())))
                .collect();
            json!({
                "date": format_date(day),
                "weekday": day.format("%a").to_string(),
                "blocks": blocks
            })
        })
        .collect();

    Ok(json!({
        "weekStart": start_s,
        "weekStartsOn": settings.week_starts_on.as_str(),
        "days": days
    }))
}

fn write_slots(conn: &Connection, academy_id: &str, slots: &[BlockSlot]) -> Result<(), HandlerErr> {
    let now = now_stamp();
    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for b in slots {
        tx.execute(
            "UPDATE schedule_blocks
             SET date = ?, start_time = ?, end_time = ?, teacher_id = ?, student_id = ?,
                 detached = ?, updated_at = ?
             WHERE academy_id = ? AND id = ?",
            (
                format_date(b.date),
                format_time(b.start),
                format_time(b.end),
                &b.teacher_id,
                &b.student_id,
                b.detached as i64,
                &now,
                academy_id,
                &b.id,
            ),
        )
        .map_err(|e| {
            HandlerErr::new("db_update_failed", e.to_string())
                .with_details(json!({ "table": "schedule_blocks" }))
        })?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))
}

fn timetable_move(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let block_id = required_str(params, "blockId")?;
    let scope = parse_scope(params)?;
    let req = MoveRequest {
        date: optional_date(params, "date")?,
        start: optional_time(params, "startTime")?,
        end: optional_time(params, "endTime")?,
        teacher_id: optional_str(params, "teacherId")?,
    };
    if let Some(tid) = req.teacher_id.as_deref() {
        require_teacher(conn, academy_id, tid)?;
    }
    let force = optional_bool(params, "force")?.unwrap_or(false);

    let anchor = load_block(conn, academy_id, &block_id)?;
    let series = load_series(conn, academy_id, &anchor)?;
    let plan = schedule::plan_move(&anchor, &series, scope, &req).map_err(HandlerErr::bad_params)?;
    // Blocks saved under an older window may keep their times; new times must fit.
    if req.start.is_some() || req.end.is_some() {
        let settings = setup::timetable_settings(conn, academy_id);
        for b in &plan.updates {
            check_day_window(&settings, b.start, b.end)?;
        }
    }
    check_student_conflicts(conn, academy_id, &plan.updates, force)?;
    write_slots(conn, academy_id, &plan.updates)?;

    info!(
        "event=timetable_move module=timetable status=ok block_id={} scope={} moved={}",
        block_id,
        plan.scope.as_str(),
        plan.updates.len()
    );
    let ids: Vec<&str> = plan.updates.iter().map(|b| b.id.as_str()).collect();
    Ok(json!({
        "scope": plan.scope.as_str(),
        "movedCount": plan.updates.len(),
        "blockIds": ids
    }))
}

fn timetable_assign(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let block_id = required_str(params, "blockId")?;
    let scope = parse_scope(params)?;
    if params.get("studentId").is_none() {
        return Err(HandlerErr::bad_params("missing studentId (use null to clear)"));
    }
    let student_id = optional_str(params, "studentId")?;
    if let Some(sid) = student_id.as_deref() {
        require_student(conn, academy_id, sid)?;
    }
    let force = optional_bool(params, "force")?.unwrap_or(false);

    let anchor = load_block(conn, academy_id, &block_id)?;
    let series = load_series(conn, academy_id, &anchor)?;
    let (effective, targets) = schedule::scope_targets(&anchor, &series, scope);
    let planned: Vec<BlockSlot> = targets
        .into_iter()
        .map(|b| BlockSlot {
            student_id: student_id.clone(),
            ..b.clone()
        })
        .collect();
    check_student_conflicts(conn, academy_id, &planned, force)?;
    write_slots(conn, academy_id, &planned)?;

    Ok(json!({
        "scope": effective.as_str(),
        "assignedCount": planned.len(),
        "studentId": student_id
    }))
}

fn timetable_delete(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let block_id = required_str(params, "blockId")?;
    let scope = parse_scope(params)?;
    let anchor = load_block(conn, academy_id, &block_id)?;
    let series = load_series(conn, academy_id, &anchor)?;
    let (effective, targets) = schedule::scope_targets(&anchor, &series, scope);

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for b in &targets {
        tx.execute(
            "DELETE FROM schedule_blocks WHERE academy_id = ? AND id = ?",
            (academy_id, &b.id),
        )
        .map_err(db_err("db_delete_failed"))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "scope": effective.as_str(), "deletedCount": targets.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.create" => Some(with_tenant(state, req, timetable_create)),
        "timetable.list" => Some(with_tenant(state, req, timetable_list)),
        "timetable.week" => Some(with_tenant(state, req, timetable_week)),
        "timetable.move" => Some(with_tenant(state, req, timetable_move)),
        "timetable.assign" => Some(with_tenant(state, req, timetable_assign)),
        "timetable.delete" => Some(with_tenant(state, req, timetable_delete)),
        _ => None,
    }
}
