use crate::ipc::helpers::{
    apply_text_patch, db_err, new_id, now_stamp, optional_bool, optional_str, require_teacher,
    required_str, row_exists, with_tenant, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const NAME_MAX: usize = 80;

fn teachers_list(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let include_inactive = optional_bool(params, "includeInactive")?.unwrap_or(false);
    let mut stmt = conn
        .prepare(
            "SELECT id, name, subject, color, active, sort_order
             FROM teachers
             WHERE academy_id = ? AND (active = 1 OR ?)
             ORDER BY sort_order, name",
        )
        .map_err(db_err("db_query_failed"))?;
    let teachers = stmt
        .query_map((academy_id, include_inactive), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "subject": r.get::<_, Option<String>>(2)?,
                "color": r.get::<_, Option<String>>(3)?,
                "active": r.get::<_, i64>(4)? != 0,
                "sortOrder": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    if name.chars().count() > NAME_MAX {
        return Err(HandlerErr::bad_params(format!("name length must be <= {}", NAME_MAX)));
    }
    let subject = optional_str(params, "subject")?;
    let color = optional_str(params, "color")?;
    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM teachers WHERE academy_id = ?",
            [academy_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;

    let teacher_id = new_id();
    conn.execute(
        "INSERT INTO teachers(id, academy_id, name, subject, color, active, sort_order, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?, ?)",
        (&teacher_id, academy_id, &name, &subject, &color, next_sort, now_stamp()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "teachers" }))
    })?;
    Ok(json!({ "teacherId": teacher_id }))
}

fn teachers_update(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    require_teacher(conn, academy_id, &teacher_id)?;
    for k in patch.keys() {
        if !matches!(k.as_str(), "name" | "subject" | "color" | "active") {
            return Err(HandlerErr::bad_params(format!("unknown teacher field: {}", k)));
        }
    }

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    if let Some(v) = patch.get("name") {
        let name = v
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::bad_params("name must be a non-empty string"))?;
        if name.chars().count() > NAME_MAX {
            return Err(HandlerErr::bad_params(format!("name length must be <= {}", NAME_MAX)));
        }
        tx.execute("UPDATE teachers SET name = ? WHERE id = ?", (&name, &teacher_id))
            .map_err(db_err("db_update_failed"))?;
    }
    if let Some(v) = patch.get("active") {
        let active = v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?;
        tx.execute(
            "UPDATE teachers SET active = ? WHERE id = ?",
            (active as i64, &teacher_id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
    apply_text_patch(
        &tx,
        "teachers",
        &teacher_id,
        patch,
        &[("subject", "subject", 60), ("color", "color", 16)],
    )?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn teachers_delete(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    require_teacher(conn, academy_id, &teacher_id)?;
    let blocks = row_exists(
        conn,
        "SELECT 1 FROM schedule_blocks WHERE teacher_id = ? LIMIT 1",
        [&teacher_id],
    )?;
    let feeds = row_exists(conn, "SELECT 1 FROM feeds WHERE teacher_id = ? LIMIT 1", [&teacher_id])?;
    if blocks || feeds {
        return Err(HandlerErr::new(
            "in_use",
            "teacher has schedule blocks or feeds; deactivate instead",
        )
        .with_details(json!({ "scheduleBlocks": blocks, "feeds": feeds })));
    }
    conn.execute(
        "DELETE FROM teachers WHERE academy_id = ? AND id = ?",
        (academy_id, &teacher_id),
    )
    .map_err(db_err("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(with_tenant(state, req, teachers_list)),
        "teachers.create" => Some(with_tenant(state, req, teachers_create)),
        "teachers.update" => Some(with_tenant(state, req, teachers_update)),
        "teachers.delete" => Some(with_tenant(state, req, teachers_delete)),
        _ => None,
    }
}
