use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_err, new_id, now_stamp, require_admin, required_str, row_exists, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use log::info;
use rusqlite::Connection;
use serde_json::json;

fn handle_academies_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT
           a.id,
           a.name,
           a.created_at,
           (SELECT COUNT(*) FROM teachers t WHERE t.academy_id = a.id AND t.active = 1),
           (SELECT COUNT(*) FROM students s WHERE s.academy_id = a.id AND s.active = 1)
         FROM academies a
         ORDER BY a.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let created_at: String = row.get(2)?;
            let teacher_count: i64 = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "createdAt": created_at,
                "teacherCount": teacher_count,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(academies) => ok(&req.id, json!({ "academies": academies })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn academies_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    if name.chars().count() > 120 {
        return Err(HandlerErr::bad_params("name length must be <= 120"));
    }
    let academy_id = new_id();
    conn.execute(
        "INSERT INTO academies(id, name, created_at) VALUES(?, ?, ?)",
        (&academy_id, &name, now_stamp()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "academies" }))
    })?;
    info!("event=academy_create module=academies status=ok academy_id={}", academy_id);
    Ok(json!({ "academyId": academy_id, "name": name }))
}

/// Tenant tables in dependency order: children before parents.
const TENANT_DELETES: &[(&str, &str)] = &[
    (
        "feed_values",
        "DELETE FROM feed_values WHERE feed_id IN (SELECT id FROM feeds WHERE academy_id = ?)",
    ),
    ("feeds", "DELETE FROM feeds WHERE academy_id = ?"),
    ("monthly_reports", "DELETE FROM monthly_reports WHERE academy_id = ?"),
    ("attendance", "DELETE FROM attendance WHERE academy_id = ?"),
    ("schedule_blocks", "DELETE FROM schedule_blocks WHERE academy_id = ?"),
    (
        "options",
        "DELETE FROM options WHERE set_id IN (
           SELECT os.id FROM option_sets os
           JOIN feed_configs fc ON fc.id = os.config_id
           WHERE fc.academy_id = ?
         )",
    ),
    (
        "option_sets",
        "DELETE FROM option_sets WHERE config_id IN (SELECT id FROM feed_configs WHERE academy_id = ?)",
    ),
    ("feed_configs", "DELETE FROM feed_configs WHERE academy_id = ?"),
    ("students", "DELETE FROM students WHERE academy_id = ?"),
    ("teachers", "DELETE FROM teachers WHERE academy_id = ?"),
    ("settings", "DELETE FROM settings WHERE academy_id = ?"),
    ("academies", "DELETE FROM academies WHERE id = ?"),
];

fn academies_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let academy_id = required_str(params, "academyId")?;
    if !row_exists(conn, "SELECT 1 FROM academies WHERE id = ?", [&academy_id])? {
        return Err(HandlerErr::not_found("academy not found"));
    }

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for (table, sql) in TENANT_DELETES {
        tx.execute(sql, [&academy_id]).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
        })?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    info!("event=academy_delete module=academies status=ok academy_id={}", academy_id);
    Ok(json!({ "ok": true, "academyId": academy_id }))
}

fn handle_academies_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, &req.params) {
        return e.response(&req.id);
    }
    with_db(state, req, academies_create)
}

fn handle_academies_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, &req.params) {
        return e.response(&req.id);
    }
    let resp = with_db(state, req, academies_delete);
    let deleted = resp.pointer("/result/academyId").and_then(|v| v.as_str());
    if deleted.is_some() && state.academy_id.as_deref() == deleted {
        state.academy_id = None;
    }
    resp
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "academies.list" => Some(handle_academies_list(state, req)),
        "academies.create" => Some(handle_academies_create(state, req)),
        "academies.delete" => Some(handle_academies_delete(state, req)),
        _ => None,
    }
}
