use crate::ipc::helpers::{
    apply_text_patch, db_err, new_id, now_stamp, optional_bool, optional_str, require_student,
    required_str, string_array, with_tenant, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;

const NAME_MAX: usize = 80;

/// JSON key, column, max length.
const TEXT_FIELDS: &[(&str, &str, usize)] = &[
    ("school", "school", 80),
    ("grade", "grade", 20),
    ("phone", "phone", 32),
    ("parentPhone", "parent_phone", 32),
    ("memo", "memo", 1000),
];

fn students_list(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let include_inactive = optional_bool(params, "includeInactive")?.unwrap_or(false);
    let search = optional_str(params, "search")?.map(|s| s.to_lowercase());

    let mut stmt = conn
        .prepare(
            "SELECT id, name, school, grade, phone, parent_phone, memo, active, sort_order, updated_at
             FROM students
             WHERE academy_id = ? AND (active = 1 OR ?)
             ORDER BY sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((academy_id, include_inactive), |r| {
            Ok((
                r.get::<_, String>(1)?,
                json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "school": r.get::<_, Option<String>>(2)?,
                    "grade": r.get::<_, Option<String>>(3)?,
                    "phone": r.get::<_, Option<String>>(4)?,
                    "parentPhone": r.get::<_, Option<String>>(5)?,
                    "memo": r.get::<_, Option<String>>(6)?,
                    "active": r.get::<_, i64>(7)? != 0,
                    "sortOrder": r.get::<_, i64>(8)?,
                    "updatedAt": r.get::<_, String>(9)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let students: Vec<serde_json::Value> = rows
        .into_iter()
        .filter(|(name, _)| {
            search
                .as_deref()
                .map(|q| name.to_lowercase().contains(q))
                .unwrap_or(true)
        })
        .map(|(_, v)| v)
        .collect();
    Ok(json!({ "students": students }))
}

fn students_create(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    if name.chars().count() > NAME_MAX {
        return Err(HandlerErr::bad_params(format!("name length must be <= {}", NAME_MAX)));
    }
    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE academy_id = ?",
            [academy_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;

    let student_id = new_id();
    let now = now_stamp();
    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO students(id, academy_id, name, active, sort_order, created_at, updated_at)
         VALUES(?, ?, ?, 1, ?, ?, ?)",
        (&student_id, academy_id, &name, next_sort, &now, &now),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "students" }))
    })?;
    // Optional fields share the patch path so length limits live in one place.
    if let Some(obj) = params.as_object() {
        apply_text_patch(&tx, "students", &student_id, obj, TEXT_FIELDS)?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "studentId": student_id }))
}

fn students_update(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    require_student(conn, academy_id, &student_id)?;
    for k in patch.keys() {
        let known = k == "name" || k == "active" || TEXT_FIELDS.iter().any(|(j, _, _)| *j == k.as_str());
        if !known {
            return Err(HandlerErr::bad_params(format!("unknown student field: {}", k)));
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
        tx.execute("UPDATE students SET name = ? WHERE id = ?", (&name, &student_id))
            .map_err(db_err("db_update_failed"))?;
    }
    if let Some(v) = patch.get("active") {
        let active = v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?;
        tx.execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (active as i64, &student_id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
    apply_text_patch(&tx, "students", &student_id, patch, TEXT_FIELDS)?;
    tx.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        (now_stamp(), &student_id),
    )
    .map_err(db_err("db_update_failed"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn students_reorder(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ordered = string_array(params, "orderedIds")?;
    let mut stmt = conn
        .prepare("SELECT id FROM students WHERE academy_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let existing: HashSet<String> = stmt
        .query_map([academy_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let given: HashSet<&String> = ordered.iter().collect();
    let is_permutation = given.len() == ordered.len()
        && ordered.len() == existing.len()
        && ordered.iter().all(|id| existing.contains(id));
    if !is_permutation {
        return Err(HandlerErr::bad_params(
            "orderedIds must list every student of the academy exactly once",
        )
        .with_details(json!({ "expected": existing.len(), "given": ordered.len() })));
    }

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for (i, id) in ordered.iter().enumerate() {
        tx.execute(
            "UPDATE students SET sort_order = ? WHERE academy_id = ? AND id = ?",
            (i as i64, academy_id, id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn students_delete(
    conn: &Connection,
    academy_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_student(conn, academy_id, &student_id)?;

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    let steps: &[(&str, &str)] = &[
        (
            "feed_values",
            "DELETE FROM feed_values WHERE feed_id IN (SELECT id FROM feeds WHERE student_id = ?)",
        ),
        ("feeds", "DELETE FROM feeds WHERE student_id = ?"),
        ("monthly_reports", "DELETE FROM monthly_reports WHERE student_id = ?"),
        ("attendance", "DELETE FROM attendance WHERE student_id = ?"),
        (
            "schedule_blocks",
            "UPDATE schedule_blocks SET student_id = NULL WHERE student_id = ?",
        ),
        ("students", "DELETE FROM students WHERE id = ?"),
    ];
    for (table, sql) in steps {
        tx.execute(sql, [&student_id]).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
        })?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_tenant(state, req, students_list)),
        "students.create" => Some(with_tenant(state, req, students_create)),
        "students.update" => Some(with_tenant(state, req, students_update)),
        "students.reorder" => Some(with_tenant(state, req, students_reorder)),
        "students.delete" => Some(with_tenant(state, req, students_delete)),
        _ => None,
    }
}
