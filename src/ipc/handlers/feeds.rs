use super::setup;
use crate::ipc::helpers::{
    db_err, new_id, now_stamp, optional_bool, optional_date, optional_str, parse_month_key,
    require_student, require_teacher, required_date, required_str, row_exists, string_array,
    with_tenant, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::format_date;
use crate::summary::FeedCategory;
use log::info;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};

const NAME_MAX: usize = 60;
const LABEL_MAX: usize = 60;

fn parse_category(raw: &str) -> Result<FeedCategory, HandlerErr> {
    FeedCategory::parse(raw).ok_or_else(|| {
        let allowed: Vec<&str> = FeedCategory::ALL.iter().map(|c| c.as_str()).collect();
        HandlerErr::bad_params(format!("category must be one of: {}", allowed.join(", ")))
            .with_details(json!({ "category": raw }))
    })
}

fn checked_name(raw: &Value, key: &str, max: usize) -> Result<String, HandlerErr> {
    let s = raw
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-empty string", key)))?;
    if s.chars().count() > max {
        return Err(HandlerErr::bad_params(format!("{} length must be <= {}", key, max)));
    }
    Ok(s)
}

fn optional_score(v: Option<&Value>) -> Result<Option<f64>, HandlerErr> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(n) => n
            .as_f64()
            .filter(|x| x.is_finite())
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params("score must be a number or null")),
    }
}

struct ConfigState {
    is_active: bool,
    deleted: bool,
}

fn load_config(conn: &Connection, academy_id: &str, config_id: &str) -> Result<ConfigState, HandlerErr> {
    conn.query_row(
        "SELECT is_active, deleted_at FROM feed_configs WHERE academy_id = ? AND id = ?",
        (academy_id, config_id),
        |r| {
            Ok(ConfigState {
                is_active: r.get::<_, i64>(0)? != 0,
                deleted: r.get::<_, Option<String>>(1)?.is_some(),
            })
        },
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("feed config not found"))
}

fn require_editable_config(conn: &Connection, academy_id: &str, config_id: &str) -> Result<(), HandlerErr> {
    if load_config(conn, academy_id, config_id)?.deleted {
        return Err(HandlerErr::new("conflict", "feed config is deleted"));
    }
    Ok(())
}

/// Config id of an option set, scoped to the academy.
fn set_config_id(conn: &Connection, academy_id: &str, set_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT os.config_id FROM option_sets os
         JOIN feed_configs fc ON fc.id = os.config_id
         WHERE fc.academy_id = ? AND os.id = ?",
        (academy_id, set_id),
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("option set not found"))
}

fn option_set_id(conn: &Connection, academy_id: &str, option_id: &str) -> Result<(String, String), HandlerErr> {
    conn.query_row(
        "SELECT o.set_id, os.config_id FROM options o
         JOIN option_sets os ON os.id = o.set_id
         JOIN feed_configs fc ON fc.id = os.config_id
         WHERE fc.academy_id = ? AND o.id = ?",
        (academy_id, option_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("option not found"))
}

fn feed_configs_list(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let include_deleted = optional_bool(params, "includeDeleted")?.unwrap_or(false);
    let mut stmt = conn
        .prepare(
            "SELECT
               fc.id,
               fc.name,
               fc.is_active,
               fc.activated_at,
               fc.applied_at,
               fc.deleted_at,
               fc.created_at,
               (SELECT COUNT(*) FROM option_sets os WHERE os.config_id = fc.id)
             FROM feed_configs fc
             WHERE fc.academy_id = ? AND (fc.deleted_at IS NULL OR ?)
             ORDER BY fc.created_at",
        )
        .map_err(db_err("db_query_failed"))?;
    let configs = stmt
        .query_map((academy_id, include_deleted), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "isActive": r.get::<_, i64>(2)? != 0,
                "activatedAt": r.get::<_, Option<String>>(3)?,
                "appliedAt": r.get::<_, Option<String>>(4)?,
                "deletedAt": r.get::<_, Option<String>>(5)?,
                "createdAt": r.get::<_, String>(6)?,
                "optionSetCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "configs": configs }))
}

fn feed_configs_get(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let config_id = required_str(params, "configId")?;
    let (name, is_active, activated_at, applied_at, deleted_at): (
        String,
        i64,
        Option<String>,
        Option<String>,
        Option<String>,
    ) = conn
        .query_row(
            "SELECT name, is_active, activated_at, applied_at, deleted_at
             FROM feed_configs WHERE academy_id = ? AND id = ?",
            (academy_id, &config_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("feed config not found"))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, set_id, label, score, sort_order FROM options
             WHERE set_id IN (SELECT id FROM option_sets WHERE config_id = ?)
             ORDER BY sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let option_rows = stmt
        .query_map([&config_id], |r| {
            Ok((
                r.get::<_, String>(1)?,
                json!({
                    "id": r.get::<_, String>(0)?,
                    "label": r.get::<_, String>(2)?,
                    "score": r.get::<_, Option<f64>>(3)?,
                    "sortOrder": r.get::<_, i64>(4)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut options_by_set: HashMap<String, Vec<Value>> = HashMap::new();
    for (set_id, option) in option_rows {
        options_by_set.entry(set_id).or_default().push(option);
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name, category, is_scored, is_required, sort_order
             FROM option_sets WHERE config_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let set_rows = stmt
        .query_map([&config_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)? != 0,
                r.get::<_, i64>(4)? != 0,
                r.get::<_, i64>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let option_sets: Vec<Value> = set_rows
        .into_iter()
        .map(|(id, name, category, is_scored, is_required, sort_order)| {
            let options = options_by_set.remove(&id).unwrap_or_default();
            json!({
                "id": id,
                "name": name,
                "category": category,
                "isScored": is_scored,
                "isRequired": is_required,
                "sortOrder": sort_order,
                "options": options
            })
        })
        .collect();

    Ok(json!({
        "config": {
            "id": config_id,
            "name": name,
            "isActive": is_active != 0,
            "activatedAt": activated_at,
            "appliedAt": applied_at,
            "deletedAt": deleted_at
        },
        "optionSets": option_sets
    }))
}

fn feed_configs_create(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    if name.chars().count() > NAME_MAX {
        return Err(HandlerErr::bad_params(format!("name length must be <= {}", NAME_MAX)));
    }
    let config_id = new_id();
    conn.execute(
        "INSERT INTO feed_configs(id, academy_id, name, is_active, created_at) VALUES(?, ?, ?, 0, ?)",
        (&config_id, academy_id, &name, now_stamp()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "feed_configs" }))
    })?;
    Ok(json!({ "configId": config_id }))
}

fn feed_configs_activate(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let config_id = required_str(params, "configId")?;
    require_editable_config(conn, academy_id, &config_id)?;

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "UPDATE feed_configs SET is_active = 0 WHERE academy_id = ? AND id <> ?",
        (academy_id, &config_id),
    )
    .map_err(db_err("db_update_failed"))?;
    tx.execute(
        "UPDATE feed_configs SET is_active = 1, activated_at = ? WHERE academy_id = ? AND id = ?",
        (now_stamp(), academy_id, &config_id),
    )
    .map_err(db_err("db_update_failed"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    info!(
        "event=feed_config_activate module=feeds status=ok config_id={}",
        config_id
    );
    Ok(json!({ "ok": true }))
}

fn feed_configs_apply(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let config_id = required_str(params, "configId")?;
    let state = load_config(conn, academy_id, &config_id)?;
    if state.deleted {
        return Err(HandlerErr::new("conflict", "feed config is deleted"));
    }
    if !state.is_active {
        return Err(HandlerErr::new("conflict", "activate the feed config before applying it"));
    }
    let applied_at = now_stamp();
    conn.execute(
        "UPDATE feed_configs SET applied_at = ? WHERE academy_id = ? AND id = ?",
        (&applied_at, academy_id, &config_id),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "ok": true, "appliedAt": applied_at }))
}

fn feed_configs_delete(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let config_id = required_str(params, "configId")?;
    load_config(conn, academy_id, &config_id)?;
    conn.execute(
        "UPDATE feed_configs
         SET is_active = 0, deleted_at = COALESCE(deleted_at, ?)
         WHERE academy_id = ? AND id = ?",
        (now_stamp(), academy_id, &config_id),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "ok": true }))
}

fn option_sets_create(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let config_id = required_str(params, "configId")?;
    require_editable_config(conn, academy_id, &config_id)?;
    let name = required_str(params, "name")?;
    if name.chars().count() > NAME_MAX {
        return Err(HandlerErr::bad_params(format!("name length must be <= {}", NAME_MAX)));
    }
    let category = parse_category(&required_str(params, "category")?)?;
    let is_scored = optional_bool(params, "isScored")?.unwrap_or(true);
    let is_required = optional_bool(params, "isRequired")?.unwrap_or(false);
    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM option_sets WHERE config_id = ?",
            [&config_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;

    let set_id = new_id();
    conn.execute(
        "INSERT INTO option_sets(id, config_id, name, category, is_scored, is_required, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &set_id,
            &config_id,
            &name,
            category.as_str(),
            is_scored as i64,
            is_required as i64,
            next_sort,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "option_sets" }))
    })?;
    Ok(json!({ "optionSetId": set_id }))
}

fn option_sets_update(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let set_id = required_str(params, "optionSetId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let config_id = set_config_id(conn, academy_id, &set_id)?;
    require_editable_config(conn, academy_id, &config_id)?;

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                let name = checked_name(v, k, NAME_MAX)?;
                tx.execute("UPDATE option_sets SET name = ? WHERE id = ?", (&name, &set_id))
                    .map_err(db_err("db_update_failed"))?;
            }
            "category" => {
                let raw = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("category must be string"))?;
                let category = parse_category(raw)?;
                tx.execute(
                    "UPDATE option_sets SET category = ? WHERE id = ?",
                    (category.as_str(), &set_id),
                )
                .map_err(db_err("db_update_failed"))?;
            }
            "isScored" | "isRequired" => {
                let b = v
                    .as_bool()
                    .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", k)))?;
                let column = if k == "isScored" { "is_scored" } else { "is_required" };
                let sql = format!("UPDATE option_sets SET {} = ? WHERE id = ?", column);
                tx.execute(&sql, (b as i64, &set_id))
                    .map_err(db_err("db_update_failed"))?;
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown option set field: {}", k))),
        }
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn option_sets_delete(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let set_id = required_str(params, "optionSetId")?;
    let config_id = set_config_id(conn, academy_id, &set_id)?;
    require_editable_config(conn, academy_id, &config_id)?;
    if row_exists(
        conn,
        "SELECT 1 FROM feed_values WHERE option_set_id = ? LIMIT 1",
        [&set_id],
    )? {
        return Err(HandlerErr::new("in_use", "option set has submitted feed values"));
    }
    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    tx.execute("DELETE FROM options WHERE set_id = ?", [&set_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.execute("DELETE FROM option_sets WHERE id = ?", [&set_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn options_create(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let set_id = required_str(params, "optionSetId")?;
    let config_id = set_config_id(conn, academy_id, &set_id)?;
    require_editable_config(conn, academy_id, &config_id)?;
    let label = required_str(params, "label")?;
    if label.chars().count() > LABEL_MAX {
        return Err(HandlerErr::bad_params(format!("label length must be <= {}", LABEL_MAX)));
    }
    let score = optional_score(params.get("score"))?;
    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM options WHERE set_id = ?",
            [&set_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;

    let option_id = new_id();
    conn.execute(
        "INSERT INTO options(id, set_id, label, score, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&option_id, &set_id, &label, score, next_sort),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "options" }))
    })?;
    Ok(json!({ "optionId": option_id }))
}

fn options_update(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let option_id = required_str(params, "optionId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let (_, config_id) = option_set_id(conn, academy_id, &option_id)?;
    require_editable_config(conn, academy_id, &config_id)?;

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for (k, v) in patch {
        match k.as_str() {
            "label" => {
                let label = checked_name(v, k, LABEL_MAX)?;
                tx.execute("UPDATE options SET label = ? WHERE id = ?", (&label, &option_id))
                    .map_err(db_err("db_update_failed"))?;
            }
            "score" => {
                let score = optional_score(Some(v))?;
                tx.execute("UPDATE options SET score = ? WHERE id = ?", (score, &option_id))
                    .map_err(db_err("db_update_failed"))?;
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown option field: {}", k))),
        }
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn options_delete(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let option_id = required_str(params, "optionId")?;
    let (_, config_id) = option_set_id(conn, academy_id, &option_id)?;
    require_editable_config(conn, academy_id, &config_id)?;
    if row_exists(
        conn,
        "SELECT 1 FROM feed_values WHERE option_id = ? LIMIT 1",
        [&option_id],
    )? {
        return Err(HandlerErr::new("in_use", "option has submitted feed values"));
    }
    conn.execute("DELETE FROM options WHERE id = ?", [&option_id])
        .map_err(db_err("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

fn options_reorder(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let set_id = required_str(params, "optionSetId")?;
    let config_id = set_config_id(conn, academy_id, &set_id)?;
    require_editable_config(conn, academy_id, &config_id)?;
    let ordered = string_array(params, "orderedIds")?;

    let mut stmt = conn
        .prepare("SELECT id FROM options WHERE set_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let existing: HashSet<String> = stmt
        .query_map([&set_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let given: HashSet<&String> = ordered.iter().collect();
    if given.len() != ordered.len()
        || ordered.len() != existing.len()
        || !ordered.iter().all(|id| existing.contains(id))
    {
        return Err(HandlerErr::bad_params(
            "orderedIds must list every option of the set exactly once",
        ));
    }

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for (i, id) in ordered.iter().enumerate() {
        tx.execute(
            "UPDATE options SET sort_order = ? WHERE set_id = ? AND id = ?",
            (i as i64, &set_id, id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

struct SetRule {
    id: String,
    name: String,
    is_required: bool,
}

/// Checks a submitted `{ optionSetId: optionId }` map against the config's
/// sets and options; returns the (set, option) pairs to store.
fn validate_values(
    sets: &[SetRule],
    option_owner: &HashMap<String, String>,
    values: &Map<String, Value>,
) -> Result<Vec<(String, String)>, HandlerErr> {
    let known: HashSet<&str> = sets.iter().map(|s| s.id.as_str()).collect();
    let mut pairs = Vec::with_capacity(values.len());
    for (set_id, option) in values {
        if !known.contains(set_id.as_str()) {
            return Err(HandlerErr::bad_params("option set is not part of the active feed config")
                .with_details(json!({ "optionSetId": set_id })));
        }
        let Some(option_id) = option.as_str() else {
            return Err(HandlerErr::bad_params("values must map optionSetId to an optionId string")
                .with_details(json!({ "optionSetId": set_id })));
        };
        if option_owner.get(option_id).map(|s| s.as_str()) != Some(set_id.as_str()) {
            return Err(HandlerErr::bad_params("option does not belong to its option set")
                .with_details(json!({ "optionSetId": set_id, "optionId": option_id })));
        }
        pairs.push((set_id.clone(), option_id.to_string()));
    }
    let missing: Vec<&str> = sets
        .iter()
        .filter(|s| s.is_required && !values.contains_key(&s.id))
        .map(|s| s.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(HandlerErr::bad_params("required option sets are missing")
            .with_details(json!({ "missing": missing })));
    }
    Ok(pairs)
}

fn active_config_id(conn: &Connection, academy_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT id FROM feed_configs
         WHERE academy_id = ? AND is_active = 1 AND applied_at IS NOT NULL AND deleted_at IS NULL",
        [academy_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::new("no_active_feed_config", "no feed config is active and applied"))
}

fn feeds_submit(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let date = format_date(required_date(params, "date")?);
    require_student(conn, academy_id, &student_id)?;
    require_teacher(conn, academy_id, &teacher_id)?;
    let Some(values) = params.get("values").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("values must be an object"));
    };

    let config_id = active_config_id(conn, academy_id)?;
    let mut stmt = conn
        .prepare("SELECT id, name, is_required FROM option_sets WHERE config_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let sets = stmt
        .query_map([&config_id], |r| {
            Ok(SetRule {
                id: r.get(0)?,
                name: r.get(1)?,
                is_required: r.get::<_, i64>(2)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut stmt = conn
        .prepare(
            "SELECT o.id, o.set_id FROM options o
             JOIN option_sets os ON os.id = o.set_id
             WHERE os.config_id = ?",
        )
        .map_err(db_err("db_query_failed"))?;
    let option_owner: HashMap<String, String> = stmt
        .query_map([&config_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let pairs = validate_values(&sets, &option_owner, values)?;

    let settings = setup::feed_settings(conn, academy_id);
    let memo = optional_str(params, "memo")?;
    if let Some(m) = memo.as_deref() {
        if m.chars().count() > settings.memo_max_chars {
            return Err(HandlerErr::bad_params(format!(
                "memo length must be <= {}",
                settings.memo_max_chars
            )));
        }
    } else if settings.require_memo {
        return Err(HandlerErr::bad_params("memo is required"));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM feeds
             WHERE academy_id = ? AND student_id = ? AND teacher_id = ? AND date = ?",
            (academy_id, &student_id, &teacher_id, &date),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;

    let now = now_stamp();
    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    let (feed_id, created) = match existing {
        Some(id) => {
            tx.execute(
                "UPDATE feeds SET config_id = ?, memo = ?, updated_at = ? WHERE id = ?",
                (&config_id, &memo, &now, &id),
            )
            .map_err(db_err("db_update_failed"))?;
            tx.execute("DELETE FROM feed_values WHERE feed_id = ?", [&id])
                .map_err(db_err("db_delete_failed"))?;
            (id, false)
        }
        None => {
            let id = new_id();
            tx.execute(
                "INSERT INTO feeds(id, academy_id, student_id, teacher_id, date, config_id, memo, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (&id, academy_id, &student_id, &teacher_id, &date, &config_id, &memo, &now, &now),
            )
            .map_err(|e| {
                HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "feeds" }))
            })?;
            (id, true)
        }
    };
    for (set_id, option_id) in &pairs {
        tx.execute(
            "INSERT INTO feed_values(feed_id, option_set_id, option_id) VALUES(?, ?, ?)",
            (&feed_id, set_id, option_id),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "feed_values" }))
        })?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    info!(
        "event=feed_submit module=feeds status=ok feed_id={} created={} values={}",
        feed_id,
        created,
        pairs.len()
    );
    Ok(json!({ "feedId": feed_id, "created": created }))
}

fn feeds_list(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let date = optional_date(params, "date")?;
    let month = optional_str(params, "month")?;
    let (from, to) = match (date, month) {
        (Some(d), None) => (format_date(d), format_date(d)),
        (None, Some(m)) => {
            let mk = parse_month_key(&m)?;
            (format_date(mk.first), format_date(mk.last))
        }
        _ => return Err(HandlerErr::bad_params("give exactly one of date or month")),
    };
    let student_id = optional_str(params, "studentId")?;

    let mut stmt = conn
        .prepare(
            "SELECT f.id, f.student_id, s.name, f.teacher_id, t.name, f.date, f.memo, f.updated_at
             FROM feeds f
             JOIN students s ON s.id = f.student_id
             JOIN teachers t ON t.id = f.teacher_id
             WHERE f.academy_id = ? AND f.date >= ? AND f.date <= ?
               AND (? IS NULL OR f.student_id = ?)
             ORDER BY f.date, s.sort_order, t.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let feed_rows = stmt
        .query_map((academy_id, &from, &to, &student_id, &student_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                json!({
                    "id": r.get::<_, String>(0)?,
                    "studentId": r.get::<_, String>(1)?,
                    "studentName": r.get::<_, String>(2)?,
                    "teacherId": r.get::<_, String>(3)?,
                    "teacherName": r.get::<_, String>(4)?,
                    "date": r.get::<_, String>(5)?,
                    "memo": r.get::<_, Option<String>>(6)?,
                    "updatedAt": r.get::<_, String>(7)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut stmt = conn
        .prepare(
            "SELECT fv.feed_id, fv.option_set_id, os.name, os.category, fv.option_id, o.label, o.score
             FROM feed_values fv
             JOIN feeds f ON f.id = fv.feed_id
             JOIN option_sets os ON os.id = fv.option_set_id
             JOIN options o ON o.id = fv.option_id
             WHERE f.academy_id = ? AND f.date >= ? AND f.date <= ?
             ORDER BY os.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let value_rows = stmt
        .query_map((academy_id, &from, &to), |r| {
            Ok((
                r.get::<_, String>(0)?,
                json!({
                    "optionSetId": r.get::<_, String>(1)?,
                    "setName": r.get::<_, String>(2)?,
                    "category": r.get::<_, String>(3)?,
                    "optionId": r.get::<_, String>(4)?,
                    "label": r.get::<_, String>(5)?,
                    "score": r.get::<_, Option<f64>>(6)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut values_by_feed: HashMap<String, Vec<Value>> = HashMap::new();
    for (feed_id, v) in value_rows {
        values_by_feed.entry(feed_id).or_default().push(v);
    }

    let feeds: Vec<Value> = feed_rows
        .into_iter()
        .map(|(id, mut feed)| {
            feed["values"] = Value::Array(values_by_feed.remove(&id).unwrap_or_default());
            feed
        })
        .collect();
    Ok(json!({ "from": from, "to": to, "feeds": feeds }))
}

fn feeds_pending(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let date = format_date(required_date(params, "date")?);
    let mut stmt = conn
        .prepare(
            "SELECT b.student_id, s.name, b.teacher_id, t.name, MIN(b.start_time)
             FROM schedule_blocks b
             JOIN students s ON s.id = b.student_id
             JOIN teachers t ON t.id = b.teacher_id
             WHERE b.academy_id = ? AND b.date = ?
               AND NOT EXISTS (
                 SELECT 1 FROM feeds f
                 WHERE f.student_id = b.student_id AND f.teacher_id = b.teacher_id AND f.date = b.date
               )
             GROUP BY b.student_id, b.teacher_id
             ORDER BY MIN(b.start_time), s.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let pending = stmt
        .query_map((academy_id, &date), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "studentName": r.get::<_, String>(1)?,
                "teacherId": r.get::<_, String>(2)?,
                "teacherName": r.get::<_, String>(3)?,
                "firstLessonAt": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "date": date, "pending": pending }))
}

fn feeds_delete(conn: &Connection, academy_id: &str, params: &Value) -> Result<Value, HandlerErr> {
    let feed_id = required_str(params, "feedId")?;
    if !row_exists(
        conn,
        "SELECT 1 FROM feeds WHERE academy_id = ? AND id = ?",
        (academy_id, &feed_id),
    )? {
        return Err(HandlerErr::not_found("feed not found"));
    }
    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    tx.execute("DELETE FROM feed_values WHERE feed_id = ?", [&feed_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.execute("DELETE FROM feeds WHERE id = ?", [&feed_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feedConfigs.list" => Some(with_tenant(state, req, feed_configs_list)),
        "feedConfigs.get" => Some(with_tenant(state, req, feed_configs_get)),
        "feedConfigs.create" => Some(with_tenant(state, req, feed_configs_create)),
        "feedConfigs.activate" => Some(with_tenant(state, req, feed_configs_activate)),
        "feedConfigs.apply" => Some(with_tenant(state, req, feed_configs_apply)),
        "feedConfigs.delete" => Some(with_tenant(state, req, feed_configs_delete)),
        "optionSets.create" => Some(with_tenant(state, req, option_sets_create)),
        "optionSets.update" => Some(with_tenant(state, req, option_sets_update)),
        "optionSets.delete" => Some(with_tenant(state, req, option_sets_delete)),
        "options.create" => Some(with_tenant(state, req, options_create)),
        "options.update" => Some(with_tenant(state, req, options_update)),
        "options.delete" => Some(with_tenant(state, req, options_delete)),
        "options.reorder" => Some(with_tenant(state, req, options_reorder)),
        "feeds.submit" => Some(with_tenant(state, req, feeds_submit)),
        "feeds.list" => Some(with_tenant(state, req, feeds_list)),
        "feeds.pending" => Some(with_tenant(state, req, feeds_pending)),
        "feeds.delete" => Some(with_tenant(state, req, feeds_delete)),
        _ => None,
    }
}
