use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::require_admin;
use crate::ipc::types::{AppState, Request};
use log::{info, warn};
use serde_json::json;
use std::path::PathBuf;

fn path_param(req: &Request, key: &str) -> Result<PathBuf, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(PathBuf::from(v.trim())),
        _ => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, &req.params) {
        return e.response(&req.id);
    }
    let out = match path_param(req, "outPath") {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(FULL)") {
            warn!("event=backup_export module=backup status=checkpoint_failed error={}", e);
        }
    }

    match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(export) => {
            info!(
                "event=backup_export module=backup status=ok path={} bytes={}",
                out.display(),
                export.db_bytes
            );
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "path": out.to_string_lossy(),
                    "bundleFormat": export.bundle_format,
                    "dbSha256": export.db_sha256,
                    "dbBytes": export.db_bytes
                }),
            )
        }
        Err(e) => err(
            &req.id,
            "io_failed",
            format!("{e:#}"),
            Some(json!({ "path": out.to_string_lossy() })),
        ),
    }
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, &req.params) {
        return e.response(&req.id);
    }
    let src = match path_param(req, "inPath") {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": src.to_string_lossy() })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;
    state.academy_id = None;

    let import = backup::import_workspace_bundle(&src, &workspace_path);
    // Reopen either way: a failed import leaves the previous file in place.
    let reopened = db::open_db(&workspace_path);
    match (import, reopened) {
        (Ok(import), Ok(conn)) => {
            state.db = Some(conn);
            info!(
                "event=backup_import module=backup status=ok path={}",
                src.display()
            );
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormat": import.bundle_format,
                    "dbSha256": import.db_sha256,
                    "exportedAt": import.exported_at
                }),
            )
        }
        (Err(e), reopened) => {
            state.db = reopened.ok();
            err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": src.to_string_lossy() })),
            )
        }
        (Ok(_), Err(e)) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        _ => None,
    }
}
