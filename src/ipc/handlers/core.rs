use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{row_exists, HandlerErr};
use crate::ipc::types::{AppState, Request};
use log::info;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "academyId": state.academy_id,
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            info!(
                "event=workspace_open module=core status=ok source=request path={}",
                path.display()
            );
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            state.academy_id = None;
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

fn handle_academy_use(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(academy_id) = req.params.get("academyId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing academyId", None);
    };
    match row_exists(conn, "SELECT 1 FROM academies WHERE id = ?", [academy_id]) {
        Ok(true) => {
            state.academy_id = Some(academy_id.to_string());
            ok(&req.id, json!({ "academyId": academy_id }))
        }
        Ok(false) => HandlerErr::not_found("academy not found").response(&req.id),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "academy.use" => Some(handle_academy_use(state, req)),
        _ => None,
    }
}
