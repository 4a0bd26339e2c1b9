use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use log::{debug, warn};
use std::time::Instant;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::academies::try_handle,
    handlers::teachers::try_handle,
    handlers::students::try_handle,
    handlers::timetable::try_handle,
    handlers::attendance::try_handle,
    handlers::feeds::try_handle,
    handlers::reports::try_handle,
    handlers::setup::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let started_at = Instant::now();
    let resp = dispatch(state, &req);

    let ok = resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    if ok {
        debug!(
            "event=request method={} status=ok duration_ms={}",
            req.method,
            started_at.elapsed().as_millis()
        );
    } else {
        let code = resp
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        warn!(
            "event=request method={} status=error error_code={} duration_ms={}",
            req.method,
            code,
            started_at.elapsed().as_millis()
        );
    }
    resp
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    for family in FAMILIES {
        if let Some(resp) = family(state, req) {
            return resp;
        }
    }
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
