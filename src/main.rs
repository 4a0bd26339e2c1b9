mod admin;
mod backup;
mod config;
mod db;
mod ipc;
mod logging;
mod schedule;
mod summary;

use log::{error, info, warn};
use std::io::{self, BufRead, Write};

fn main() {
    let config = match config::AcademydConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("academyd: {e}");
            std::process::exit(2);
        }
    };
    let _logger = match logging::init(&config.log) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("academyd: logging disabled: {e:#}");
            None
        }
    };

    let mut state = ipc::AppState::new(config);
    if let Some(path) = state.config.workspace.clone() {
        match db::open_db(&path) {
            Ok(conn) => {
                info!("event=workspace_open module=core status=ok source=config path={}", path.display());
                state.workspace = Some(path);
                state.db = Some(conn);
            }
            Err(e) => warn!(
                "event=workspace_open module=core status=error source=config path={} error={:#}",
                path.display(),
                e
            ),
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                error!("event=stdin_read module=core status=error error={}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            // Can't reply with an id; the caller matches on the missing id.
            Err(e) => ipc::bad_json(e.to_string()),
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    info!("event=app_stop module=core status=ok");
}
