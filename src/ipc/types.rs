use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::AcademydConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub config: AcademydConfig,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Active tenant; every tenant query filters on it.
    pub academy_id: Option<String>,
}

impl AppState {
    pub fn new(config: AcademydConfig) -> Self {
        Self {
            config,
            workspace: None,
            db: None,
            academy_id: None,
        }
    }
}
