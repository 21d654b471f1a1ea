use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::Role;
use crate::config::Config;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The signed-in teacher for this sidecar process.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub teacher_id: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub expires_at: i64,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub session: Option<Session>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        AppState {
            workspace: None,
            db: None,
            session: None,
            config,
        }
    }
}
