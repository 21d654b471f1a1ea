use clap::Parser;
use std::path::PathBuf;

/// Attendance sidecar for campus teachers.
///
/// Reads one JSON request per line on stdin and writes one JSON response per
/// line on stdout. Logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "campusd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Workspace directory to open at startup (falls back to CAMPUSD_WORKSPACE)
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Log output format: "text" or "json" (falls back to CAMPUSD_LOG_FORMAT)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Lifetime of a sign-in session
    #[arg(long, default_value = "12")]
    pub session_ttl_hours: i64,

    /// Accounts created with this email get the admin role (falls back to CAMPUSD_ADMIN_EMAIL)
    #[arg(long)]
    pub admin_email: Option<String>,

    /// Attempts for writes that hit a busy database
    #[arg(long, default_value = "3")]
    pub retry_attempts: u32,

    /// Pause between busy-database attempts
    #[arg(long, default_value = "500")]
    pub retry_delay_ms: u64,

    /// Default look-ahead for upcoming birthdays
    #[arg(long, default_value = "30")]
    pub birthday_window_days: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub log_format: String,
    pub session_ttl_hours: i64,
    pub admin_email: Option<String>,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub birthday_window_days: i64,
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_cli(cli: Cli) -> Self {
        let workspace = cli
            .workspace
            .or_else(|| env_non_empty("CAMPUSD_WORKSPACE").map(PathBuf::from));
        let log_format = cli
            .log_format
            .or_else(|| env_non_empty("CAMPUSD_LOG_FORMAT"))
            .unwrap_or_else(|| "text".to_string())
            .to_ascii_lowercase();
        let admin_email = cli
            .admin_email
            .or_else(|| env_non_empty("CAMPUSD_ADMIN_EMAIL"))
            .map(|e| e.trim().to_ascii_lowercase());
        Config {
            workspace,
            log_format,
            session_ttl_hours: cli.session_ttl_hours.max(1),
            admin_email,
            retry_attempts: cli.retry_attempts.max(1),
            retry_delay_ms: cli.retry_delay_ms,
            birthday_window_days: cli.birthday_window_days.clamp(0, 366),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workspace: None,
            log_format: "text".to_string(),
            session_ttl_hours: 12,
            admin_email: None,
            retry_attempts: 3,
            retry_delay_ms: 500,
            birthday_window_days: 30,
        }
    }
}
