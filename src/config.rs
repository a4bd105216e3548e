//! Runtime configuration read from the environment (and `.env`).

use crate::core::realtime::ReconnectPolicy;
use crate::infrastructure::database::DEFAULT_DATABASE_URL;
use di::{inject, injectable};
use log::warn;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub database_url: String,
    pub storage_dir: PathBuf,
    pub storage_public_url: String,
    pub attachment_bucket: String,
    pub session_dir: PathBuf,
    pub session_namespace: String,
    pub reconnect: ReconnectPolicy,
    pub pending_echo_window: Duration,
    pub session_ttl: Duration,
    /// bcrypt cost for stored passwords.
    pub password_cost: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            database_url: DEFAULT_DATABASE_URL.to_owned(),
            storage_dir: PathBuf::from("./storage"),
            storage_public_url: "http://localhost:3000/storage".to_owned(),
            attachment_bucket: "chat-attachments".to_owned(),
            session_dir: PathBuf::from("./.sessions"),
            session_namespace: "market".to_owned(),
            reconnect: ReconnectPolicy::default(),
            pending_echo_window: Duration::from_secs(30),
            session_ttl: Duration::from_secs(3600),
            password_cost: bcrypt::DEFAULT_COST,
        }
    }
}

#[injectable]
impl ChatConfig {
    #[inject]
    pub fn create() -> ChatConfig {
        ChatConfig::from_env()
    }
}

impl ChatConfig {
    pub fn from_env() -> ChatConfig {
        dotenvy::dotenv().ok();
        let defaults = ChatConfig::default();

        ChatConfig {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            storage_dir: env::var("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            storage_public_url: env::var("STORAGE_PUBLIC_URL")
                .unwrap_or(defaults.storage_public_url),
            attachment_bucket: env::var("ATTACHMENT_BUCKET").unwrap_or(defaults.attachment_bucket),
            session_dir: env::var("SESSION_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.session_dir),
            session_namespace: env::var("SESSION_NAMESPACE").unwrap_or(defaults.session_namespace),
            reconnect: ReconnectPolicy {
                max_retries: parsed("REALTIME_MAX_RETRIES", defaults.reconnect.max_retries),
                initial_backoff: Duration::from_millis(parsed(
                    "REALTIME_BACKOFF_MS",
                    defaults.reconnect.initial_backoff.as_millis() as u64,
                )),
                max_backoff: Duration::from_millis(parsed(
                    "REALTIME_MAX_BACKOFF_MS",
                    defaults.reconnect.max_backoff.as_millis() as u64,
                )),
            },
            pending_echo_window: Duration::from_secs(parsed(
                "PENDING_ECHO_WINDOW_SECS",
                defaults.pending_echo_window.as_secs(),
            )),
            session_ttl: Duration::from_secs(parsed(
                "SESSION_TTL_SECS",
                defaults.session_ttl.as_secs(),
            )),
            password_cost: parsed("PASSWORD_HASH_COST", defaults.password_cost),
        }
    }
}

fn parsed<T: FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring unparseable {name}={raw}");
            default
        }),
        Err(_) => default,
    }
}
