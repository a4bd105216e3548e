//! Pooled SQLite connection

use crate::core::error::RepositoryError;
use di::inject;
use di::injectable;
use log::{error, warn};
use sqlx::SqlitePool;
use sqlx::migrate::MigrateError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::env;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Mutex;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://market_chat.db";

/// Pool handed out by `create()` instead of `DATABASE_URL` while tests run.
static TEST_POOL: Mutex<Option<SqlitePool>> = Mutex::new(None);

pub struct DatabaseConnection {
    connection: SqlitePool,
}

#[injectable]
impl DatabaseConnection {
    #[inject]
    pub fn create() -> DatabaseConnection {
        if let Some(pool) = Self::test_pool() {
            return DatabaseConnection { connection: pool };
        }

        dotenvy::dotenv().ok();
        let connection_string =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_owned());

        DatabaseConnection::connect_lazy(&connection_string)
    }
}

impl DatabaseConnection {
    pub fn connect_lazy(connection_string: &str) -> DatabaseConnection {
        let options = SqliteConnectOptions::from_str(connection_string)
            .map(|options| options.create_if_missing(true))
            .unwrap_or_else(|e| {
                error!("invalid DATABASE_URL `{connection_string}`: {e}, using an in-memory database");
                SqliteConnectOptions::new()
            });

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_lazy_with(options);

        DatabaseConnection { connection: pool }
    }

    pub fn from_pool(pool: SqlitePool) -> DatabaseConnection {
        DatabaseConnection { connection: pool }
    }

    pub async fn migrate(&self) -> Result<(), MigrateError> {
        sqlx::migrate!().run(&self.connection).await
    }

    pub fn set_test_pool(pool: SqlitePool) {
        match TEST_POOL.lock() {
            Ok(mut slot) => *slot = Some(pool),
            Err(poisoned) => *poisoned.into_inner() = Some(pool),
        }
    }

    pub fn clear_test_pool() {
        match TEST_POOL.lock() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    fn test_pool() -> Option<SqlitePool> {
        TEST_POOL.lock().ok().and_then(|slot| slot.clone())
    }
}

impl Deref for DatabaseConnection {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for DatabaseConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row not found".to_owned()),
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                RepositoryError::Validation(db.message().to_owned())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                warn!("undecodable row: {e}");
                RepositoryError::Transient(e.to_string())
            }
            _ => RepositoryError::Transient(e.to_string()),
        }
    }
}

/// Logs a query failure and converts it for the caller.
pub(crate) fn logged(context: &'static str) -> impl Fn(sqlx::Error) -> RepositoryError {
    move |e| {
        error!("{context}: {e}");
        RepositoryError::from(e)
    }
}
