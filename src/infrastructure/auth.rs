//! Auth service backed by the `profiles` and `auth_sessions` tables.

use crate::config::ChatConfig;
use crate::core::error::AuthError;
use crate::core::models::{AuthSession, Credentials, Identity, Registration};
use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::entities;
use crate::infrastructure::traits::AuthBackend;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use di::{Ref, inject, injectable};
use bcrypt::{DEFAULT_COST, hash, verify};
use log::{error, info, warn};
use uuid::Uuid;

pub struct DbAuthBackend {
    connection: Ref<DatabaseConnection>,
    session_ttl: Duration,
    password_cost: u32,
}

#[injectable(AuthBackend)]
impl DbAuthBackend {
    #[inject]
    pub fn create(connection: Ref<DatabaseConnection>, config: Ref<ChatConfig>) -> DbAuthBackend {
        let session_ttl = Duration::from_std(config.session_ttl).unwrap_or_else(|_| Duration::hours(1));
        DbAuthBackend::new(connection, session_ttl).with_password_cost(config.password_cost)
    }
}

impl DbAuthBackend {
    pub fn new(connection: Ref<DatabaseConnection>, session_ttl: Duration) -> Self {
        DbAuthBackend {
            connection,
            session_ttl,
            password_cost: DEFAULT_COST,
        }
    }

    pub fn with_password_cost(mut self, cost: u32) -> Self {
        self.password_cost = cost;
        self
    }

    async fn issue_session(&self, identity: Identity) -> Result<AuthSession, AuthError> {
        let session = AuthSession {
            access_token: Uuid::new_v4().simple().to_string(),
            refresh_token: Uuid::new_v4().simple().to_string(),
            expires_at: Utc::now() + self.session_ttl,
            identity,
        };

        sqlx::query(
            "INSERT INTO auth_sessions (token, refresh_token, user_id, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.access_token)
        .bind(&session.refresh_token)
        .bind(session.identity.id)
        .bind(session.expires_at)
        .execute(&**self.connection)
        .await
        .map_err(unavailable)?;

        Ok(session)
    }

    async fn profile(&self, user_id: Uuid) -> Result<Option<entities::Profile>, AuthError> {
        sqlx::query_as("SELECT * FROM profiles WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&**self.connection)
            .await
            .map_err(unavailable)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// A stored hash that bcrypt cannot read never matches.
fn password_matches(password: &str, stored: &str) -> bool {
    verify(password, stored).unwrap_or_else(|e| {
        warn!("unreadable password hash: {e}");
        false
    })
}

fn unavailable(e: sqlx::Error) -> AuthError {
    error!("auth query failed: {e}");
    AuthError::Unavailable(e.to_string())
}

fn to_identity(profile: &entities::Profile) -> Result<Identity, AuthError> {
    profile
        .identity()
        .map_err(|e| AuthError::Unavailable(e.to_string()))
}

#[async_trait]
impl AuthBackend for DbAuthBackend {
    async fn sign_up(&self, registration: &Registration) -> Result<AuthSession, AuthError> {
        let email = normalize_email(&registration.credentials.email);
        if email.is_empty() || registration.credentials.password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        let password_hash = hash(&registration.credentials.password, self.password_cost)
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let profile: entities::Profile = sqlx::query_as(
            "INSERT INTO profiles (id, display_name, email, role, password_hash, created_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(registration.display_name.trim())
        .bind(&email)
        .bind(registration.role.as_str())
        .bind(&password_hash)
        .bind(Utc::now())
        .fetch_one(&**self.connection)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AuthError::EmailTaken(email.clone())
            }
            _ => unavailable(e),
        })?;

        info!("registered {} as {}", profile.email, profile.role);
        self.issue_session(to_identity(&profile)?).await
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<AuthSession, AuthError> {
        let email = normalize_email(&credentials.email);
        let profile: Option<entities::Profile> =
            sqlx::query_as("SELECT * FROM profiles WHERE email = ?")
                .bind(&email)
                .fetch_optional(&**self.connection)
                .await
                .map_err(unavailable)?;

        match profile {
            Some(profile) if password_matches(&credentials.password, &profile.password_hash) => {
                self.issue_session(to_identity(&profile)?).await
            }
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError> {
        let previous: Option<entities::AuthSession> =
            sqlx::query_as("DELETE FROM auth_sessions WHERE refresh_token = ? RETURNING *")
                .bind(refresh_token)
                .fetch_optional(&**self.connection)
                .await
                .map_err(unavailable)?;

        let previous = previous.ok_or(AuthError::TokenExpired)?;
        let profile = self
            .profile(previous.user_id)
            .await?
            .ok_or(AuthError::TokenExpired)?;

        self.issue_session(to_identity(&profile)?).await
    }

    async fn get_user(&self, access_token: &str) -> Result<Identity, AuthError> {
        let session: Option<entities::AuthSession> =
            sqlx::query_as("SELECT * FROM auth_sessions WHERE token = ?")
                .bind(access_token)
                .fetch_optional(&**self.connection)
                .await
                .map_err(unavailable)?;

        match session {
            Some(session) if session.expires_at > Utc::now() => {
                let profile = self
                    .profile(session.user_id)
                    .await?
                    .ok_or(AuthError::TokenExpired)?;
                to_identity(&profile)
            }
            _ => Err(AuthError::TokenExpired),
        }
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM auth_sessions WHERE token = ?")
            .bind(access_token)
            .execute(&**self.connection)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
