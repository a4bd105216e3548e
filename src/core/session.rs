//! Session store adapter.
//!
//! Buyer, seller and admin each get an independent [`SessionStore`] persisted under its own
//! key of one shared [`SessionStorage`], so signing out of one role never touches the others.

use crate::core::error::AuthError;
use crate::core::models::{AuthSession, Credentials, Identity, Registration, Role};
use crate::infrastructure::traits::{AuthBackend, SessionStorage};
use chrono::Utc;
use di::Ref;
use log::{debug, info, warn};
use std::sync::RwLock;
use tokio::sync::broadcast;

const AUTH_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStateChange {
    pub role: Role,
    pub event: AuthEvent,
    pub identity: Option<Identity>,
}

struct SessionState {
    session: Option<AuthSession>,
    loading: bool,
}

pub struct SessionStore {
    role: Role,
    storage_key: String,
    backend: Ref<dyn AuthBackend>,
    storage: Ref<dyn SessionStorage>,
    state: RwLock<SessionState>,
    changes: broadcast::Sender<AuthStateChange>,
}

impl SessionStore {
    pub fn new(
        role: Role,
        namespace: &str,
        backend: Ref<dyn AuthBackend>,
        storage: Ref<dyn SessionStorage>,
    ) -> Self {
        let (changes, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        SessionStore {
            role,
            storage_key: format!("{namespace}-{role}-auth"),
            backend,
            storage,
            state: RwLock::new(SessionState {
                session: None,
                loading: true,
            }),
            changes,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// True until [`SessionStore::restore`] has run.
    pub fn is_loading(&self) -> bool {
        self.state.read().map(|s| s.loading).unwrap_or(false)
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.session.as_ref().map(|session| session.identity.clone()))
    }

    /// Fires on sign-in, sign-out and token refresh of this role only.
    pub fn on_auth_state_change(&self) -> broadcast::Receiver<AuthStateChange> {
        self.changes.subscribe()
    }

    /// Reloads the persisted session of this role, validating it against the backend.
    pub async fn restore(&self) -> Option<Identity> {
        let restored = self.load_persisted().await;
        let identity = match restored {
            None => None,
            Some(session) if session.is_expired(Utc::now()) => {
                self.refresh_from(&session).await.ok()
            }
            Some(session) => match self.backend.get_user(&session.access_token).await {
                Ok(identity) => {
                    let session = AuthSession {
                        identity: identity.clone(),
                        ..session
                    };
                    self.install(session, AuthEvent::SignedIn).await;
                    Some(identity)
                }
                Err(AuthError::Unavailable(reason)) => {
                    warn!("{} session kept offline: {reason}", self.role);
                    let identity = session.identity.clone();
                    self.install(session, AuthEvent::SignedIn).await;
                    Some(identity)
                }
                Err(_) => self.refresh_from(&session).await.ok(),
            },
        };

        if let Ok(mut state) = self.state.write() {
            state.loading = false;
        }
        identity
    }

    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let session = self.backend.sign_in(credentials).await?;
        self.accept(session).await
    }

    pub async fn sign_up(
        &self,
        display_name: &str,
        credentials: Credentials,
    ) -> Result<Identity, AuthError> {
        let registration = Registration {
            display_name: display_name.to_owned(),
            credentials,
            role: self.role,
        };
        let session = self.backend.sign_up(&registration).await?;
        self.accept(session).await
    }

    pub async fn sign_out(&self) {
        let previous = self.take_session();
        if let Some(session) = previous {
            if let Err(e) = self.backend.sign_out(&session.access_token).await {
                warn!("{} sign-out not acknowledged by backend: {e}", self.role);
            }
            info!("{} signed out", self.role);
        }
        self.forget().await;
        self.emit(AuthEvent::SignedOut, None);
    }

    /// Current access token, refreshed first if it has expired.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let session = self
            .session()
            .ok_or(AuthError::NotSignedIn(self.role))?;
        if !session.is_expired(Utc::now()) {
            return Ok(session.access_token);
        }
        self.refresh_from(&session).await?;
        self.session()
            .map(|s| s.access_token)
            .ok_or(AuthError::TokenExpired)
    }

    pub async fn refresh(&self) -> Result<Identity, AuthError> {
        let session = self
            .session()
            .ok_or(AuthError::NotSignedIn(self.role))?;
        self.refresh_from(&session).await
    }

    /// Called when a downstream request was rejected for an expired token. Downgrades this role
    /// to signed-out instead of failing the caller.
    pub async fn handle_token_expired(&self) {
        if self.take_session().is_some() {
            warn!("{} token expired, signing out", self.role);
            self.forget().await;
            self.emit(AuthEvent::SignedOut, None);
        }
    }

    async fn accept(&self, session: AuthSession) -> Result<Identity, AuthError> {
        if session.identity.role != self.role {
            let actual = session.identity.role;
            if let Err(e) = self.backend.sign_out(&session.access_token).await {
                debug!("discarding foreign {actual} session failed: {e}");
            }
            return Err(AuthError::RoleMismatch {
                expected: self.role,
                actual,
            });
        }

        let identity = session.identity.clone();
        self.install(session, AuthEvent::SignedIn).await;
        info!("{} signed in as {}", self.role, identity.email);
        Ok(identity)
    }

    async fn refresh_from(&self, session: &AuthSession) -> Result<Identity, AuthError> {
        match self.backend.refresh(&session.refresh_token).await {
            Ok(refreshed) if refreshed.identity.role == self.role => {
                let identity = refreshed.identity.clone();
                self.install(refreshed, AuthEvent::TokenRefreshed).await;
                Ok(identity)
            }
            Ok(refreshed) => Err(AuthError::RoleMismatch {
                expected: self.role,
                actual: refreshed.identity.role,
            }),
            Err(AuthError::Unavailable(reason)) => Err(AuthError::Unavailable(reason)),
            Err(e) => {
                self.handle_token_expired().await;
                self.forget().await;
                Err(e)
            }
        }
    }

    async fn install(&self, session: AuthSession, event: AuthEvent) {
        let identity = session.identity.clone();
        match serde_json::to_string(&session) {
            Ok(serialized) => {
                if let Err(e) = self.storage.set_item(&self.storage_key, serialized).await {
                    warn!("persisting {} session failed: {e}", self.role);
                }
            }
            Err(e) => warn!("serializing {} session failed: {e}", self.role),
        }
        if let Ok(mut state) = self.state.write() {
            state.session = Some(session);
        }
        self.emit(event, Some(identity));
    }

    async fn load_persisted(&self) -> Option<AuthSession> {
        let raw = match self.storage.get_item(&self.storage_key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("reading {} session failed: {e}", self.role);
                return None;
            }
        };
        match serde_json::from_str::<AuthSession>(&raw) {
            Ok(session) if session.identity.role == self.role => Some(session),
            Ok(_) | Err(_) => {
                warn!("discarding unreadable {} session", self.role);
                self.forget().await;
                None
            }
        }
    }

    async fn forget(&self) {
        if let Err(e) = self.storage.remove_item(&self.storage_key).await {
            warn!("clearing {} session failed: {e}", self.role);
        }
    }

    fn session(&self) -> Option<AuthSession> {
        self.state.read().ok().and_then(|s| s.session.clone())
    }

    fn take_session(&self) -> Option<AuthSession> {
        self.state.write().ok().and_then(|mut s| s.session.take())
    }

    fn emit(&self, event: AuthEvent, identity: Option<Identity>) {
        // nobody listening is fine
        let _ = self.changes.send(AuthStateChange {
            role: self.role,
            event,
            identity,
        });
    }
}

/// The three role-scoped session stores of one client profile.
pub struct SessionStores {
    buyer: SessionStore,
    seller: SessionStore,
    admin: SessionStore,
}

impl SessionStores {
    pub fn new(
        namespace: &str,
        backend: Ref<dyn AuthBackend>,
        storage: Ref<dyn SessionStorage>,
    ) -> Self {
        SessionStores {
            buyer: SessionStore::new(Role::Buyer, namespace, backend.clone(), storage.clone()),
            seller: SessionStore::new(Role::Seller, namespace, backend.clone(), storage.clone()),
            admin: SessionStore::new(Role::Admin, namespace, backend, storage),
        }
    }

    pub fn get(&self, role: Role) -> &SessionStore {
        match role {
            Role::Buyer => &self.buyer,
            Role::Seller => &self.seller,
            Role::Admin => &self.admin,
        }
    }

    pub async fn restore_all(&self) {
        for role in Role::ALL {
            self.get(role).restore().await;
        }
    }

    pub fn current_identity(&self, role: Role) -> Option<Identity> {
        self.get(role).current_identity()
    }

    pub async fn sign_in(&self, role: Role, credentials: &Credentials) -> Result<Identity, AuthError> {
        self.get(role).sign_in(credentials).await
    }

    pub async fn sign_out(&self, role: Role) {
        self.get(role).sign_out().await
    }

    pub fn on_auth_state_change(&self, role: Role) -> broadcast::Receiver<AuthStateChange> {
        self.get(role).on_auth_state_change()
    }
}
