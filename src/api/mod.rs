//! Presentation adapters: serializable views of the chat state and their plain-text rendering.

use crate::core::error::AuthError;
use crate::core::models::{Identity, Role};
use crate::core::session::SessionStores;
use crate::core::state::ConnectionState;
use thiserror::Error;

pub mod conversations;
pub mod messages;

/// The identity a command runs as, resolved from the session of one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub Identity);

impl CurrentUser {
    pub fn extract(sessions: &SessionStores, role: Role) -> Result<CurrentUser, AuthError> {
        sessions
            .current_identity(role)
            .map(CurrentUser)
            .ok_or(AuthError::NotSignedIn(role))
    }
}

/// `$12.34`
pub fn format_price(price_cents: i64) -> String {
    let sign = if price_cents < 0 { "-" } else { "" };
    let cents = price_cents.unsigned_abs();
    format!("{sign}${}.{:02}", cents / 100, cents % 100)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid price `{0}`, expected dollars with at most two decimals")]
pub struct InvalidPrice(pub String);

/// `12`, `$12.5` or `12.50` to cents. Negative amounts are rejected.
pub fn parse_price(raw: &str) -> Result<i64, InvalidPrice> {
    let amount = raw.trim();
    let invalid = || InvalidPrice(amount.to_owned());
    let unsigned = amount.strip_prefix('$').unwrap_or(amount);
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let digits_only = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if whole.is_empty() || !digits_only(whole) || !digits_only(fraction) || fraction.len() > 2 {
        return Err(invalid());
    }

    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    let fraction: i64 = format!("{fraction:0<2}").parse().map_err(|_| invalid())?;
    whole
        .checked_mul(100)
        .and_then(|cents| cents.checked_add(fraction))
        .ok_or_else(invalid)
}

/// Banner text for a degraded connection, `None` while connected.
pub fn connection_banner(connection: ConnectionState) -> Option<&'static str> {
    match connection {
        ConnectionState::Connected => None,
        ConnectionState::Reconnecting => Some("reconnecting..."),
        ConnectionState::Lost => Some("connection lost, use `refresh` to reconnect"),
    }
}
