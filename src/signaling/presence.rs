//! Login und Online-Status über das Relay

use super::messages::{password_key, status_key, UserStatus};
use super::transport::{SignalingTransport, TransportError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    #[error("Password is wrong")]
    WrongPassword,

    #[error("Identity must not be empty")]
    EmptyIdentity,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Meldet `identity` am Relay an
///
/// Existiert noch kein Credential-Record, wird die Identität registriert.
/// Anschließend steht der Status auf ONLINE.
pub async fn login(
    transport: &dyn SignalingTransport,
    identity: &str,
    password: &str,
) -> Result<(), LoginError> {
    if identity.trim().is_empty() {
        return Err(LoginError::EmptyIdentity);
    }

    match transport.read_once(&password_key(identity)).await? {
        Some(stored) if stored == password => {
            tracing::info!("Logged in as {}", identity);
        }
        Some(_) => return Err(LoginError::WrongPassword),
        None => {
            transport.publish(&password_key(identity), Some(password.to_string()))?;
            tracing::info!("Registered new identity {}", identity);
        }
    }

    set_status(transport, identity, UserStatus::Online)?;
    Ok(())
}

/// Setzt den eigenen Status
pub fn set_status(
    transport: &dyn SignalingTransport,
    identity: &str,
    status: UserStatus,
) -> Result<(), TransportError> {
    transport.publish(&status_key(identity), Some(status.as_str().to_string()))
}

/// Liest den Status eines anderen Benutzers
pub async fn status_of(
    transport: &dyn SignalingTransport,
    identity: &str,
) -> Result<Option<UserStatus>, TransportError> {
    let value = transport.read_once(&status_key(identity)).await?;
    Ok(value.as_deref().and_then(UserStatus::parse))
}

/// Meldet `identity` ab
pub fn log_off(transport: &dyn SignalingTransport, identity: &str) -> Result<(), TransportError> {
    tracing::info!("Logging off {}", identity);
    set_status(transport, identity, UserStatus::Offline)
}

// ============================================================================
// TESTS
// ============================================================================
