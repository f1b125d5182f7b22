use thiserror::Error;

/// Why a token failed validation. Leaked to the decider for metrics and logs
/// only, never to clients.
#[derive(Debug, Error)]
pub enum AuthnError {
    #[error("token expired or outside its validity window")]
    ExpiredToken,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("invalid token claims")]
    InvalidClaims,
    #[error("token missing kubernetes identity claims")]
    MissingKubernetesClaims,
    #[error("unknown signing key id {0}")]
    UnknownKey(String),
    #[error("transient authentication failure: {0}")]
    Transient(String),
}

pub type AuthnResult<T> = Result<T, AuthnError>;
