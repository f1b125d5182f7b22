use thiserror::Error;

#[derive(Debug, Error)]
pub enum NatsJwtError {
    #[error("malformed token: {0}")]
    Malformed(&'static str),
    #[error("unexpected claim type: {0}")]
    UnexpectedClaimType(String),
    #[error("token issuer {0} is not a trusted key")]
    UntrustedIssuer(String),
    #[error("token signature verification failed")]
    InvalidSignature,
    #[error("claims serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("nkey failure: {0}")]
    Key(String),
}

pub type NatsJwtResult<T> = Result<T, NatsJwtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_variants() {
        let errors = vec![
            NatsJwtError::Malformed("missing segment"),
            NatsJwtError::UnexpectedClaimType("user".to_string()),
            NatsJwtError::UntrustedIssuer("NROGUE".to_string()),
            NatsJwtError::InvalidSignature,
            NatsJwtError::Key("bad seed".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
