use crate::{AuthnError, AuthnResult, JwksKeystore};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of "now" in epoch seconds. Injected so boundary tests can fix wall
/// time; production uses the system clock.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The assertions extracted from a validated service-account token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub issuer: String,
    pub audience: Vec<String>,
    pub issued_at: i64,
    pub not_before: Option<i64>,
    pub expires: i64,
    pub namespace: String,
    pub service_account: String,
}

/// Verifies service-account tokens against the cluster JWKS.
///
/// Signature verification delegates to the keystore; registered-claim checks
/// run against the injected clock, so `jsonwebtoken`'s own time validation is
/// disabled. A token valid exactly at `nbf` is accepted; a token whose `exp`
/// equals now is not.
pub struct TokenValidator {
    keystore: Arc<JwksKeystore>,
    checks: ClaimChecks,
    clock: Clock,
}

impl TokenValidator {
    pub fn new(
        keystore: Arc<JwksKeystore>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            keystore,
            checks: ClaimChecks {
                issuer: issuer.into(),
                audience: audience.into(),
                leeway: 1,
            },
            clock: Arc::new(now_epoch_seconds),
        }
    }

    /// Replaces the clock. Intended for tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn validate(&self, token: &str) -> AuthnResult<Claims> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|_| AuthnError::InvalidSignature)?;
        if header.alg != Algorithm::RS256 {
            // Covers alg=none downgrades along with every other algorithm.
            return Err(AuthnError::InvalidSignature);
        }
        let kid = header.kid.ok_or(AuthnError::InvalidSignature)?;

        let key = match self.keystore.key_for(&kid).await {
            Ok(key) => key,
            Err(AuthnError::UnknownKey(_)) => return Err(AuthnError::InvalidSignature),
            Err(err) => return Err(err),
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let decoded = jsonwebtoken::decode::<RawClaims>(token, &key, &validation).map_err(
            |err| match err.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidToken
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidAlgorithmName => AuthnError::InvalidSignature,
                _ => AuthnError::InvalidClaims,
            },
        )?;

        self.checks.check(decoded.claims, (self.clock)())
    }
}

// Registered-claim and identity checks, separated from signature handling so
// they can be exercised against a fixed clock.
struct ClaimChecks {
    issuer: String,
    audience: String,
    leeway: i64,
}

impl ClaimChecks {
    fn check(&self, raw: RawClaims, now: i64) -> AuthnResult<Claims> {
        let sa = raw.kubernetes.ok_or(AuthnError::MissingKubernetesClaims)?;
        let (namespace, service_account) = match (sa.namespace, sa.name) {
            (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => (ns, name),
            _ => return Err(AuthnError::MissingKubernetesClaims),
        };

        let issuer = raw.issuer.ok_or(AuthnError::InvalidClaims)?;
        if issuer != self.issuer {
            return Err(AuthnError::InvalidClaims);
        }

        // Kubernetes tokens carry a list audience; membership, not equality.
        let audience = raw.audience.into_vec();
        if !audience.iter().any(|aud| aud == &self.audience) {
            return Err(AuthnError::InvalidClaims);
        }

        let expires = raw.expires.ok_or(AuthnError::InvalidClaims)?;
        if now >= expires {
            return Err(AuthnError::ExpiredToken);
        }
        if let Some(nbf) = raw.not_before {
            if now + self.leeway < nbf {
                return Err(AuthnError::ExpiredToken);
            }
        }
        let issued_at = raw.issued_at.ok_or(AuthnError::InvalidClaims)?;
        if issued_at > now + self.leeway {
            return Err(AuthnError::ExpiredToken);
        }

        Ok(Claims {
            issuer,
            audience,
            issued_at,
            not_before: raw.not_before,
            expires,
            namespace,
            service_account,
        })
    }
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(rename = "iss")]
    issuer: Option<String>,
    #[serde(rename = "aud", default)]
    audience: Audience,
    #[serde(rename = "iat")]
    issued_at: Option<i64>,
    #[serde(rename = "nbf")]
    not_before: Option<i64>,
    #[serde(rename = "exp")]
    expires: Option<i64>,
    #[serde(rename = "kubernetes.io/serviceaccount")]
    kubernetes: Option<ServiceAccountClaim>,
}

#[derive(Debug, Deserialize)]
struct ServiceAccountClaim {
    namespace: Option<String>,
    name: Option<String>,
}

// `aud` is a single string or a list depending on how the token was minted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn into_vec(self) -> Vec<String> {
        match self {
            Audience::One(aud) => vec![aud],
            Audience::Many(auds) => auds,
        }
    }
}

impl Default for Audience {
    fn default() -> Self {
        Audience::Many(Vec::new())
    }
}
