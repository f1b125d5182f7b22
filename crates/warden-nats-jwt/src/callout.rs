use crate::claims::{decode_verified, Claims, CLAIMS_VERSION};
use crate::{NatsJwtError, NatsJwtResult};
use serde::{Deserialize, Serialize};

/// Audience the server stamps on authorization requests.
pub const AUTH_REQUEST_AUDIENCE: &str = "nats-authorization-request";

const AUTH_REQUEST_CLAIM_TYPE: &str = "authorization_request";
const AUTH_RESPONSE_CLAIM_TYPE: &str = "authorization_response";

/// `nats` payload of the authorization request the server sends for every
/// connection attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthRequest {
    pub server_id: ServerId,

    /// Public key the issued user claim must be scoped to.
    pub user_nkey: String,

    #[serde(default)]
    pub connect_opts: ConnectOptions,

    #[serde(rename = "type", default)]
    pub claim_type: String,

    #[serde(default)]
    pub version: i64,
}

impl AuthRequest {
    /// Decodes a signed authorization request against the callout trust root:
    /// the set of server public keys pinned at configuration time. A request
    /// issued by any other key is rejected before its contents are looked at.
    pub fn decode(token: &str, trusted_issuers: &[String]) -> NatsJwtResult<Claims<AuthRequest>> {
        let claims: Claims<AuthRequest> = decode_verified(token, trusted_issuers)?;
        if claims.nats.claim_type != AUTH_REQUEST_CLAIM_TYPE {
            return Err(NatsJwtError::UnexpectedClaimType(
                claims.nats.claim_type.clone(),
            ));
        }
        if claims.nats.version != CLAIMS_VERSION {
            return Err(NatsJwtError::Malformed("unsupported claims version"));
        }
        if claims.nats.user_nkey.is_empty() {
            return Err(NatsJwtError::Malformed("missing user nkey"));
        }
        Ok(claims)
    }
}

/// Identity of the server that forwarded the connection attempt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerId {
    /// Public nkey of the server; authorization responses are addressed to it.
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub version: String,
}

/// Connection options the client supplied in its CONNECT, as relayed by the
/// server. Only the credential fields matter to the decider; the rest is
/// client metadata useful in logs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectOptions {
    #[serde(default)]
    pub jwt: String,

    #[serde(default)]
    pub auth_token: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub lang: String,

    #[serde(default)]
    pub version: String,
}

impl ConnectOptions {
    /// The client credential: the `jwt` field, falling back to `auth_token`.
    pub fn credential(&self) -> &str {
        if !self.jwt.is_empty() {
            &self.jwt
        } else {
            &self.auth_token
        }
    }
}

/// `nats` payload of the authorization response. Exactly one of `jwt` and
/// `error` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jwt: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer_account: String,

    #[serde(rename = "type")]
    pub claim_type: String,

    pub version: i64,
}

impl AuthResponse {
    pub fn allowed(user_jwt: impl Into<String>) -> Self {
        Self {
            jwt: user_jwt.into(),
            error: String::new(),
            issuer_account: String::new(),
            claim_type: AUTH_RESPONSE_CLAIM_TYPE.to_string(),
            version: CLAIMS_VERSION,
        }
    }

    pub fn denied(error: impl Into<String>) -> Self {
        Self {
            jwt: String::new(),
            error: error.into(),
            issuer_account: String::new(),
            claim_type: AUTH_RESPONSE_CLAIM_TYPE.to_string(),
            version: CLAIMS_VERSION,
        }
    }
}
