use crate::{NatsJwtError, NatsJwtResult};
use data_encoding::{BASE32HEX_NOPAD, BASE64URL_NOPAD};
use nkeys::KeyPair;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

const JWT_HEADER: &str = r#"{"typ":"JWT","alg":"ed25519-nkey"}"#;

/// Claims object version used across the NATS v2 JWT family.
pub const CLAIMS_VERSION: i64 = 2;

pub(crate) const USER_CLAIM_TYPE: &str = "user";

/// Outer envelope shared by every NATS JWT; `P` is the `nats` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims<P> {
    /// Seconds since the epoch at which the token was issued.
    #[serde(rename = "iat")]
    pub issued_at: i64,

    /// Public key of the signing nkey; stamped by [`Claims::encode`].
    #[serde(rename = "iss")]
    pub issuer: String,

    /// Base32hex SHA-256 of the claims with this field empty.
    #[serde(rename = "jti", default)]
    pub jwt_id: String,

    /// Public key of the entity the claims are about.
    pub sub: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "aud", default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,

    /// Seconds since the epoch at which the token expires.
    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,

    pub nats: P,
}

impl<P> Claims<P> {
    pub fn new(subject: impl Into<String>, nats: P) -> Self {
        Self {
            issued_at: now_epoch_seconds(),
            issuer: String::new(),
            jwt_id: String::new(),
            sub: subject.into(),
            name: None,
            audience: None,
            expires: None,
            nats,
        }
    }

    #[must_use]
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    #[must_use]
    pub fn expires(mut self, expires: i64) -> Self {
        self.expires = Some(expires);
        self
    }
}

impl<P: Serialize> Claims<P> {
    /// Signs the claims with `signing_key` and returns the compact JWT.
    ///
    /// The issuer is always the signing key's public key, and the `jti` is
    /// recomputed from the serialized body, matching how the NATS tooling
    /// encodes its tokens.
    pub fn encode(mut self, signing_key: &KeyPair) -> NatsJwtResult<String> {
        self.issuer = signing_key.public_key();
        self.jwt_id = String::new();

        let body = serde_json::to_string(&self)?;
        let digest = Sha256::digest(body.as_bytes());
        self.jwt_id = BASE32HEX_NOPAD.encode(digest.as_slice());
        let body = serde_json::to_string(&self)?;

        let signing_input = format!(
            "{}.{}",
            BASE64URL_NOPAD.encode(JWT_HEADER.as_bytes()),
            BASE64URL_NOPAD.encode(body.as_bytes())
        );
        let signature = signing_key
            .sign(signing_input.as_bytes())
            .map_err(|err| NatsJwtError::Key(err.to_string()))?;

        Ok(format!(
            "{signing_input}.{}",
            BASE64URL_NOPAD.encode(&signature)
        ))
    }
}

/// Decodes a compact ed25519-nkey JWT and verifies it against a trust root.
///
/// The claimed issuer must be one of `trusted_issuers`, and the signature must
/// verify against that pinned public key. A key embedded in the token itself
/// proves nothing about who sent it; the trust root is the caller's.
pub fn decode_verified<P: DeserializeOwned>(
    token: &str,
    trusted_issuers: &[String],
) -> NatsJwtResult<Claims<P>> {
    let mut segments = token.split('.');
    let header_b64 = segments
        .next()
        .ok_or(NatsJwtError::Malformed("missing header"))?;
    let body_b64 = segments
        .next()
        .ok_or(NatsJwtError::Malformed("missing body"))?;
    let signature_b64 = segments
        .next()
        .ok_or(NatsJwtError::Malformed("missing signature"))?;
    if segments.next().is_some() {
        return Err(NatsJwtError::Malformed("extra segment"));
    }

    let header_bytes = BASE64URL_NOPAD
        .decode(header_b64.as_bytes())
        .map_err(|_| NatsJwtError::Malformed("header encoding"))?;
    let header: Header =
        serde_json::from_slice(&header_bytes).map_err(|_| NatsJwtError::Malformed("header json"))?;
    if header.alg != "ed25519-nkey" {
        return Err(NatsJwtError::Malformed("unsupported algorithm"));
    }

    let body_bytes = BASE64URL_NOPAD
        .decode(body_b64.as_bytes())
        .map_err(|_| NatsJwtError::Malformed("body encoding"))?;
    let claims: Claims<P> = serde_json::from_slice(&body_bytes)?;

    let Some(issuer_key) = trusted_issuers.iter().find(|key| **key == claims.issuer) else {
        return Err(NatsJwtError::UntrustedIssuer(claims.issuer));
    };

    let signature = BASE64URL_NOPAD
        .decode(signature_b64.as_bytes())
        .map_err(|_| NatsJwtError::Malformed("signature encoding"))?;
    let issuer =
        KeyPair::from_public_key(issuer_key).map_err(|err| NatsJwtError::Key(err.to_string()))?;
    let signing_input = format!("{header_b64}.{body_b64}");
    issuer
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| NatsJwtError::InvalidSignature)?;

    Ok(claims)
}

/// Subject patterns a user may (or may not) touch.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct NatsPermissions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

impl NatsPermissions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// Publish and subscribe permissions, serialized as `pub` / `sub`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PermissionsMap {
    #[serde(rename = "pub", default, skip_serializing_if = "NatsPermissions::is_empty")]
    pub publish: NatsPermissions,

    #[serde(rename = "sub", default, skip_serializing_if = "NatsPermissions::is_empty")]
    pub subscribe: NatsPermissions,
}

/// `nats` payload of a user claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(flatten)]
    pub permissions: PermissionsMap,

    /// Account the user belongs to, required when the token is signed with an
    /// account signing key rather than the account identity key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer_account: String,

    /// Maximum subscriptions; -1 is unlimited.
    pub subs: i64,

    /// Maximum message data in bytes; -1 is unlimited.
    pub data: i64,

    /// Maximum message payload in bytes; -1 is unlimited.
    pub payload: i64,

    #[serde(default)]
    pub bearer_token: bool,

    #[serde(rename = "type")]
    pub claim_type: String,

    pub version: i64,
}

impl User {
    pub fn new(issuer_account: impl Into<String>) -> Self {
        Self {
            permissions: PermissionsMap::default(),
            issuer_account: issuer_account.into(),
            subs: -1,
            data: -1,
            payload: -1,
            bearer_token: false,
            claim_type: USER_CLAIM_TYPE.to_string(),
            version: CLAIMS_VERSION,
        }
    }

    #[must_use]
    pub fn allow_publish(mut self, subjects: impl IntoIterator<Item = String>) -> Self {
        self.permissions.publish.allow.extend(subjects);
        self
    }

    #[must_use]
    pub fn allow_subscribe(mut self, subjects: impl IntoIterator<Item = String>) -> Self {
        self.permissions.subscribe.allow.extend(subjects);
        self
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    #[allow(dead_code)]
    typ: String,
    alg: String,
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_claims_roundtrip() {
        let signing_key = KeyPair::new_account();
        let user_key = KeyPair::new_user();

        let user = User::new("ACCOUNTPUBLICKEY")
            .allow_publish(vec!["prod.>".to_string()])
            .allow_subscribe(vec!["prod.>".to_string(), "_INBOX.>".to_string()]);
        let token = Claims::new(user_key.public_key(), user)
            .expires(now_epoch_seconds() + 300)
            .encode(&signing_key)
            .expect("encode");

        let decoded: Claims<User> =
            decode_verified(&token, &[signing_key.public_key()]).expect("decode");
        assert_eq!(decoded.issuer, signing_key.public_key());
        assert_eq!(decoded.sub, user_key.public_key());
        assert_eq!(decoded.nats.claim_type, USER_CLAIM_TYPE);
        assert_eq!(decoded.nats.permissions.publish.allow, vec!["prod.>"]);
        assert_eq!(
            decoded.nats.permissions.subscribe.allow,
            vec!["prod.>", "_INBOX.>"]
        );
        assert!(!decoded.jwt_id.is_empty());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let signing_key = KeyPair::new_account();
        let user = User::new("ACCOUNTPUBLICKEY");
        let token = Claims::new("UVICTIM", user).encode(&signing_key).expect("encode");

        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_body = BASE64URL_NOPAD.encode(
            format!(
                r#"{{"iat":1,"iss":"{}","jti":"","sub":"UFORGED","nats":{{"subs":-1,"data":-1,"payload":-1,"type":"user","version":2}}}}"#,
                signing_key.public_key()
            )
            .as_bytes(),
        );
        parts[1] = forged_body.as_str();
        let forged = parts.join(".");

        let err = decode_verified::<User>(&forged, &[signing_key.public_key()])
            .expect_err("forged");
        assert!(matches!(err, NatsJwtError::InvalidSignature));
    }

    #[test]
    fn issuer_outside_the_trust_root_is_rejected() {
        // A valid, self-consistent token from a key nobody pinned.
        let rogue_key = KeyPair::new_account();
        let trusted_key = KeyPair::new_account();
        let token = Claims::new("UUSER", User::new(""))
            .encode(&rogue_key)
            .expect("encode");

        let err = decode_verified::<User>(&token, &[trusted_key.public_key()])
            .expect_err("untrusted issuer");
        assert!(matches!(err, NatsJwtError::UntrustedIssuer(_)));
    }

    #[test]
    fn rejects_foreign_algorithms() {
        // A standard RS256 header is not an nkey token.
        let header = BASE64URL_NOPAD.encode(br#"{"typ":"JWT","alg":"RS256"}"#);
        let body = BASE64URL_NOPAD.encode(br#"{"iat":1,"iss":"x","sub":"y","nats":{}}"#);
        let token = format!("{header}.{body}.c2ln");

        let err = decode_verified::<serde_json::Value>(&token, &["x".to_string()]).expect_err("alg");
        assert!(matches!(err, NatsJwtError::Malformed(_)));
    }

    #[test]
    fn empty_permissions_are_omitted_from_the_wire() {
        let signing_key = KeyPair::new_account();
        let token = Claims::new("UUSER", User::new(""))
            .encode(&signing_key)
            .expect("encode");

        let body_b64 = token.split('.').nth(1).expect("body");
        let body: serde_json::Value =
            serde_json::from_slice(&BASE64URL_NOPAD.decode(body_b64.as_bytes()).expect("b64"))
                .expect("json");
        assert!(body["nats"].get("pub").is_none());
        assert!(body["nats"].get("sub").is_none());
        assert!(body["nats"].get("issuer_account").is_none());
    }
}
