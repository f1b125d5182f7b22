// Test fakes shared by the authorizer and callout tests.

use crate::authorize::{ClaimsValidator, PermissionSource};
use crate::index::PermissionSet;
use async_trait::async_trait;
use std::collections::HashMap;
use warden_authn::{AuthnError, AuthnResult, Claims};

// Validator mapping exact token strings to canned outcomes; anything else is
// an invalid signature.
pub struct FakeValidator {
    outcomes: HashMap<String, AuthnResult<Claims>>,
}

impl FakeValidator {
    pub fn with(outcomes: Vec<(&str, AuthnResult<Claims>)>) -> Self {
        Self {
            outcomes: outcomes
                .into_iter()
                .map(|(token, outcome)| (token.to_string(), outcome))
                .collect(),
        }
    }
}

#[async_trait]
impl ClaimsValidator for FakeValidator {
    async fn validate(&self, token: &str) -> AuthnResult<Claims> {
        match self.outcomes.get(token) {
            Some(Ok(claims)) => Ok(claims.clone()),
            Some(Err(err)) => Err(clone_error(err)),
            None => Err(AuthnError::InvalidSignature),
        }
    }
}

pub fn clone_error(err: &AuthnError) -> AuthnError {
    match err {
        AuthnError::ExpiredToken => AuthnError::ExpiredToken,
        AuthnError::InvalidSignature => AuthnError::InvalidSignature,
        AuthnError::InvalidClaims => AuthnError::InvalidClaims,
        AuthnError::MissingKubernetesClaims => AuthnError::MissingKubernetesClaims,
        AuthnError::UnknownKey(kid) => AuthnError::UnknownKey(kid.clone()),
        AuthnError::Transient(msg) => AuthnError::Transient(msg.clone()),
    }
}

pub struct FakeIndex {
    entries: HashMap<String, PermissionSet>,
}

impl FakeIndex {
    pub fn with(entries: Vec<(&str, PermissionSet)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(key, set)| (key.to_string(), set))
                .collect(),
        }
    }
}

impl PermissionSource for FakeIndex {
    fn permissions(&self, namespace: &str, name: &str) -> Option<PermissionSet> {
        self.entries.get(&format!("{namespace}/{name}")).cloned()
    }
}

pub fn claims(namespace: &str, service_account: &str) -> Claims {
    Claims {
        issuer: "https://kubernetes.default.svc".to_string(),
        audience: vec!["nats".to_string()],
        issued_at: 1_000,
        not_before: None,
        expires: 1_300,
        namespace: namespace.to_string(),
        service_account: service_account.to_string(),
    }
}

pub fn default_only(namespace: &str) -> PermissionSet {
    PermissionSet {
        publish: vec![format!("{namespace}.>")],
        subscribe: vec![format!("{namespace}.>")],
    }
}
