use crate::index::{PermissionSet, ServiceAccountIndex};
use async_trait::async_trait;
use std::sync::Arc;
use warden_authn::{AuthnError, AuthnResult, Claims, TokenValidator};

/// Outcome of an authorization. `Deny` is a single uninhabited refusal: which
/// step failed is recorded in metrics and logs, never in the decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow {
        publish: Vec<String>,
        subscribe: Vec<String>,
    },
    Deny,
}

/// The slice of the validator the decider needs.
#[async_trait]
pub trait ClaimsValidator: Send + Sync {
    async fn validate(&self, token: &str) -> AuthnResult<Claims>;
}

#[async_trait]
impl ClaimsValidator for TokenValidator {
    async fn validate(&self, token: &str) -> AuthnResult<Claims> {
        TokenValidator::validate(self, token).await
    }
}

/// The slice of the index the decider needs.
pub trait PermissionSource: Send + Sync {
    fn permissions(&self, namespace: &str, name: &str) -> Option<PermissionSet>;
}

impl PermissionSource for ServiceAccountIndex {
    fn permissions(&self, namespace: &str, name: &str) -> Option<PermissionSet> {
        ServiceAccountIndex::permissions(self, namespace, name)
    }
}

/// Composes token validation and the ServiceAccount index into a yes/no plus
/// permission tuple.
pub struct Authorizer {
    validator: Arc<dyn ClaimsValidator>,
    permissions: Arc<dyn PermissionSource>,
}

impl Authorizer {
    pub fn new(validator: Arc<dyn ClaimsValidator>, permissions: Arc<dyn PermissionSource>) -> Self {
        Self {
            validator,
            permissions,
        }
    }

    pub async fn authorize(&self, token: &str) -> Decision {
        if token.is_empty() {
            metrics::counter!("warden_missing_token_total").increment(1);
            return Decision::Deny;
        }

        let claims = match self.validator.validate(token).await {
            Ok(claims) => claims,
            Err(err) => {
                record_denial(&err);
                return Decision::Deny;
            }
        };

        // An account the watch has not seen is denied outright; the index's
        // eventual consistency is resolved by the client's next reconnect,
        // not by retrying here.
        let Some(set) = self
            .permissions
            .permissions(&claims.namespace, &claims.service_account)
        else {
            metrics::counter!("warden_unknown_service_account_total").increment(1);
            tracing::debug!(
                namespace = %claims.namespace,
                service_account = %claims.service_account,
                "service account not in index"
            );
            return Decision::Deny;
        };

        Decision::Allow {
            publish: set.publish,
            subscribe: set.subscribe,
        }
    }
}

fn record_denial(err: &AuthnError) {
    match err {
        AuthnError::ExpiredToken => {
            metrics::counter!("warden_expired_token_total").increment(1);
        }
        AuthnError::InvalidSignature | AuthnError::UnknownKey(_) => {
            metrics::counter!("warden_invalid_signature_total").increment(1);
        }
        AuthnError::InvalidClaims => {
            metrics::counter!("warden_invalid_claims_total").increment(1);
        }
        AuthnError::MissingKubernetesClaims => {
            metrics::counter!("warden_missing_kubernetes_claims_total").increment(1);
        }
        AuthnError::Transient(_) => {
            metrics::counter!("warden_transient_error_total").increment(1);
        }
    }
    tracing::debug!(error = %err, "token validation failed");
}
