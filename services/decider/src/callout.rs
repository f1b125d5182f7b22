use crate::authorize::{Authorizer, Decision};
use anyhow::{Context, Result};
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use warden_nats_jwt::{AuthRequest, AuthResponse, Claims, ConnectOptions, KeyPair, User};

/// Subject the server publishes authorization requests on.
pub const AUTH_CALLOUT_SUBJECT: &str = "$SYS.REQ.USER.AUTH";

/// Issued user tokens live this long; revocation is by expiry, and the client
/// reconnect loop re-triggers authorization.
pub const USER_TOKEN_TTL: Duration = Duration::from_secs(300);

// The uniform refusal. Clients never learn which step failed.
const AUTH_ERROR: &str = "authorization failed";

/// Consumes signed authorization requests from the bus, runs them through the
/// authorizer, and replies with a signed user token or a refusal.
pub struct CalloutService {
    authorizer: Arc<Authorizer>,
    signing_key: KeyPair,
    issuer_account: String,
    // Server public keys allowed to issue authorization requests; the callout
    // trust root established at server configuration time.
    trusted_issuers: Vec<String>,
    limiter: Option<Arc<Semaphore>>,
    request_seq: AtomicU64,
}

impl CalloutService {
    /// `issuer_account` defaults to the signing key's public key, which is
    /// correct when the NATS server trusts that key directly.
    /// `trusted_issuers` are the server keys whose authorization requests are
    /// accepted; requests signed by anything else are dropped.
    pub fn new(
        authorizer: Arc<Authorizer>,
        signing_key: KeyPair,
        issuer_account: Option<String>,
        trusted_issuers: Vec<String>,
    ) -> Self {
        let issuer_account = issuer_account.unwrap_or_else(|| signing_key.public_key());
        Self {
            authorizer,
            signing_key,
            issuer_account,
            trusted_issuers,
            limiter: None,
            request_seq: AtomicU64::new(0),
        }
    }

    /// Caps concurrently running handlers. Unbounded when never called.
    #[must_use]
    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(max_inflight)));
        self
    }

    /// Serves callout requests until the connection ends or shutdown fires,
    /// then drains in-flight handlers within `drain_timeout`.
    pub async fn serve(
        self: Arc<Self>,
        client: async_nats::Client,
        mut shutdown: watch::Receiver<bool>,
        drain_timeout: Duration,
    ) -> Result<()> {
        let mut subscriber = client
            .subscribe(AUTH_CALLOUT_SUBJECT)
            .await
            .context("subscribe to auth callout subject")?;
        tracing::info!(subject = AUTH_CALLOUT_SUBJECT, "auth callout serving");

        let mut inflight = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                tracing::info!("auth callout draining");
                break;
            }
            // Reap finished handlers so the set does not grow unbounded.
            while inflight.try_join_next().is_some() {}

            tokio::select! {
                message = subscriber.next() => match message {
                    Some(message) => {
                        let permit = match &self.limiter {
                            Some(limiter) => {
                                match Arc::clone(limiter).acquire_owned().await {
                                    Ok(permit) => Some(permit),
                                    Err(_) => break,
                                }
                            }
                            None => None,
                        };
                        let service = Arc::clone(&self);
                        let client = client.clone();
                        inflight.spawn(async move {
                            let _permit = permit;
                            service.handle(client, message).await;
                        });
                    }
                    None => {
                        tracing::warn!("auth callout subscription ended");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    tracing::info!("auth callout draining");
                    break;
                }
            }
        }

        let _ = subscriber.unsubscribe().await;
        let drain = async {
            while inflight.join_next().await.is_some() {}
        };
        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            tracing::warn!("drain grace expired with handlers still in flight");
            inflight.shutdown().await;
        }
        tracing::info!("auth callout stopped");
        Ok(())
    }

    async fn handle(self: Arc<Self>, client: async_nats::Client, message: async_nats::Message) {
        let request_id = self.request_seq.fetch_add(1, Ordering::Relaxed);
        let Some(reply) = message.reply.clone() else {
            metrics::counter!("warden_request_without_reply_total").increment(1);
            tracing::warn!(request_id, "authorization request carried no reply subject");
            return;
        };

        let payload = String::from_utf8_lossy(&message.payload).into_owned();
        let Some(response) = self.process(&payload, request_id).await else {
            return;
        };
        if let Err(err) = client.publish(reply, response.into()).await {
            tracing::warn!(request_id, error = %err, "failed to publish authorization reply");
        }
    }

    /// Turns one authorization-request token into a signed response token.
    /// Returns `None` when the request is unusable; the client then times out
    /// rather than receiving a reply it could not distinguish anyway.
    pub(crate) async fn process(&self, request_token: &str, request_id: u64) -> Option<String> {
        let request = match AuthRequest::decode(request_token, &self.trusted_issuers) {
            Ok(request) => request,
            Err(err) => {
                metrics::counter!("warden_invalid_request_total").increment(1);
                tracing::warn!(request_id, error = %err, "rejecting authorization request");
                return None;
            }
        };
        let user_nkey = request.nats.user_nkey.clone();
        let server_id = request.nats.server_id.id.clone();

        // A panicking handler must still answer with the uniform refusal.
        let response = match AssertUnwindSafe(self.decide(&request.nats.connect_opts, &user_nkey))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(_) => {
                metrics::counter!("warden_handler_panic_total").increment(1);
                tracing::error!(request_id, user_nkey = %user_nkey, "authorization handler panicked");
                AuthResponse::denied(AUTH_ERROR)
            }
        };

        match Claims::new(user_nkey.clone(), response)
            .audience(server_id)
            .encode(&self.signing_key)
        {
            Ok(token) => Some(token),
            Err(err) => {
                metrics::counter!("warden_response_sign_failure_total").increment(1);
                tracing::error!(request_id, error = %err, "failed to sign authorization response");
                None
            }
        }
    }

    async fn decide(&self, opts: &ConnectOptions, user_nkey: &str) -> AuthResponse {
        let credential = opts.credential();
        match self.authorizer.authorize(credential).await {
            Decision::Allow { publish, subscribe } => {
                let user = User::new(self.issuer_account.clone())
                    .allow_publish(publish)
                    .allow_subscribe(subscribe);
                let expires = now_epoch_seconds() + USER_TOKEN_TTL.as_secs() as i64;
                match Claims::new(user_nkey, user)
                    .expires(expires)
                    .encode(&self.signing_key)
                {
                    Ok(user_jwt) => {
                        metrics::counter!("warden_authorizations_allowed_total").increment(1);
                        AuthResponse::allowed(user_jwt)
                    }
                    Err(err) => {
                        metrics::counter!("warden_response_sign_failure_total").increment(1);
                        tracing::error!(user_nkey = %user_nkey, error = %err, "failed to sign user claim");
                        AuthResponse::denied(AUTH_ERROR)
                    }
                }
            }
            Decision::Deny => {
                metrics::counter!("warden_authorizations_denied_total").increment(1);
                AuthResponse::denied(AUTH_ERROR)
            }
        }
    }
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
    use crate::test_support::{claims, default_only, FakeIndex, FakeValidator};
    use serde_json::json;
    use warden_nats_jwt::decode_verified;

    // Returns the service plus the public key it signs responses with, since
    // decoding a response requires pinning that key.
    fn service(authorizer: Authorizer, server_key: &KeyPair) -> (CalloutService, String) {
        let signing_key = KeyPair::new_account();
        let signing_pub = signing_key.public_key();
        let service = CalloutService::new(
            Arc::new(authorizer),
            signing_key,
            None,
            vec![server_key.public_key()],
        );
        (service, signing_pub)
    }

    fn request_token(server_key: &KeyPair, user_nkey: &str, client_jwt: &str) -> String {
        let nats = json!({
            "server_id": { "id": "NSERVER", "name": "nats-0" },
            "user_nkey": user_nkey,
            "connect_opts": { "jwt": client_jwt, "lang": "rust" },
            "type": "authorization_request",
            "version": 2
        });
        Claims::new(user_nkey, nats)
            .audience("nats-authorization-request")
            .encode(server_key)
            .expect("encode request")
    }

    #[tokio::test]
    async fn allowed_request_gets_a_signed_user_token() {
        let authorizer = Authorizer::new(
            Arc::new(FakeValidator::with(vec![(
                "tok-api",
                Ok(claims("prod", "api")),
            )])),
            Arc::new(FakeIndex::with(vec![("prod/api", default_only("prod"))])),
        );
        let server_key = KeyPair::new_server();
        let (service, signing_pub) = service(authorizer, &server_key);
        let user_key = KeyPair::new_user();

        let response_token = service
            .process(
                &request_token(&server_key, &user_key.public_key(), "tok-api"),
                0,
            )
            .await
            .expect("reply");

        let decider_keys = [signing_pub];
        let response: Claims<AuthResponse> =
            decode_verified(&response_token, &decider_keys).expect("decode response");
        assert_eq!(response.sub, user_key.public_key());
        assert_eq!(response.audience.as_deref(), Some("NSERVER"));
        assert!(response.nats.error.is_empty());

        let user: Claims<User> =
            decode_verified(&response.nats.jwt, &decider_keys).expect("decode user claim");
        assert_eq!(user.sub, user_key.public_key());
        assert_eq!(user.nats.permissions.publish.allow, vec!["prod.>"]);
        assert_eq!(user.nats.permissions.subscribe.allow, vec!["prod.>"]);
        let expires = user.expires.expect("expiry");
        let ttl = expires - user.issued_at;
        assert!((299..=301).contains(&ttl), "unexpected ttl {ttl}");
    }

    #[tokio::test]
    async fn denied_request_gets_a_uniform_refusal() {
        let authorizer = Authorizer::new(
            Arc::new(FakeValidator::with(vec![(
                "tok-ghost",
                Ok(claims("prod", "ghost")),
            )])),
            Arc::new(FakeIndex::with(vec![("prod/api", default_only("prod"))])),
        );
        let server_key = KeyPair::new_server();
        let (service, signing_pub) = service(authorizer, &server_key);
        let user_key = KeyPair::new_user();

        let response_token = service
            .process(
                &request_token(&server_key, &user_key.public_key(), "tok-ghost"),
                0,
            )
            .await
            .expect("reply");

        let response: Claims<AuthResponse> =
            decode_verified(&response_token, &[signing_pub]).expect("decode response");
        assert_eq!(response.nats.error, "authorization failed");
        assert!(response.nats.jwt.is_empty());
    }

    #[tokio::test]
    async fn request_without_credential_is_denied() {
        let authorizer = Authorizer::new(
            Arc::new(FakeValidator::with(vec![])),
            Arc::new(FakeIndex::with(vec![("prod/api", default_only("prod"))])),
        );
        let server_key = KeyPair::new_server();
        let (service, signing_pub) = service(authorizer, &server_key);
        let user_key = KeyPair::new_user();

        let response_token = service
            .process(&request_token(&server_key, &user_key.public_key(), ""), 0)
            .await
            .expect("reply");

        let response: Claims<AuthResponse> =
            decode_verified(&response_token, &[signing_pub]).expect("decode response");
        assert_eq!(response.nats.error, "authorization failed");
    }

    #[tokio::test]
    async fn undecodable_request_gets_no_reply() {
        let authorizer = Authorizer::new(
            Arc::new(FakeValidator::with(vec![])),
            Arc::new(FakeIndex::with(vec![])),
        );
        let (service, _) = service(authorizer, &KeyPair::new_server());

        assert!(service.process("not-a-jwt", 0).await.is_none());
    }

    #[tokio::test]
    async fn request_from_untrusted_server_gets_no_reply() {
        let authorizer = Authorizer::new(
            Arc::new(FakeValidator::with(vec![(
                "tok-api",
                Ok(claims("prod", "api")),
            )])),
            Arc::new(FakeIndex::with(vec![("prod/api", default_only("prod"))])),
        );
        let trusted_server = KeyPair::new_server();
        let (service, _) = service(authorizer, &trusted_server);

        // Correctly signed, carries an admissible credential, but the signer
        // is not in the callout trust root.
        let rogue_server = KeyPair::new_server();
        let user_key = KeyPair::new_user();
        let token = request_token(&rogue_server, &user_key.public_key(), "tok-api");

        assert!(service.process(&token, 0).await.is_none());
    }

    #[tokio::test]
    async fn tampered_request_gets_no_reply() {
        let authorizer = Authorizer::new(
            Arc::new(FakeValidator::with(vec![])),
            Arc::new(FakeIndex::with(vec![])),
        );
        let server_key = KeyPair::new_server();
        let (service, _) = service(authorizer, &server_key);
        let user_key = KeyPair::new_user();

        let token = request_token(&server_key, &user_key.public_key(), "tok");
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        let signature = parts[2].clone();
        parts[2] = signature[..signature.len() - 4].to_string();
        let forged = parts.join(".");

        assert!(service.process(&forged, 0).await.is_none());
    }

    #[tokio::test]
    async fn issuer_account_is_stamped_into_user_claims() {
        let authorizer = Authorizer::new(
            Arc::new(FakeValidator::with(vec![(
                "tok-api",
                Ok(claims("prod", "api")),
            )])),
            Arc::new(FakeIndex::with(vec![("prod/api", default_only("prod"))])),
        );
        let account = KeyPair::new_account();
        let signing_key = KeyPair::new_account();
        let signing_pub = signing_key.public_key();
        let server_key = KeyPair::new_server();
        let service = CalloutService::new(
            Arc::new(authorizer),
            signing_key,
            Some(account.public_key()),
            vec![server_key.public_key()],
        );
        let user_key = KeyPair::new_user();

        let response_token = service
            .process(
                &request_token(&server_key, &user_key.public_key(), "tok-api"),
                0,
            )
            .await
            .expect("reply");
        let decider_keys = [signing_pub];
        let response: Claims<AuthResponse> =
            decode_verified(&response_token, &decider_keys).expect("decode response");
        let user: Claims<User> =
            decode_verified(&response.nats.jwt, &decider_keys).expect("decode user claim");
        assert_eq!(user.nats.issuer_account, account.public_key());
    }
}
