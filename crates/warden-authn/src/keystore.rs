use crate::{AuthnError, AuthnResult};
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm};
use jsonwebtoken::DecodingKey;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Minimum spacing between JWKS refreshes, regardless of what triggered them.
pub const DEFAULT_REFRESH_COOLDOWN: Duration = Duration::from_secs(300);

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cache of the cluster's token-signing keys, indexed by `kid`.
///
/// Kubernetes rotates its OIDC signing keys with overlap. The scheduled
/// refresh loop covers the steady state; a lookup for a key id that is not in
/// the cache forces an immediate refresh to close the window between a
/// rotation and the next tick. The cooldown bounds how often a storm of
/// lookups against a nonexistent key id can hit the endpoint.
pub struct JwksKeystore {
    url: String,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
    // None until the first post-bootstrap refresh, so a rotation right after
    // startup is still picked up on demand.
    last_refresh: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl JwksKeystore {
    /// Fetches the JWKS once and builds the keystore. A failure here is fatal
    /// to the process; there is no key material to fall back on.
    pub async fn bootstrap(url: impl Into<String>) -> AuthnResult<Self> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|err| AuthnError::Transient(format!("build http client: {err}")))?;

        let keys = fetch_keys(&client, &url).await?;
        tracing::info!(url = %url, keys = keys.len(), "jwks loaded");
        metrics::gauge!("warden_jwks_keys").set(keys.len() as f64);

        Ok(Self {
            url,
            client,
            keys: RwLock::new(keys),
            last_refresh: Mutex::new(None),
            cooldown: DEFAULT_REFRESH_COOLDOWN,
        })
    }

    /// Overrides the refresh cooldown. Intended for tests.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Resolves a verification key by key id.
    ///
    /// A miss triggers a synchronous refresh when the cooldown allows it;
    /// otherwise the miss is reported without touching the endpoint.
    pub async fn key_for(&self, kid: &str) -> AuthnResult<DecodingKey> {
        if let Some(key) = self.cached(kid) {
            return Ok(key);
        }

        if !self.claim_refresh_slot() {
            return Err(AuthnError::UnknownKey(kid.to_string()));
        }

        tracing::debug!(kid = %kid, "unknown key id, refreshing jwks");
        self.refresh().await?;

        self.cached(kid)
            .ok_or_else(|| AuthnError::UnknownKey(kid.to_string()))
    }

    /// Spawns the scheduled refresh loop. The first tick fires one full
    /// interval after startup since `bootstrap` just loaded the set.
    pub fn run_refresh_loop(
        self: std::sync::Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // An on-demand refresh may have run moments ago; the
                        // cooldown applies to every cause equally.
                        if !self.claim_refresh_slot() {
                            continue;
                        }
                        if let Err(err) = self.refresh().await {
                            tracing::warn!(error = %err, "scheduled jwks refresh failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("jwks refresh loop stopping");
                        return;
                    }
                }
            }
        })
    }

    fn cached(&self, kid: &str) -> Option<DecodingKey> {
        self.keys
            .read()
            .expect("jwks lock poisoned")
            .get(kid)
            .cloned()
    }

    // Records a refresh attempt if the cooldown has elapsed. Returns false
    // when a refresh ran too recently to allow another.
    fn claim_refresh_slot(&self) -> bool {
        let mut last = self.last_refresh.lock().expect("refresh lock poisoned");
        match *last {
            Some(at) if at.elapsed() < self.cooldown => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    async fn refresh(&self) -> AuthnResult<()> {
        metrics::counter!("warden_jwks_refresh_total").increment(1);
        let fresh = match fetch_keys(&self.client, &self.url).await {
            Ok(keys) => keys,
            Err(err) => {
                // The previous snapshot stays in place.
                metrics::counter!("warden_jwks_refresh_failure_total").increment(1);
                return Err(err);
            }
        };

        metrics::gauge!("warden_jwks_keys").set(fresh.len() as f64);
        let mut keys = self.keys.write().expect("jwks lock poisoned");
        *keys = fresh;
        Ok(())
    }
}

async fn fetch_keys(
    client: &reqwest::Client,
    url: &str,
) -> AuthnResult<HashMap<String, DecodingKey>> {
    let set: JwkSet = client
        .get(url)
        .send()
        .await
        .map_err(|err| AuthnError::Transient(format!("fetch jwks: {err}")))?
        .error_for_status()
        .map_err(|err| AuthnError::Transient(format!("fetch jwks: {err}")))?
        .json()
        .await
        .map_err(|err| AuthnError::Transient(format!("decode jwks: {err}")))?;

    Ok(index_keys(&set))
}

// Keeps RSA keys usable for RS256 verification; everything else in the set is
// ignored. Keys without a kid cannot be selected by header and are skipped.
fn index_keys(set: &JwkSet) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();
    for jwk in &set.keys {
        if !matches!(jwk.algorithm, AlgorithmParameters::RSA(_)) {
            continue;
        }
        if matches!(jwk.common.key_algorithm, Some(alg) if alg != KeyAlgorithm::RS256) {
            continue;
        }
        let Some(kid) = jwk.common.key_id.clone() else {
            continue;
        };
        match DecodingKey::from_jwk(jwk) {
            Ok(key) => {
                keys.insert(kid, key);
            }
            Err(err) => {
                tracing::warn!(kid = %kid, error = %err, "skipping unusable jwk");
            }
        }
    }
    keys
}
