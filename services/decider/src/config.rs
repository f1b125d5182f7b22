use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// Default endpoints for a decider running inside the cluster it authorizes.
const IN_CLUSTER_ISSUER: &str = "https://kubernetes.default.svc";
const IN_CLUSTER_JWKS_URL: &str = "https://kubernetes.default.svc/openid/v1/jwks";

const DEFAULT_AUDIENCE: &str = "nats";
const DEFAULT_JWKS_REFRESH_SECS: u64 = 3600;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

// Decider configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct DeciderConfig {
    // NATS server to consume callout requests from.
    pub nats_url: String,
    // Credentials authenticating the decider's own connection.
    pub nats_creds_file: Option<PathBuf>,
    // Account public key stamped into issued user tokens.
    pub nats_account: Option<String>,
    // Account nkey seed used to sign responses; ephemeral when unset.
    pub nats_signing_key_file: Option<PathBuf>,
    // Server public keys trusted to sign authorization requests.
    pub nats_callout_issuers: Vec<String>,
    // JWKS endpoint serving the cluster's token-signing keys.
    pub jwks_url: String,
    // Expected `iss` claim on client tokens.
    pub jwt_issuer: String,
    // Expected entry in the `aud` claim on client tokens.
    pub jwt_audience: String,
    // In-cluster Kubernetes client configuration vs kubeconfig.
    pub in_cluster: bool,
    // Scheduled JWKS refresh interval.
    pub jwks_refresh_interval: Duration,
    // Optional cap on concurrently handled callout requests.
    pub max_inflight: Option<usize>,
    // Grace period for in-flight handlers at shutdown.
    pub drain_timeout: Duration,
    // Liveness and metrics HTTP listener.
    pub metrics_bind: SocketAddr,
}

impl DeciderConfig {
    pub fn from_env() -> Result<Self> {
        let nats_url = match std::env::var("WARDEN_NATS_URL") {
            Ok(value) if !value.is_empty() => value,
            _ => bail!("WARDEN_NATS_URL is required"),
        };
        let nats_creds_file = std::env::var("WARDEN_NATS_CREDS_FILE")
            .ok()
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let nats_account = std::env::var("WARDEN_NATS_ACCOUNT")
            .ok()
            .filter(|value| !value.is_empty());
        let nats_signing_key_file = std::env::var("WARDEN_NATS_SIGNING_KEY_FILE")
            .ok()
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let in_cluster = std::env::var("WARDEN_IN_CLUSTER")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        // Outside the cluster there is no endpoint to assume.
        let jwks_url = match std::env::var("WARDEN_JWKS_URL") {
            Ok(value) if !value.is_empty() => value,
            _ if in_cluster => IN_CLUSTER_JWKS_URL.to_string(),
            _ => bail!("WARDEN_JWKS_URL is required when not running in-cluster"),
        };
        let jwt_issuer = std::env::var("WARDEN_JWT_ISSUER")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| IN_CLUSTER_ISSUER.to_string());
        let jwt_audience = std::env::var("WARDEN_JWT_AUDIENCE")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_AUDIENCE.to_string());

        // The callout trust root. Requests not signed by one of these keys
        // are discarded, so an empty set would refuse every connection.
        let nats_callout_issuers: Vec<String> = std::env::var("WARDEN_NATS_CALLOUT_ISSUERS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if nats_callout_issuers.is_empty() {
            bail!("WARDEN_NATS_CALLOUT_ISSUERS is required");
        }

        let jwks_refresh_interval = std::env::var("WARDEN_JWKS_REFRESH_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_JWKS_REFRESH_SECS));
        let max_inflight = std::env::var("WARDEN_MAX_INFLIGHT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0);
        let drain_timeout = std::env::var("WARDEN_DRAIN_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS));
        let metrics_bind = std::env::var("WARDEN_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse WARDEN_METRICS_BIND")?;

        Ok(Self {
            nats_url,
            nats_creds_file,
            nats_account,
            nats_signing_key_file,
            nats_callout_issuers,
            jwks_url,
            jwt_issuer,
            jwt_audience,
            in_cluster,
            jwks_refresh_interval,
            max_inflight,
            drain_timeout,
            metrics_bind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    // Helper to clear all warden env vars between tests.
    fn clear_warden_env() {
        for (key, _) in env::vars() {
            if key.starts_with("WARDEN_") {
                env::remove_var(key);
            }
        }
    }

    #[test]
    #[serial]
    fn requires_nats_url() {
        clear_warden_env();
        let err = DeciderConfig::from_env().expect_err("missing NATS url");
        assert!(err.to_string().contains("WARDEN_NATS_URL"));
    }

    #[test]
    #[serial]
    fn requires_jwks_url_outside_the_cluster() {
        clear_warden_env();
        env::set_var("WARDEN_NATS_URL", "nats://127.0.0.1:4222");
        let err = DeciderConfig::from_env().expect_err("missing JWKS url");
        assert!(err.to_string().contains("WARDEN_JWKS_URL"));
    }

    #[test]
    #[serial]
    fn requires_callout_trust_root() {
        clear_warden_env();
        env::set_var("WARDEN_NATS_URL", "nats://127.0.0.1:4222");
        env::set_var("WARDEN_JWKS_URL", "https://oidc.example/jwks");
        let err = DeciderConfig::from_env().expect_err("missing trust root");
        assert!(err.to_string().contains("WARDEN_NATS_CALLOUT_ISSUERS"));

        // Whitespace and stray commas do not count as a trust root.
        env::set_var("WARDEN_NATS_CALLOUT_ISSUERS", " , ,");
        assert!(DeciderConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn in_cluster_defaults_cover_jwks_and_issuer() {
        clear_warden_env();
        env::set_var("WARDEN_NATS_URL", "nats://127.0.0.1:4222");
        env::set_var("WARDEN_IN_CLUSTER", "true");
        env::set_var("WARDEN_NATS_CALLOUT_ISSUERS", "NSERVERKEY");

        let config = DeciderConfig::from_env().expect("config");
        assert_eq!(config.jwks_url, IN_CLUSTER_JWKS_URL);
        assert_eq!(config.jwt_issuer, IN_CLUSTER_ISSUER);
        assert_eq!(config.jwt_audience, "nats");
        assert!(config.in_cluster);
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert!(config.max_inflight.is_none());
    }

    #[test]
    #[serial]
    fn explicit_values_override_defaults() {
        clear_warden_env();
        env::set_var("WARDEN_NATS_URL", "nats://nats.example:4222");
        env::set_var("WARDEN_JWKS_URL", "https://oidc.example/jwks");
        env::set_var("WARDEN_JWT_ISSUER", "https://oidc.example");
        env::set_var("WARDEN_JWT_AUDIENCE", "messaging");
        env::set_var("WARDEN_NATS_CALLOUT_ISSUERS", "NSERVERA, NSERVERB");
        env::set_var("WARDEN_MAX_INFLIGHT", "64");
        env::set_var("WARDEN_JWKS_REFRESH_INTERVAL_SECS", "600");
        env::set_var("WARDEN_METRICS_BIND", "127.0.0.1:9100");

        let config = DeciderConfig::from_env().expect("config");
        assert_eq!(config.jwks_url, "https://oidc.example/jwks");
        assert_eq!(config.nats_callout_issuers, vec!["NSERVERA", "NSERVERB"]);
        assert_eq!(config.jwt_issuer, "https://oidc.example");
        assert_eq!(config.jwt_audience, "messaging");
        assert_eq!(config.max_inflight, Some(64));
        assert_eq!(config.jwks_refresh_interval, Duration::from_secs(600));
        assert_eq!(config.metrics_bind.port(), 9100);
    }

    #[test]
    #[serial]
    fn rejects_unparseable_metrics_bind() {
        clear_warden_env();
        env::set_var("WARDEN_NATS_URL", "nats://127.0.0.1:4222");
        env::set_var("WARDEN_JWKS_URL", "https://oidc.example/jwks");
        env::set_var("WARDEN_NATS_CALLOUT_ISSUERS", "NSERVERKEY");
        env::set_var("WARDEN_METRICS_BIND", "not-an-address");
        assert!(DeciderConfig::from_env().is_err());
    }
}
