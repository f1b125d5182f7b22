//! Authentication primitives for the warden decider.
//!
//! # Purpose
//! Validates Kubernetes-projected service-account tokens: fetches and rotates
//! the cluster JWKS, verifies RS256 signatures, checks the registered claims,
//! and extracts the workload identity (namespace + service-account name).
//!
//! # How it fits
//! The decider service composes the [`TokenValidator`] with its
//! ServiceAccount index to turn a bearer token into a permission set. This
//! crate performs no I/O beyond the JWKS endpoint.
//!
//! # Key invariants
//! - Only `alg = RS256` tokens are accepted; `none` is rejected outright.
//! - An unknown key id triggers at most one JWKS refresh per cooldown window,
//!   regardless of how many lookups miss.
//! - A failed refresh never clears the last good key snapshot.

mod errors;
mod keystore;
mod validator;

pub use errors::{AuthnError, AuthnResult};
pub use keystore::{JwksKeystore, DEFAULT_REFRESH_COOLDOWN};
pub use validator::{Claims, Clock, TokenValidator};
