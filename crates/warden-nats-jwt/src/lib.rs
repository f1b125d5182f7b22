//! NATS-flavored JWTs for the auth-callout exchange.
//!
//! # Purpose
//! Encodes and decodes the three claim shapes the callout protocol uses:
//! the server's authorization request, the decider's authorization response,
//! and the user claim embedded in a successful response. All three are
//! ed25519-nkey JWTs, not RFC 7519 tokens: the algorithm is `ed25519-nkey`
//! and the `jti` is a base32hex SHA-256 of the claim body.
//!
//! # Key invariants
//! - `encode` stamps the signing key's public key into `iss`; callers never
//!   set the issuer themselves.
//! - `decode_verified` trusts only the caller's pinned issuer keys: a token
//!   whose `iss` is outside that set is rejected without signature checking,
//!   and the signature must verify against the pinned key, never against a
//!   key the token carries itself.

mod callout;
mod claims;
mod errors;

pub use callout::{AuthRequest, AuthResponse, ConnectOptions, ServerId, AUTH_REQUEST_AUDIENCE};
pub use claims::{decode_verified, Claims, NatsPermissions, PermissionsMap, User, CLAIMS_VERSION};
pub use errors::{NatsJwtError, NatsJwtResult};

/// Re-export so callers share one `KeyPair` type for signing and verification.
pub use nkeys::KeyPair;
