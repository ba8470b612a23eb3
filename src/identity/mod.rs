//! Identity handling: token verification against the identity provider,
//! the provider's privileged admin surface, and the dashboard session layer.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod provider;
mod session;
mod token;

pub use principal::VerifiedIdentity;
pub use provider::{Account, DirectoryProvider, IdentityProvider};
pub use session::{Session, SessionManager, SessionToken};
pub use token::{extract_bearer_token, mint_hs_token, HsVerifier, JwksVerifier, TokenVerifier};
