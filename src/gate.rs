//! Access gate / redirect relay.
//!
//! Given a caller's bearer token and a requested pillar number, verify the
//! token, load the permission record, evaluate effective access, and build
//! the redirect to the pillar's verification endpoint with the token as a
//! query parameter. Every step is a distinct terminal outcome; there are no
//! internal retries, the caller re-runs the whole flow.

use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::identity::{TokenVerifier, VerifiedIdentity};
use crate::permissions::Pillar;
use crate::storage::SharedStore;

/// Fixed verification path on every pillar application.
pub const VERIFY_PATH: &str = "/verify";

/// A granted redirect, plus what the handler needs for the grant log.
#[derive(Debug, Clone)]
pub struct PillarRedirect {
    pub location: String,
    /// Redirect target with the token parameter stripped; safe to log.
    pub logged_target: String,
    pub pillar: Pillar,
    pub identity: VerifiedIdentity,
    pub via_admin: bool,
}

pub async fn resolve_pillar_redirect(
    store: &SharedStore,
    verifier: &TokenVerifier,
    config: &AppConfig,
    raw_pillar: &str,
    bearer: Option<&str>,
) -> AppResult<PillarRedirect> {
    // 1. pillar number must be a routable integer in [1, 6]
    let pillar = raw_pillar
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(Pillar::routable)
        .ok_or_else(|| AppError::invalid("invalid_pillar", "pillar must be a number between 1 and 6"))?;

    // 2. a token must be present at all
    let token = bearer.ok_or_else(|| {
        AppError::unauthenticated("missing_token", "authentication required")
    })?;

    // 3. verify signature/expiry; detail stays server-side
    let identity = match verifier.verify(token).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "token verification failed at the gate");
            return Err(AppError::unauthenticated("invalid_token", "authentication token is invalid or expired"));
        }
    };

    // 4. the caller must have been provisioned
    let record = store
        .0
        .lock()
        .get_record(&identity.uid)
        .map_err(AppError::from)?
        .ok_or_else(|| {
            AppError::forbidden(
                "not_provisioned",
                "no access profile exists for this account; contact an administrator",
            )
        })?;

    // 5. effective access = admin override OR the pillar flag
    let flag = record.pillars.get(pillar);
    if !record.effective_access(pillar) {
        info!(
            uid = %identity.uid,
            pillar = pillar.number(),
            is_admin = record.is_admin,
            flag,
            "pillar access denied"
        );
        return Err(AppError::forbidden("access_denied", "you do not have access to this pillar"));
    }

    // 6. the pillar must be configured with a real base URL
    let base = config.pillar_base_url(pillar);
    if is_placeholder(base) {
        error!(pillar = pillar.number(), "pillar base URL is not configured");
        return Err(AppError::internal("pillar_unconfigured", "pillar destination is not configured"));
    }

    // 7. never redirect to a loopback destination from a production runtime
    let host = match host_of(base) {
        Some(h) if !h.is_empty() => h,
        _ => {
            error!(pillar = pillar.number(), "pillar base URL is malformed");
            return Err(AppError::internal("bad_redirect_base", "pillar destination is misconfigured"));
        }
    };
    if config.production && is_loopback_host(host) {
        error!(pillar = pillar.number(), "pillar base URL resolves to loopback in production");
        return Err(AppError::internal("pillar_misconfigured", "pillar destination is misconfigured"));
    }

    // 8. join base + fixed verification path + token/pillar query parameters
    let trimmed = base.trim_end_matches('/');
    let location = format!(
        "{}{}?token={}&pillar={}",
        trimmed,
        VERIFY_PATH,
        urlencoding::encode(token),
        pillar.number()
    );
    let logged_target = format!("{}{}?pillar={}", trimmed, VERIFY_PATH, pillar.number());

    let via_admin = record.is_admin;
    Ok(PillarRedirect { location, logged_target, pillar, identity, via_admin })
}

/// Unconfigured or template value left in the deployment config.
fn is_placeholder(base: &str) -> bool {
    if base.is_empty() {
        return true;
    }
    match host_of(base) {
        Some(h) => h == "example.com" || h.ends_with(".example.com") || h.ends_with(".invalid"),
        None => false,
    }
}

/// Host portion of an http(s) URL, without port or brackets. None when the
/// scheme is missing or unsupported.
fn host_of(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    if let Some(bracketed) = authority.strip_prefix('[') {
        // IPv6 literal: [::1] or [::1]:8080
        return bracketed.split(']').next();
    }
    authority.split(':').next()
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0" | "::1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://p1.pillars.app/x"), Some("p1.pillars.app"));
        assert_eq!(host_of("http://localhost:3000"), Some("localhost"));
        assert_eq!(host_of("http://[::1]:3000/verify"), Some("::1"));
        assert_eq!(host_of("https://127.0.0.1"), Some("127.0.0.1"));
        assert_eq!(host_of("ftp://x.com"), None);
        assert_eq!(host_of("p1.pillars.app"), None);
    }

    #[test]
    fn loopback_hosts() {
        for h in ["localhost", "127.0.0.1", "0.0.0.0", "::1"] {
            assert!(is_loopback_host(h), "{} should be loopback", h);
        }
        assert!(!is_loopback_host("p1.pillars.app"));
        assert!(!is_loopback_host("127.0.0.2"));
    }

    #[test]
    fn placeholder_detection() {
        assert!(is_placeholder(""));
        assert!(is_placeholder("https://example.com"));
        assert!(is_placeholder("https://pillar1.example.com"));
        assert!(is_placeholder("https://anything.invalid"));
        assert!(!is_placeholder("https://p1.pillars.app"));
        assert!(!is_placeholder("http://localhost:3000"));
    }
}
