//! Runtime configuration from environment variables, with development-safe
//! defaults. Production deployments must set `PILLARGATE_ENV=production` and
//! real pillar base URLs; the access gate refuses loopback URLs in that mode.

use std::time::Duration;

use crate::permissions::{Pillar, ACTIVE_PILLARS};

/// Token verification mode.
#[derive(Debug, Clone)]
pub enum VerifyConfig {
    /// HS256 shared secret; local/dev only.
    Hs { secret: String, issuer: Option<String>, audience: Option<String> },
    /// RS256 against the provider JWKS.
    Jwks { issuer: String, jwks_url: String, audiences: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_port: u16,
    pub data_root: String,
    pub production: bool,
    /// Base URLs for the six routable pillars, indexed pillar1..pillar6.
    pub pillar_urls: [String; ACTIVE_PILLARS as usize],
    pub verify: VerifyConfig,
    pub session_ttl: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    pub fn from_env() -> AppConfig {
        let http_port = env_or("PILLARGATE_HTTP_PORT", "7980").parse().unwrap_or(7980);
        let data_root = env_or("PILLARGATE_DATA_ROOT", "data");
        let production = env_or("PILLARGATE_ENV", "development").eq_ignore_ascii_case("production");

        let mut pillar_urls: [String; ACTIVE_PILLARS as usize] = Default::default();
        for (i, slot) in pillar_urls.iter_mut().enumerate() {
            *slot = env_or(&format!("PILLARGATE_PILLAR{}_URL", i + 1), "");
        }

        let verify = match env_or("PILLARGATE_TOKEN_MODE", "hs256").to_ascii_lowercase().as_str() {
            "jwks" => VerifyConfig::Jwks {
                issuer: env_or("PILLARGATE_TOKEN_ISSUER", ""),
                jwks_url: env_or("PILLARGATE_TOKEN_JWKS_URL", ""),
                audiences: std::env::var("PILLARGATE_TOKEN_AUDIENCE")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                    .unwrap_or_default(),
            },
            _ => VerifyConfig::Hs {
                secret: env_or("PILLARGATE_TOKEN_SECRET", "dev-secret"),
                issuer: std::env::var("PILLARGATE_TOKEN_ISSUER").ok(),
                audience: std::env::var("PILLARGATE_TOKEN_AUDIENCE").ok(),
            },
        };

        let ttl_days: u64 = env_or("PILLARGATE_SESSION_TTL_DAYS", "5").parse().unwrap_or(5);

        AppConfig {
            http_port,
            data_root,
            production,
            pillar_urls,
            verify,
            session_ttl: Duration::from_secs(ttl_days * 24 * 60 * 60),
        }
    }

    /// Config shape used by tests and embedded callers.
    pub fn for_root(data_root: &str) -> AppConfig {
        AppConfig {
            http_port: 0,
            data_root: data_root.to_string(),
            production: false,
            pillar_urls: Default::default(),
            verify: VerifyConfig::Hs { secret: "dev-secret".into(), issuer: None, audience: None },
            session_ttl: Duration::from_secs(5 * 24 * 60 * 60),
        }
    }

    /// Configured base URL for a routable pillar. Empty when unconfigured.
    pub fn pillar_base_url(&self, pillar: Pillar) -> &str {
        &self.pillar_urls[(pillar.number() - 1) as usize]
    }

    pub fn configured_pillar_count(&self) -> usize {
        self.pillar_urls.iter().filter(|u| !u.is_empty()).count()
    }
}
