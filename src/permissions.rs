//! Permission records for the pillar dashboard.
//!
//! One record per user, keyed by the identity provider's user id. A record
//! holds the admin flag and one grant flag per pillar. Pre-authorized users
//! who have not signed in yet are represented by a pending stub keyed by an
//! email-derived synthetic id; the reconciler migrates the stub into a real
//! record at first sign-in.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Pillars routable through the access gate.
pub const ACTIVE_PILLARS: u8 = 6;
/// Flags kept on every record: six active pillars plus one reserved slot.
pub const TOTAL_PILLARS: u8 = 7;

const PENDING_PREFIX: &str = "pending_";

/// A single pillar, identified by number. Numbers 1..=6 are routable; 7 is
/// reserved (the flag exists on records but no application is wired to it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pillar(u8);

impl Pillar {
    /// Parse a pillar number the access gate will route to.
    pub fn routable(n: i64) -> Option<Pillar> {
        if (1..=ACTIVE_PILLARS as i64).contains(&n) { Some(Pillar(n as u8)) } else { None }
    }

    /// Parse a flag key like `pillar3`. Accepts the full closed set including
    /// the reserved slot, since admins may pre-set the reserved flag.
    pub fn from_key(key: &str) -> Option<Pillar> {
        let n: u8 = key.strip_prefix("pillar")?.parse().ok()?;
        if (1..=TOTAL_PILLARS).contains(&n) { Some(Pillar(n)) } else { None }
    }

    pub fn number(self) -> u8 { self.0 }

    pub fn key(self) -> &'static str {
        match self.0 {
            1 => "pillar1",
            2 => "pillar2",
            3 => "pillar3",
            4 => "pillar4",
            5 => "pillar5",
            6 => "pillar6",
            _ => "pillar7",
        }
    }
}

/// Closed per-pillar grant map. Keys are enumerated fields, never arbitrary
/// strings, so an unknown key cannot round-trip through the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PillarFlags {
    #[serde(default)]
    pub pillar1: bool,
    #[serde(default)]
    pub pillar2: bool,
    #[serde(default)]
    pub pillar3: bool,
    #[serde(default)]
    pub pillar4: bool,
    #[serde(default)]
    pub pillar5: bool,
    #[serde(default)]
    pub pillar6: bool,
    #[serde(default)]
    pub pillar7: bool,
}

impl PillarFlags {
    pub fn get(&self, p: Pillar) -> bool {
        match p.number() {
            1 => self.pillar1,
            2 => self.pillar2,
            3 => self.pillar3,
            4 => self.pillar4,
            5 => self.pillar5,
            6 => self.pillar6,
            _ => self.pillar7,
        }
    }

    pub fn set(&mut self, p: Pillar, v: bool) {
        match p.number() {
            1 => self.pillar1 = v,
            2 => self.pillar2 = v,
            3 => self.pillar3 = v,
            4 => self.pillar4 = v,
            5 => self.pillar5 = v,
            6 => self.pillar6 = v,
            _ => self.pillar7 = v,
        }
    }

    /// Number of granted flags; used for log-volume hygiene in application
    /// logs (identifying detail goes to the audit ledger only).
    pub fn granted_count(&self) -> usize {
        [self.pillar1, self.pillar2, self.pillar3, self.pillar4, self.pillar5, self.pillar6, self.pillar7]
            .iter()
            .filter(|v| **v)
            .count()
    }
}

/// Validate an incoming pillar update map against the closed key set.
/// Rejects the first unrecognized key or non-boolean value by name.
pub fn parse_pillar_update(map: &serde_json::Map<String, serde_json::Value>) -> AppResult<Vec<(Pillar, bool)>> {
    let mut out = Vec::with_capacity(map.len());
    for (key, value) in map {
        let Some(pillar) = Pillar::from_key(key) else {
            return Err(AppError::invalid(
                "unknown_pillar_key".into(),
                format!("unrecognized pillar key: {}", key),
            ));
        };
        let Some(flag) = value.as_bool() else {
            return Err(AppError::invalid(
                "nonboolean_pillar_flag".into(),
                format!("pillar flag {} must be a boolean", key),
            ));
        };
        out.push((pillar, flag));
    }
    Ok(out)
}

/// Lowercase-normalize an email for lookup and storage.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Storage key for a record: either a real provider-issued user id, or a
/// synthetic pending key derived from the normalized email. Modeled as a
/// tagged variant so the pending/real distinction is a type, not a string
/// prefix convention scattered through callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    Real(String),
    Pending(String),
}

impl RecordKey {
    pub fn pending_for_email(email: &str) -> RecordKey {
        RecordKey::Pending(normalize_email(email))
    }

    pub fn storage_key(&self) -> String {
        match self {
            RecordKey::Real(uid) => uid.clone(),
            RecordKey::Pending(email) => {
                let enc = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(email.as_bytes());
                format!("{}{}", PENDING_PREFIX, enc)
            }
        }
    }

    pub fn is_pending(&self) -> bool { matches!(self, RecordKey::Pending(_)) }
}

/// Per-user permission document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRecord {
    /// Provider user id for real records; synthetic pending key for stubs.
    pub user_id: String,
    pub email: String,
    pub is_admin: bool,
    #[serde(default)]
    pub pillars: PillarFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Only ever true on pre-authorization stubs. Stubs must be deleted once
    /// reconciled into a real record.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_pending: bool,
}

impl PermissionRecord {
    /// Fresh all-false record for a user with no pre-authorization.
    pub fn new_default(user_id: &str, email: &str, now: DateTime<Utc>) -> PermissionRecord {
        PermissionRecord {
            user_id: user_id.to_string(),
            email: normalize_email(email),
            is_admin: false,
            pillars: PillarFlags::default(),
            created_at: now,
            updated_at: now,
            is_pending: false,
        }
    }

    /// Admin overrides individual flags; computed, never stored.
    pub fn effective_access(&self, pillar: Pillar) -> bool {
        self.is_admin || self.pillars.get(pillar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routable_range_is_closed() {
        assert!(Pillar::routable(0).is_none());
        assert!(Pillar::routable(1).is_some());
        assert!(Pillar::routable(6).is_some());
        assert!(Pillar::routable(7).is_none());
        assert!(Pillar::routable(-3).is_none());
        assert!(Pillar::routable(9).is_none());
    }

    #[test]
    fn key_parsing_accepts_reserved_slot_only_up_to_seven() {
        assert_eq!(Pillar::from_key("pillar1").map(Pillar::number), Some(1));
        assert_eq!(Pillar::from_key("pillar7").map(Pillar::number), Some(7));
        assert!(Pillar::from_key("pillar8").is_none());
        assert!(Pillar::from_key("pillar9").is_none());
        assert!(Pillar::from_key("pillar0").is_none());
        assert!(Pillar::from_key("pillarx").is_none());
        assert!(Pillar::from_key("admin").is_none());
    }

    #[test]
    fn effective_access_is_admin_or_flag() {
        let now = Utc::now();
        let mut rec = PermissionRecord::new_default("u1", "a@x.com", now);
        for n in 1..=6 {
            assert!(!rec.effective_access(Pillar::routable(n).unwrap()));
        }
        rec.pillars.set(Pillar::routable(3).unwrap(), true);
        assert!(rec.effective_access(Pillar::routable(3).unwrap()));
        assert!(!rec.effective_access(Pillar::routable(1).unwrap()));
        rec.is_admin = true;
        for n in 1..=6 {
            assert!(rec.effective_access(Pillar::routable(n).unwrap()));
        }
    }

    #[test]
    fn pillar_map_round_trips_identically() {
        let mut flags = PillarFlags::default();
        flags.pillar1 = true;
        let text = serde_json::to_string(&flags).unwrap();
        let back: PillarFlags = serde_json::from_str(&text).unwrap();
        assert_eq!(flags, back);
        assert_eq!(back.granted_count(), 1);
    }

    #[test]
    fn update_parser_rejects_unknown_keys_and_nonbooleans() {
        let good = json!({"pillar1": true, "pillar2": false});
        let parsed = parse_pillar_update(good.as_object().unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);

        let bad_key = json!({"pillar9": true});
        let err = parse_pillar_update(bad_key.as_object().unwrap()).unwrap_err();
        assert_eq!(err.code_str(), "unknown_pillar_key");
        assert!(err.message().contains("pillar9"));

        let bad_value = json!({"pillar2": "yes"});
        let err = parse_pillar_update(bad_value.as_object().unwrap()).unwrap_err();
        assert_eq!(err.code_str(), "nonboolean_pillar_flag");
        assert!(err.message().contains("pillar2"));
    }

    #[test]
    fn pending_key_derives_from_lowercased_email() {
        let a = RecordKey::pending_for_email("A@X.com");
        let b = RecordKey::pending_for_email("a@x.com");
        assert_eq!(a.storage_key(), b.storage_key());
        assert!(a.storage_key().starts_with("pending_"));
        assert!(a.is_pending());
        assert!(!RecordKey::Real("u1".into()).is_pending());
    }
}
