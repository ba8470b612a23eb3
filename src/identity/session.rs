//! Dashboard session cookies. A session pins the verified identity and the
//! raw provider token so the access gate can relay it on cookie-authenticated
//! redirects. Sessions live in process memory; a restart signs everyone out.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use base64::Engine;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::tprintln;

pub type SessionToken = String;

#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub uid: String,
    pub email: Option<String>,
    /// Raw provider-issued token; re-verified on every gate request, so a
    /// session outliving its token yields 401, not silent access.
    pub id_token: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

static SESSIONS: Lazy<RwLock<HashMap<String, Session>>> = Lazy::new(|| RwLock::new(HashMap::new()));
static USER_INDEX: Lazy<RwLock<HashMap<String, HashSet<String>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

fn gen_token() -> String {
    // 256-bit random token, base64url without padding. A dead system RNG
    // must never degrade into a predictable token, so it is fatal.
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).expect("system RNG unavailable");
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Drop a token from the per-user index, discarding the set once empty.
fn unindex(uid: &str, token: &str) {
    let mut idx = USER_INDEX.write();
    if let Some(set) = idx.get_mut(uid) {
        set.remove(token);
        if set.is_empty() {
            idx.remove(uid);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionManager {
    pub ttl: Duration,
}

impl Default for SessionManager {
    // Fixed multi-day expiry for the dashboard cookie.
    fn default() -> Self { Self { ttl: Duration::from_secs(5 * 24 * 60 * 60) } }
}

impl SessionManager {
    pub fn with_ttl(ttl: Duration) -> Self { Self { ttl } }

    pub fn issue(&self, uid: &str, email: Option<&str>, id_token: &str) -> Session {
        let now = Instant::now();
        let token = gen_token();
        let sess = Session {
            token: token.clone(),
            uid: uid.to_string(),
            email: email.map(|e| e.to_string()),
            id_token: id_token.to_string(),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        {
            let mut m = SESSIONS.write();
            m.insert(token.clone(), sess.clone());
        }
        {
            let mut uidx = USER_INDEX.write();
            uidx.entry(uid.to_string()).or_insert_with(HashSet::new).insert(token);
        }
        tprintln!("session.issue ttl_secs={}", self.ttl.as_secs());
        sess
    }

    pub fn validate(&self, token: &str) -> Option<Session> {
        let now = Instant::now();
        let mut expired: Option<Session> = None;
        let out = {
            let map = SESSIONS.read();
            match map.get(token) {
                Some(sess) if sess.expires_at > now => Some(sess.clone()),
                Some(sess) => {
                    expired = Some(sess.clone());
                    None
                }
                None => None,
            }
        };
        if let Some(sess) = expired {
            SESSIONS.write().remove(&sess.token);
            unindex(&sess.uid, &sess.token);
        }
        out
    }

    pub fn logout(&self, token: &str) -> bool {
        if let Some(sess) = SESSIONS.write().remove(token) {
            unindex(&sess.uid, token);
            true
        } else {
            false
        }
    }

    /// Drop every session for a user; used when the user is deleted.
    pub fn revoke_user(&self, uid: &str) -> usize {
        let mut count = 0usize;
        if let Some(tokens) = USER_INDEX.write().remove(uid) {
            let mut s = SESSIONS.write();
            for t in tokens.iter() {
                if s.remove(t).is_some() {
                    count += 1;
                }
            }
        }
        tprintln!("session.revoke count={}", count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_validate_logout() {
        let sm = SessionManager::default();
        let sess = sm.issue("sess-u1", Some("a@x.com"), "tok");
        let got = sm.validate(&sess.token).expect("valid session");
        assert_eq!(got.uid, "sess-u1");
        assert_eq!(got.id_token, "tok");
        assert_eq!(got.email.as_deref(), Some("a@x.com"));

        assert!(sm.logout(&sess.token));
        assert!(sm.validate(&sess.token).is_none());
        assert!(!sm.logout(&sess.token));
    }

    #[test]
    fn expired_sessions_are_pruned_on_validate() {
        let sm = SessionManager::with_ttl(Duration::from_secs(0));
        let sess = sm.issue("sess-u2", None, "tok");
        std::thread::sleep(Duration::from_millis(5));
        assert!(sm.validate(&sess.token).is_none());
    }

    #[test]
    fn revoke_user_drops_all_sessions() {
        let sm = SessionManager::default();
        let a = sm.issue("sess-u3", None, "tok-a");
        let b = sm.issue("sess-u3", None, "tok-b");
        assert_eq!(sm.revoke_user("sess-u3"), 2);
        assert!(sm.validate(&a.token).is_none());
        assert!(sm.validate(&b.token).is_none());
    }

    #[test]
    fn index_entries_do_not_outlive_their_sessions() {
        // Expiry pruning and logout must both clear the per-user index, or
        // it grows for the life of the process.
        let sm = SessionManager::with_ttl(Duration::from_secs(0));
        let sess = sm.issue("sess-u4", None, "tok");
        std::thread::sleep(Duration::from_millis(5));
        assert!(sm.validate(&sess.token).is_none());
        assert!(USER_INDEX.read().get("sess-u4").is_none());

        let sm = SessionManager::default();
        let sess = sm.issue("sess-u5", None, "tok");
        assert!(sm.logout(&sess.token));
        assert!(USER_INDEX.read().get("sess-u5").is_none());
    }

    #[test]
    fn tokens_are_unique_and_never_the_zero_pattern() {
        let sm = SessionManager::default();
        let a = sm.issue("sess-u6", None, "tok");
        let b = sm.issue("sess-u6", None, "tok");
        assert_ne!(a.token, b.token);
        let zeros = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([0u8; 32]);
        assert_ne!(a.token, zeros);
        assert_ne!(b.token, zeros);
    }
}
