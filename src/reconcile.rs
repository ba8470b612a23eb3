//! Pending-record lifecycle: the reconciler that turns pre-authorization
//! stubs into real permission records at first sign-in, and the admin-side
//! producer that creates the stubs.
//!
//! Reconciliation is the explicit `Pending -> Real` state transition. It is
//! idempotent: once a real record exists for a user id, re-invocation is a
//! no-op, which is the documented mitigation for duplicate sign-in triggers.

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::permissions::{
    normalize_email, parse_pillar_update, PermissionRecord, PillarFlags, RecordKey,
};
use crate::storage::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A real record already existed; nothing was touched.
    AlreadyProvisioned,
    /// A pending stub was migrated into the real record.
    MigratedPending,
    /// No stub existed; a default all-false record was created.
    CreatedDefault,
}

/// Provision the permission record for a just-created identity.
///
/// Holds the store guard across the whole check-then-act sequence so a
/// concurrent duplicate trigger in this process cannot double-create; across
/// processes the real-record short-circuit keeps re-runs harmless.
pub fn reconcile_new_user(store: &SharedStore, uid: &str, email: &str) -> Result<ReconcileOutcome> {
    if email.trim().is_empty() {
        bail!("an email address is required to provision a permission record");
    }
    let email_n = normalize_email(email);
    let guard = store.0.lock();

    if guard.get_record(uid)?.is_some() {
        // A run that crashed between the record write and the stub delete
        // leaves the stub orphaned; sweep it here so its flags can never be
        // applied to a different future account with this email.
        if guard.find_pending_by_email(&email_n)?.is_some() {
            let pending_key = RecordKey::pending_for_email(&email_n).storage_key();
            if let Err(e) = guard.delete_record(&pending_key) {
                warn!(error = %e, "failed to delete orphaned pending stub");
            }
        }
        return Ok(ReconcileOutcome::AlreadyProvisioned);
    }

    let now = Utc::now();
    if let Some(stub) = guard.find_pending_by_email(&email_n)? {
        let pending_key = RecordKey::pending_for_email(&email_n).storage_key();
        let real = PermissionRecord {
            user_id: uid.to_string(),
            email: email_n,
            is_admin: stub.is_admin,
            pillars: stub.pillars,
            // Preserve the stub's original creation time.
            created_at: stub.created_at,
            updated_at: now,
            is_pending: false,
        };
        guard.put_record(uid, &real)?;
        if let Err(e) = guard.delete_record(&pending_key) {
            // Orphaned stub is harmless; the next reconcile run deletes it.
            warn!(error = %e, "failed to delete migrated pending stub");
        }
        info!(pre_authorized = true, "permission record provisioned");
        return Ok(ReconcileOutcome::MigratedPending);
    }

    guard.put_record(uid, &PermissionRecord::new_default(uid, &email_n, now))?;
    info!(pre_authorized = false, "permission record provisioned");
    Ok(ReconcileOutcome::CreatedDefault)
}

/// Create (or refresh) a pre-authorization stub for an email that has no
/// provider account yet. At most one stub per email: the stub key is derived
/// from the normalized email, and an existing stub is overwritten in place
/// with its original creation time kept.
pub fn preauthorize(
    store: &SharedStore,
    email: &str,
    is_admin: bool,
    pillars: Option<&serde_json::Map<String, serde_json::Value>>,
) -> AppResult<PermissionRecord> {
    let email_n = normalize_email(email);
    if email_n.is_empty() || !email_n.contains('@') {
        return Err(AppError::invalid("invalid_email", "a valid email address is required"));
    }
    let mut flags = PillarFlags::default();
    if let Some(map) = pillars {
        for (pillar, value) in parse_pillar_update(map)? {
            flags.set(pillar, value);
        }
    }

    let guard = store.0.lock();
    if guard.find_real_by_email(&email_n).map_err(AppError::from)?.is_some() {
        return Err(AppError::invalid(
            "already_provisioned",
            "a permission record already exists for this email",
        ));
    }

    let key = RecordKey::pending_for_email(&email_n).storage_key();
    let now = Utc::now();
    let created_at = guard
        .get_record(&key)
        .map_err(AppError::from)?
        .map(|existing| existing.created_at)
        .unwrap_or(now);
    let stub = PermissionRecord {
        user_id: key.clone(),
        email: email_n,
        is_admin,
        pillars: flags,
        created_at,
        updated_at: now,
        is_pending: true,
    };
    guard.put_record(&key, &stub).map_err(AppError::from)?;
    info!(granted = stub.pillars.granted_count(), admin = is_admin, "pre-authorization stub written");
    Ok(stub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SharedStore) {
        let tmp = tempdir().unwrap();
        let store = SharedStore::new(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn fresh_identity_gets_all_false_defaults() {
        let (_tmp, store) = store();
        let outcome = reconcile_new_user(&store, "U1", "a@x.com").unwrap();
        assert_eq!(outcome, ReconcileOutcome::CreatedDefault);

        let rec = store.0.lock().get_record("U1").unwrap().expect("record");
        assert!(!rec.is_admin);
        assert_eq!(rec.pillars, PillarFlags::default());
        assert_eq!(rec.email, "a@x.com");
        assert!(!rec.is_pending);
    }

    #[test]
    fn missing_email_is_fatal_and_writes_nothing() {
        let (_tmp, store) = store();
        assert!(reconcile_new_user(&store, "U1", "  ").is_err());
        assert!(store.0.lock().get_record("U1").unwrap().is_none());
    }

    #[test]
    fn pending_stub_migrates_with_flags_and_created_at() {
        let (_tmp, store) = store();
        let stub = preauthorize(&store, "A@X.com", false, json!({"pillar3": true}).as_object()).unwrap();

        let outcome = reconcile_new_user(&store, "U2", "a@x.com").unwrap();
        assert_eq!(outcome, ReconcileOutcome::MigratedPending);

        let guard = store.0.lock();
        let rec = guard.get_record("U2").unwrap().expect("record");
        assert!(rec.pillars.pillar3);
        assert!(!rec.pillars.pillar1);
        assert_eq!(rec.created_at, stub.created_at);
        assert!(rec.updated_at >= stub.updated_at);
        // Stub is gone.
        assert!(guard.find_pending_by_email("a@x.com").unwrap().is_none());
    }

    #[test]
    fn reconcile_is_idempotent_across_all_starting_states() {
        let (_tmp, store) = store();

        // none -> created, then no-op
        assert_eq!(reconcile_new_user(&store, "U3", "c@x.com").unwrap(), ReconcileOutcome::CreatedDefault);
        assert_eq!(reconcile_new_user(&store, "U3", "c@x.com").unwrap(), ReconcileOutcome::AlreadyProvisioned);

        // pending-only -> migrated, then no-op
        preauthorize(&store, "d@x.com", true, None).unwrap();
        assert_eq!(reconcile_new_user(&store, "U4", "d@x.com").unwrap(), ReconcileOutcome::MigratedPending);
        assert_eq!(reconcile_new_user(&store, "U4", "d@x.com").unwrap(), ReconcileOutcome::AlreadyProvisioned);

        let guard = store.0.lock();
        let reals: Vec<_> = guard.list_records().unwrap().into_iter().filter(|r| !r.is_pending).collect();
        assert_eq!(reals.len(), 2);
        assert!(guard.find_pending_by_email("d@x.com").unwrap().is_none());
    }

    #[test]
    fn orphaned_stub_is_swept_on_the_short_circuit_path() {
        let (_tmp, store) = store();

        // Real record plus a leftover stub for the same email, as left by a
        // run that crashed between the record write and the stub delete.
        reconcile_new_user(&store, "U6", "g@x.com").unwrap();
        {
            let guard = store.0.lock();
            let key = RecordKey::pending_for_email("g@x.com").storage_key();
            let mut stub = PermissionRecord::new_default(&key, "g@x.com", Utc::now());
            stub.is_pending = true;
            stub.pillars.pillar4 = true;
            guard.put_record(&key, &stub).unwrap();
        }

        assert_eq!(reconcile_new_user(&store, "U6", "g@x.com").unwrap(), ReconcileOutcome::AlreadyProvisioned);

        let guard = store.0.lock();
        assert!(guard.find_pending_by_email("g@x.com").unwrap().is_none());
        let pending: Vec<_> = guard.list_records().unwrap().into_iter().filter(|r| r.is_pending && r.email == "g@x.com").collect();
        assert!(pending.is_empty());
        // The real record and its flags are untouched.
        let rec = guard.get_record("U6").unwrap().unwrap();
        assert!(!rec.pillars.pillar4);
    }

    #[test]
    fn preauthorize_rejects_invalid_email_and_known_users() {
        let (_tmp, store) = store();
        assert_eq!(preauthorize(&store, "not-an-email", false, None).unwrap_err().code_str(), "invalid_email");

        reconcile_new_user(&store, "U5", "e@x.com").unwrap();
        let err = preauthorize(&store, "e@x.com", false, None).unwrap_err();
        assert_eq!(err.code_str(), "already_provisioned");
    }

    #[test]
    fn preauthorize_overwrites_existing_stub_in_place() {
        let (_tmp, store) = store();
        let first = preauthorize(&store, "f@x.com", false, json!({"pillar1": true}).as_object()).unwrap();
        let second = preauthorize(&store, "F@X.COM", true, json!({"pillar2": true}).as_object()).unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.is_admin);
        assert!(second.pillars.pillar2);
        assert!(!second.pillars.pillar1);

        // Still exactly one stub for the email.
        let guard = store.0.lock();
        let stubs: Vec<_> = guard.list_records().unwrap().into_iter().filter(|r| r.is_pending).collect();
        assert_eq!(stubs.len(), 1);
    }
}
