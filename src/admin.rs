//! Privileged mutation operations: the claim synchronizer, the permission
//! updater, and user deletion. Every operation runs under the caller-is-admin
//! precondition and appends to the audit ledger.
//!
//! Admin status lives in two places: the signed custom claim on the token and
//! the `isAdmin` field of the permission record. The two converge after every
//! mutation but may transiently disagree, so the privilege gate accepts
//! either being true. Application logs here carry counts and flags, never raw
//! user identifiers; identifying detail goes to the audit ledger only.

use chrono::Utc;
use tracing::{info, warn};

use crate::audit::AuditLogEntry;
use crate::error::{AppError, AppResult};
use crate::identity::{IdentityProvider, SessionManager, VerifiedIdentity};
use crate::permissions::{parse_pillar_update, PillarFlags};
use crate::storage::SharedStore;

/// Dual-source admin check: claim OR document. Either side being true grants,
/// so a half-converged mutation never locks an admin out.
pub fn caller_is_admin(store: &SharedStore, caller: &VerifiedIdentity) -> bool {
    if caller.admin_claim {
        return true;
    }
    let guard = store.0.lock();
    match guard.get_record(&caller.uid) {
        Ok(Some(rec)) => rec.is_admin,
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "permission record read failed during admin check");
            false
        }
    }
}

pub fn require_admin(store: &SharedStore, caller: &VerifiedIdentity) -> AppResult<()> {
    if caller_is_admin(store, caller) {
        Ok(())
    } else {
        Err(AppError::forbidden("admin_required", "caller is not an administrator"))
    }
}

/// Claim synchronizer: set the custom admin claim and mirror it into the
/// permission record. The claim write is the unit of failure; the document
/// update and the audit append are best-effort once the claim is set.
pub fn set_admin_claim(
    store: &SharedStore,
    provider: &dyn IdentityProvider,
    caller: &VerifiedIdentity,
    target_uid: &str,
    is_admin: bool,
) -> AppResult<()> {
    require_admin(store, caller)?;

    // Claim first; if this fails the operation fails as a unit.
    provider
        .set_admin_claim(target_uid, is_admin)
        .map_err(|e| AppError::internal("claim_set_failed".into(), format!("failed to set admin claim: {}", e)))?;

    let target_email = {
        let guard = store.0.lock();
        match guard.get_record(target_uid) {
            Ok(Some(mut rec)) => {
                let email = Some(rec.email.clone());
                rec.is_admin = is_admin;
                rec.updated_at = Utc::now();
                if let Err(e) = guard.put_record(target_uid, &rec) {
                    // Claim and document now disagree; the dual-read rule
                    // tolerates this until the next successful mutation.
                    warn!(error = %e, "claim set but permission record update failed");
                }
                email
            }
            Ok(None) => {
                warn!("claim set for a user with no permission record");
                provider.account(target_uid).ok().flatten().and_then(|a| a.email)
            }
            Err(e) => {
                warn!(error = %e, "claim set but permission record read failed");
                None
            }
        }
    };

    let entry = AuditLogEntry::admin_claim_set(
        target_uid,
        target_email,
        &caller.uid,
        caller.email.clone(),
        is_admin,
    );
    if let Err(e) = store.0.lock().append_audit(&entry) {
        warn!(error = %e, "audit append failed for admin_claim_set");
    }
    info!(admin = is_admin, "admin claim updated");
    Ok(())
}

/// Permission updater: merge a validated pillar map into the target record.
pub fn update_pillars(
    store: &SharedStore,
    caller: &VerifiedIdentity,
    target_uid: &str,
    pillars: &serde_json::Map<String, serde_json::Value>,
) -> AppResult<PillarFlags> {
    require_admin(store, caller)?;
    let updates = parse_pillar_update(pillars)?;

    let (merged, target_email) = {
        let guard = store.0.lock();
        let Some(mut rec) = guard.get_record(target_uid).map_err(AppError::from)? else {
            return Err(AppError::not_found("user_not_found", "no permission record for that user"));
        };
        for (pillar, value) in updates {
            rec.pillars.set(pillar, value);
        }
        rec.updated_at = Utc::now();
        guard.put_record(target_uid, &rec).map_err(AppError::from)?;
        (rec.pillars, rec.email)
    };

    let entry = AuditLogEntry::permissions_updated(
        target_uid,
        Some(target_email),
        &caller.uid,
        caller.email.clone(),
        merged,
    );
    if let Err(e) = store.0.lock().append_audit(&entry) {
        warn!(error = %e, "audit append failed for permissions_updated");
    }
    info!(granted = merged.granted_count(), "pillar permissions updated");
    Ok(merged)
}

/// User deletion, ordered so partial failure still leaves an auditable trail:
/// lookup for the audit entry (placeholders on failure), provider account
/// delete (absent is success, anything else aborts), record delete
/// (tolerated), audit append (tolerated). Success is reported once the
/// provider account is gone.
pub fn delete_user(
    store: &SharedStore,
    provider: &dyn IdentityProvider,
    sessions: &SessionManager,
    caller: &VerifiedIdentity,
    target_uid: &str,
) -> AppResult<String> {
    require_admin(store, caller)?;
    if target_uid == caller.uid {
        return Err(AppError::invalid("self_delete", "an administrator cannot delete their own account"));
    }

    // (a) prior state for the audit entry; tolerate lookup failure.
    let (target_email, was_admin) = {
        let guard = store.0.lock();
        match guard.get_record(target_uid) {
            Ok(Some(rec)) => (rec.email, rec.is_admin),
            Ok(None) => {
                let email = provider
                    .account(target_uid)
                    .ok()
                    .flatten()
                    .and_then(|a| a.email)
                    .unwrap_or_else(|| "unknown".to_string());
                (email, false)
            }
            Err(e) => {
                warn!(error = %e, "record lookup failed ahead of deletion");
                ("unknown".to_string(), false)
            }
        }
    };

    // (b) identity account; fatal on anything but absence.
    provider
        .delete_account(target_uid)
        .map_err(|e| AppError::internal("account_delete_failed".into(), format!("failed to delete provider account: {}", e)))?;

    let revoked = sessions.revoke_user(target_uid);
    if revoked > 0 {
        info!(revoked, "revoked sessions for deleted user");
    }

    // (c) permission record; best-effort now that the identity is gone.
    if let Err(e) = store.0.lock().delete_record(target_uid) {
        warn!(error = %e, "permission record delete failed after account deletion");
    }

    // (d) ledger; never fails the overall request.
    let entry = AuditLogEntry::user_deleted(
        target_uid,
        Some(target_email.clone()),
        &caller.uid,
        caller.email.clone(),
        was_admin,
    );
    if let Err(e) = store.0.lock().append_audit(&entry) {
        warn!(error = %e, "audit append failed for user_deleted");
    }

    Ok(target_email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditDetail};
    use crate::identity::DirectoryProvider;
    use crate::reconcile::reconcile_new_user;
    use serde_json::json;
    use tempfile::tempdir;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: SharedStore,
        provider: DirectoryProvider,
        sessions: SessionManager,
        admin: VerifiedIdentity,
        user: VerifiedIdentity,
    }

    fn fixture() -> Fixture {
        let tmp = tempdir().unwrap();
        let store = SharedStore::new(tmp.path()).unwrap();
        let provider = DirectoryProvider::new(tmp.path()).unwrap();

        provider.upsert_account("admin1", Some("admin@x.com")).unwrap();
        provider.upsert_account("user1", Some("user@x.com")).unwrap();
        reconcile_new_user(&store, "admin1", "admin@x.com").unwrap();
        reconcile_new_user(&store, "user1", "user@x.com").unwrap();

        let admin = VerifiedIdentity { uid: "admin1".into(), email: Some("admin@x.com".into()), admin_claim: true };
        let user = VerifiedIdentity { uid: "user1".into(), email: Some("user@x.com".into()), admin_claim: false };
        Fixture { _tmp: tmp, store, provider, sessions: SessionManager::default(), admin, user }
    }

    #[test]
    fn non_admin_callers_are_rejected() {
        let f = fixture();
        let err = set_admin_claim(&f.store, &f.provider, &f.user, "admin1", true).unwrap_err();
        assert_eq!(err.code_str(), "admin_required");
        let err = update_pillars(&f.store, &f.user, "admin1", json!({"pillar1": true}).as_object().unwrap()).unwrap_err();
        assert_eq!(err.code_str(), "admin_required");
        let err = delete_user(&f.store, &f.provider, &f.sessions, &f.user, "admin1").unwrap_err();
        assert_eq!(err.code_str(), "admin_required");
    }

    #[test]
    fn document_only_admin_passes_dual_read() {
        let f = fixture();
        // Claim not yet converged, but the record says admin.
        {
            let guard = f.store.0.lock();
            let mut rec = guard.get_record("user1").unwrap().unwrap();
            rec.is_admin = true;
            guard.put_record("user1", &rec).unwrap();
        }
        assert!(caller_is_admin(&f.store, &f.user));
    }

    #[test]
    fn claim_sync_updates_claim_record_and_ledger() {
        let f = fixture();
        set_admin_claim(&f.store, &f.provider, &f.admin, "user1", true).unwrap();

        let account = f.provider.account("user1").unwrap().unwrap();
        assert!(account.admin_claim);
        let guard = f.store.0.lock();
        let rec = guard.get_record("user1").unwrap().unwrap();
        assert!(rec.is_admin);
        let entries = guard.list_audit().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::AdminClaimSet);
        assert_eq!(entries[0].target_user_id, "user1");
        assert_eq!(entries[0].performed_by, "admin1");
        assert_eq!(entries[0].detail, AuditDetail::AdminClaimSet { is_admin: true });
    }

    #[test]
    fn claim_set_failure_aborts_without_audit() {
        let f = fixture();
        // No provider account, so the claim write fails as a unit.
        let err = set_admin_claim(&f.store, &f.provider, &f.admin, "ghost", true).unwrap_err();
        assert_eq!(err.code_str(), "claim_set_failed");
        assert!(f.store.0.lock().list_audit().unwrap().is_empty());
    }

    #[test]
    fn self_revocation_is_accepted() {
        let f = fixture();
        set_admin_claim(&f.store, &f.provider, &f.admin, "admin1", false).unwrap();
        let account = f.provider.account("admin1").unwrap().unwrap();
        assert!(!account.admin_claim);
    }

    #[test]
    fn update_pillars_merges_and_audits() {
        let f = fixture();
        let merged = update_pillars(
            &f.store,
            &f.admin,
            "user1",
            json!({"pillar1": true, "pillar4": true}).as_object().unwrap(),
        )
        .unwrap();
        assert!(merged.pillar1 && merged.pillar4);

        // Second update merges over the first rather than replacing it.
        let merged = update_pillars(&f.store, &f.admin, "user1", json!({"pillar1": false}).as_object().unwrap()).unwrap();
        assert!(!merged.pillar1);
        assert!(merged.pillar4);

        let guard = f.store.0.lock();
        let entries = guard.list_audit().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.action == AuditAction::PermissionsUpdated));
    }

    #[test]
    fn update_pillars_rejects_unknown_key_before_writing() {
        let f = fixture();
        let before = f.store.0.lock().get_record("user1").unwrap().unwrap();
        let err = update_pillars(&f.store, &f.admin, "user1", json!({"pillar9": true}).as_object().unwrap()).unwrap_err();
        assert_eq!(err.code_str(), "unknown_pillar_key");
        let after = f.store.0.lock().get_record("user1").unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn update_pillars_unknown_user_is_not_found() {
        let f = fixture();
        let err = update_pillars(&f.store, &f.admin, "ghost", json!({"pillar1": true}).as_object().unwrap()).unwrap_err();
        assert_eq!(err.code_str(), "user_not_found");
    }

    #[test]
    fn self_deletion_fails_with_zero_mutations() {
        let f = fixture();
        let err = delete_user(&f.store, &f.provider, &f.sessions, &f.admin, "admin1").unwrap_err();
        assert_eq!(err.code_str(), "self_delete");
        assert!(f.provider.account("admin1").unwrap().is_some());
        let guard = f.store.0.lock();
        assert!(guard.get_record("admin1").unwrap().is_some());
        assert!(guard.list_audit().unwrap().is_empty());
    }

    #[test]
    fn delete_user_cascades_and_audits() {
        let f = fixture();
        let email = delete_user(&f.store, &f.provider, &f.sessions, &f.admin, "user1").unwrap();
        assert_eq!(email, "user@x.com");
        assert!(f.provider.account("user1").unwrap().is_none());
        let guard = f.store.0.lock();
        assert!(guard.get_record("user1").unwrap().is_none());
        let entries = guard.list_audit().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::UserDeleted);
        assert_eq!(entries[0].target_user_email.as_deref(), Some("user@x.com"));
    }

    #[test]
    fn delete_user_with_absent_account_still_succeeds() {
        let f = fixture();
        // Provider account removed out-of-band; absence is tolerated.
        f.provider.delete_account("user1").unwrap();
        let email = delete_user(&f.store, &f.provider, &f.sessions, &f.admin, "user1").unwrap();
        assert_eq!(email, "user@x.com");
        assert!(f.store.0.lock().get_record("user1").unwrap().is_none());
    }
}
