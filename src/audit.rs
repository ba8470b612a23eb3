//! Append-only ledger of privileged mutations. Entries are written once by
//! the admin operations and never updated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::permissions::PillarFlags;

/// Closed set of audited actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AdminClaimSet,
    PermissionsUpdated,
    UserDeleted,
}

/// Action-specific payload carried alongside the common fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditDetail {
    AdminClaimSet { is_admin: bool },
    PermissionsUpdated { pillars: PillarFlags, granted: usize },
    UserDeleted { was_admin: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub target_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user_email: Option<String>,
    pub performed_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performed_by_email: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub detail: AuditDetail,
}

impl AuditLogEntry {
    fn base(
        action: AuditAction,
        target_user_id: &str,
        target_user_email: Option<String>,
        performed_by: &str,
        performed_by_email: Option<String>,
        detail: AuditDetail,
    ) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            action,
            target_user_id: target_user_id.to_string(),
            target_user_email,
            performed_by: performed_by.to_string(),
            performed_by_email,
            timestamp: Utc::now(),
            detail,
        }
    }

    pub fn admin_claim_set(
        target_user_id: &str,
        target_user_email: Option<String>,
        performed_by: &str,
        performed_by_email: Option<String>,
        is_admin: bool,
    ) -> AuditLogEntry {
        Self::base(
            AuditAction::AdminClaimSet,
            target_user_id,
            target_user_email,
            performed_by,
            performed_by_email,
            AuditDetail::AdminClaimSet { is_admin },
        )
    }

    pub fn permissions_updated(
        target_user_id: &str,
        target_user_email: Option<String>,
        performed_by: &str,
        performed_by_email: Option<String>,
        pillars: PillarFlags,
    ) -> AuditLogEntry {
        let granted = pillars.granted_count();
        Self::base(
            AuditAction::PermissionsUpdated,
            target_user_id,
            target_user_email,
            performed_by,
            performed_by_email,
            AuditDetail::PermissionsUpdated { pillars, granted },
        )
    }

    pub fn user_deleted(
        target_user_id: &str,
        target_user_email: Option<String>,
        performed_by: &str,
        performed_by_email: Option<String>,
        was_admin: bool,
    ) -> AuditLogEntry {
        Self::base(
            AuditAction::UserDeleted,
            target_user_id,
            target_user_email,
            performed_by,
            performed_by_email,
            AuditDetail::UserDeleted { was_admin },
        )
    }
}
