use serde::{Deserialize, Serialize};

/// Caller identity extracted from a verified token.
///
/// `admin_claim` is the signed custom claim asserting admin status. It is one
/// of two sources of truth; the permission record's `isAdmin` field is the
/// other, and authorization checks accept either being true.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub admin_claim: bool,
}
