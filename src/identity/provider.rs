//! Privileged identity-provider surface: account lookup, the custom admin
//! claim, and account deletion. The real deployment fronts a managed provider
//! admin SDK; `DirectoryProvider` is the file-backed implementation that the
//! HS256 dev mode and the tests run against.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tprintln;

/// Provider-side account; `admin_claim` is the signed custom claim embedded
/// into tokens the provider issues for this account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub admin_claim: bool,
}

pub trait IdentityProvider: Send + Sync {
    /// Create the account if absent; refresh the email if present. The admin
    /// claim is never touched by this path.
    fn upsert_account(&self, uid: &str, email: Option<&str>) -> Result<()>;

    fn account(&self, uid: &str) -> Result<Option<Account>>;

    /// Set the custom admin claim. Fails when the account does not exist,
    /// matching the managed provider's behavior.
    fn set_admin_claim(&self, uid: &str, is_admin: bool) -> Result<()>;

    /// Delete the account. An already-absent account is success.
    fn delete_account(&self, uid: &str) -> Result<()>;
}

const ACCOUNTS_DIR: &str = "accounts";

pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().join(ACCOUNTS_DIR);
        fs::create_dir_all(&root).with_context(|| format!("creating account directory {:?}", root))?;
        Ok(Self { root })
    }

    fn account_path(&self, uid: &str) -> PathBuf {
        self.root.join(format!("{}.json", uid))
    }

    fn write_account(&self, account: &Account) -> Result<()> {
        let path = self.account_path(&account.uid);
        let text = serde_json::to_string_pretty(account)?;
        fs::write(&path, text).with_context(|| format!("writing account {:?}", path))?;
        Ok(())
    }
}

impl IdentityProvider for DirectoryProvider {
    fn upsert_account(&self, uid: &str, email: Option<&str>) -> Result<()> {
        let account = match self.account(uid)? {
            Some(mut existing) => {
                if let Some(e) = email {
                    existing.email = Some(e.to_string());
                }
                existing
            }
            None => Account { uid: uid.to_string(), email: email.map(|e| e.to_string()), admin_claim: false },
        };
        self.write_account(&account)
    }

    fn account(&self, uid: &str) -> Result<Option<Account>> {
        let path = self.account_path(uid);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).with_context(|| format!("reading account {:?}", path))?;
        let account: Account = serde_json::from_str(&text).with_context(|| format!("parsing account {:?}", path))?;
        Ok(Some(account))
    }

    fn set_admin_claim(&self, uid: &str, is_admin: bool) -> Result<()> {
        let Some(mut account) = self.account(uid)? else {
            bail!("no provider account for uid");
        };
        account.admin_claim = is_admin;
        self.write_account(&account)?;
        tprintln!("provider.set_admin_claim admin={}", is_admin);
        Ok(())
    }

    fn delete_account(&self, uid: &str) -> Result<()> {
        let path = self.account_path(uid);
        if !path.exists() {
            // Already absent counts as deleted.
            debug!("provider account already absent on delete");
            return Ok(());
        }
        fs::remove_file(&path).with_context(|| format!("deleting account {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn upsert_preserves_admin_claim() -> Result<()> {
        let tmp = tempdir()?;
        let provider = DirectoryProvider::new(tmp.path())?;
        provider.upsert_account("u1", Some("a@x.com"))?;
        provider.set_admin_claim("u1", true)?;

        // A later sign-in upsert must not clear the claim.
        provider.upsert_account("u1", Some("renamed@x.com"))?;
        let account = provider.account("u1")?.expect("account exists");
        assert!(account.admin_claim);
        assert_eq!(account.email.as_deref(), Some("renamed@x.com"));
        Ok(())
    }

    #[test]
    fn set_claim_requires_existing_account() -> Result<()> {
        let tmp = tempdir()?;
        let provider = DirectoryProvider::new(tmp.path())?;
        assert!(provider.set_admin_claim("ghost", true).is_err());
        Ok(())
    }

    #[test]
    fn delete_tolerates_absence() -> Result<()> {
        let tmp = tempdir()?;
        let provider = DirectoryProvider::new(tmp.path())?;
        provider.delete_account("nobody")?;
        provider.upsert_account("u2", None)?;
        provider.delete_account("u2")?;
        assert!(provider.account("u2")?.is_none());
        Ok(())
    }
}
