//!
//! pillargate storage module
//! -------------------------
//! On-disk document store backing the permission records and the audit
//! ledger. Layout under the configured root folder:
//!
//! - `perms/<key>.json`: one `PermissionRecord` per file, keyed by the
//!   provider user id or the synthetic `pending_*` key.
//! - `audit/<uuid>.json`: one `AuditLogEntry` per file, write-once. The
//!   store exposes append and list only; there is no update or delete path
//!   for ledger entries.
//!
//! The public API centers around the `Store` type, wrapped in a thread-safe
//! `SharedStore` (`Arc<Mutex<Store>>`) elsewhere in the codebase. Handlers
//! hold the single guard across read-modify-write sequences, so per-process
//! check-then-act runs are serialized.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::audit::AuditLogEntry;
use crate::permissions::{normalize_email, PermissionRecord, RecordKey};

const PERMS_DIR: &str = "perms";
const AUDIT_DIR: &str = "audit";

/// Core on-disk storage handle.
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Create a new Store rooted at the given filesystem path.
    /// The directory tree is created if it does not already exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(PERMS_DIR))
            .with_context(|| format!("creating permission store under {:?}", root))?;
        fs::create_dir_all(root.join(AUDIT_DIR))
            .with_context(|| format!("creating audit ledger under {:?}", root))?;
        Ok(Store { root })
    }

    pub fn root(&self) -> &Path { &self.root }

    fn perm_path(&self, key: &str) -> PathBuf {
        self.root.join(PERMS_DIR).join(format!("{}.json", key))
    }

    pub fn get_record(&self, key: &str) -> Result<Option<PermissionRecord>> {
        let path = self.perm_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading permission record {:?}", path))?;
        let rec: PermissionRecord = serde_json::from_str(&text)
            .with_context(|| format!("parsing permission record {:?}", path))?;
        Ok(Some(rec))
    }

    pub fn put_record(&self, key: &str, record: &PermissionRecord) -> Result<()> {
        let path = self.perm_path(key);
        let text = serde_json::to_string_pretty(record)?;
        fs::write(&path, text).with_context(|| format!("writing permission record {:?}", path))?;
        debug!(pending = record.is_pending, "permission record written");
        Ok(())
    }

    /// Delete a record; returns whether a record existed.
    pub fn delete_record(&self, key: &str) -> Result<bool> {
        let path = self.perm_path(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("deleting permission record {:?}", path))?;
        Ok(true)
    }

    /// Look up the pre-authorization stub for an email, if one exists. The
    /// stub's key is derived from the normalized email, so this is a direct
    /// keyed read rather than a scan.
    pub fn find_pending_by_email(&self, email: &str) -> Result<Option<PermissionRecord>> {
        let key = RecordKey::pending_for_email(email).storage_key();
        match self.get_record(&key)? {
            Some(rec) if rec.is_pending => Ok(Some(rec)),
            _ => Ok(None),
        }
    }

    /// Scan for a real (non-pending) record carrying the given email.
    pub fn find_real_by_email(&self, email: &str) -> Result<Option<PermissionRecord>> {
        let wanted = normalize_email(email);
        for rec in self.list_records()? {
            if !rec.is_pending && rec.email == wanted {
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    /// All records, pending stubs included, in unspecified order.
    pub fn list_records(&self) -> Result<Vec<PermissionRecord>> {
        let dir = self.root.join(PERMS_DIR);
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("listing {:?}", dir))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading permission record {:?}", path))?;
            let rec: PermissionRecord = serde_json::from_str(&text)
                .with_context(|| format!("parsing permission record {:?}", path))?;
            out.push(rec);
        }
        Ok(out)
    }

    /// Append an entry to the audit ledger.
    pub fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        let path = self.root.join(AUDIT_DIR).join(format!("{}.json", entry.id));
        let text = serde_json::to_string_pretty(entry)?;
        fs::write(&path, text).with_context(|| format!("writing audit entry {:?}", path))?;
        Ok(())
    }

    /// All ledger entries, newest first.
    pub fn list_audit(&self) -> Result<Vec<AuditLogEntry>> {
        let dir = self.root.join(AUDIT_DIR);
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("listing {:?}", dir))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading audit entry {:?}", path))?;
            let rec: AuditLogEntry = serde_json::from_str(&text)
                .with_context(|| format!("parsing audit entry {:?}", path))?;
            out.push(rec);
        }
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }
}

/// Thread-safe clone-able handle around the store.
#[derive(Clone)]
pub struct SharedStore(pub Arc<Mutex<Store>>);

impl SharedStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        Ok(SharedStore(Arc::new(Mutex::new(Store::new(root)?))))
    }
}
