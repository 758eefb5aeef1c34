//! Persistent store for users, policies and the internal admin secret
//!
//! A JSON document kept in memory behind a lock and written back with a
//! tmp+rename on every mutation. Each policy carries a monotonic version
//! counter bumped on every change; the runtime pollers watch those numbers.

mod password;
mod rules;

pub use rules::{classify_pattern, normalize_cidr, normalize_domain, DenyKind, DenyRule};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const STORE_FILE: &str = "store.json";
const SECRET_FILE: &str = "admin.secret";

/// Localhost entries seeded on first open. A `clear` never touches them;
/// an explicit delete may.
const SEEDED_ALLOWLIST: [&str; 2] = ["127.0.0.1/32", "::1/128"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("user already exists: {0}")]
    UserExists(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("invalid credentials")]
    BadCredentials,
    #[error("invalid pattern: {0:?}")]
    InvalidPattern(String),
    #[error("rule not found: {0}")]
    RuleNotFound(String),
    #[error("password cannot be empty")]
    EmptyPassword,
    #[error("password hashing failed: {0}")]
    Hash(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub password_hash: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DenyEntry {
    kind: DenyKind,
    enabled: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    users: BTreeMap<String, UserRecord>,
    /// cidr -> enabled
    #[serde(default)]
    allowlist: BTreeMap<String, bool>,
    #[serde(default)]
    allow_version: u64,
    /// pattern -> rule
    #[serde(default)]
    denylist: BTreeMap<String, DenyEntry>,
    #[serde(default)]
    deny_version: u64,
}

/// File-backed store shared across the CLI, the front-ends and the policy
/// pollers.
pub struct FileStore {
    path: PathBuf,
    secret_path: PathBuf,
    state: RwLock<StoreState>,
}

impl FileStore {
    /// Open (or create) the store under `dir`, seeding the localhost
    /// allowlist entries and the admin secret on first run.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE);
        let secret_path = dir.join(SECRET_FILE);

        let mut state = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            StoreState::default()
        };

        let mut dirty = false;
        if state.allow_version == 0 {
            state.allow_version = 1;
            dirty = true;
        }
        if state.deny_version == 0 {
            state.deny_version = 1;
            dirty = true;
        }
        for cidr in SEEDED_ALLOWLIST {
            if !state.allowlist.contains_key(cidr) {
                state.allowlist.insert(cidr.to_string(), true);
                dirty = true;
            }
        }

        let store = Self {
            path,
            secret_path,
            state: RwLock::new(state),
        };
        if dirty {
            store.persist()?;
        }
        store.ensure_admin_secret()?;
        Ok(store)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let payload = serde_json::to_string_pretty(&*self.state.read())?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // ---- users ----

    pub fn add_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let hash = password::hash_password(password)?;
        {
            let mut state = self.state.write();
            if state.users.contains_key(username) {
                return Err(StoreError::UserExists(username.to_string()));
            }
            state.users.insert(
                username.to_string(),
                UserRecord {
                    password_hash: hash,
                    active: true,
                },
            );
        }
        self.persist()
    }

    pub fn remove_user(&self, username: &str) -> Result<(), StoreError> {
        {
            let mut state = self.state.write();
            if state.users.remove(username).is_none() {
                return Err(StoreError::UserNotFound(username.to_string()));
            }
        }
        self.persist()
    }

    pub fn list_users(&self) -> Vec<(String, bool)> {
        self.state
            .read()
            .users
            .iter()
            .map(|(name, rec)| (name.clone(), rec.active))
            .collect()
    }

    pub fn set_active(&self, username: &str, active: bool) -> Result<(), StoreError> {
        {
            let mut state = self.state.write();
            let rec = state
                .users
                .get_mut(username)
                .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
            rec.active = active;
        }
        self.persist()
    }

    /// The active flag is the sole runtime gate; unknown users read as
    /// inactive.
    pub fn is_active(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .read()
            .users
            .get(username)
            .map(|rec| rec.active)
            .unwrap_or(false))
    }

    /// Verify credentials. Unknown users and bad passwords are
    /// indistinguishable to the caller.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let hash = match self.state.read().users.get(username) {
            Some(rec) => rec.password_hash.clone(),
            None => return false,
        };
        password::verify_password(&hash, password)
    }

    // ---- source allowlist ----

    pub fn allow_ip(&self, input: &str) -> Result<String, StoreError> {
        let cidr = rules::normalize_cidr(input)?;
        {
            let mut state = self.state.write();
            state.allowlist.insert(cidr.clone(), true);
            state.allow_version += 1;
        }
        self.persist()?;
        Ok(cidr)
    }

    pub fn block_ip(&self, input: &str) -> Result<String, StoreError> {
        let cidr = rules::normalize_cidr(input)?;
        {
            let mut state = self.state.write();
            match state.allowlist.get_mut(&cidr) {
                Some(enabled) => *enabled = false,
                None => return Err(StoreError::RuleNotFound(cidr)),
            }
            state.allow_version += 1;
        }
        self.persist()?;
        Ok(cidr)
    }

    /// Hard delete; permitted even for the seeded localhost entries.
    pub fn delete_allowed_ip(&self, input: &str) -> Result<String, StoreError> {
        let cidr = rules::normalize_cidr(input)?;
        {
            let mut state = self.state.write();
            if state.allowlist.remove(&cidr).is_none() {
                return Err(StoreError::RuleNotFound(cidr));
            }
            state.allow_version += 1;
        }
        self.persist()?;
        Ok(cidr)
    }

    /// Disable every entry except the seeded localhost ones.
    pub fn clear_allowlist(&self) -> Result<(), StoreError> {
        {
            let mut state = self.state.write();
            for (cidr, enabled) in state.allowlist.iter_mut() {
                if !SEEDED_ALLOWLIST.contains(&cidr.as_str()) {
                    *enabled = false;
                }
            }
            state.allow_version += 1;
        }
        self.persist()
    }

    pub fn list_allowlist(&self) -> Vec<(String, bool)> {
        self.state
            .read()
            .allowlist
            .iter()
            .map(|(cidr, enabled)| (cidr.clone(), *enabled))
            .collect()
    }

    /// Enabled entries as parsed networks. A corrupt entry fails the whole
    /// load; the caller keeps its previous snapshot.
    pub fn load_allowlist(&self) -> Result<Vec<IpNet>, StoreError> {
        self.state
            .read()
            .allowlist
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(cidr, _)| {
                cidr.parse()
                    .map_err(|_| StoreError::InvalidPattern(cidr.clone()))
            })
            .collect()
    }

    pub fn allow_version(&self) -> u64 {
        self.state.read().allow_version
    }

    // ---- destination denylist ----

    pub fn block_dest(&self, input: &str) -> Result<(String, DenyKind), StoreError> {
        let (pattern, kind) = rules::classify_pattern(input)?;
        {
            let mut state = self.state.write();
            state.denylist.insert(
                pattern.clone(),
                DenyEntry {
                    kind,
                    enabled: true,
                },
            );
            state.deny_version += 1;
        }
        self.persist()?;
        Ok((pattern, kind))
    }

    /// Soft remove: disable a deny rule.
    pub fn allow_dest(&self, input: &str) -> Result<String, StoreError> {
        let (pattern, _) = rules::classify_pattern(input)?;
        {
            let mut state = self.state.write();
            match state.denylist.get_mut(&pattern) {
                Some(entry) => entry.enabled = false,
                None => return Err(StoreError::RuleNotFound(pattern)),
            }
            state.deny_version += 1;
        }
        self.persist()?;
        Ok(pattern)
    }

    pub fn delete_dest(&self, input: &str) -> Result<String, StoreError> {
        let (pattern, _) = rules::classify_pattern(input)?;
        {
            let mut state = self.state.write();
            if state.denylist.remove(&pattern).is_none() {
                return Err(StoreError::RuleNotFound(pattern));
            }
            state.deny_version += 1;
        }
        self.persist()?;
        Ok(pattern)
    }

    pub fn list_denylist(&self) -> Vec<DenyRule> {
        self.state
            .read()
            .denylist
            .iter()
            .map(|(pattern, entry)| DenyRule {
                pattern: pattern.clone(),
                kind: entry.kind,
                enabled: entry.enabled,
            })
            .collect()
    }

    /// Enabled rules only, for runtime builds.
    pub fn load_denylist(&self) -> Result<Vec<DenyRule>, StoreError> {
        Ok(self
            .state
            .read()
            .denylist
            .iter()
            .filter(|(_, entry)| entry.enabled)
            .map(|(pattern, entry)| DenyRule {
                pattern: pattern.clone(),
                kind: entry.kind,
                enabled: true,
            })
            .collect())
    }

    pub fn deny_version(&self) -> u64 {
        self.state.read().deny_version
    }

    // ---- admin secret ----

    fn ensure_admin_secret(&self) -> Result<(), StoreError> {
        if self.secret_path.exists() {
            return Ok(());
        }

        let mut raw = [0u8; 32];
        getrandom::getrandom(&mut raw)
            .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        fs::write(&self.secret_path, BASE64.encode(raw))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.secret_path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// The secret shared between the admin endpoint and the CLI.
    pub fn admin_secret(&self) -> Result<String, StoreError> {
        Ok(fs::read_to_string(&self.secret_path)?.trim().to_string())
    }
}
