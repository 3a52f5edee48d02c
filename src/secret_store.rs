use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Mutex,
};

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::error::SecretStoreError;

pub const SERVICE: &str = "shadowsocks-ui";

/// Key/value secret storage addressed by `(service, account)`.
pub trait SecretStore: Send + Sync {
    fn put(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), SecretStoreError>;

    fn get(&self, service: &str, account: &str) -> Result<Vec<u8>, SecretStoreError>;

    /// `None` clears the stored value to empty.
    fn update(
        &self,
        service: &str,
        account: &str,
        secret: Option<&[u8]>,
    ) -> Result<(), SecretStoreError>;

    /// Deleting a missing item succeeds.
    fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError>;
}

#[derive(Default)]
pub struct MemorySecretStore {
    items: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), Vec<u8>>>, SecretStoreError>
    {
        self.items
            .lock()
            .map_err(|_| SecretStoreError::UnexpectedStatus("secret store lock poisoned".into()))
    }
}

impl SecretStore for MemorySecretStore {
    fn put(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), SecretStoreError> {
        let mut items = self.locked()?;
        let key = (service.to_string(), account.to_string());
        if items.contains_key(&key) {
            return Err(SecretStoreError::DuplicateItem);
        }
        items.insert(key, secret.to_vec());
        Ok(())
    }

    fn get(&self, service: &str, account: &str) -> Result<Vec<u8>, SecretStoreError> {
        self.locked()?
            .get(&(service.to_string(), account.to_string()))
            .cloned()
            .ok_or(SecretStoreError::ItemNotFound)
    }

    fn update(
        &self,
        service: &str,
        account: &str,
        secret: Option<&[u8]>,
    ) -> Result<(), SecretStoreError> {
        let mut items = self.locked()?;
        let entry = items
            .get_mut(&(service.to_string(), account.to_string()))
            .ok_or(SecretStoreError::ItemNotFound)?;
        *entry = secret.unwrap_or_default().to_vec();
        Ok(())
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        self.locked()?
            .remove(&(service.to_string(), account.to_string()));
        Ok(())
    }
}

/// Secrets persisted as a JSON map of `service/account` to base64 values.
/// Every operation reads and rewrites the whole file under a process-wide lock.
pub struct FileSecretStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key(service: &str, account: &str) -> String {
        format!("{service}/{account}")
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, SecretStoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|error| {
                log::warn!(
                    "[secrets] failed to parse {}: {error}",
                    self.path.display()
                );
                SecretStoreError::InvalidFormat
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(error) => Err(SecretStoreError::UnexpectedStatus(format!(
                "failed to read {}: {error}",
                self.path.display()
            ))),
        }
    }

    fn write_all(&self, items: &BTreeMap<String, String>) -> Result<(), SecretStoreError> {
        let unexpected = |error: String| SecretStoreError::UnexpectedStatus(error);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                unexpected(format!("failed to create {}: {error}", parent.display()))
            })?;
        }

        let content = serde_json::to_string_pretty(items)
            .map_err(|error| unexpected(format!("failed to serialize secrets: {error}")))?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, content).map_err(|error| {
            unexpected(format!("failed to write {}: {error}", staging.display()))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(error) =
                std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600))
            {
                log::warn!("[secrets] failed to restrict permissions: {error}");
            }
        }

        std::fs::rename(&staging, &self.path).map_err(|error| {
            unexpected(format!("failed to replace {}: {error}", self.path.display()))
        })
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, SecretStoreError> {
        self.lock
            .lock()
            .map_err(|_| SecretStoreError::UnexpectedStatus("secret store lock poisoned".into()))
    }
}

impl SecretStore for FileSecretStore {
    fn put(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), SecretStoreError> {
        let _guard = self.guard()?;
        let mut items = self.read_all()?;
        let key = Self::key(service, account);
        if items.contains_key(&key) {
            return Err(SecretStoreError::DuplicateItem);
        }
        items.insert(key, STANDARD.encode(secret));
        self.write_all(&items)
    }

    fn get(&self, service: &str, account: &str) -> Result<Vec<u8>, SecretStoreError> {
        let _guard = self.guard()?;
        let items = self.read_all()?;
        let encoded = items
            .get(&Self::key(service, account))
            .ok_or(SecretStoreError::ItemNotFound)?;
        STANDARD
            .decode(encoded)
            .map_err(|_| SecretStoreError::InvalidFormat)
    }

    fn update(
        &self,
        service: &str,
        account: &str,
        secret: Option<&[u8]>,
    ) -> Result<(), SecretStoreError> {
        let _guard = self.guard()?;
        let mut items = self.read_all()?;
        let entry = items
            .get_mut(&Self::key(service, account))
            .ok_or(SecretStoreError::ItemNotFound)?;
        *entry = STANDARD.encode(secret.unwrap_or_default());
        self.write_all(&items)
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        let _guard = self.guard()?;
        let mut items = self.read_all()?;
        if items.remove(&Self::key(service, account)).is_some() {
            self.write_all(&items)?;
        }
        Ok(())
    }
}
