//! The ordered list of server profiles and the current selection.
//!
//! Profiles are persisted as a JSON array; credentials live only in the
//! [`SecretStore`] under the profile id and are resolved on demand.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{Engine, engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;

use crate::{
    error::{ImportError, RepositoryError, SecretStoreError},
    prober::ProbeRegistry,
    profile::{ProfileId, ServerProfile},
    secret_store::{SERVICE, SecretStore},
};

pub const SERVERS_FILE: &str = "servers.json";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub failed: usize,
}

pub struct ProfileRepository {
    path: PathBuf,
    profiles: Vec<ServerProfile>,
    current: Option<ProfileId>,
    secrets: Arc<dyn SecretStore>,
    probes: ProbeRegistry,
}

impl ProfileRepository {
    /// Loads `path`. A missing or unreadable file is replaced by a single
    /// placeholder profile, which is persisted immediately.
    pub fn load(path: PathBuf, secrets: Arc<dyn SecretStore>, probes: ProbeRegistry) -> Self {
        let loaded = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<ServerProfile>>(&bytes) {
                Ok(profiles) => {
                    log::info!(
                        "[repository] loaded {} profiles from {}",
                        profiles.len(),
                        path.display()
                    );
                    Some(profiles)
                }
                Err(error) => {
                    log::warn!("[repository] failed to parse {}: {error}", path.display());
                    None
                }
            },
            Err(_) => {
                log::info!("[repository] no server list at {}", path.display());
                None
            }
        };

        let synthesized = loaded.is_none();
        let profiles = loaded.unwrap_or_else(|| vec![ServerProfile::placeholder()]);
        let current = profiles
            .iter()
            .find(|profile| profile.is_active)
            .or_else(|| profiles.first())
            .map(|profile| profile.id.clone());

        let mut repository = Self {
            path,
            profiles,
            current,
            secrets,
            probes,
        };
        if synthesized && let Err(error) = repository.save() {
            log::error!("[repository] failed to persist placeholder: {error}");
        }
        repository
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &[ServerProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, id: &ProfileId) -> Option<&ServerProfile> {
        self.profiles.iter().find(|profile| &profile.id == id)
    }

    pub fn current_id(&self) -> Option<&ProfileId> {
        self.current.as_ref()
    }

    pub fn current_profile(&self) -> Option<&ServerProfile> {
        self.get(self.current.as_ref()?)
    }

    fn position(&self, id: &ProfileId) -> Option<usize> {
        self.profiles.iter().position(|profile| &profile.id == id)
    }

    /// Stores the credential first; the list is untouched if that fails.
    pub fn add(&mut self, mut profile: ServerProfile) -> Result<(), RepositoryError> {
        if self.position(&profile.id).is_some() {
            return self.update(profile);
        }

        let password = profile.password.take().unwrap_or_default();
        self.secrets
            .put(SERVICE, profile.id.as_str(), password.as_bytes())
            .inspect_err(|error| {
                log::error!("[repository] failed to store credential for {}: {error}", profile.name)
            })?;
        profile.password = Some(password);

        log::info!("[repository] added {} ({})", profile.name, profile.id);
        if self.current.is_none() {
            self.current = Some(profile.id.clone());
        }
        self.profiles.push(profile);
        self.save()
    }

    /// Replaces the record with the same id once its credential is stored.
    /// A profile without a password keeps the credential already on record.
    pub fn update(&mut self, mut profile: ServerProfile) -> Result<(), RepositoryError> {
        let index = self
            .position(&profile.id)
            .ok_or_else(|| RepositoryError::NotFound(profile.id.to_string()))?;

        if profile.password.is_none() {
            profile.password = Some(self.resolve_credential(&profile.id)?);
        }

        let account = profile.id.as_str();
        let secret = profile.password.as_deref().unwrap_or_default().as_bytes();
        match self.secrets.update(SERVICE, account, Some(secret)) {
            Ok(()) => {}
            Err(SecretStoreError::ItemNotFound) => {
                log::debug!("[repository] no credential for {account}, creating one");
                self.secrets.put(SERVICE, account, secret)?;
            }
            Err(error) => {
                log::error!("[repository] failed to update credential for {account}: {error}");
                return Err(error.into());
            }
        }

        log::info!("[repository] updated {} ({})", profile.name, profile.id);
        self.profiles[index] = profile;
        self.save()
    }

    pub fn remove(&mut self, id: &ProfileId) -> Result<(), RepositoryError> {
        let index = self
            .position(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;

        self.probes.cancel(id);
        self.secrets.delete(SERVICE, id.as_str())?;

        let removed = self.profiles.remove(index);
        log::info!("[repository] removed {} ({})", removed.name, removed.id);

        if self.current.as_ref() == Some(id) {
            self.current = self.profiles.first().map(|profile| profile.id.clone());
        }
        self.save()
    }

    pub fn select_current(&mut self, id: &ProfileId) -> Result<(), RepositoryError> {
        if self.position(id).is_none() {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        self.current = Some(id.clone());
        if let Err(error) = self.resolve_credential(id) {
            log::warn!("[repository] credential for {id} not resolved: {error}");
        }
        self.save()
    }

    /// Moves the rows at `from` so they land before the row that was at
    /// `to`, keeping their relative order.
    pub fn reorder(&mut self, from: &[usize], to: usize) -> Result<(), RepositoryError> {
        let length = self.profiles.len();
        let mut indices: Vec<usize> = from.iter().copied().filter(|index| *index < length).collect();
        indices.sort_unstable();
        indices.dedup();
        if indices.is_empty() {
            return Ok(());
        }

        let to = to.min(length);
        let shift = indices.iter().filter(|index| **index < to).count();
        let mut moved: Vec<ServerProfile> = indices
            .iter()
            .rev()
            .map(|index| self.profiles.remove(*index))
            .collect();
        moved.reverse();

        let insert_at = to - shift;
        self.profiles.splice(insert_at..insert_at, moved);
        self.save()
    }

    /// Selects the profile with the lowest latency/throughput score. Falls
    /// back to the first profile when none has both metrics.
    pub fn rank_best(&mut self) -> Result<ProfileId, RepositoryError> {
        let mut best: Option<(f64, &ServerProfile)> = None;
        for profile in &self.profiles {
            let Some(score) = profile.score() else {
                continue;
            };
            if best.is_none_or(|(lowest, _)| score < lowest) {
                best = Some((score, profile));
            }
        }

        let winner = match best {
            Some((score, profile)) => {
                log::info!("[repository] best server: {} (score {score:.2})", profile.name);
                profile.id.clone()
            }
            None => {
                let first = self.profiles.first().ok_or(RepositoryError::Empty)?;
                log::info!("[repository] no tested servers, falling back to {}", first.name);
                first.id.clone()
            }
        };

        self.select_current(&winner)?;
        Ok(winner)
    }

    /// Returns the credential for `id`, loading and caching it on first use.
    /// A missing secret resolves to an empty credential.
    pub fn resolve_credential(&mut self, id: &ProfileId) -> Result<String, RepositoryError> {
        let index = self
            .position(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        if let Some(password) = &self.profiles[index].password {
            return Ok(password.clone());
        }

        let password = match self.secrets.get(SERVICE, id.as_str()) {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| SecretStoreError::InvalidFormat)?,
            Err(SecretStoreError::ItemNotFound) => {
                log::debug!("[repository] no stored credential for {id}, using empty");
                String::new()
            }
            Err(error) => return Err(error.into()),
        };
        self.profiles[index].password = Some(password.clone());
        Ok(password)
    }

    /// `None` means the probe failed and the previous latency is discarded.
    pub fn record_latency(&mut self, id: &ProfileId, latency: Option<u32>) {
        let Some(index) = self.position(id) else {
            log::debug!("[repository] latency for removed profile {id} dropped");
            return;
        };
        let profile = &mut self.profiles[index];
        profile.last_ping = latency;
        profile.last_update = Some(Utc::now());
        if let Err(error) = self.save() {
            log::error!("[repository] failed to persist latency: {error}");
        }
    }

    pub fn record_throughput(&mut self, id: &ProfileId, speed: f64) {
        let Some(index) = self.position(id) else {
            log::debug!("[repository] throughput for removed profile {id} dropped");
            return;
        };
        let profile = &mut self.profiles[index];
        profile.last_speed = Some(speed);
        profile.last_update = Some(Utc::now());
        if let Err(error) = self.save() {
            log::error!("[repository] failed to persist throughput: {error}");
        }
    }

    /// Writes the whole list, flagging only the current profile as active.
    pub fn save(&mut self) -> Result<(), RepositoryError> {
        for profile in &mut self.profiles {
            profile.is_active = self.current.as_ref() == Some(&profile.id);
        }

        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| RepositoryError::Io { path, source }
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let content = serde_json::to_vec_pretty(&self.profiles)?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, content).map_err(io_error(&staging))?;
        std::fs::rename(&staging, &self.path).map_err(io_error(&self.path))?;

        log::debug!(
            "[repository] saved {} profiles to {}",
            self.profiles.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Adds every record from a JSON array. Ids are regenerated and any
    /// embedded credential is replaced by an empty one.
    pub fn import_json(&mut self, bytes: &[u8]) -> Result<ImportReport, ImportError> {
        let records: Vec<ServerProfile> = serde_json::from_slice(bytes)?;
        let mut report = ImportReport::default();

        for mut profile in records {
            profile.id = ProfileId::generate();
            profile.password = None;
            profile.is_active = false;
            let name = profile.name.clone();
            match self.add(profile) {
                Ok(()) => report.imported += 1,
                Err(error) => {
                    log::warn!("[import] failed to add {name}: {error}");
                    report.failed += 1;
                }
            }
        }

        log::info!(
            "[import] imported {} profiles ({} failed)",
            report.imported,
            report.failed
        );
        Ok(report)
    }

    pub fn import_subscription(&mut self, body: &[u8]) -> Result<ImportReport, ImportError> {
        let text: Vec<u8> = body
            .iter()
            .copied()
            .filter(|byte| !byte.is_ascii_whitespace())
            .collect();
        let decoded = STANDARD.decode(&text).or_else(|_| {
            let unpadded: Vec<u8> = text.iter().copied().filter(|byte| *byte != b'=').collect();
            URL_SAFE_NO_PAD.decode(unpadded)
        })?;
        self.import_json(&decoded)
    }

    pub fn import_link(&mut self, link: &str) -> Result<ProfileId, ImportError> {
        let profile = ServerProfile::from_share_link(link)?;
        let id = profile.id.clone();
        self.add(profile)
            .map_err(|error| ImportError::Link(error.to_string()))?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::ProbeKind, secret_store::MemorySecretStore};

    struct BrokenStore;

    impl SecretStore for BrokenStore {
        fn put(&self, _: &str, _: &str, _: &[u8]) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::UnexpectedStatus("locked".into()))
        }

        fn get(&self, _: &str, _: &str) -> Result<Vec<u8>, SecretStoreError> {
            Err(SecretStoreError::UnexpectedStatus("locked".into()))
        }

        fn update(&self, _: &str, _: &str, _: Option<&[u8]>) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::UnexpectedStatus("locked".into()))
        }

        fn delete(&self, _: &str, _: &str) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::UnexpectedStatus("locked".into()))
        }
    }

    fn profile(name: &str) -> ServerProfile {
        ServerProfile::new(name, &format!("{name}.example.com"), 8388, "aes-256-gcm")
    }

    fn fresh(directory: &Path) -> (ProfileRepository, Arc<MemorySecretStore>) {
        let secrets = Arc::new(MemorySecretStore::new());
        let mut repository = ProfileRepository::load(
            directory.join(SERVERS_FILE),
            secrets.clone(),
            ProbeRegistry::new(),
        );
        let placeholder = repository.list()[0].id.clone();
        repository.remove(&placeholder).unwrap();
        (repository, secrets)
    }

    fn names(repository: &ProfileRepository) -> Vec<&str> {
        repository.list().iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_missing_file_synthesizes_placeholder() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join(SERVERS_FILE);
        let repository =
            ProfileRepository::load(path.clone(), Arc::new(MemorySecretStore::new()), ProbeRegistry::new());

        assert_eq!(names(&repository), vec!["New Server"]);
        assert_eq!(repository.current_id(), Some(&repository.list()[0].id));
        assert!(path.exists());
    }

    #[test]
    fn test_corrupt_file_synthesizes_placeholder() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join(SERVERS_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        let repository =
            ProfileRepository::load(path, Arc::new(MemorySecretStore::new()), ProbeRegistry::new());
        assert_eq!(names(&repository), vec!["New Server"]);
    }

    #[test]
    fn test_round_trip_preserves_order_and_active_flag() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, secrets) = fresh(directory.path());
        for name in ["a", "b", "c"] {
            let mut entry = profile(name);
            entry.password = Some(format!("{name}-secret"));
            repository.add(entry).unwrap();
        }
        let second = repository.list()[1].id.clone();
        repository.select_current(&second).unwrap();

        let content = std::fs::read_to_string(repository.path()).unwrap();
        assert!(!content.contains("secret"));

        let reloaded =
            ProfileRepository::load(repository.path().to_path_buf(), secrets, ProbeRegistry::new());
        assert_eq!(names(&reloaded), vec!["a", "b", "c"]);
        assert_eq!(reloaded.current_id(), Some(&second));
        let active: Vec<bool> = reloaded.list().iter().map(|p| p.is_active).collect();
        assert_eq!(active, vec![false, true, false]);
    }

    #[test]
    fn test_add_aborts_when_credential_store_fails() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, _) = fresh(directory.path());
        repository.add(profile("kept")).unwrap();
        repository.secrets = Arc::new(BrokenStore);

        assert!(matches!(
            repository.add(profile("lost")),
            Err(RepositoryError::Secret(SecretStoreError::UnexpectedStatus(_)))
        ));
        assert_eq!(names(&repository), vec!["kept"]);
    }

    #[test]
    fn test_update_falls_back_to_create() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, secrets) = fresh(directory.path());
        repository.add(profile("a")).unwrap();
        let id = repository.list()[0].id.clone();
        secrets.delete(SERVICE, id.as_str()).unwrap();

        let mut edited = repository.list()[0].clone();
        edited.name = "renamed".into();
        edited.password = Some("new".into());
        repository.update(edited).unwrap();

        assert_eq!(names(&repository), vec!["renamed"]);
        assert_eq!(secrets.get(SERVICE, id.as_str()).unwrap(), b"new");
    }

    #[test]
    fn test_update_without_password_keeps_stored_credential() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, secrets) = fresh(directory.path());
        let mut original = profile("a");
        original.password = Some("hunter2".into());
        repository.add(original).unwrap();
        let id = repository.list()[0].id.clone();

        let mut reloaded = ProfileRepository::load(
            directory.path().join(SERVERS_FILE),
            secrets.clone(),
            ProbeRegistry::new(),
        );
        let mut edited = reloaded.list()[0].clone();
        assert_eq!(edited.password, None);
        edited.name = "renamed".into();
        reloaded.update(edited).unwrap();

        assert_eq!(names(&reloaded), vec!["renamed"]);
        assert_eq!(secrets.get(SERVICE, id.as_str()).unwrap(), b"hunter2");
        assert_eq!(reloaded.resolve_credential(&id).unwrap(), "hunter2");
    }

    #[test]
    fn test_failed_update_keeps_previous_record() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, _) = fresh(directory.path());
        repository.add(profile("a")).unwrap();
        repository.secrets = Arc::new(BrokenStore);

        let mut edited = repository.list()[0].clone();
        edited.name = "renamed".into();
        assert!(repository.update(edited).is_err());
        assert_eq!(names(&repository), vec!["a"]);
    }

    #[test]
    fn test_remove_current_advances_to_first() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, _) = fresh(directory.path());
        for name in ["a", "b", "c"] {
            repository.add(profile(name)).unwrap();
        }
        let second = repository.list()[1].id.clone();
        repository.select_current(&second).unwrap();
        repository.remove(&second).unwrap();
        assert_eq!(repository.current_id(), Some(&repository.list()[0].id));

        let ids: Vec<ProfileId> = repository.list().iter().map(|p| p.id.clone()).collect();
        for id in ids {
            repository.remove(&id).unwrap();
        }
        assert_eq!(repository.current_id(), None);
        assert!(repository.is_empty());
    }

    #[test]
    fn test_remove_cancels_probes_and_credential() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, secrets) = fresh(directory.path());
        repository.add(profile("a")).unwrap();
        let id = repository.list()[0].id.clone();
        let (_, token) = repository.probes.begin(&id, ProbeKind::Latency);

        repository.remove(&id).unwrap();
        assert!(token.is_cancelled());
        assert_eq!(
            secrets.get(SERVICE, id.as_str()),
            Err(SecretStoreError::ItemNotFound)
        );
    }

    #[test]
    fn test_reorder_moves_rows_before_target() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, _) = fresh(directory.path());
        for name in ["a", "b", "c", "d", "e"] {
            repository.add(profile(name)).unwrap();
        }
        repository.reorder(&[0], 3).unwrap();
        assert_eq!(names(&repository), vec!["b", "c", "a", "d", "e"]);

        repository.reorder(&[3, 4], 0).unwrap();
        assert_eq!(names(&repository), vec!["d", "e", "b", "c", "a"]);

        repository.reorder(&[1, 3], 5).unwrap();
        assert_eq!(names(&repository), vec!["d", "b", "a", "e", "c"]);
    }

    #[test]
    fn test_rank_best_picks_lowest_score() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, _) = fresh(directory.path());
        let mut first = profile("first");
        first.last_ping = Some(50);
        first.last_speed = Some(2.0);
        let mut second = profile("second");
        second.last_ping = Some(200);
        second.last_speed = Some(10.0);
        let untested = profile("untested");
        repository.add(untested).unwrap();
        repository.add(first).unwrap();
        repository.add(second.clone()).unwrap();

        assert_eq!(repository.rank_best().unwrap(), second.id);
        assert_eq!(repository.current_id(), Some(&second.id));
    }

    #[test]
    fn test_rank_best_ties_go_to_list_order() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, _) = fresh(directory.path());
        let mut a = profile("a");
        a.last_ping = Some(100);
        a.last_speed = Some(4.0);
        let mut b = profile("b");
        b.last_ping = Some(50);
        b.last_speed = Some(2.0);
        repository.add(a.clone()).unwrap();
        repository.add(b).unwrap();
        assert_eq!(repository.rank_best().unwrap(), a.id);
    }

    #[test]
    fn test_rank_best_falls_back_to_first() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, _) = fresh(directory.path());
        assert!(matches!(repository.rank_best(), Err(RepositoryError::Empty)));

        repository.add(profile("a")).unwrap();
        repository.add(profile("b")).unwrap();
        let second = repository.list()[1].id.clone();
        repository.select_current(&second).unwrap();
        assert_eq!(repository.rank_best().unwrap(), repository.list()[0].id);
    }

    #[test]
    fn test_missing_credential_resolves_empty() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, secrets) = fresh(directory.path());
        repository.add(profile("a")).unwrap();
        let id = repository.list()[0].id.clone();
        secrets.delete(SERVICE, id.as_str()).unwrap();
        repository.profiles[0].password = None;

        assert_eq!(repository.resolve_credential(&id).unwrap(), "");
    }

    #[test]
    fn test_import_strips_credentials() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, secrets) = fresh(directory.path());
        let payload = br#"[
            {"id":"fixed","name":"one","address":"1.example.com","port":8388,"method":"aes-256-gcm","password":"leaked"},
            {"name":"two","address":"2.example.com","port":443,"method":"chacha20-ietf-poly1305","isActive":true}
        ]"#;

        let report = repository.import_json(payload).unwrap();
        assert_eq!(report, ImportReport { imported: 2, failed: 0 });
        assert_eq!(names(&repository), vec!["one", "two"]);
        for entry in repository.list() {
            assert_ne!(entry.id.as_str(), "fixed");
            assert_eq!(secrets.get(SERVICE, entry.id.as_str()).unwrap(), b"");
        }
        let active = repository.list().iter().filter(|p| p.is_active).count();
        assert_eq!(active, 1);
    }

    #[test]
    fn test_import_subscription_decodes_base64() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, _) = fresh(directory.path());
        let json = r#"[{"name":"sub","address":"s.example.com","port":8388,"method":"aes-128-gcm"}]"#;
        let body = format!("{}\n", STANDARD.encode(json));

        let report = repository.import_subscription(body.as_bytes()).unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(names(&repository), vec!["sub"]);

        assert!(matches!(
            repository.import_subscription(b"%%%"),
            Err(ImportError::Base64(_))
        ));
    }

    #[test]
    fn test_record_telemetry() {
        let directory = tempfile::tempdir().unwrap();
        let (mut repository, _) = fresh(directory.path());
        repository.add(profile("a")).unwrap();
        let id = repository.list()[0].id.clone();

        repository.record_latency(&id, Some(80));
        repository.record_throughput(&id, 5.5);
        let entry = repository.get(&id).unwrap();
        assert_eq!(entry.last_ping, Some(80));
        assert_eq!(entry.last_speed, Some(5.5));
        assert!(entry.last_update.is_some());

        repository.record_latency(&id, None);
        assert_eq!(repository.get(&id).unwrap().last_ping, None);
        assert_eq!(repository.get(&id).unwrap().last_speed, Some(5.5));
    }
}
