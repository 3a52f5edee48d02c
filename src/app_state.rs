use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::configuration::ProxyMode;

pub const FREE_NODES_URL: &str =
    "https://raw.githubusercontent.com/shadowsocks-ui/free-nodes/main/servers.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppState {
    #[serde(default)]
    pub proxy_mode: ProxyMode,
    #[serde(default)]
    pub pac_url: Option<String>,
    #[serde(default)]
    pub subscription_url: Option<String>,
    #[serde(default)]
    pub executable_path: Option<PathBuf>,
    #[serde(default)]
    pub free_nodes_url: Option<String>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            proxy_mode: ProxyMode::Global,
            pac_url: None,
            subscription_url: None,
            executable_path: None,
            free_nodes_url: None,
        }
    }
}

impl AppState {
    pub fn state_file_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shadowsocks-ui")
            .join("shadowsocks-ui.toml")
    }

    pub fn load() -> Self {
        Self::load_from(&Self::state_file_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(state) => {
                    log::info!("[app_state] loaded from {}", path.display());
                    state
                }
                Err(error) => {
                    log::warn!("[app_state] failed to parse {}: {error}", path.display());
                    Self::default()
                }
            },
            Err(_) => {
                log::info!(
                    "[app_state] no state file at {}, using defaults",
                    path.display()
                );
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) {
        if let Some(parent) = path.parent()
            && let Err(error) = std::fs::create_dir_all(parent)
        {
            log::warn!(
                "[app_state] failed to create state directory {}: {error}",
                parent.display()
            );
        }
        match toml::to_string_pretty(self) {
            Ok(content) => {
                if let Err(error) = std::fs::write(path, content) {
                    log::warn!("[app_state] failed to write {}: {error}", path.display());
                }
            }
            Err(error) => {
                log::warn!("[app_state] failed to serialize state: {error}");
            }
        }
    }

    pub fn free_nodes_url(&self) -> &str {
        self.free_nodes_url.as_deref().unwrap_or(FREE_NODES_URL)
    }

    pub fn set_proxy_mode(&mut self, mode: ProxyMode) {
        self.proxy_mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let state = AppState::load_from(&directory.path().join("absent.toml"));
        assert_eq!(state, AppState::default());
        assert_eq!(state.free_nodes_url(), FREE_NODES_URL);
    }

    #[test]
    fn test_save_and_load() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join("state.toml");
        let mut state = AppState::default();
        state.set_proxy_mode(ProxyMode::Pac);
        state.subscription_url = Some("https://example.com/sub".into());
        state.save_to(&path);

        let loaded = AppState::load_from(&path);
        assert_eq!(loaded, state);
        assert!(
            std::fs::read_to_string(&path)
                .unwrap()
                .contains("proxy_mode = \"pac\"")
        );
    }

    #[test]
    fn test_corrupt_file_uses_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("state.toml");
        std::fs::write(&path, "proxy_mode = [").unwrap();
        assert_eq!(AppState::load_from(&path), AppState::default());
    }
}
