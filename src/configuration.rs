use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::profile::ServerProfile;

pub const LOCAL_LISTEN_HOST: &str = "127.0.0.1";

pub fn configuration_directory() -> PathBuf {
    let directory = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shadowsocks-ui");
    if let Err(error) = std::fs::create_dir_all(&directory) {
        log::warn!(
            "[configuration] failed to create configuration directory {}: {error}",
            directory.display()
        );
    }
    directory
}

pub fn runtime_directory() -> PathBuf {
    std::env::temp_dir().join(format!("shadowsocks-ui-{}", std::process::id()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Global,
    Pac,
    Manual,
}

impl ProxyMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Pac => "pac",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "global" => Some(Self::Global),
            "pac" => Some(Self::Pac),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// The JSON document handed to the client via `-c`.
#[derive(Serialize, Debug)]
pub struct ProxyConfiguration {
    pub server: String,
    pub server_port: u32,
    pub local_port: u32,
    pub method: String,
    pub timeout: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfiguration {
    pub fn new(profile: &ServerProfile, password: &str) -> Self {
        log::debug!(
            "[configuration] server={}:{}, local_port={}, method={}, timeout={}",
            profile.address,
            profile.port,
            profile.local_port,
            profile.method,
            profile.timeout,
        );

        Self {
            server: profile.address.clone(),
            server_port: profile.port,
            local_port: profile.local_port,
            method: profile.method.clone(),
            timeout: profile.timeout,
            password: (!password.is_empty()).then(|| password.to_string()),
        }
    }
}

pub fn proxy_configuration_path(directory: &Path, profile: &ServerProfile) -> PathBuf {
    directory.join(format!("{}.json", profile.id))
}

pub fn write_proxy_configuration(
    directory: &Path,
    profile: &ServerProfile,
    password: &str,
) -> Result<PathBuf, String> {
    std::fs::create_dir_all(directory)
        .map_err(|error| format!("Failed to create {}: {error}", directory.display()))?;

    let configuration = ProxyConfiguration::new(profile, password);
    let json = serde_json::to_string_pretty(&configuration)
        .map_err(|error| format!("Configuration serialization error: {error}"))?;

    log::info!(
        "[connect] generated configuration:\n{}",
        redact_password_in_json(&json)
    );

    let path = proxy_configuration_path(directory, profile);
    std::fs::write(&path, &json)
        .map_err(|error| format!("Failed to write {}: {error}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(error) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
        {
            log::warn!("[configuration] failed to restrict permissions: {error}");
        }
    }

    Ok(path)
}

pub fn redact_password_in_json(json: &str) -> String {
    json.lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("\"password\"")
                && let Some(colon_position) = line.find(':')
            {
                let value = line[colon_position + 1..].trim().trim_end_matches(',');
                let length = value
                    .strip_prefix('"')
                    .and_then(|stripped| stripped.strip_suffix('"'))
                    .map(|inner| inner.len())
                    .unwrap_or(value.len());
                let trailing = if line.trim_end().ends_with(',') { "," } else { "" };
                return format!(
                    "{}: \"{}\"{trailing}",
                    &line[..colon_position],
                    "*".repeat(length)
                );
            }
            line.to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Routes every request through the local SOCKS5 listener.
pub fn pac_script(local_port: u32) -> String {
    format!(
        "function FindProxyForURL(url, host) {{\n  \
         if (isPlainHostName(host) || host === \"localhost\" || host === \"{LOCAL_LISTEN_HOST}\") {{\n    \
         return \"DIRECT\";\n  }}\n  \
         return \"SOCKS5 {LOCAL_LISTEN_HOST}:{local_port}; SOCKS {LOCAL_LISTEN_HOST}:{local_port}; DIRECT\";\n}}\n"
    )
}

pub fn write_pac_file(directory: &Path, local_port: u32) -> Result<PathBuf, String> {
    std::fs::create_dir_all(directory)
        .map_err(|error| format!("Failed to create {}: {error}", directory.display()))?;
    let path = directory.join("proxy.pac");
    std::fs::write(&path, pac_script(local_port))
        .map_err(|error| format!("Failed to write {}: {error}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ServerProfile {
        let mut profile = ServerProfile::new("Tokyo", "jp.example.com", 8388, "aes-256-gcm");
        profile.local_port = 1086;
        profile.timeout = 60;
        profile
    }

    #[test]
    fn test_configuration_fields() {
        let json = serde_json::to_value(ProxyConfiguration::new(&profile(), "pw")).unwrap();
        assert_eq!(json["server"], "jp.example.com");
        assert_eq!(json["server_port"], 8388);
        assert_eq!(json["local_port"], 1086);
        assert_eq!(json["method"], "aes-256-gcm");
        assert_eq!(json["timeout"], 60);
        assert_eq!(json["password"], "pw");
    }

    #[test]
    fn test_configuration_omits_empty_password() {
        let json = serde_json::to_value(ProxyConfiguration::new(&profile(), "")).unwrap();
        assert!(json.get("password").is_none());
    }

    #[test]
    fn test_write_configuration_per_profile() {
        let directory = tempfile::tempdir().unwrap();
        let profile = profile();
        let path = write_proxy_configuration(directory.path(), &profile, "pw").unwrap();
        assert_eq!(path, proxy_configuration_path(directory.path(), &profile));
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("\"password\": \"pw\""));
    }

    #[test]
    fn test_redact_password() {
        let json = "{\n  \"server\": \"h\",\n  \"password\": \"secret\",\n  \"timeout\": 1\n}";
        let redacted = redact_password_in_json(json);
        assert!(redacted.contains("\"password\": \"******\","));
        assert!(!redacted.contains("secret"));
        assert!(redacted.contains("\"server\": \"h\","));
    }

    #[test]
    fn test_proxy_mode_parse() {
        assert_eq!(ProxyMode::parse("PAC"), Some(ProxyMode::Pac));
        assert_eq!(ProxyMode::parse("global"), Some(ProxyMode::Global));
        assert_eq!(ProxyMode::parse(" Manual "), Some(ProxyMode::Manual));
        assert_eq!(ProxyMode::parse("tun"), None);
    }

    #[test]
    fn test_pac_script_points_at_local_port() {
        assert!(pac_script(1086).contains("SOCKS5 127.0.0.1:1086"));
    }
}
