use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ImportError, ValidationError};

pub const DEFAULT_LOCAL_PORT: u16 = 1080;
pub const DEFAULT_TIMEOUT: u32 = 300;

pub const SUPPORTED_METHODS: &[&str] = &[
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "aes-128-cfb",
    "aes-192-cfb",
    "aes-256-cfb",
    "aes-128-ctr",
    "aes-192-ctr",
    "aes-256-ctr",
    "camellia-128-cfb",
    "camellia-192-cfb",
    "camellia-256-cfb",
    "bf-cfb",
    "chacha20-ietf",
    "salsa20",
    "rc4-md5",
];

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProfileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingStatus {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

impl PingStatus {
    pub fn from_latency(latency: Option<u32>) -> Self {
        match latency {
            None => Self::Unknown,
            Some(ms) if ms < 100 => Self::Excellent,
            Some(ms) if ms < 300 => Self::Good,
            Some(ms) if ms < 500 => Self::Fair,
            Some(_) => Self::Poor,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Unknown => "unknown",
        }
    }
}

/// A proxy server profile as persisted in `servers.json`.
///
/// The password is only ever held in memory after it has been resolved from
/// the secret store; it is never serialized and any `password` key in an
/// incoming record is dropped on deserialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProfile {
    #[serde(default = "ProfileId::generate")]
    pub id: ProfileId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub method: String,
    #[serde(default = "default_local_port")]
    pub local_port: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ping: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_speed: Option<f64>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_local_port() -> u32 {
    DEFAULT_LOCAL_PORT as u32
}

fn default_timeout() -> u32 {
    DEFAULT_TIMEOUT
}

impl ServerProfile {
    pub fn new(name: &str, address: &str, port: u32, method: &str) -> Self {
        Self {
            id: ProfileId::generate(),
            name: name.to_string(),
            address: address.to_string(),
            port,
            method: method.to_string(),
            local_port: default_local_port(),
            timeout: DEFAULT_TIMEOUT,
            last_ping: None,
            last_speed: None,
            is_active: false,
            last_update: None,
            password: None,
        }
    }

    pub fn placeholder() -> Self {
        Self::new("New Server", "example.com", 8388, "aes-256-gcm")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::InvalidProfile("name is empty".into()));
        }
        if self.address.trim().is_empty() {
            return Err(ValidationError::InvalidProfile("address is empty".into()));
        }
        if !(1..=65535).contains(&self.port) {
            return Err(ValidationError::InvalidProfile(format!(
                "port {} is out of range",
                self.port
            )));
        }
        if !SUPPORTED_METHODS.contains(&self.method.as_str()) {
            return Err(ValidationError::InvalidProfile(format!(
                "unsupported method '{}'",
                self.method
            )));
        }
        if !(1024..=65535).contains(&self.local_port) {
            return Err(ValidationError::InvalidProfile(format!(
                "local port {} is out of range",
                self.local_port
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn ping_status(&self) -> PingStatus {
        PingStatus::from_latency(self.last_ping)
    }

    /// Latency divided by throughput; lower is better. `None` when either
    /// metric is missing or the throughput is not positive.
    pub fn score(&self) -> Option<f64> {
        let latency = self.last_ping?;
        let speed = self.last_speed.filter(|speed| *speed > 0.0)?;
        Some(latency as f64 / speed)
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }

    pub fn share_link(&self) -> String {
        let credential = match self.password() {
            "" => self.method.clone(),
            password => format!("{}:{password}", self.method),
        };
        let plain = format!("{credential}@{}:{}", self.address, self.port);
        format!("ss://{}", STANDARD.encode(plain))
    }

    pub fn from_share_link(link: &str) -> Result<Self, ImportError> {
        let body = link
            .trim()
            .strip_prefix("ss://")
            .ok_or_else(|| ImportError::Link("missing ss:// scheme".into()))?;
        let (encoded, name) = match body.split_once('#') {
            Some((encoded, name)) => (encoded, Some(name)),
            None => (body, None),
        };

        let decoded = STANDARD
            .decode(encoded)
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')))?;
        let plain = String::from_utf8(decoded)
            .map_err(|_| ImportError::Link("link payload is not UTF-8".into()))?;

        let (credential, endpoint) = plain
            .rsplit_once('@')
            .ok_or_else(|| ImportError::Link("missing '@' separator".into()))?;
        let (method, password) = match credential.split_once(':') {
            Some((method, password)) => (method, password),
            None => (credential, ""),
        };
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| ImportError::Link("missing port".into()))?;
        let port = port
            .parse::<u32>()
            .map_err(|_| ImportError::Link(format!("invalid port '{port}'")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let name = name
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{host}:{port}"));

        let mut profile = Self::new(&name, host, port, method);
        if !password.is_empty() {
            profile.password = Some(password.to_string());
        }
        Ok(profile)
    }
}
