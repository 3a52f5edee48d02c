use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretStoreError {
    #[error("secret already exists")]
    DuplicateItem,
    #[error("secret not found")]
    ItemNotFound,
    #[error("secret has an invalid format")]
    InvalidFormat,
    #[error("secret store failure: {0}")]
    UnexpectedStatus(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("failed to launch {program}: {reason}")]
    LaunchFailed { program: String, reason: String },
    #[error("executable not found: {}", .0.display())]
    NotFound(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("could not parse probe output: {0}")]
    Unparseable(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("probe superseded")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid profile: {0}")]
    InvalidProfile(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallationError {
    #[error("installation step '{step}' failed: {output}")]
    StepFailed { step: String, output: String },
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Secret(#[from] SecretStoreError),
    #[error("profile not found: {0}")]
    NotFound(String),
    #[error("no profiles available")]
    Empty,
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize profiles: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },
    #[error("failed to fetch import source: {0}")]
    Fetch(String),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid profile list: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid share link: {0}")]
    Link(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("shadowsocks client is not installed")]
    NotInstalled,
    #[error("no server selected")]
    NoCurrentProfile,
    #[error("a session is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Credential(#[from] RepositoryError),
    #[error("failed to write proxy configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}
