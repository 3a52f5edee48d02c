//! Everything that may mutate application state arrives as an [`Event`] on a
//! single channel and is applied by the owning [`crate::app::ShadowsocksApp`].

use std::{fmt, path::PathBuf};

use crate::{
    configuration::ProxyMode,
    error::{ImportError, ProbeError},
    installation::InstallationState,
    process_log::OutputStream,
    profile::{ProfileId, ServerProfile},
    traffic::TrafficSample,
};

/// Identifies one spawned client process. Events tagged with a stale session
/// are ignored.
pub type SessionId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Latency,
    Throughput,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportSource {
    File(PathBuf),
    Subscription(String),
    FreeNodes,
    Link(String),
}

/// Names the source for logs. A link carries its credential, so only the
/// scheme is shown.
impl fmt::Display for ImportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file {}", path.display()),
            Self::Subscription(url) => write!(f, "subscription {url}"),
            Self::FreeNodes => f.write_str("free-nodes feed"),
            Self::Link(_) => f.write_str("ss:// link"),
        }
    }
}

#[derive(Debug)]
pub enum Command {
    Start,
    Stop,
    Restart,
    AddProfile(ServerProfile),
    UpdateProfile(ServerProfile),
    RemoveProfile(ProfileId),
    SelectProfile(ProfileId),
    Reorder { from: Vec<usize>, to: usize },
    RankBest,
    TestProfile(ProfileId),
    TestAll,
    Import(ImportSource),
    SetProxyMode(ProxyMode),
    CheckInstallation,
    Install,
    Quit,
}

#[derive(Debug)]
pub enum Event {
    Command(Command),
    ProcessOutput {
        session: SessionId,
        stream: OutputStream,
        line: String,
    },
    ProcessExited {
        session: SessionId,
        code: Option<i32>,
    },
    HealthProbed {
        session: SessionId,
        latency: Option<u32>,
    },
    TrafficSampled {
        session: SessionId,
        sample: TrafficSample,
    },
    RestartDue {
        token: u64,
    },
    LatencyMeasured {
        profile: ProfileId,
        ticket: u64,
        result: Result<u32, ProbeError>,
    },
    ThroughputMeasured {
        profile: ProfileId,
        ticket: u64,
        result: Result<f64, ProbeError>,
    },
    TestAllFinished,
    Installation(InstallationState),
    ImportFetched {
        source: ImportSource,
        result: Result<Vec<u8>, ImportError>,
    },
}

impl From<Command> for Event {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}
