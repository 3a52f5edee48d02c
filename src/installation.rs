use std::{
    path::{Path, PathBuf},
    sync::{Arc, mpsc::Sender},
};

use crate::{
    error::InstallationError,
    event::Event,
    system::{run_silent_with_output, which},
};

pub const BINARY_NAMES: &[&str] = &["ss-local", "sslocal"];
pub const SEARCH_PATHS: &[&str] = &[
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/usr/bin",
    "/opt/local/bin",
];
pub const PRODUCT_MARKER: &str = "shadowsocks";
pub const PACKAGE_NAME: &str = "shadowsocks-libev";

#[derive(Clone, Debug, PartialEq)]
pub enum InstallationState {
    Checking,
    Installed(PathBuf),
    NotInstalled,
    Installing(f64),
    Error(String),
}

impl InstallationState {
    pub fn label(&self) -> String {
        match self {
            Self::Checking => "Checking…".into(),
            Self::Installed(path) => format!("Installed ({})", path.display()),
            Self::NotInstalled => "Not installed".into(),
            Self::Installing(progress) => format!("Installing {:.0}%", progress * 100.0),
            Self::Error(message) => format!("Error: {message}"),
        }
    }

    pub fn executable(&self) -> Option<&Path> {
        match self {
            Self::Installed(path) => Some(path),
            _ => None,
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(self, Self::Installed(_))
    }
}

/// The shell commands used to bring the client onto the host. Each command
/// is `[program, arguments...]`.
#[derive(Clone, Debug)]
pub struct PackageManager {
    pub name: String,
    pub detect: Vec<String>,
    pub bootstrap: Option<Vec<String>>,
    pub update: Vec<String>,
    pub install: Vec<String>,
    /// Prints either binary paths or an install prefix.
    pub locate: Option<Vec<String>>,
}

fn command(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

impl PackageManager {
    pub fn homebrew() -> Self {
        Self {
            name: "Homebrew".into(),
            detect: command(&["brew", "--version"]),
            bootstrap: Some(command(&[
                "/bin/bash",
                "-c",
                "NONINTERACTIVE=1 /bin/bash -c \"$(curl -fsSL https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh)\"",
            ])),
            update: command(&["brew", "update"]),
            install: command(&["brew", "install", PACKAGE_NAME]),
            locate: Some(command(&["brew", "--prefix", PACKAGE_NAME])),
        }
    }

    pub fn apt() -> Self {
        Self {
            name: "APT".into(),
            detect: command(&["apt-get", "--version"]),
            bootstrap: None,
            update: command(&["pkexec", "apt-get", "update"]),
            install: command(&["pkexec", "apt-get", "install", "-y", PACKAGE_NAME]),
            locate: Some(command(&["dpkg", "-L", PACKAGE_NAME])),
        }
    }

    #[cfg(target_os = "macos")]
    pub fn platform_default() -> Option<Self> {
        Some(Self::homebrew())
    }

    #[cfg(target_os = "linux")]
    pub fn platform_default() -> Option<Self> {
        Some(Self::apt())
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    pub fn platform_default() -> Option<Self> {
        None
    }
}

fn run_command(parts: &[String]) -> (bool, String) {
    let Some((program, arguments)) = parts.split_first() else {
        return (false, "empty command".into());
    };
    let arguments: Vec<&str> = arguments.iter().map(String::as_str).collect();
    run_silent_with_output(program, &arguments)
}

fn run_step(step: &str, parts: &[String]) -> Result<String, InstallationError> {
    log::info!("[install] {step}: {}", parts.join(" "));
    let (success, output) = run_command(parts);
    if success {
        Ok(output)
    } else {
        log::error!("[install] step '{step}' failed: {output}");
        Err(InstallationError::StepFailed {
            step: step.to_string(),
            output,
        })
    }
}

pub struct InstallationChecker {
    configured: Option<PathBuf>,
    search_paths: Vec<PathBuf>,
    binary_names: Vec<String>,
    path_lookup: bool,
    package_manager: Option<PackageManager>,
}

impl Default for InstallationChecker {
    fn default() -> Self {
        Self {
            configured: None,
            search_paths: SEARCH_PATHS.iter().map(PathBuf::from).collect(),
            binary_names: BINARY_NAMES.iter().map(|name| name.to_string()).collect(),
            path_lookup: true,
            package_manager: PackageManager::platform_default(),
        }
    }
}

impl InstallationChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A user-chosen executable, tried before anything else.
    pub fn with_executable(mut self, path: Option<PathBuf>) -> Self {
        self.configured = path;
        self
    }

    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    pub fn with_path_lookup(mut self, enabled: bool) -> Self {
        self.path_lookup = enabled;
        self
    }

    pub fn with_package_manager(mut self, manager: Option<PackageManager>) -> Self {
        self.package_manager = manager;
        self
    }

    pub fn check(&self) -> InstallationState {
        match self.locate() {
            Some(path) => {
                log::info!("[install] found client at {}", path.display());
                InstallationState::Installed(path)
            }
            None => {
                log::info!("[install] shadowsocks client not found");
                InstallationState::NotInstalled
            }
        }
    }

    fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = &self.configured
            && is_accepted(path)
        {
            return Some(path.clone());
        }

        for directory in &self.search_paths {
            for name in &self.binary_names {
                let candidate = directory.join(name);
                if is_accepted(&candidate) {
                    return Some(candidate);
                }
            }
        }

        if self.path_lookup {
            for name in &self.binary_names {
                if let Some(candidate) = which(name)
                    && is_accepted(&candidate)
                {
                    return Some(candidate);
                }
            }
        }

        let locate = self.package_manager.as_ref()?.locate.as_ref()?;
        let (success, output) = run_command(locate);
        if !success {
            return None;
        }
        self.package_candidates(&output)
            .into_iter()
            .find(|candidate| is_accepted(candidate))
    }

    fn package_candidates(&self, output: &str) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let path = PathBuf::from(line);
            let is_binary = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| self.binary_names.iter().any(|binary| binary == name));
            if is_binary {
                candidates.push(path);
            } else if path.is_dir() {
                for name in &self.binary_names {
                    candidates.push(path.join("bin").join(name));
                }
            }
        }
        candidates
    }

    /// Runs the install sequence, reporting progress in `0..=1` after each
    /// completed step.
    pub fn install(&self, mut progress: impl FnMut(f64)) -> Result<PathBuf, InstallationError> {
        let Some(manager) = &self.package_manager else {
            return Err(InstallationError::StepFailed {
                step: "check package manager".into(),
                output: "no supported package manager for this platform".into(),
            });
        };

        let (present, detect_output) = run_command(&manager.detect);
        progress(0.1);

        if !present {
            match &manager.bootstrap {
                Some(bootstrap) => {
                    run_step(&format!("install {}", manager.name), bootstrap)?;
                }
                None => {
                    return Err(InstallationError::StepFailed {
                        step: "check package manager".into(),
                        output: detect_output,
                    });
                }
            }
        } else {
            log::info!("[install] using {}", manager.name);
        }
        progress(0.3);

        run_step("update", &manager.update)?;
        progress(0.5);

        run_step("install package", &manager.install)?;
        progress(0.8);

        match self.check() {
            InstallationState::Installed(path) => {
                progress(1.0);
                Ok(path)
            }
            _ => Err(InstallationError::StepFailed {
                step: "verify".into(),
                output: "client executable not found after installation".into(),
            }),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn reports_product(path: &Path) -> bool {
    let Some(program) = path.to_str() else {
        return false;
    };
    ["-h", "--version"].iter().any(|flag| {
        let (_, output) = run_silent_with_output(program, &[flag]);
        output.to_lowercase().contains(PRODUCT_MARKER)
    })
}

fn is_accepted(path: &Path) -> bool {
    is_executable(path) && reports_product(path)
}

pub fn start_check(checker: Arc<InstallationChecker>, events: Sender<Event>) {
    let _ = events.send(Event::Installation(InstallationState::Checking));
    std::thread::spawn(move || {
        let state = checker.check();
        let _ = events.send(Event::Installation(state));
    });
}

pub fn start_install(checker: Arc<InstallationChecker>, events: Sender<Event>) {
    let _ = events.send(Event::Installation(InstallationState::Installing(0.0)));
    std::thread::spawn(move || {
        let progress_events = events.clone();
        let result = checker.install(|fraction| {
            let _ = progress_events.send(Event::Installation(InstallationState::Installing(
                fraction,
            )));
        });
        let state = match result {
            Ok(path) => {
                log::info!("[install] installation complete: {}", path.display());
                InstallationState::Installed(path)
            }
            Err(error) => InstallationState::Error(error.to_string()),
        };
        let _ = events.send(Event::Installation(state));
    });
}
